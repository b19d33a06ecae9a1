use crate::ide::IDE;
use crate::lapic;
use crate::mmu::{GateDesc, DPL_USER, SEG_KCODE};
use crate::proc::{Cpus, ProcState, PTABLE};
use crate::println;
use crate::spinlock::Mutex;
use crate::syscall;
use crate::uart;
use crate::x86::{lidt, rcr2};
use core::arch::global_asm;
use core::cell::UnsafeCell;
use core::ptr::NonNull;

// x86 trap and interrupt numbers
pub const T_PGFLT: u32 = 14; // page fault
pub const T_SYSCALL: u32 = 64; // system call
pub const T_IRQ0: u32 = 32; // IRQ 0 corresponds to int T_IRQ0

pub const IRQ_TIMER: u32 = 0;
pub const IRQ_COM1: u32 = 4;
pub const IRQ_IDE: u32 = 14;
pub const IRQ_ERROR: u32 = 19;
pub const IRQ_SPURIOUS: u32 = 31;

// Layout of the registers built on the kernel stack by the vector
// stubs and alltraps below, and consumed again by trapret. The
// hardware pushes ss/esp only on a privilege change; the segment
// registers are pushed as 32-bit words, hence the padding.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct Trapframe {
    // registers as pushed by pushad
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub oesp: u32, // useless & ignored
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,

    // rest of trap frame
    pub gs: u16,
    pub padding1: u16,
    pub fs: u16,
    pub padding2: u16,
    pub es: u16,
    pub padding3: u16,
    pub ds: u16,
    pub padding4: u16,
    pub trapno: u32,

    // below here defined by x86 hardware
    pub err: u32,
    pub eip: u32,
    pub cs: u16,
    pub padding5: u16,
    pub eflags: u32,

    // below here only when crossing rings, such as from user to kernel
    pub esp: u32,
    pub ss: u16,
    pub padding6: u16,
}

// 256 interrupt vector stubs, each padded to 16 bytes so tvinit can
// compute their addresses. Vectors 8, 10-14 and 17 get an error code
// from the hardware; the others push a zero to keep the frame layout
// uniform.
global_asm!(
    r#"
.section .text
.p2align 4
.globl vectors
vectors:
.set i, 0
.rept 256
  .p2align 4
  .if (i == 8) || ((i >= 10) && (i <= 14)) || (i == 17)
  .else
        pushl   $0
  .endif
        pushl   $i
        jmp     alltraps
  .set i, i + 1
.endr

.globl alltraps
alltraps:
        # Build trap frame.
        pushl   %ds
        pushl   %es
        pushl   %fs
        pushl   %gs
        pushal

        # Set up data segments.
        movw    $(2 << 3), %ax          # SEG_KDATA
        movw    %ax, %ds
        movw    %ax, %es

        # Call trap(tf), where tf=%esp
        pushl   %esp
        call    trap
        addl    $4, %esp

        # Return falls through to trapret...
.globl trapret
trapret:
        popal
        popl    %gs
        popl    %fs
        popl    %es
        popl    %ds
        addl    $0x8, %esp              # trapno and errcode
        iret
"#,
    options(att_syntax)
);

extern "C" {
    fn vectors(); // first vector stub; stub i is at vectors + i*16
    pub fn trapret();
}

struct Idt(UnsafeCell<[GateDesc; 256]>);
unsafe impl Sync for Idt {}

static IDT: Idt = Idt(UnsafeCell::new([GateDesc::zero(); 256]));

pub static TICKS: Mutex<u32> = Mutex::new(0, "time");

// Build the interrupt descriptor table. Single-threaded boot only.
pub fn tvinit() {
    let idt = unsafe { &mut *IDT.0.get() };
    let base = vectors as usize;
    for (i, gate) in idt.iter_mut().enumerate() {
        gate.set(false, (SEG_KCODE << 3) as u16, base + i * 16, 0);
    }
    // The syscall gate is a trap gate (interrupts stay enabled) and
    // callable from user mode.
    idt[T_SYSCALL as usize].set(
        true,
        (SEG_KCODE << 3) as u16,
        base + T_SYSCALL as usize * 16,
        DPL_USER,
    );
}

// Load the IDT register; every CPU runs this.
pub fn idtinit() {
    let idt = IDT.0.get() as usize;
    let desc: [u16; 3] = [
        (core::mem::size_of::<[GateDesc; 256]>() - 1) as u16,
        (idt & 0xFFFF) as u16,
        (idt >> 16) as u16,
    ];
    unsafe { lidt(desc.as_ptr() as *const u8) };
}

#[no_mangle]
pub extern "C" fn trap(tf: &mut Trapframe) {
    if tf.trapno == T_SYSCALL {
        let p = Cpus::my_proc().expect("syscall with no process");
        if PTABLE.killed(p) {
            PTABLE.exit();
        }
        unsafe { (*p.data.get()).tf = NonNull::new(tf) };
        syscall::syscall();
        if PTABLE.killed(p) {
            PTABLE.exit();
        }
        return;
    }

    match tf.trapno {
        t if t == T_IRQ0 + IRQ_TIMER => {
            if unsafe { Cpus::my_cpu_index() } == 0 {
                let ticks = {
                    let mut ticks = TICKS.lock();
                    *ticks += 1;
                    &*ticks as *const u32 as usize
                };
                PTABLE.wakeup(ticks);
            }
            lapic::eoi();
        }
        t if t == T_IRQ0 + IRQ_IDE => {
            IDE.intr();
            lapic::eoi();
        }
        t if t == T_IRQ0 + IRQ_COM1 => {
            uart::intr();
            lapic::eoi();
        }
        t if t == T_IRQ0 + 7 || t == T_IRQ0 + IRQ_SPURIOUS => {
            println!(
                "cpu{}: spurious interrupt at {:x}:{:x}",
                unsafe { Cpus::my_cpu_index() },
                tf.cs,
                tf.eip
            );
            lapic::eoi();
        }
        t => {
            let p = Cpus::my_proc();
            if p.is_none() || tf.cs & 3 == 0 {
                // In the kernel, it must be our mistake.
                println!(
                    "unexpected trap {} from cpu {} eip {:x} (cr2=0x{:x})",
                    t,
                    unsafe { Cpus::my_cpu_index() },
                    tf.eip,
                    rcr2()
                );
                panic!("trap");
            }
            // In user space, assume the process misbehaved.
            let p = p.unwrap();
            println!(
                "pid {} {}: trap {} err {} on cpu {} eip 0x{:x} addr 0x{:x}--kill proc",
                PTABLE.pid(p),
                unsafe { &(*p.data.get()).name },
                t,
                tf.err,
                unsafe { Cpus::my_cpu_index() },
                tf.eip,
                rcr2()
            );
            PTABLE.set_killed(p);
        }
    }

    // Force the process to exit if it has been killed and is in user
    // space. (If it is still executing in the kernel, let it keep
    // running until it gets to the regular system call return.)
    if let Some(p) = Cpus::my_proc() {
        if PTABLE.killed(p) && tf.cs & 3 == DPL_USER {
            PTABLE.exit();
        }

        // Force the process to give up the CPU on a clock tick.
        if PTABLE.state(p) == ProcState::RUNNING && tf.trapno == T_IRQ0 + IRQ_TIMER {
            PTABLE.yielding();
        }

        // Check again: yielding may have given another CPU time to kill us.
        if PTABLE.killed(p) && tf.cs & 3 == DPL_USER {
            PTABLE.exit();
        }
    }
}
