use crate::file::File;
use crate::fs::{self, Inode, Path};
use crate::kalloc::{kalloc, kfree};
use crate::lapic;
use crate::lazy::SyncOnceCell;
use crate::log::LOG;
use crate::mmu::{SegDesc, TaskState, DPL_USER, NSEGS, PGSIZE, SEG_UCODE, SEG_UDATA};
use crate::param::{KSTACKSIZE, NCPU, NOFILE, NPROC, ROOTDEV};
use crate::spinlock::{pop_off, push_off, Mutex, MutexGuard};
use crate::swtch::swtch;
use crate::trap::{trapret, Trapframe};
use crate::vm::{self, PgDir};
use crate::x86::{intr_get, sti, FL_IF};
use crate::println;
use alloc::string::String;
use alloc::sync::Arc;
use array_macro::array;
use core::cell::UnsafeCell;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub static CPUS: Cpus = Cpus::new();
pub static PTABLE: Ptable = Ptable::new();
pub static INITPROC: SyncOnceCell<usize> = SyncOnceCell::new();

// Saved registers for kernel context switches. The segment registers
// are constant across kernel contexts and the caller-saved registers
// are already on the stack, so only these five are kept. A context
// always lives at the bottom of the stack it describes; the stack
// pointer of a switched-out thread is the address of its Context.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct Context {
    pub edi: u32,
    pub esi: u32,
    pub ebx: u32,
    pub ebp: u32,
    pub eip: u32,
}

pub struct Cpus {
    cpus: [UnsafeCell<Cpu>; NCPU],
    ncpu: AtomicUsize,
}
unsafe impl Sync for Cpus {}

// Per-CPU state
pub struct Cpu {
    pub apicid: u8,              // Local APIC ID
    pub scheduler: *mut Context, // swtch() here to enter scheduler()
    pub ts: TaskState,           // used by x86 to find stack for interrupt
    pub gdt: [SegDesc; NSEGS],   // x86 global descriptor table
    pub started: AtomicBool,     // has this CPU entered its scheduler?
    pub ncli: i32,               // depth of push_off() nesting
    pub intena: bool,            // were interrupts enabled before push_off()?
    pub proc: Option<usize>,     // slot of the process running here, or None
}

impl Cpus {
    const fn new() -> Self {
        Self {
            cpus: array![_ => UnsafeCell::new(Cpu::new()); NCPU],
            ncpu: AtomicUsize::new(0),
        }
    }

    // Record a CPU found in the multiprocessor tables.
    // Single-threaded boot only.
    pub unsafe fn register(&self, apicid: u8) {
        let n = self.ncpu.load(Ordering::Relaxed);
        if n < NCPU {
            (*self.cpus[n].get()).apicid = apicid;
            self.ncpu.store(n + 1, Ordering::Relaxed);
        }
    }

    pub fn count(&self) -> usize {
        self.ncpu.load(Ordering::Relaxed)
    }

    pub fn iter(&self) -> core::slice::Iter<'_, UnsafeCell<Cpu>> {
        self.cpus[..self.count()].iter()
    }

    // Return this CPU's descriptor. Must be called with interrupts
    // disabled, to prevent a race with being moved to a different CPU.
    pub unsafe fn my_cpu() -> &'static mut Cpu {
        assert!(!intr_get(), "my_cpu called with interrupts enabled");
        if CPUS.count() == 0 {
            // single-threaded early boot, before mp::init
            return &mut *CPUS.cpus[0].get();
        }
        let apicid = lapic::id();
        // APIC IDs are not guaranteed to be contiguous, so search.
        for c in CPUS.iter() {
            if (*c.get()).apicid == apicid {
                return &mut *c.get();
            }
        }
        panic!("unknown apicid");
    }

    // Index of this CPU in the table. Interrupts must be off.
    pub unsafe fn my_cpu_index() -> usize {
        let c = Self::my_cpu() as *const Cpu as usize;
        let base = CPUS.cpus.as_ptr() as usize;
        (c - base) / core::mem::size_of::<UnsafeCell<Cpu>>()
    }

    // The process running on this CPU, or None.
    pub fn my_proc() -> Option<&'static Proc> {
        push_off();
        let p = unsafe { Self::my_cpu().proc.map(|i| &PTABLE.pool[i]) };
        pop_off();
        p
    }
}

impl Cpu {
    const fn new() -> Self {
        Self {
            apicid: 0,
            scheduler: ptr::null_mut(),
            ts: TaskState::zero(),
            gdt: [SegDesc::zero(); NSEGS],
            started: AtomicBool::new(false),
            ncli: 0,
            intena: false,
            proc: None,
        }
    }
}

#[allow(non_camel_case_types)]
#[derive(PartialEq, Clone, Copy, Debug)]
pub enum ProcState {
    UNUSED,
    EMBRYO,
    SLEEPING,
    RUNNABLE,
    RUNNING,
    ZOMBIE,
}

// The per-process fields other CPUs may inspect. All of them live
// under the single table lock; any transition except the creator-owned
// EMBRYO <-> UNUSED must hold it.
#[derive(Clone, Copy)]
pub struct ProcShared {
    pub state: ProcState,
    pub pid: u32,
    pub chan: usize, // if SLEEPING, the channel slept on, else 0
    pub killed: bool,
    pub parent: Option<usize>, // slot index of parent, a weak link
}

impl ProcShared {
    const fn new() -> Self {
        Self {
            state: ProcState::UNUSED,
            pid: 0,
            chan: 0,
            killed: false,
            parent: None,
        }
    }
}

// Fields private to the running process (or, briefly, to the parent
// reaping a ZOMBIE). The table lock need not be held to touch these.
pub struct ProcData {
    pub kstack: usize,                      // bottom of kernel stack, 0 if none
    pub sz: usize,                          // size of process memory (bytes)
    pub pgdir: Option<NonNull<PgDir>>,      // page directory
    pub tf: Option<NonNull<Trapframe>>,     // trap frame for current syscall
    pub context: *mut Context,              // swtch() here to run process
    pub name: String,                       // process name (debugging)
    pub ofile: [Option<Arc<File>>; NOFILE], // open files
    pub cwd: Option<Inode>,                 // current directory
}
unsafe impl Send for ProcData {}

impl ProcData {
    const fn new() -> Self {
        Self {
            kstack: 0,
            sz: 0,
            pgdir: None,
            tf: None,
            context: ptr::null_mut(),
            name: String::new(),
            ofile: array![_ => None; NOFILE],
            cwd: None,
        }
    }
}

pub struct Proc {
    pub idx: usize,
    pub data: UnsafeCell<ProcData>,
}
unsafe impl Sync for Proc {}

impl Proc {
    const fn new(idx: usize) -> Self {
        Self {
            idx,
            data: UnsafeCell::new(ProcData::new()),
        }
    }

    // The channel exit() wakes and wait() sleeps on: the slot address.
    pub fn chan(&self) -> usize {
        self as *const Proc as usize
    }
}

struct TableShared {
    procs: [ProcShared; NPROC],
    nextpid: u32,
}

pub struct Ptable {
    shared: Mutex<TableShared>,
    pool: [Proc; NPROC],
}

// The first user program, hand-assembled: exec("/init", ["/init"]),
// then spin on exit in case exec fails.
//
//   68 24 00 00 00          push $argv
//   68 1c 00 00 00          push $init
//   6a 00                   push $0
//   b8 07 00 00 00          mov  $SYS_exec, %eax
//   cd 40                   int  $T_SYSCALL
//   b8 02 00 00 00          mov  $SYS_exit, %eax
//   cd 40                   int  $T_SYSCALL
//   eb f7                   jmp  <the exit loop>
//   init: "/init\0", pad, argv: [init, 0]
static INITCODE: [u8; 44] = [
    0x68, 0x24, 0x00, 0x00, 0x00, 0x68, 0x1c, 0x00, 0x00, 0x00, 0x6a, 0x00, 0xb8, 0x07, 0x00,
    0x00, 0x00, 0xcd, 0x40, 0xb8, 0x02, 0x00, 0x00, 0x00, 0xcd, 0x40, 0xeb, 0xf7, 0x2f, 0x69,
    0x6e, 0x69, 0x74, 0x00, 0x00, 0x00, 0x1c, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

impl Ptable {
    const fn new() -> Self {
        Self {
            shared: Mutex::new(
                TableShared {
                    procs: array![_ => ProcShared::new(); NPROC],
                    nextpid: 1,
                },
                "ptable",
            ),
            pool: array![i => Proc::new(i); NPROC],
        }
    }

    // Look in the process table for an UNUSED slot. If found, mark it
    // EMBRYO, hand it a fresh pid, and build its kernel stack so that
    // its first dispatch runs fork_ret and then falls into trapret.
    // The slot is not yet runnable; publishing it RUNNABLE is the
    // caller's job, under the table lock.
    fn alloc_proc(&self) -> Option<usize> {
        let idx;
        {
            let mut table = self.shared.lock();
            idx = table
                .procs
                .iter()
                .position(|p| p.state == ProcState::UNUSED)?;
            table.procs[idx].state = ProcState::EMBRYO;
            table.procs[idx].pid = table.nextpid;
            table.nextpid += 1;
        }

        let data = unsafe { &mut *self.pool[idx].data.get() };

        // Allocate the kernel stack.
        let kstack = kalloc();
        if kstack.is_null() {
            // Still creator-owned EMBRYO, unpublished; reverting it
            // does not need the lock.
            unsafe {
                self.shared.get_mut().procs[idx].state = ProcState::UNUSED;
            }
            return None;
        }
        data.kstack = kstack as usize;
        let mut sp = data.kstack + KSTACKSIZE;

        // Leave room for the trap frame.
        sp -= core::mem::size_of::<Trapframe>();
        data.tf = NonNull::new(sp as *mut Trapframe);

        // The word fork_ret returns through: trapret.
        sp -= core::mem::size_of::<u32>();
        unsafe {
            *(sp as *mut u32) = trapret as usize as u32;
        }

        // New context starts executing at fork_ret.
        sp -= core::mem::size_of::<Context>();
        data.context = sp as *mut Context;
        unsafe {
            ptr::write_bytes(data.context, 0, 1);
            (*data.context).eip = fork_ret as usize as u32;
        }

        Some(idx)
    }

    // Set up the first user process.
    pub fn user_init(&self) {
        let idx = self.alloc_proc().expect("user_init: no procs");
        INITPROC.set(idx).expect("user_init: called twice");

        let data = unsafe { &mut *self.pool[idx].data.get() };
        let mut pgdir = vm::setupkvm().expect("user_init: out of memory?");
        unsafe {
            vm::inituvm(pgdir.as_mut(), &INITCODE);
        }
        data.pgdir = Some(pgdir);
        data.sz = PGSIZE;

        let tf = unsafe { data.tf.unwrap().as_mut() };
        unsafe { ptr::write_bytes(tf as *mut Trapframe, 0, 1) };
        tf.cs = ((SEG_UCODE << 3) as u16) | DPL_USER;
        tf.ds = ((SEG_UDATA << 3) as u16) | DPL_USER;
        tf.es = tf.ds;
        tf.ss = tf.ds;
        tf.eflags = FL_IF;
        tf.esp = PGSIZE as u32;
        tf.eip = 0; // beginning of initcode

        data.name.push_str("initcode");
        data.cwd = Path::new("/").namei();

        // This store lets other cores run the process. The lock forces
        // the writes above to be visible first.
        let mut table = self.shared.lock();
        table.procs[idx].state = ProcState::RUNNABLE;
    }

    // Grow current process's memory by n bytes (shrink if n < 0).
    pub fn grow_proc(&self, n: i32) -> Result<(), ()> {
        let p = Cpus::my_proc().unwrap();
        let data = unsafe { &mut *p.data.get() };
        let pgdir = unsafe { data.pgdir.unwrap().as_mut() };

        let mut sz = data.sz;
        if n > 0 {
            sz = vm::allocuvm(pgdir, sz, sz + n as usize).ok_or(())?;
        } else if n < 0 {
            // A shrink that lands exactly on zero reads as failure
            // here, as it always has.
            sz = match vm::deallocuvm(pgdir, sz, (sz as i64 + n as i64) as usize) {
                0 => return Err(()),
                s => s,
            };
        }
        data.sz = sz;
        vm::switchuvm(p);
        Ok(())
    }

    // Create a new process copying the caller as the parent.
    // Sets up the child's stack to return as if from the fork()
    // system call. Returns the child's pid.
    pub fn fork(&self) -> Result<u32, ()> {
        let p = Cpus::my_proc().unwrap();
        let data = unsafe { &mut *p.data.get() };

        let idx = self.alloc_proc().ok_or(())?;
        let ndata = unsafe { &mut *self.pool[idx].data.get() };

        // Copy the address space.
        match vm::copyuvm(unsafe { data.pgdir.unwrap().as_mut() }, data.sz) {
            Some(pgdir) => ndata.pgdir = Some(pgdir),
            None => {
                kfree(ndata.kstack as *mut u8);
                ndata.kstack = 0;
                unsafe {
                    self.shared.get_mut().procs[idx].state = ProcState::UNUSED;
                }
                return Err(());
            }
        }
        ndata.sz = data.sz;
        unsafe {
            *ndata.tf.unwrap().as_mut() = *data.tf.unwrap().as_ref();
            // fork returns 0 in the child.
            ndata.tf.unwrap().as_mut().eax = 0;
        }

        // Duplicate open file and directory handles.
        for (nf, f) in ndata.ofile.iter_mut().zip(data.ofile.iter()) {
            *nf = f.clone();
        }
        ndata.cwd = data.cwd.as_ref().map(|c| c.dup());

        ndata.name.clear();
        ndata.name.push_str(&data.name);

        let mut table = self.shared.lock();
        table.procs[idx].parent = Some(p.idx);
        let pid = table.procs[idx].pid;
        table.procs[idx].state = ProcState::RUNNABLE;
        Ok(pid)
    }

    // Exit the current process. Does not return. An exited process
    // stays ZOMBIE until its parent calls wait() to find out it exited.
    pub fn exit(&self) -> ! {
        let p = Cpus::my_proc().expect("exit");
        let idx = p.idx;
        assert!(INITPROC.get() != Some(&idx), "init exiting");

        let data = unsafe { &mut *p.data.get() };

        // Close all open files.
        for f in data.ofile.iter_mut() {
            f.take();
        }

        LOG.begin_op();
        data.cwd.take();
        LOG.end_op();

        let mut table = self.shared.lock();

        // Parent might be sleeping in wait().
        if let Some(pp) = table.procs[idx].parent {
            self.wakeup1(&mut table, self.pool[pp].chan());
        }

        // Pass abandoned children to init.
        let init = *INITPROC.get().unwrap();
        for i in 0..NPROC {
            if table.procs[i].parent == Some(idx) {
                table.procs[i].parent = Some(init);
                if table.procs[i].state == ProcState::ZOMBIE {
                    self.wakeup1(&mut table, self.pool[init].chan());
                }
            }
        }

        // Jump into the scheduler, never to return.
        table.procs[idx].state = ProcState::ZOMBIE;
        unsafe {
            sched(table, &mut data.context);
        }
        panic!("zombie exit");
    }

    // Wait for a child process to exit and return its pid, or None if
    // this process has no children.
    pub fn wait(&self) -> Option<u32> {
        let p = Cpus::my_proc().unwrap();
        let idx = p.idx;

        let mut table = self.shared.lock();
        loop {
            // Scan the table looking for exited children.
            let mut havekids = false;
            for i in 0..NPROC {
                if table.procs[i].parent != Some(idx) {
                    continue;
                }
                havekids = true;
                if table.procs[i].state == ProcState::ZOMBIE {
                    // Found one.
                    let pid = table.procs[i].pid;
                    let cdata = unsafe { &mut *self.pool[i].data.get() };
                    kfree(cdata.kstack as *mut u8);
                    cdata.kstack = 0;
                    if let Some(pgdir) = cdata.pgdir.take() {
                        vm::freevm(pgdir);
                    }
                    cdata.tf = None;
                    cdata.name.clear();
                    table.procs[i].pid = 0;
                    table.procs[i].parent = None;
                    table.procs[i].killed = false;
                    table.procs[i].state = ProcState::UNUSED;
                    return Some(pid);
                }
            }

            // No point waiting if we don't have any children.
            if !havekids || table.procs[idx].killed {
                return None;
            }

            // Wait for children to exit. (See wakeup1 call in exit.)
            table = self.sleep1(p.chan(), table);
        }
    }

    // Transition to SLEEPING on chan and yield, with the table lock
    // already held. The lock travels across the stack switch and comes
    // back with the return value.
    fn sleep1<'a>(
        &self,
        chan: usize,
        mut table: MutexGuard<'a, TableShared>,
    ) -> MutexGuard<'a, TableShared> {
        let p = Cpus::my_proc().expect("sleep");
        let idx = p.idx;

        // Go to sleep.
        table.procs[idx].chan = chan;
        table.procs[idx].state = ProcState::SLEEPING;

        table = unsafe { sched(table, &mut (*p.data.get()).context) };

        // Tidy up.
        table.procs[idx].chan = 0;
        table
    }

    // Wake up all processes sleeping on chan. The table lock must be
    // held; chan is left as-is for the sleeper to clear.
    fn wakeup1(&self, table: &mut MutexGuard<'_, TableShared>, chan: usize) {
        for p in table.procs.iter_mut() {
            if p.state == ProcState::SLEEPING && p.chan == chan {
                p.state = ProcState::RUNNABLE;
            }
        }
    }

    // Wake up all processes sleeping on chan.
    pub fn wakeup(&self, chan: usize) {
        let mut table = self.shared.lock();
        self.wakeup1(&mut table, chan);
    }

    // Kill the process with the given pid. The victim won't exit until
    // it tries to return to user space (see trap in trap.rs).
    pub fn kill(&self, pid: u32) -> Result<(), ()> {
        let mut table = self.shared.lock();
        for p in table.procs.iter_mut() {
            if p.pid == pid {
                p.killed = true;
                // Wake the process from sleep if necessary.
                if p.state == ProcState::SLEEPING {
                    p.state = ProcState::RUNNABLE;
                }
                return Ok(());
            }
        }
        Err(())
    }

    pub fn killed(&self, p: &Proc) -> bool {
        self.shared.lock().procs[p.idx].killed
    }

    pub fn set_killed(&self, p: &Proc) {
        self.shared.lock().procs[p.idx].killed = true;
    }

    pub fn state(&self, p: &Proc) -> ProcState {
        self.shared.lock().procs[p.idx].state
    }

    pub fn pid(&self, p: &Proc) -> u32 {
        self.shared.lock().procs[p.idx].pid
    }

    // Give up the CPU for one scheduling round.
    pub fn yielding(&self) {
        let p = Cpus::my_proc().unwrap();
        let mut table = self.shared.lock();
        table.procs[p.idx].state = ProcState::RUNNABLE;
        let _table = unsafe { sched(table, &mut (*p.data.get()).context) };
    }
}

// Atomically release lk and sleep on chan; reacquire lk when
// awakened. The table lock is taken before lk is dropped, so a
// concurrent wakeup (which must take the table lock) cannot slip in
// between the caller's condition check and the SLEEPING transition.
pub fn sleep<'a, T>(chan: usize, lk: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    let table = PTABLE.shared.lock();
    let mutex = Mutex::unlock(lk);

    let table = PTABLE.sleep1(chan, table);
    drop(table);

    // Reacquire the original lock.
    mutex.lock()
}

// Enter scheduler. Must hold only the table lock and have already
// changed this process's state. Saves and restores intena because
// intena is a property of this kernel thread, not this CPU. It should
// be proc.intena and proc.ncli, but that would break in the few
// places where a lock is held but there is no process.
unsafe fn sched<'a>(
    table: MutexGuard<'a, TableShared>,
    ctx: &mut *mut Context,
) -> MutexGuard<'a, TableShared> {
    let c = Cpus::my_cpu();
    assert!(table.holding(), "sched ptable.lock");
    assert!(c.ncli == 1, "sched locks");
    assert!(
        table.procs[c.proc.unwrap()].state != ProcState::RUNNING,
        "sched running"
    );
    assert!(!intr_get(), "sched interruptible");

    let intena = c.intena;
    swtch(ctx, c.scheduler);
    // This kernel thread may be back on a different CPU.
    Cpus::my_cpu().intena = intena;

    table
}

// Per-CPU process scheduler. Each CPU calls scheduler() after setting
// itself up. Scheduler never returns. It loops, doing:
//  - choose a process to run
//  - swtch to start running that process
//  - eventually that process transfers control
//      via swtch back to the scheduler.
pub fn scheduler() -> ! {
    let c = unsafe { Cpus::my_cpu() };
    c.proc = None;

    loop {
        // Enable interrupts on this processor, so a CPU with no
        // runnable process can still be woken by one.
        sti();

        let mut table = PTABLE.shared.lock();
        for idx in 0..NPROC {
            if table.procs[idx].state != ProcState::RUNNABLE {
                continue;
            }

            // Switch to the chosen process. It is the process's job to
            // release the table lock and then reacquire it before
            // jumping back to us.
            let p = &PTABLE.pool[idx];
            c.proc = Some(idx);
            vm::switchuvm(p);
            table.procs[idx].state = ProcState::RUNNING;

            unsafe {
                swtch(&mut c.scheduler, (*p.data.get()).context);
            }
            vm::switchkvm();

            // The process is done running for now. It should have
            // changed its state before coming back.
            c.proc = None;
        }
        drop(table);
    }
}

// A fork child's very first scheduling by scheduler() will swtch here.
unsafe extern "C" fn fork_ret() {
    static FIRST: AtomicBool = AtomicBool::new(true);

    // Still holding the table lock from scheduler.
    PTABLE.shared.force_unlock();

    if FIRST.swap(false, Ordering::AcqRel) {
        // The file system must be initialized in the context of a
        // regular process (it sleeps), and so cannot run from main().
        fs::init(ROOTDEV);
    }

    // Return to "caller", actually trapret (see alloc_proc).
}

// Print a process listing to the console. For debugging.
// Runs when a user types ^P on the console.
// No lock, to avoid wedging a stuck machine further.
pub fn procdump() {
    for p in PTABLE.pool.iter() {
        let shared = unsafe { PTABLE.shared.get_mut().procs[p.idx] };
        if shared.state == ProcState::UNUSED {
            continue;
        }
        let state = match shared.state {
            ProcState::UNUSED => "unused",
            ProcState::EMBRYO => "embryo",
            ProcState::SLEEPING => "sleep ",
            ProcState::RUNNABLE => "runble",
            ProcState::RUNNING => "run   ",
            ProcState::ZOMBIE => "zombie",
        };
        let data = unsafe { &*p.data.get() };
        println!("{} {} {}", shared.pid, state, data.name);
    }
}

// Free-function wrappers, for the syscall and trap layers.

pub fn fork() -> Result<u32, ()> {
    PTABLE.fork()
}

pub fn exit() -> ! {
    PTABLE.exit()
}

pub fn wait() -> Option<u32> {
    PTABLE.wait()
}

pub fn kill(pid: u32) -> Result<(), ()> {
    PTABLE.kill(pid)
}

pub fn grow_proc(n: i32) -> Result<(), ()> {
    PTABLE.grow_proc(n)
}

pub fn user_init() {
    PTABLE.user_init()
}
