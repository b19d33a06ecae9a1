#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod kernel_main {
    use core::ptr;
    use core::sync::atomic::Ordering;
    use kernel::ide::IDE;
    use kernel::memlayout::{p2v, v2p, APBOOT, KERNBASE};
    use kernel::mmu::{PteFlags, NPDENTRIES};
    use kernel::param::KSTACKSIZE;
    use kernel::proc::{self, scheduler, Cpus, CPUS};
    use kernel::{console, ioapic, kalloc, kmain, lapic, mp, picirq, println, trap, uart, vm};

    kmain!(main);

    // The boot processor starts running Rust code here, on entry.rs's
    // provisional stack and page table. Bring the machine up
    // single-threaded, start the other CPUs, forge the first process,
    // and fall into the scheduler.
    extern "C" fn main() -> ! {
        unsafe {
            kalloc::kinit1(kalloc::kernel_end(), p2v(4 * 1024 * 1024)); // phys page allocator
            vm::kvmalloc(); // kernel page table
            mp::init(); // detect other processors
            lapic::init(); // interrupt controller
            vm::seginit(); // segment descriptors
            picirq::init(); // disable pic
            ioapic::init(); // another interrupt controller
            console::init(); // console device
            uart::init(); // serial port
            println!("");
            println!("ferrox kernel is booting");
            println!("");
            trap::tvinit(); // trap vectors
            IDE.init(); // disk
            start_others(); // start other processors
            kalloc::kinit2(p2v(4 * 1024 * 1024), kalloc::phystop_va()); // must come after start_others()
            proc::user_init(); // first user process
        }
        mpmain() // finish this processor's setup
    }

    // Other CPUs jump here from entryother.rs.
    extern "C" fn mpenter() -> ! {
        vm::switchkvm();
        vm::seginit();
        lapic::init();
        mpmain()
    }

    // Common CPU setup code.
    fn mpmain() -> ! {
        let id = unsafe { Cpus::my_cpu_index() };
        println!("cpu{}: starting {}", id, id);
        trap::idtinit(); // load idt register
        unsafe { Cpus::my_cpu() }
            .started
            .store(true, Ordering::Release); // tell start_others() we're up
        scheduler() // start running processes
    }

    // Start the non-boot (AP) processors.
    unsafe fn start_others() {
        use kernel::entryother::{entryother_end, entryother_start};

        // Write entry code to unused memory at APBOOT (0x7000). The
        // linker has placed the image of entryother.rs right in the
        // kernel's rodata.
        let code = p2v(APBOOT) as *mut u8;
        let size = entryother_end as usize - entryother_start as usize;
        ptr::copy_nonoverlapping(entryother_start as usize as *const u8, code, size);

        for c in CPUS.iter() {
            let cpu = &mut *c.get();
            if cpu.apicid == lapic::id() {
                // We've started already.
                continue;
            }

            // Tell entryother.rs what stack to use, where to enter,
            // and what pgdir to use. We cannot use kpgdir yet, because
            // the AP processor is running in low memory, so we use
            // entrypgdir for the APs too.
            let stack = kalloc::kalloc();
            assert!(!stack.is_null(), "start_others: out of memory");
            *(code.sub(4) as *mut u32) = stack as u32 + KSTACKSIZE as u32;
            *(code.sub(8) as *mut u32) = mpenter as usize as u32;
            *(code.sub(12) as *mut u32) = v2p(&entrypgdir as *const _ as usize) as u32;

            lapic::start_ap(cpu.apicid, APBOOT as u32);

            // wait for cpu to finish mpmain()
            while !cpu.started.load(Ordering::Acquire) {}
        }
    }

    // The boot page table used in entry.rs and entryother.rs.
    // Page directories (and page tables) must start on page boundaries.
    // PTE_PS in a page directory entry enables 4Mbyte pages.
    #[repr(C, align(4096))]
    pub struct EntryPgDir([u32; NPDENTRIES]);

    #[allow(non_upper_case_globals)]
    #[no_mangle]
    #[used]
    pub static entrypgdir: EntryPgDir = EntryPgDir({
        let mut dir = [0u32; NPDENTRIES];
        let flags = PteFlags::P.bits() | PteFlags::W.bits() | PteFlags::PS.bits();
        // Map VA's [0, 4MB) to PA's [0, 4MB)
        dir[0] = flags;
        // Map VA's [KERNBASE, KERNBASE+4MB) to PA's [0, 4MB)
        dir[KERNBASE >> 22] = flags;
        dir
    });
}

#[cfg(not(target_os = "none"))]
fn main() {}
