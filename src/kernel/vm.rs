use crate::fs::InodeData;
use crate::kalloc::{kalloc, kfree};
use crate::memlayout::{p2v, v2p, DEVSPACE, EXTMEM, KERNBASE, KERNLINK, PHYSTOP};
use crate::mmu::{
    pdx, pg_round_down, pg_round_up, pte_addr, pte_flags, ptx, PteFlags, PteT, SegDesc,
    DPL_USER, NPDENTRIES, PGSIZE, SEG_KCODE, SEG_KDATA, SEG_TSS, SEG_UCODE, SEG_UDATA, STA_R,
    STA_W, STA_X, STS_T32A,
};
use crate::param::KSTACKSIZE;
use crate::proc::{Cpus, Proc};
use crate::println;
use crate::sleeplock::SleepLockGuard;
use crate::spinlock::{pop_off, push_off};
use crate::x86::{lcr3, lgdt, ltr};
use core::cmp::min;
use core::ops::Add;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicUsize, Ordering};
use zerocopy::{AsBytes, FromBytes};

extern "C" {
    // defined by kernel.ld: start of the kernel's writable data.
    static data: [u8; 0];
}

// A page directory: one kalloc'd page holding 1024 entries.
#[repr(C, align(4096))]
pub struct PgDir {
    pub entries: [PteT; NPDENTRIES],
}

// the kernel page directory, shared by the scheduler and by
// every process's kernel half.
static KPGDIR: AtomicUsize = AtomicUsize::new(0);

// Set up CPU's kernel segment descriptors.
// Run once on entry on each CPU.
pub fn seginit() {
    // Map "logical" addresses to virtual addresses using identity map.
    // The user segments differ from the kernel's only in DPL.
    let c = unsafe { Cpus::my_cpu() };
    c.gdt[SEG_KCODE] = SegDesc::seg(STA_X | STA_R, 0, 0xffffffff, 0);
    c.gdt[SEG_KDATA] = SegDesc::seg(STA_W, 0, 0xffffffff, 0);
    c.gdt[SEG_UCODE] = SegDesc::seg(STA_X | STA_R, 0, 0xffffffff, DPL_USER);
    c.gdt[SEG_UDATA] = SegDesc::seg(STA_W, 0, 0xffffffff, DPL_USER);

    let base = c.gdt.as_ptr() as usize;
    let desc: [u16; 3] = [
        (core::mem::size_of_val(&c.gdt) - 1) as u16,
        (base & 0xFFFF) as u16,
        (base >> 16) as u16,
    ];
    unsafe { lgdt(desc.as_ptr() as *const u8) };
}

// Return the address of the PTE in page directory pgdir that
// corresponds to virtual address va. If alloc is true, create any
// required page table page.
fn walkpgdir(pgdir: &mut PgDir, va: usize, alloc: bool) -> Option<&'static mut PteT> {
    let pde = &mut pgdir.entries[pdx(va)];
    let pgtab: *mut PteT;
    if *pde & PteFlags::P.bits() != 0 {
        pgtab = p2v(pte_addr(*pde)) as *mut PteT;
    } else {
        if !alloc {
            return None;
        }
        let mem = kalloc();
        if mem.is_null() {
            return None;
        }
        // Make sure all those PTE_P bits are zero.
        unsafe { ptr::write_bytes(mem, 0, PGSIZE) };
        pgtab = mem as *mut PteT;
        // The permissions here are overly generous, but they can
        // be further restricted by the permissions in the page
        // table entries, if necessary.
        *pde = v2p(pgtab as usize) as PteT
            | (PteFlags::P | PteFlags::W | PteFlags::U).bits();
    }
    Some(unsafe { &mut *pgtab.add(ptx(va)) })
}

// Create PTEs for virtual addresses starting at va that refer to
// physical addresses starting at pa. va and size might not
// be page-aligned.
fn mappages(
    pgdir: &mut PgDir,
    va: usize,
    size: usize,
    mut pa: usize,
    perm: PteFlags,
) -> Result<(), ()> {
    let mut a = pg_round_down(va);
    // the device mapping runs to the top of the address space, so the
    // end computation has to wrap.
    let last = pg_round_down(va.wrapping_add(size).wrapping_sub(1));
    loop {
        let pte = walkpgdir(pgdir, a, true).ok_or(())?;
        if *pte & PteFlags::P.bits() != 0 {
            panic!("remap");
        }
        *pte = pa as PteT | perm.bits() | PteFlags::P.bits();
        if a == last {
            break;
        }
        a += PGSIZE;
        pa += PGSIZE;
    }
    Ok(())
}

// The kernel's mappings, present in every process's page table.
struct Kmap {
    virt: usize,
    phys_start: usize,
    phys_end: usize,
    perm: PteFlags,
}

fn kmap() -> [Kmap; 4] {
    let data_start = unsafe { data.as_ptr() as usize };
    [
        Kmap {
            // I/O space
            virt: KERNBASE,
            phys_start: 0,
            phys_end: EXTMEM,
            perm: PteFlags::W,
        },
        Kmap {
            // kernel text+rodata
            virt: KERNLINK,
            phys_start: v2p(KERNLINK),
            phys_end: v2p(data_start),
            perm: PteFlags::empty(),
        },
        Kmap {
            // kernel data+memory
            virt: data_start,
            phys_start: v2p(data_start),
            phys_end: PHYSTOP,
            perm: PteFlags::W,
        },
        Kmap {
            // more devices
            virt: DEVSPACE,
            phys_start: DEVSPACE,
            phys_end: 0, // wraps: the rest of the address space
            perm: PteFlags::W,
        },
    ]
}

// Set up the kernel part of a page table.
pub fn setupkvm() -> Option<NonNull<PgDir>> {
    let mem = kalloc();
    let mut pgdir = NonNull::new(mem as *mut PgDir)?;
    unsafe { ptr::write_bytes(mem, 0, PGSIZE) };

    assert!(p2v(PHYSTOP) <= DEVSPACE, "PHYSTOP too high");
    for k in kmap().iter() {
        let size = k.phys_end.wrapping_sub(k.phys_start);
        if mappages(
            unsafe { pgdir.as_mut() },
            k.virt,
            size,
            k.phys_start,
            k.perm,
        )
        .is_err()
        {
            freevm(pgdir);
            return None;
        }
    }
    Some(pgdir)
}

// Allocate one page table for the machine for the kernel address
// space for scheduler processes.
pub fn kvmalloc() {
    let pgdir = setupkvm().expect("kvmalloc");
    KPGDIR.store(pgdir.as_ptr() as usize, Ordering::Release);
    switchkvm();
}

// Switch the hardware page table register to the kernel-only page
// table, for when no process is running.
pub fn switchkvm() {
    unsafe { lcr3(v2p(KPGDIR.load(Ordering::Acquire))) };
}

// Switch TSS and hardware page table to correspond to process p.
pub fn switchuvm(p: &Proc) {
    let datap = unsafe { &*p.data.get() };
    if datap.kstack == 0 {
        panic!("switchuvm: no kstack");
    }
    let pgdir = match datap.pgdir {
        Some(pgdir) => pgdir,
        None => panic!("switchuvm: no pgdir"),
    };

    push_off();
    let c = unsafe { Cpus::my_cpu() };
    let ts_base = &c.ts as *const _ as usize;
    c.gdt[SEG_TSS] = SegDesc::seg16(
        STS_T32A,
        ts_base,
        core::mem::size_of_val(&c.ts) - 1,
        0,
    );
    c.ts.ss0 = (SEG_KDATA << 3) as u16;
    c.ts.esp0 = (datap.kstack + KSTACKSIZE) as u32;
    // setting IOPB beyond the TSS limit forbids I/O instructions
    // (e.g., inb and outb) from user space
    c.ts.iomb = 0xFFFF;
    unsafe {
        ltr((SEG_TSS << 3) as u16);
        lcr3(v2p(pgdir.as_ptr() as usize));
    }
    pop_off();
}

// Load the initcode into address 0 of pgdir; sz must be less than a
// page.
pub unsafe fn inituvm(pgdir: &mut PgDir, init: &[u8]) {
    assert!(init.len() < PGSIZE, "inituvm: more than a page");
    let mem = kalloc();
    ptr::write_bytes(mem, 0, PGSIZE);
    mappages(
        pgdir,
        0,
        PGSIZE,
        v2p(mem as usize),
        PteFlags::W | PteFlags::U,
    )
    .expect("inituvm");
    ptr::copy_nonoverlapping(init.as_ptr(), mem, init.len());
}

// Load a program segment into pgdir. addr must be page-aligned and
// the pages from addr to addr+sz must already be mapped.
pub fn loaduvm(
    pgdir: &mut PgDir,
    addr: usize,
    ip: &mut SleepLockGuard<'_, InodeData>,
    offset: u32,
    sz: usize,
) -> Result<(), ()> {
    assert!(addr % PGSIZE == 0, "loaduvm: addr must be page aligned");
    let mut i = 0;
    while i < sz {
        let pte = walkpgdir(pgdir, addr + i, false).expect("loaduvm: address should exist");
        let pa = pte_addr(*pte);
        let n = min(sz - i, PGSIZE);
        if ip.read(VirtAddr::Kernel(p2v(pa)), offset + i as u32, n) != Ok(n) {
            return Err(());
        }
        i += PGSIZE;
    }
    Ok(())
}

// Allocate page tables and physical memory to grow process from
// oldsz to newsz, which need not be page aligned. Returns the new
// size or None on error.
pub fn allocuvm(pgdir: &mut PgDir, oldsz: usize, newsz: usize) -> Option<usize> {
    if newsz >= KERNBASE {
        return None;
    }
    if newsz < oldsz {
        return Some(oldsz);
    }

    let mut a = pg_round_up(oldsz);
    while a < newsz {
        let mem = kalloc();
        if mem.is_null() {
            println!("allocuvm out of memory");
            deallocuvm(pgdir, newsz, oldsz);
            return None;
        }
        unsafe { ptr::write_bytes(mem, 0, PGSIZE) };
        if mappages(
            pgdir,
            a,
            PGSIZE,
            v2p(mem as usize),
            PteFlags::W | PteFlags::U,
        )
        .is_err()
        {
            println!("allocuvm out of memory (2)");
            deallocuvm(pgdir, newsz, oldsz);
            kfree(mem);
            return None;
        }
        a += PGSIZE;
    }
    Some(newsz)
}

// Deallocate user pages to bring the process size from oldsz to
// newsz. oldsz and newsz need not be page-aligned, nor does newsz
// need to be less than oldsz. oldsz can be larger than the actual
// process size. Returns the new process size.
pub fn deallocuvm(pgdir: &mut PgDir, oldsz: usize, newsz: usize) -> usize {
    if newsz >= oldsz {
        return oldsz;
    }

    let mut a = pg_round_up(newsz);
    while a < oldsz {
        match walkpgdir(pgdir, a, false) {
            None => {
                // no page table here; skip to the next directory entry.
                a = pg_round_up((pdx(a) + 1) << 22);
                continue;
            }
            Some(pte) => {
                if *pte & PteFlags::P.bits() != 0 {
                    let pa = pte_addr(*pte);
                    if pa == 0 {
                        panic!("kfree");
                    }
                    kfree(p2v(pa) as *mut u8);
                    *pte = 0;
                }
            }
        }
        a += PGSIZE;
    }
    newsz
}

// Free a page table and all the physical memory pages in the user
// part.
pub fn freevm(mut pgdir: NonNull<PgDir>) {
    deallocuvm(unsafe { pgdir.as_mut() }, KERNBASE, 0);
    for pde in unsafe { pgdir.as_ref() }.entries.iter() {
        if *pde & PteFlags::P.bits() != 0 {
            kfree(p2v(pte_addr(*pde)) as *mut u8);
        }
    }
    kfree(pgdir.as_ptr() as *mut u8);
}

// Clear PTE_U on a page. Used to create an inaccessible page beneath
// the user stack.
pub fn clearpteu(pgdir: &mut PgDir, uva: usize) {
    let pte = walkpgdir(pgdir, uva, false).expect("clearpteu");
    *pte &= !PteFlags::U.bits();
}

// Given a parent process's page table, create a copy of it for a
// child.
pub fn copyuvm(pgdir: &mut PgDir, sz: usize) -> Option<NonNull<PgDir>> {
    let mut d = setupkvm()?;
    let mut i = 0;
    while i < sz {
        let pte = walkpgdir(pgdir, i, false).expect("copyuvm: pte should exist");
        if *pte & PteFlags::P.bits() == 0 {
            panic!("copyuvm: page not present");
        }
        let pa = pte_addr(*pte);
        let flags = pte_flags(*pte);
        let mem = kalloc();
        if mem.is_null() {
            freevm(d);
            return None;
        }
        unsafe { ptr::copy_nonoverlapping(p2v(pa) as *const u8, mem, PGSIZE) };
        if mappages(
            unsafe { d.as_mut() },
            i,
            PGSIZE,
            v2p(mem as usize),
            PteFlags::from_bits_truncate(flags),
        )
        .is_err()
        {
            kfree(mem);
            freevm(d);
            return None;
        }
        i += PGSIZE;
    }
    Some(d)
}

// Map user virtual address to kernel address, checking that the page
// is present and user-accessible.
pub fn uva2ka(pgdir: &mut PgDir, uva: usize) -> Option<*mut u8> {
    let pte = walkpgdir(pgdir, uva, false)?;
    if *pte & PteFlags::P.bits() == 0 || *pte & PteFlags::U.bits() == 0 {
        return None;
    }
    Some(p2v(pte_addr(*pte)) as *mut u8)
}

// Copy bytes to user address va in pgdir, which may not be the
// current page table. Most useful when pgdir is a freshly built
// address space not yet installed (exec builds the user stack this
// way). uva2ka ensures this only works on user pages.
pub fn copyout(pgdir: &mut PgDir, va: usize, src: &[u8]) -> Result<(), ()> {
    let mut len = src.len();
    let mut buf = src.as_ptr();
    let mut va = va;
    while len > 0 {
        let va0 = pg_round_down(va);
        let pa0 = uva2ka(pgdir, va0).ok_or(())?;
        let n = min(PGSIZE - (va - va0), len);
        unsafe { ptr::copy_nonoverlapping(buf, pa0.add(va - va0), n) };
        len -= n;
        buf = unsafe { buf.add(n) };
        va = va0 + PGSIZE;
    }
    Ok(())
}

// An address in either half of the split address space. Kernel and
// user memory are both mapped while a process runs in the kernel, so
// copies are direct; the User arm just bounds-checks first.
#[derive(Clone, Copy, Debug)]
pub enum VirtAddr {
    User(usize),
    Kernel(usize),
}

impl Add<usize> for VirtAddr {
    type Output = Self;
    fn add(self, rhs: usize) -> Self {
        match self {
            VirtAddr::User(a) => VirtAddr::User(a + rhs),
            VirtAddr::Kernel(a) => VirtAddr::Kernel(a + rhs),
        }
    }
}

// Copy to either a user address in the current process, or a kernel
// address.
pub fn either_copyout<T: AsBytes + ?Sized>(dst: VirtAddr, src: &T) -> Result<(), ()> {
    let src = src.as_bytes();
    match dst {
        VirtAddr::User(addr) => {
            let p = Cpus::my_proc().ok_or(())?;
            let pdata = unsafe { &*p.data.get() };
            if addr >= pdata.sz || addr + src.len() > pdata.sz {
                return Err(());
            }
            unsafe { ptr::copy_nonoverlapping(src.as_ptr(), addr as *mut u8, src.len()) };
            Ok(())
        }
        VirtAddr::Kernel(addr) => {
            unsafe { ptr::copy_nonoverlapping(src.as_ptr(), addr as *mut u8, src.len()) };
            Ok(())
        }
    }
}

// Copy from either a user address in the current process, or a
// kernel address.
pub fn either_copyin<T: AsBytes + FromBytes + ?Sized>(
    dst: &mut T,
    src: VirtAddr,
) -> Result<(), ()> {
    let dst = dst.as_bytes_mut();
    match src {
        VirtAddr::User(addr) => {
            let p = Cpus::my_proc().ok_or(())?;
            let pdata = unsafe { &*p.data.get() };
            if addr >= pdata.sz || addr + dst.len() > pdata.sz {
                return Err(());
            }
            unsafe { ptr::copy_nonoverlapping(addr as *const u8, dst.as_mut_ptr(), dst.len()) };
            Ok(())
        }
        VirtAddr::Kernel(addr) => {
            unsafe { ptr::copy_nonoverlapping(addr as *const u8, dst.as_mut_ptr(), dst.len()) };
            Ok(())
        }
    }
}
