// Physical memory allocator, intended to allocate memory for user
// processes, kernel stacks, page table pages, and pipe buffers.
// Allocates whole 4096-byte pages from a free list.
//
// A slice of memory just past the kernel image is handed to a buddy
// allocator instead and backs the kernel heap (Arc, Box, String).

use crate::memlayout::{p2v, v2p, PHYSTOP};
use crate::mmu::{pg_round_up, PGSIZE};
use crate::spinlock::Mutex;
use buddy_alloc::{buddy_alloc::BuddyAlloc, BuddyAllocParam};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

extern "C" {
    // first address after kernel loaded from ELF file,
    // defined by kernel.ld.
    static end: [u8; 0];
}

// memory carved out for the kernel heap
const KHEAPSIZE: usize = 0x100000;

struct Run {
    next: *mut Run,
}

struct FreeList {
    head: *mut Run,
}
unsafe impl Send for FreeList {}

struct Kmem {
    // kinit1 runs while still executing on a single CPU and with the
    // CPU table not yet filled in, so locking is deferred to kinit2.
    use_lock: AtomicBool,
    freelist: Mutex<FreeList>,
}

static KMEM: Kmem = Kmem {
    use_lock: AtomicBool::new(false),
    freelist: Mutex::new(FreeList { head: ptr::null_mut() }, "kmem"),
};

// Initialization happens in two phases.
// 1. main() calls kinit1() while still using entrypgdir to place just
// the pages mapped by entrypgdir on the free list.
// 2. main() calls kinit2() with the rest of the physical pages
// after installing a full page table that maps them on all cores.

pub unsafe fn kinit1(vstart: usize, vend: usize) {
    // the kernel heap comes first, so Arc and friends work from the
    // moment the first process is forged.
    let heap = pg_round_up(vstart);
    HEAP.init(heap as *mut u8, KHEAPSIZE);
    freerange(heap + KHEAPSIZE, vend);
}

pub unsafe fn kinit2(vstart: usize, vend: usize) {
    freerange(vstart, vend);
    KMEM.use_lock.store(true, Ordering::Release);
}

unsafe fn freerange(vstart: usize, vend: usize) {
    let mut p = pg_round_up(vstart);
    while p + PGSIZE <= vend {
        kfree(p as *mut u8);
        p += PGSIZE;
    }
}

// Free the page of physical memory pointed at by v, which normally
// should have been returned by a call to kalloc(). (The exception is
// when initializing the allocator; see kinit above.)
pub fn kfree(v: *mut u8) {
    let va = v as usize;
    if va % PGSIZE != 0 || va < unsafe { end.as_ptr() as usize } || v2p(va) >= PHYSTOP {
        panic!("kfree");
    }

    // Fill with junk to catch dangling refs.
    unsafe { ptr::write_bytes(v, 1, PGSIZE) };

    let r = v as *mut Run;
    if KMEM.use_lock.load(Ordering::Acquire) {
        let mut list = KMEM.freelist.lock();
        unsafe { (*r).next = list.head };
        list.head = r;
    } else {
        let list = unsafe { KMEM.freelist.get_mut() };
        unsafe { (*r).next = list.head };
        list.head = r;
    }
}

// Allocate one 4096-byte page of physical memory.
// Returns a pointer the kernel can use, or null if
// the memory cannot be allocated.
pub fn kalloc() -> *mut u8 {
    let r;
    if KMEM.use_lock.load(Ordering::Acquire) {
        let mut list = KMEM.freelist.lock();
        r = list.head;
        if !r.is_null() {
            list.head = unsafe { (*r).next };
        }
    } else {
        let list = unsafe { KMEM.freelist.get_mut() };
        r = list.head;
        if !r.is_null() {
            list.head = unsafe { (*r).next };
        }
    }
    r as *mut u8
}

// The kernel heap.

#[global_allocator]
static HEAP: KHeap = KHeap(Mutex::new(None, "kheap"));

struct KHeap(Mutex<Option<BuddyAlloc>>);
unsafe impl Sync for KHeap {}

impl KHeap {
    unsafe fn init(&self, base: *mut u8, size: usize) {
        let mut heap = self.0.lock();
        assert!(heap.is_none(), "kheap: double init");
        heap.replace(BuddyAlloc::new(BuddyAllocParam::new(
            base as *const u8,
            size,
            16,
        )));
    }
}

unsafe impl GlobalAlloc for KHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.0
            .lock()
            .as_mut()
            .expect("kheap: not initialized")
            .malloc(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.0.lock().as_mut().expect("kheap: not initialized").free(ptr)
    }
}

#[alloc_error_handler]
fn handle_alloc_error(layout: Layout) -> ! {
    panic!("kernel heap: alloc error: {:?}", layout)
}

pub fn kernel_end() -> usize {
    unsafe { end.as_ptr() as usize }
}

pub fn phystop_va() -> usize {
    p2v(PHYSTOP)
}
