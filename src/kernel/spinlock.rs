// Mutual exclusion spin locks.

use crate::proc::Cpus;
use crate::x86::{cli, intr_get, sti};
use core::cell::{Cell, UnsafeCell};
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{fence, AtomicBool, Ordering};

pub struct Mutex<T: ?Sized> {
    locked: AtomicBool,
    name: &'static str, // for debugging
    cpuid: Cell<isize>, // cpu holding the lock, -1 means none
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}

pub struct MutexGuard<'a, T: ?Sized + 'a> {
    mutex: &'a Mutex<T>,
}

impl<T> Mutex<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            locked: AtomicBool::new(false),
            name,
            cpuid: Cell::new(-1),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    // Acquire the lock.
    // Loops (spins) until the lock is acquired.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        push_off(); // disable interrupts to avoid deadlock.
        assert!(!self.holding(), "acquire {}", self.name);

        while self.locked.swap(true, Ordering::Acquire) {
            core::hint::spin_loop();
        }

        // the critical section's loads and stores must happen
        // strictly after the lock is acquired.
        fence(Ordering::SeqCst);

        self.cpuid.set(unsafe { Cpus::my_cpu_index() } as isize);
        MutexGuard { mutex: self }
    }

    // Check whether this cpu is holding the lock.
    // Interrupts must be off.
    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
            && self.cpuid.get() == unsafe { Cpus::my_cpu_index() } as isize
    }

    fn release(&self) {
        assert!(self.holding(), "release {}", self.name);
        self.cpuid.set(-1);

        // the critical section's stores must be visible to other
        // CPUs before the lock is released.
        fence(Ordering::SeqCst);
        self.locked.store(false, Ordering::Release);

        pop_off();
    }

    // Release the lock held by a guard that lives on another kernel
    // thread's stack. The scheduler hands a newly dispatched process a
    // held lock; the process must drop it from its own stack even
    // though it never saw the guard.
    //
    // Safety: the lock must be held by the current cpu.
    pub unsafe fn force_unlock(&self) {
        self.release();
    }

    // Unlock explicitly, getting back a reference to the Mutex so
    // the caller can re-lock later (sleep does this).
    pub fn unlock(guard: MutexGuard<'_, T>) -> &Mutex<T> {
        let mutex = guard.mutex;
        drop(guard);
        mutex
    }

    // Peek at the data without locking.
    //
    // Safety: only for code that tolerates races (procdump) or that
    // owns the slot exclusively (an EMBRYO's creator before publication,
    // panic paths).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self) -> &mut T {
        &mut *self.data.get()
    }
}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    pub fn holding(&self) -> bool {
        self.mutex.holding()
    }
}

impl<'a, T: ?Sized> Deref for MutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        self.mutex.release();
    }
}

// push_off/pop_off are like cli/sti except that they are matched:
// it takes two pop_off()s to undo two push_off()s. Also, if
// interrupts are initially off, then push_off, pop_off leaves them off.

pub fn push_off() {
    let old = intr_get();

    cli();
    let cpu = unsafe { Cpus::my_cpu() };
    if cpu.ncli == 0 {
        cpu.intena = old;
    }
    cpu.ncli += 1;
}

pub fn pop_off() {
    assert!(!intr_get(), "pop_off - interruptible");
    let cpu = unsafe { Cpus::my_cpu() };
    assert!(cpu.ncli >= 1, "pop_off");
    cpu.ncli -= 1;
    if cpu.ncli == 0 && cpu.intena {
        sti();
    }
}
