// Long-term locks for processes. Held across disk I/O; the holder
// sleeps rather than spins, and the CPU stays interruptible.

use crate::proc::{sleep, Cpus, PTABLE};
use crate::spinlock::Mutex;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

pub struct SleepLock<T> {
    lk: Mutex<SleepLockInfo>, // spinlock protecting this sleep lock
    data: UnsafeCell<T>,
    name: &'static str,
}
unsafe impl<T: Send> Sync for SleepLock<T> {}
unsafe impl<T: Send> Send for SleepLock<T> {}

struct SleepLockInfo {
    locked: bool,
    pid: u32, // holder, for debugging
}

pub struct SleepLockGuard<'a, T> {
    lock: &'a SleepLock<T>,
}

impl<T> SleepLock<T> {
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            lk: Mutex::new(SleepLockInfo { locked: false, pid: 0 }, "sleep lock"),
            data: UnsafeCell::new(data),
            name,
        }
    }

    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let p = Cpus::my_proc().expect("sleeplock");
        let mut lk = self.lk.lock();
        while lk.locked {
            lk = sleep(self as *const _ as usize, lk);
        }
        lk.locked = true;
        lk.pid = PTABLE.pid(p);
        SleepLockGuard { lock: self }
    }

    pub fn holding(&self) -> bool {
        let lk = self.lk.lock();
        lk.locked
            && Cpus::my_proc().map_or(false, |p| PTABLE.pid(p) == lk.pid)
    }

    // Peek at the data without locking.
    //
    // Safety: only when no other reference can exist, e.g. while the
    // buffer cache recycles a slot whose refcnt is zero.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self) -> &mut T {
        &mut *self.data.get()
    }
}

impl<'a, T> Deref for SleepLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SleepLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        assert!(self.lock.holding(), "release {}", self.lock.name);
        {
            let mut lk = self.lock.lk.lock();
            lk.locked = false;
            lk.pid = 0;
        }
        PTABLE.wakeup(self.lock as *const _ as usize);
    }
}
