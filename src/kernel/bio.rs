// Buffer cache.
//
// The buffer cache is a fixed pool of buffers holding cached copies of
// disk block contents. Caching disk blocks in memory reduces the
// number of disk reads and also provides a synchronization point for
// disk blocks used by multiple processes.
//
// Interface:
// * To get a buffer for a particular disk block, call BCACHE.read.
// * After changing buffer data, call BufGuard::write to flush it.
// * When done with the buffer, drop the guard (brelse).
// * Only one process at a time can use a buffer,
//     so do not keep them longer than necessary.

use crate::fs::BSIZE;
use crate::ide::IDE;
use crate::param::NBUF;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::Mutex;
use array_macro::array;
use core::ops::{Deref, DerefMut};

pub static BCACHE: BCache = BCache::new();

pub struct BufData {
    pub data: [u8; BSIZE],
    pub valid: bool, // has data been read from disk?
    pub disk: bool,  // does the disk "own" the buffer?
    pub dev: u32,
    pub blockno: u32,
}

impl BufData {
    const fn new() -> Self {
        Self {
            data: [0; BSIZE],
            valid: false,
            disk: false,
            dev: 0,
            blockno: 0,
        }
    }

    pub fn chan(&self) -> usize {
        self as *const BufData as usize
    }
}

// Identity and reuse bookkeeping for each slot, all under one lock.
// A slot with refcnt == 0 may be recycled; among those, the one with
// the oldest release stamp goes first (least recently used).
#[derive(Clone, Copy)]
struct BufMeta {
    dev: u32,
    blockno: u32,
    refcnt: u32,
    stamp: u64,
}

struct Lru {
    meta: [BufMeta; NBUF],
    clock: u64,
}

pub struct BCache {
    lru: Mutex<Lru>,
    bufs: [SleepLock<BufData>; NBUF],
}

pub struct BufGuard {
    guard: Option<SleepLockGuard<'static, BufData>>,
    idx: usize,
}

impl BCache {
    const fn new() -> Self {
        Self {
            lru: Mutex::new(
                Lru {
                    meta: [BufMeta {
                        dev: 0,
                        blockno: 0,
                        refcnt: 0,
                        stamp: 0,
                    }; NBUF],
                    clock: 0,
                },
                "bcache",
            ),
            bufs: array![_ => SleepLock::new(BufData::new(), "buffer"); NBUF],
        }
    }

    // Look through the cache for block on device dev. If not found,
    // recycle the least recently used unreferenced buffer. The slot is
    // returned referenced but not locked.
    fn get(&self, dev: u32, blockno: u32) -> usize {
        let mut lru = self.lru.lock();

        // Is the block already cached?
        for (i, m) in lru.meta.iter_mut().enumerate() {
            if m.dev == dev && m.blockno == blockno {
                m.refcnt += 1;
                return i;
            }
        }

        // Not cached; recycle the oldest unreferenced buffer.
        let mut victim = None;
        for (i, m) in lru.meta.iter().enumerate() {
            if m.refcnt == 0 && victim.map_or(true, |(_, s)| m.stamp < s) {
                victim = Some((i, m.stamp));
            }
        }
        let (i, _) = victim.expect("bget: no buffers");
        let m = &mut lru.meta[i];
        m.dev = dev;
        m.blockno = blockno;
        m.refcnt = 1;
        // refcnt was 0, so nobody holds the sleep lock.
        let b = unsafe { self.bufs[i].get_mut() };
        b.dev = dev;
        b.blockno = blockno;
        b.valid = false;
        i
    }

    // Return a locked buffer with the contents of the indicated block.
    pub fn read(&'static self, dev: u32, blockno: u32) -> BufGuard {
        let idx = self.get(dev, blockno);
        let mut guard = self.bufs[idx].lock();
        if !guard.valid {
            IDE.rw(&mut guard, false);
            guard.valid = true;
        }
        BufGuard {
            guard: Some(guard),
            idx,
        }
    }

    fn relse(&self, idx: usize) {
        let mut lru = self.lru.lock();
        let m = &mut lru.meta[idx];
        assert!(m.refcnt > 0, "brelse");
        m.refcnt -= 1;
        if m.refcnt == 0 {
            lru.clock += 1;
            let stamp = lru.clock;
            lru.meta[idx].stamp = stamp;
        }
    }

    fn pin(&self, idx: usize) {
        self.lru.lock().meta[idx].refcnt += 1;
    }

    fn unpin(&self, idx: usize) {
        let mut lru = self.lru.lock();
        assert!(lru.meta[idx].refcnt > 0, "unpin");
        lru.meta[idx].refcnt -= 1;
    }
}

impl BufGuard {
    // Write the buffer's contents to disk. Must be locked (it is: the
    // guard proves it).
    pub fn write(&mut self) {
        IDE.rw(self.guard.as_mut().unwrap(), true);
    }

    // Keep the slot referenced across a guard drop (the log does this
    // for blocks recorded in a pending transaction).
    pub fn pin(&self) {
        BCACHE.pin(self.idx);
    }

    pub fn unpin(&self) {
        BCACHE.unpin(self.idx);
    }

    // View the block contents as a slice of fixed-layout records.
    pub fn align_to<U>(&self) -> &[U] {
        let (head, body, _) = unsafe { self.guard.as_ref().unwrap().data.align_to::<U>() };
        assert!(head.is_empty(), "block data was not aligned");
        body
    }

    pub fn align_to_mut<U>(&mut self) -> &mut [U] {
        let (head, body, _) =
            unsafe { self.guard.as_mut().unwrap().data.align_to_mut::<U>() };
        assert!(head.is_empty(), "block data was not aligned");
        body
    }
}

impl Deref for BufGuard {
    type Target = BufData;
    fn deref(&self) -> &BufData {
        self.guard.as_ref().unwrap()
    }
}

impl DerefMut for BufGuard {
    fn deref_mut(&mut self) -> &mut BufData {
        self.guard.as_mut().unwrap()
    }
}

impl Drop for BufGuard {
    fn drop(&mut self) {
        // release the sleep lock, then the reference.
        self.guard.take();
        BCACHE.relse(self.idx);
    }
}
