// Simple logging that allows concurrent FS system calls.
//
// A log transaction contains the updates of multiple FS system
// calls. The logging system only commits when there are
// no FS system calls active. Thus there is never
// any reasoning required about whether a commit might
// write an uncommitted system call's updates to disk.
//
// A system call should call LOG.begin_op()/LOG.end_op() to mark
// its start and end. Usually begin_op just increments
// the count of in-progress FS system calls and returns.
// But if it thinks the log is close to running out, it
// sleeps until the last outstanding end_op commits.
//
// The log is a physical re-do log containing disk blocks.
// The on-disk log format:
//   header block, containing block #s for block A, B, C, ...
//   block A
//   block B
//   block C
//   ...
// Log appends are synchronous.

use crate::bio::{BufGuard, BCACHE};
use crate::fs::{SuperBlock, BSIZE};
use crate::param::{LOGSIZE, MAXOPBLOCKS};
use crate::proc::{sleep, PTABLE};
use crate::spinlock::Mutex;

pub static LOG: Mutex<Log> = Mutex::new(Log::new(), "log");

// Contents of the header block, used for both the on-disk header
// block and to keep track in memory of logged block #s before commit.
#[repr(C)]
#[derive(Clone, Copy)]
struct LogHeader {
    n: u32,
    block: [u32; LOGSIZE],
}

pub struct Log {
    start: u32,
    size: u32,
    dev: u32,
    outstanding: u32, // how many FS sys calls are executing.
    committing: bool, // in commit(), please wait.
    lh: LogHeader,
}

impl Log {
    const fn new() -> Self {
        Self {
            start: 0,
            size: 0,
            dev: 0,
            outstanding: 0,
            committing: false,
            lh: LogHeader {
                n: 0,
                block: [0; LOGSIZE],
            },
        }
    }

    // Read the log header from disk into the in-memory log header.
    fn read_head(&mut self) {
        let bp = BCACHE.read(self.dev, self.start);
        let lh = bp.align_to::<LogHeader>().first().unwrap();
        self.lh = *lh;
    }

    // Write the in-memory log header to disk.
    // This is the true point at which the
    // current transaction commits.
    fn write_head(&self) {
        let mut bp = BCACHE.read(self.dev, self.start);
        *bp.align_to_mut::<LogHeader>().first_mut().unwrap() = self.lh;
        bp.write();
    }

    // Copy committed blocks from the log to their home location.
    fn install_trans(&self, recovering: bool) {
        for tail in 0..self.lh.n {
            let lbuf = BCACHE.read(self.dev, self.start + tail + 1); // log block
            let mut dbuf = BCACHE.read(self.dev, self.lh.block[tail as usize]); // dst
            dbuf.data.copy_from_slice(&lbuf.data);
            dbuf.write(); // write dst to disk
            if !recovering {
                dbuf.unpin();
            }
        }
    }

    // Copy modified blocks from cache to log.
    fn write_log(&self) {
        for tail in 0..self.lh.n {
            let mut to = BCACHE.read(self.dev, self.start + tail + 1); // log block
            let from = BCACHE.read(self.dev, self.lh.block[tail as usize]); // cache block
            to.data.copy_from_slice(&from.data);
            to.write();
        }
    }

    fn recover(&mut self) {
        self.read_head();
        self.install_trans(true); // if committed, copy from log to disk
        self.lh.n = 0;
        self.write_head(); // clear the log
    }

    fn commit(&mut self) {
        if self.lh.n > 0 {
            self.write_log(); // Write modified blocks from cache to log
            self.write_head(); // Write header to disk -- the real commit
            self.install_trans(false); // Now install writes to home locations
            self.lh.n = 0;
            self.write_head(); // Erase the transaction from the log
        }
    }
}

impl Mutex<Log> {
    // Called once from the first process's context (recovery reads
    // the disk and so may sleep), before any FS system call.
    pub fn init(&self, dev: u32, sb: &SuperBlock) {
        assert!(
            core::mem::size_of::<LogHeader>() < BSIZE,
            "initlog: too big logheader"
        );
        let log = unsafe { self.get_mut() };
        log.start = sb.logstart;
        log.size = sb.nlog;
        log.dev = dev;
        log.recover();
    }

    // Called at the start of each FS system call.
    pub fn begin_op(&self) {
        let mut log = self.lock();
        loop {
            if log.committing {
                let chan = &*log as *const Log as usize;
                log = sleep(chan, log);
            } else if log.lh.n as usize + (log.outstanding as usize + 1) * MAXOPBLOCKS > LOGSIZE
            {
                // this op might exhaust log space; wait for commit.
                let chan = &*log as *const Log as usize;
                log = sleep(chan, log);
            } else {
                log.outstanding += 1;
                break;
            }
        }
    }

    // Called at the end of each FS system call.
    // Commits if this was the last outstanding operation.
    pub fn end_op(&self) {
        let mut do_commit = false;

        {
            let mut log = self.lock();
            log.outstanding -= 1;
            assert!(!log.committing, "log.committing");
            if log.outstanding == 0 {
                do_commit = true;
                log.committing = true;
            } else {
                // begin_op may be waiting for log space, and
                // decrementing log.outstanding has decreased
                // the amount of reserved space.
                let chan = &*log as *const Log as usize;
                PTABLE.wakeup(chan);
            }
        }

        if do_commit {
            // call commit without holding locks, since not allowed
            // to sleep with locks.
            unsafe { self.get_mut().commit() };
            let mut log = self.lock();
            log.committing = false;
            let chan = &*log as *const Log as usize;
            PTABLE.wakeup(chan);
        }
    }

    // Caller has modified the buffer and is done with it.
    // Record the block number and pin the buffer in the cache by
    // increasing its refcnt; commit will do the disk write.
    //
    // LOG.write replaces BufGuard::write; a typical use is:
    //   let mut bp = BCACHE.read(...);
    //   modify bp.data[]
    //   LOG.write(bp)
    pub fn write(&self, b: BufGuard) {
        let mut log = self.lock();
        assert!(
            (log.lh.n as usize) < LOGSIZE && log.lh.n < log.size - 1,
            "too big a transaction"
        );
        assert!(log.outstanding >= 1, "log write outside of trans");

        let blockno = b.blockno;
        for i in 0..log.lh.n as usize {
            if log.lh.block[i] == blockno {
                // log absorption
                return;
            }
        }
        let n = log.lh.n as usize;
        log.lh.block[n] = blockno;
        b.pin();
        log.lh.n += 1;
        // b drops here: the sleep lock is released but the pinned
        // refcnt keeps the slot from being recycled before commit.
    }
}
