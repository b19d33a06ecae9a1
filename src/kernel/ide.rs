// Simple PIO-based (non-DMA) IDE driver.

use crate::bio::BufData;
use crate::fs::BSIZE;
use crate::ioapic;
use crate::proc::{sleep, CPUS, PTABLE};
use crate::spinlock::Mutex;
use crate::trap::IRQ_IDE;
use crate::x86::{inb, insl, outb, outsl};
use alloc::collections::VecDeque;

const SECTOR_SIZE: usize = 512;

const IDE_BSY: u8 = 0x80;
const IDE_DRDY: u8 = 0x40;
const IDE_DF: u8 = 0x20;
const IDE_ERR: u8 = 0x01;

const IDE_CMD_READ: u8 = 0x20;
const IDE_CMD_WRITE: u8 = 0x30;
const IDE_CMD_RDMUL: u8 = 0xc4;
const IDE_CMD_WRMUL: u8 = 0xc5;

pub static IDE: Ide = Ide {
    state: Mutex::new(
        IdeState {
            queue: VecDeque::new(),
            havedisk1: false,
        },
        "ide",
    ),
};

// A queued request. The pointer refers into the static buffer cache,
// so it stays valid while the request is outstanding (the requester
// holds the buffer's sleep lock until the interrupt side finishes).
struct Req {
    buf: *mut BufData,
    write: bool,
}
unsafe impl Send for Req {}

struct IdeState {
    queue: VecDeque<Req>,
    havedisk1: bool,
}

pub struct Ide {
    state: Mutex<IdeState>,
}

// Wait for IDE disk to become ready.
fn wait(checkerr: bool) -> Result<(), ()> {
    loop {
        let r = inb(0x1f7);
        if r & (IDE_BSY | IDE_DRDY) == IDE_DRDY {
            if checkerr && r & (IDE_DF | IDE_ERR) != 0 {
                return Err(());
            }
            return Ok(());
        }
    }
}

impl Ide {
    pub fn init(&self) {
        ioapic::enable(IRQ_IDE, (CPUS.count() - 1) as u32);
        wait(false).ok();

        // Check if disk 1 is present.
        outb(0x1f6, 0xe0 | (1 << 4));
        let mut havedisk1 = false;
        for _ in 0..1000 {
            if inb(0x1f7) != 0 {
                havedisk1 = true;
                break;
            }
        }
        self.state.lock().havedisk1 = havedisk1;

        // Switch back to disk 0.
        outb(0x1f6, 0xe0);
    }

    // Start the request for b. Caller must hold the queue lock.
    fn start(&self, b: &BufData, write: bool) {
        let sector_per_block = (BSIZE / SECTOR_SIZE) as u32;
        assert!(sector_per_block <= 7, "ide::start");
        let sector = b.blockno * sector_per_block;
        let (read_cmd, write_cmd) = if sector_per_block == 1 {
            (IDE_CMD_READ, IDE_CMD_WRITE)
        } else {
            (IDE_CMD_RDMUL, IDE_CMD_WRMUL)
        };

        wait(false).ok();
        outb(0x3f6, 0); // generate interrupt
        outb(0x1f2, sector_per_block as u8); // number of sectors
        outb(0x1f3, (sector & 0xff) as u8);
        outb(0x1f4, ((sector >> 8) & 0xff) as u8);
        outb(0x1f5, ((sector >> 16) & 0xff) as u8);
        outb(
            0x1f6,
            0xe0 | (((b.dev & 1) as u8) << 4) | (((sector >> 24) & 0x0f) as u8),
        );
        if write {
            outb(0x1f7, write_cmd);
            unsafe { outsl(0x1f0, b.data.as_ptr() as *const u32, BSIZE / 4) };
        } else {
            outb(0x1f7, read_cmd);
        }
    }

    // Sync the buffer with disk: write it out if write, else fill it
    // from disk. The caller holds the buffer's sleep lock.
    pub fn rw(&self, b: &mut BufData, write: bool) {
        if b.dev != 0 && !self.state.lock().havedisk1 {
            panic!("ide::rw: ide disk 1 not present");
        }

        let mut state = self.state.lock();

        // The disk owns the buffer until the interrupt handler is done
        // with it.
        b.disk = true;

        // Append to the request queue; start if it was idle.
        state.queue.push_back(Req {
            buf: b as *mut BufData,
            write,
        });
        if state.queue.len() == 1 {
            self.start(b, write);
        }

        // Wait for the request to finish.
        while b.disk {
            state = sleep(b.chan(), state);
        }
    }

    // Interrupt handler: the head request has completed.
    pub fn intr(&self) {
        let mut state = self.state.lock();

        let req = match state.queue.pop_front() {
            Some(req) => req,
            // spurious IDE interrupt
            None => return,
        };
        let b = unsafe { &mut *req.buf };

        // Read data if needed.
        if !req.write && wait(true).is_ok() {
            unsafe { insl(0x1f0, b.data.as_mut_ptr() as *mut u32, BSIZE / 4) };
        }

        // Wake the process waiting for this buffer.
        b.disk = false;
        PTABLE.wakeup(b.chan());

        // Start the disk on the next buffer in the queue.
        if let Some(next) = state.queue.front() {
            let (buf, write) = (next.buf, next.write);
            self.start(unsafe { &*buf }, write);
        }
    }
}
