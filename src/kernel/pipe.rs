use crate::fcntl::OMode;
use crate::file::{FType, File, FTABLE};
use crate::proc::{sleep, Cpus, PTABLE};
use crate::spinlock::Mutex;
use crate::vm::{either_copyin, either_copyout, VirtAddr};
use alloc::sync::Arc;

const PIPESIZE: usize = 512;

pub struct Pipe {
    inner: Mutex<PipeInner>,
}

struct PipeInner {
    data: [u8; PIPESIZE],
    nread: u32,     // number of bytes read
    nwrite: u32,    // number of bytes written
    readopen: bool, // read fd is still open
    writeopen: bool, // write fd is still open
}

// One side of a pipe. The buffer is shared; dropping an end closes
// that side and wakes any peer blocked on it.
pub struct PipeEnd {
    pipe: Arc<Pipe>,
    write: bool,
}

impl Pipe {
    pub fn alloc() -> Option<(File, File)> {
        let pipe = Arc::new(Pipe {
            inner: Mutex::new(
                PipeInner {
                    data: [0; PIPESIZE],
                    nread: 0,
                    nwrite: 0,
                    readopen: true,
                    writeopen: true,
                },
                "pipe",
            ),
        });

        let rend = PipeEnd {
            pipe: Arc::clone(&pipe),
            write: false,
        };
        let wend = PipeEnd { pipe, write: true };

        let f0 = FTABLE.alloc(OMode::RDONLY, FType::Pipe(rend))?;
        let f1 = FTABLE.alloc(OMode::WRONLY, FType::Pipe(wend))?;
        Some((f0, f1))
    }
}

impl PipeEnd {
    pub fn write(&self, src: VirtAddr, n: usize) -> Result<usize, ()> {
        let p = Cpus::my_proc().unwrap();
        let mut pi = self.pipe.inner.lock();

        let mut i = 0;
        while i < n {
            while pi.nwrite == pi.nread + PIPESIZE as u32 {
                // pipe is full
                if !pi.readopen || PTABLE.killed(p) {
                    return Err(());
                }
                let rchan = &pi.nread as *const u32 as usize;
                let wchan = &pi.nwrite as *const u32 as usize;
                PTABLE.wakeup(rchan);
                pi = sleep(wchan, pi);
            }
            let mut c: u8 = 0;
            if either_copyin(&mut c, src + i).is_err() {
                break;
            }
            let slot = pi.nwrite as usize % PIPESIZE;
            pi.data[slot] = c;
            pi.nwrite += 1;
            i += 1;
        }
        let rchan = &pi.nread as *const u32 as usize;
        PTABLE.wakeup(rchan);
        Ok(i)
    }

    pub fn read(&self, dst: VirtAddr, n: usize) -> Result<usize, ()> {
        let p = Cpus::my_proc().unwrap();
        let mut pi = self.pipe.inner.lock();

        while pi.nread == pi.nwrite && pi.writeopen {
            // pipe is empty
            if PTABLE.killed(p) {
                return Err(());
            }
            let rchan = &pi.nread as *const u32 as usize;
            pi = sleep(rchan, pi);
        }

        let mut i = 0;
        while i < n {
            if pi.nread == pi.nwrite {
                break;
            }
            let c = pi.data[pi.nread as usize % PIPESIZE];
            pi.nread += 1;
            if either_copyout(dst + i, &c).is_err() {
                break;
            }
            i += 1;
        }
        let wchan = &pi.nwrite as *const u32 as usize;
        PTABLE.wakeup(wchan);
        Ok(i)
    }
}

impl Drop for PipeEnd {
    fn drop(&mut self) {
        let mut pi = self.pipe.inner.lock();
        if self.write {
            pi.writeopen = false;
            let rchan = &pi.nread as *const u32 as usize;
            PTABLE.wakeup(rchan);
        } else {
            pi.readopen = false;
            let wchan = &pi.nwrite as *const u32 as usize;
            PTABLE.wakeup(wchan);
        }
    }
}
