// Support functions for system calls that involve file descriptors.

use crate::defs::as_bytes;
use crate::fcntl::OMode;
use crate::fs::{create, Inode, Path, BSIZE};
use crate::lazy::SyncOnceCell;
use crate::log::LOG;
use crate::param::{MAXOPBLOCKS, NDEV, NFILE};
use crate::pipe::PipeEnd;
use crate::spinlock::Mutex;
use crate::stat::{IType, Stat};
use crate::vm::{either_copyout, VirtAddr};
use alloc::sync::Arc;
use array_macro::array;
use core::cell::UnsafeCell;
use core::ops::Deref;

pub static DEVSW: DevSW = DevSW::new();
pub static FTABLE: Ftable = Mutex::new(array![_ => None; NFILE], "ftable");

pub type Ftable = Mutex<[Option<Arc<VFile>>; NFILE]>;

// A process's handle on an open file: a counted reference into the
// system-wide open file table plus this descriptor's access mode.
// Cloning is dup; dropping the last clone closes.
#[derive(Clone)]
pub struct File {
    f: Option<Arc<VFile>>,
    readable: bool,
    writable: bool,
}

pub enum VFile {
    Device(DNod),
    Inode(FNod),
    Pipe(PipeEnd),
}

// device node
pub struct DNod {
    driver: &'static dyn Device,
    ip: Inode,
}

// file or directory node, with the shared read/write offset
pub struct FNod {
    off: UnsafeCell<u32>,
    ip: Inode,
}
// off races between processes sharing the descriptor are benign; the
// inode lock serializes the actual I/O, as it always has.
unsafe impl Send for FNod {}
unsafe impl Sync for FNod {}

// Device functions, dispatched through dyn
pub trait Device: Send + Sync {
    fn read(&self, dst: VirtAddr, n: usize) -> Result<usize, ()>;
    fn write(&self, src: VirtAddr, n: usize) -> Result<usize, ()>;
    fn major(&self) -> Major;
}

impl core::fmt::Debug for dyn Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Device fn {:?}", self.major())
    }
}

impl FNod {
    fn new(ip: Inode) -> Self {
        Self {
            off: UnsafeCell::new(0),
            ip,
        }
    }

    fn read(&self, dst: VirtAddr, n: usize) -> Result<usize, ()> {
        let mut ip = self.ip.lock();
        let off = unsafe { &mut *self.off.get() };
        let r = ip.read(dst, *off, n)?;
        *off += r as u32;
        Ok(r)
    }

    fn write(&self, src: VirtAddr, n: usize) -> Result<usize, ()> {
        // write a few blocks at a time to avoid exceeding the maximum
        // log transaction size, including i-node, indirect block,
        // allocation blocks, and 2 blocks of slop for non-aligned
        // writes. this really belongs lower down, since writei() might
        // be writing a device like the console.
        let max = ((MAXOPBLOCKS - 1 - 1 - 2) / 2) * BSIZE;
        let off = unsafe { &mut *self.off.get() };
        let mut i = 0;
        while i < n {
            let n1 = (n - i).min(max);
            let r;
            {
                LOG.begin_op();
                let mut ip = self.ip.lock();
                r = ip.write(src + i, *off, n1);
                if let Ok(w) = r {
                    *off += w as u32;
                }
                drop(ip);
                LOG.end_op();
            }
            match r {
                Ok(w) if w == n1 => i += w,
                // error from inode write
                _ => return Err(()),
            }
        }
        Ok(n)
    }
}

impl VFile {
    fn read(&self, dst: VirtAddr, n: usize) -> Result<usize, ()> {
        match self {
            VFile::Device(d) => d.driver.read(dst, n),
            VFile::Inode(f) => f.read(dst, n),
            VFile::Pipe(p) => p.read(dst, n),
        }
    }

    fn write(&self, src: VirtAddr, n: usize) -> Result<usize, ()> {
        match self {
            VFile::Device(d) => d.driver.write(src, n),
            VFile::Inode(f) => f.write(src, n),
            VFile::Pipe(p) => p.write(src, n),
        }
    }

    // Get metadata about file f; addr points to a user struct stat.
    pub fn stat(&self, addr: VirtAddr) -> Result<(), ()> {
        let mut stat = Stat::default();
        match self {
            VFile::Device(DNod { ip, .. }) | VFile::Inode(FNod { ip, .. }) => {
                ip.lock().stat(&mut stat);
                either_copyout(addr, unsafe { as_bytes(&stat) })
            }
            _ => Err(()),
        }
    }
}

impl File {
    // Read from file f.
    pub fn read(&self, dst: VirtAddr, n: usize) -> Result<usize, ()> {
        if !self.readable {
            return Err(());
        }
        self.f.as_ref().unwrap().read(dst, n)
    }

    // Write to file f.
    pub fn write(&self, src: VirtAddr, n: usize) -> Result<usize, ()> {
        if !self.writable {
            return Err(());
        }
        self.f.as_ref().unwrap().write(src, n)
    }
}

impl Deref for File {
    type Target = Arc<VFile>;
    fn deref(&self) -> &Arc<VFile> {
        self.f.as_ref().unwrap()
    }
}

impl Drop for File {
    // fileclose: drop a reference; the last one tears the entry down.
    fn drop(&mut self) {
        let f = self.f.take().unwrap();
        assert!(Arc::strong_count(&f) >= 2, "file drop");

        if Arc::strong_count(&f) == 2 {
            // only the table's reference will remain; clear the slot.
            let mut table = FTABLE.lock();
            for entry in table.iter_mut() {
                match entry {
                    Some(vf) if Arc::ptr_eq(&f, vf) => {
                        entry.take();
                    }
                    _ => (),
                }
            }
        }

        // If that made us the sole owner, release what the file held.
        match Arc::try_unwrap(f) {
            Ok(VFile::Inode(FNod { ip, .. })) | Ok(VFile::Device(DNod { ip, .. })) => {
                LOG.begin_op();
                drop(ip);
                LOG.end_op();
            }
            Ok(VFile::Pipe(end)) => drop(end), // closes this side
            _ => (),
        }
    }
}

// What FTABLE.alloc should wrap in a file.
pub enum FType<'a> {
    Node(&'a Path),
    Pipe(PipeEnd),
}

impl Ftable {
    // Allocate a file structure.
    // Must be called inside a transaction when ftype is Node.
    pub fn alloc(&self, opts: OMode, ftype: FType<'_>) -> Option<File> {
        let inner: Arc<VFile> = Arc::new(match ftype {
            FType::Node(path) => {
                let ip: Inode;
                if opts.is_create() {
                    ip = create(path, IType::File, 0, 0)?;
                } else {
                    ip = path.namei()?;
                    let guard = ip.lock();
                    if guard.itype() == IType::Dir && !opts.is_rdonly() {
                        return None;
                    }
                }

                let guard = ip.lock();
                match guard.itype() {
                    IType::Device if guard.major != Major::Invalid && guard.major != Major::Null =>
                    {
                        let driver = DEVSW.get(guard.major)?;
                        drop(guard);
                        VFile::Device(DNod { driver, ip })
                    }
                    IType::Dir | IType::File => {
                        drop(guard);
                        VFile::Inode(FNod::new(ip))
                    }
                    _ => return None,
                }
            }
            FType::Pipe(end) => VFile::Pipe(end),
        });

        let mut table = self.lock();
        let entry = table.iter_mut().find(|f| f.is_none())?;
        entry.replace(Arc::clone(&inner));
        Some(File {
            f: Some(inner), // table + handle: ref count 2
            readable: opts.readable(),
            writable: opts.writable(),
        })
    }
}

pub struct DevSW {
    table: [SyncOnceCell<&'static dyn Device>; NDEV],
}

impl DevSW {
    pub const fn new() -> Self {
        Self {
            table: array![_ => SyncOnceCell::new(); NDEV],
        }
    }

    pub fn set(
        &self,
        devnum: Major,
        dev: &'static dyn Device,
    ) -> Result<(), &'static (dyn Device + 'static)> {
        self.table[devnum as usize].set(dev)
    }

    pub fn get(&self, devnum: Major) -> Option<&'static dyn Device> {
        self.table[devnum as usize].get().copied()
    }
}

// Device major number
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Major {
    Null = 0,
    Console = 1,
    Invalid = 2,
}

impl Default for Major {
    fn default() -> Self {
        Self::Null
    }
}

impl Major {
    pub fn from_u16(bits: u16) -> Major {
        match bits {
            0 => Major::Null,
            1 => Major::Console,
            _ => Major::Invalid,
        }
    }
}
