// File system implementation. Five layers:
//   + Blocks: allocator for raw disk blocks.
//   + Log: crash recovery for multi-step updates.
//   + Files: inode allocator, reading, writing, metadata.
//   + Directories: inode with special contents (list of other inodes!)
//   + Names: paths like /usr/rtm/ferrox/fs.rs for convenient naming.
//
// This file contains the low-level file system manipulation routines.
// The (higher-level) system call implementations are in sysfile.rs.

#[cfg(target_os = "none")]
use crate::bio::BCACHE;
#[cfg(target_os = "none")]
use crate::file::Major;
#[cfg(target_os = "none")]
use crate::lazy::SyncOnceCell;
#[cfg(target_os = "none")]
use crate::log::LOG;
#[cfg(target_os = "none")]
use crate::param::{NINODE, ROOTDEV};
#[cfg(target_os = "none")]
use crate::proc::Cpus;
#[cfg(target_os = "none")]
use crate::println;
#[cfg(target_os = "none")]
use crate::sleeplock::{SleepLock, SleepLockGuard};
#[cfg(target_os = "none")]
use crate::spinlock::Mutex;
#[cfg(target_os = "none")]
use crate::stat::{IType, Stat};
#[cfg(target_os = "none")]
use crate::vm::{either_copyin, either_copyout, VirtAddr};
#[cfg(target_os = "none")]
use alloc::sync::Arc;
#[cfg(target_os = "none")]
use array_macro::array;
use core::mem::size_of;
#[cfg(target_os = "none")]
use core::ops::Deref;

pub const ROOTINO: u32 = 1; // root i-number
pub const BSIZE: usize = 512; // block size
pub const FSMAGIC: u32 = 0x10203040;

// Disk layout:
// [ boot block | super block | log | inode blocks |
//                                  free bit map | data blocks ]
//
// mkfs computes the super block and builds an initial file system.
// The super block describes the disk layout:
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SuperBlock {
    pub magic: u32,      // Must be FSMAGIC
    pub size: u32,       // Size of file system image (blocks)
    pub nblocks: u32,    // Number of data blocks
    pub ninodes: u32,    // Number of inodes.
    pub nlog: u32,       // Number of log blocks
    pub logstart: u32,   // Block number of first log block
    pub inodestart: u32, // Block number of first inode block
    pub bmapstart: u32,  // Block number of first free map block
}

pub const NDIRECT: usize = 12;
pub const NINDIRECT: usize = BSIZE / size_of::<u32>();
pub const MAXFILE: usize = NDIRECT + NINDIRECT;

// On-disk inode structure
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DInode {
    pub itype: u16,                // File type (an IType value)
    pub major: u16,                // Major device number (device only)
    pub minor: u16,                // Minor device number (device only)
    pub nlink: u16,                // Number of links to inode in file system
    pub size: u32,                 // Size of file (bytes)
    pub addrs: [u32; NDIRECT + 1], // Data block addresses
}

// Inodes per block.
pub const IPB: usize = BSIZE / size_of::<DInode>();

// Bitmap bits per block
pub const BPB: u32 = (BSIZE * 8) as u32;

// Directory is a file containing a sequence of dirent structures.
pub const DIRSIZ: usize = 14;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DirEnt {
    pub inum: u16,
    name: [u8; DIRSIZ],
}

impl DirEnt {
    pub fn set_name(&mut self, name: &str) {
        let n = name.len().min(DIRSIZ);
        self.name = [0; DIRSIZ];
        self.name[..n].copy_from_slice(&name.as_bytes()[..n]);
    }

    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(DIRSIZ);
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }
}

impl SuperBlock {
    // Block containing inode i
    pub fn iblock(&self, i: u32) -> u32 {
        i / IPB as u32 + self.inodestart
    }

    // Block of free map containing bit for block b
    pub fn bblock(&self, b: u32) -> u32 {
        b / BPB + self.bmapstart
    }

    #[cfg(target_os = "none")]
    fn read(dev: u32) -> Self {
        let bp = BCACHE.read(dev, 1);
        *bp.align_to::<SuperBlock>().first().unwrap()
    }
}

// there should be one superblock per disk device, but we run with
// only one device.
#[cfg(target_os = "none")]
pub static SB: SyncOnceCell<SuperBlock> = SyncOnceCell::new();

// Initialize the file system; runs in the context of the first
// process because log recovery reads the disk and may sleep.
#[cfg(target_os = "none")]
pub fn init(dev: u32) {
    let sb = SuperBlock::read(dev);
    assert!(sb.magic == FSMAGIC, "invalid file system");
    SB.set(sb).expect("fs::init: called twice");
    LOG.init(dev, SB.get().unwrap());
}

// Blocks.

// Zero a block.
#[cfg(target_os = "none")]
fn bzero(dev: u32, bno: u32) {
    let mut bp = BCACHE.read(dev, bno);
    bp.data.fill(0);
    LOG.write(bp);
}

// Allocate a zeroed disk block.
#[cfg(target_os = "none")]
fn balloc(dev: u32) -> u32 {
    let sb = SB.get().unwrap();
    for b in (0..sb.size).step_by(BPB as usize) {
        let mut bp = BCACHE.read(dev, sb.bblock(b));
        let mut bi = 0;
        while bi < BPB && b + bi < sb.size {
            let m = 1u8 << (bi % 8);
            if bp.data[(bi / 8) as usize] & m == 0 {
                // Is block free?
                bp.data[(bi / 8) as usize] |= m; // Mark block in use.
                LOG.write(bp);
                bzero(dev, b + bi);
                return b + bi;
            }
            bi += 1;
        }
    }
    panic!("balloc: out of blocks");
}

// Free a disk block.
#[cfg(target_os = "none")]
fn bfree(dev: u32, b: u32) {
    let sb = SB.get().unwrap();
    let mut bp = BCACHE.read(dev, sb.bblock(b));
    let bi = b % BPB;
    let m = 1u8 << (bi % 8);
    assert!(bp.data[(bi / 8) as usize] & m != 0, "freeing free block");
    bp.data[(bi / 8) as usize] &= !m;
    LOG.write(bp);
}

// Inodes.
//
// An inode describes a single unnamed file. The on-disk inode holds
// metadata: the file's type, its size, the number of links referring
// to it, and the list of blocks holding the file's content.
//
// The inodes are laid out sequentially on disk at sb.inodestart. The
// kernel keeps a table of in-memory inodes (ITABLE) to synchronize
// access to inodes used by multiple processes.
//
// * Allocation: an inode is allocated if its type (on disk) is
//   non-zero. ITABLE.alloc() allocates; Inode's drop frees on disk
//   once the reference and link counts fall to zero.
//
// * Referencing in table: the Arc count of a table entry tracks the
//   number of in-memory handles (open files and current directories).
//   ITABLE.get() finds or creates an entry; dropping an Inode puts it.
//
// * Valid: the information in a table entry is only correct once it
//   has been read from disk, which happens lazily on first lock.
//
// * Locked: file system code may only examine and modify the
//   information in an inode and its content after locking it; the
//   SleepLockGuard is the capability.
//
// Thus a typical sequence is:
//   let ip = ...namei();       // get a handle
//   let guard = ip.lock();     // lock, reading from disk if needed
//   ... examine and modify guard.xxx ...
//   drop(guard);
//   drop(ip);                  // iput, inside a transaction
//
// Locking is separate from getting so that system calls can keep a
// long-term handle to an inode (as for an open file) and only lock it
// for short periods (e.g., in read()). The separation also helps
// avoid deadlock during pathname lookup.
//
// All drops of Inode handles must be inside a transaction in case the
// drop has to free the inode on disk.

#[cfg(target_os = "none")]
pub static ITABLE: Itable = Mutex::new(array![_ => None; NINODE], "itable");

#[cfg(target_os = "none")]
pub type Itable = Mutex<[Option<Arc<MInode>>; NINODE]>;

// in-memory inode: identity plus sleep-locked body
#[cfg(target_os = "none")]
#[derive(Debug)]
pub struct MInode {
    pub dev: u32,
    pub inum: u32,
    data: SleepLock<InodeData>,
}

#[cfg(target_os = "none")]
impl core::fmt::Debug for SleepLock<InodeData> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "SleepLock<InodeData>")
    }
}

// A counted handle to an in-memory inode. Dropping the handle is
// iput: it may free the inode on disk, so it must happen inside a
// transaction.
#[cfg(target_os = "none")]
#[derive(Debug)]
pub struct Inode {
    ip: Option<Arc<MInode>>,
}

#[cfg(target_os = "none")]
#[derive(Default)]
pub struct InodeData {
    dev: u32,
    inum: u32,
    valid: bool,
    itype: IType,
    pub major: Major,
    pub minor: u16,
    pub nlink: u16,
    pub size: u32,
    addrs: [u32; NDIRECT + 1],
}

#[cfg(target_os = "none")]
impl InodeData {
    pub fn itype(&self) -> IType {
        self.itype
    }

    // Copy a modified in-memory inode to disk.
    // Must be called after every change to a field that lives on
    // disk. Caller must hold the inode lock.
    pub fn update(&self) {
        let sb = SB.get().unwrap();
        let mut bp = BCACHE.read(self.dev, sb.iblock(self.inum));
        let dip = bp
            .align_to_mut::<DInode>()
            .get_mut(self.inum as usize % IPB)
            .unwrap();
        dip.itype = self.itype as u16;
        dip.major = self.major as u16;
        dip.minor = self.minor;
        dip.nlink = self.nlink;
        dip.size = self.size;
        dip.addrs.copy_from_slice(&self.addrs);
        LOG.write(bp);
    }

    // Truncate inode (discard contents).
    // Caller must hold the inode lock.
    pub fn trunc(&mut self) {
        for addr in self.addrs.iter_mut().take(NDIRECT) {
            if *addr != 0 {
                bfree(self.dev, *addr);
                *addr = 0;
            }
        }

        if self.addrs[NDIRECT] != 0 {
            {
                let bp = BCACHE.read(self.dev, self.addrs[NDIRECT]);
                for &addr in bp.align_to::<u32>().iter() {
                    if addr != 0 {
                        bfree(self.dev, addr);
                    }
                }
            }
            bfree(self.dev, self.addrs[NDIRECT]);
            self.addrs[NDIRECT] = 0;
        }

        self.size = 0;
        self.update();
    }

    // Return the disk block address of the nth block in this inode.
    // If there is no such block, bmap allocates one.
    fn bmap(&mut self, bn: u32) -> Result<u32, ()> {
        let mut bn = bn as usize;

        if bn < NDIRECT {
            let mut addr = self.addrs[bn];
            if addr == 0 {
                addr = balloc(self.dev);
                self.addrs[bn] = addr;
            }
            return Ok(addr);
        }
        bn -= NDIRECT;

        if bn < NINDIRECT {
            // Load indirect block, allocating if necessary.
            let mut iaddr = self.addrs[NDIRECT];
            if iaddr == 0 {
                iaddr = balloc(self.dev);
                self.addrs[NDIRECT] = iaddr;
            }
            let mut bp = BCACHE.read(self.dev, iaddr);
            let mut addr = bp.align_to::<u32>()[bn];
            if addr == 0 {
                addr = balloc(self.dev);
                bp.align_to_mut::<u32>()[bn] = addr;
                LOG.write(bp);
            }
            return Ok(addr);
        }

        panic!("bmap: out of range");
    }

    // Copy stat information from inode.
    // Caller must hold the inode lock.
    pub fn stat(&self, st: &mut Stat) {
        st.dev = self.dev;
        st.ino = self.inum;
        st.itype = self.itype;
        st.nlink = self.nlink;
        st.size = self.size;
    }

    // Read data from inode. Caller must hold the inode lock.
    pub fn read(&mut self, dst: VirtAddr, off: u32, n: usize) -> Result<usize, ()> {
        let mut off = off as usize;
        let mut n = n;

        if off > self.size as usize {
            return Err(());
        }
        if off + n > self.size as usize {
            n = self.size as usize - off;
        }

        let mut tot = 0;
        let mut dst = dst;
        while tot < n {
            let bp = BCACHE.read(self.dev, self.bmap((off / BSIZE) as u32)?);
            let m = (n - tot).min(BSIZE - off % BSIZE);
            if either_copyout(dst, &bp.data[off % BSIZE..off % BSIZE + m]).is_err() {
                return Err(());
            }
            tot += m;
            off += m;
            dst = dst + m;
        }
        Ok(tot)
    }

    // Write data to inode. Caller must hold the inode lock.
    // Returns the number of bytes successfully written.
    pub fn write(&mut self, src: VirtAddr, off: u32, n: usize) -> Result<usize, ()> {
        let mut off = off as usize;

        if off > self.size as usize {
            return Err(());
        }
        if off + n > MAXFILE * BSIZE {
            return Err(());
        }

        let mut tot = 0;
        let mut src = src;
        while tot < n {
            let mut bp = BCACHE.read(self.dev, self.bmap((off / BSIZE) as u32)?);
            let m = (n - tot).min(BSIZE - off % BSIZE);
            if either_copyin(&mut bp.data[off % BSIZE..off % BSIZE + m], src).is_err() {
                break;
            }
            LOG.write(bp);
            tot += m;
            off += m;
            src = src + m;
        }

        if off > self.size as usize {
            self.size = off as u32;
        }

        // Write the inode back to disk even if the size didn't change,
        // because the loop above might have called bmap and added a
        // new block to addrs[].
        self.update();

        Ok(tot)
    }

    // Directories.

    // Look for a directory entry in a directory.
    // If found, optionally report its byte offset.
    pub fn dirlookup(&mut self, name: &str, mut poff: Option<&mut u32>) -> Option<Inode> {
        assert!(self.itype == IType::Dir, "dirlookup not DIR");

        let mut de = DirEnt::default();
        for off in (0..self.size).step_by(size_of::<DirEnt>()) {
            self.read(
                VirtAddr::Kernel(&mut de as *mut DirEnt as usize),
                off,
                size_of::<DirEnt>(),
            )
            .expect("dirlookup read");
            if de.inum == 0 {
                continue;
            }
            if de.name() == name || (name.len() > DIRSIZ && de.name() == &name[..DIRSIZ]) {
                // entry matches path element
                if let Some(poff) = poff.take() {
                    *poff = off;
                }
                return Some(ITABLE.get(self.dev, de.inum as u32));
            }
        }
        None
    }

    // Write a new directory entry (name, inum) into this directory.
    pub fn dirlink(&mut self, name: &str, inum: u32) -> Result<(), ()> {
        // Check that name is not present.
        if self.dirlookup(name, None).is_some() {
            return Err(());
        }

        // Look for an empty dirent.
        let mut de = DirEnt::default();
        let mut off = 0;
        while off < self.size {
            self.read(
                VirtAddr::Kernel(&mut de as *mut DirEnt as usize),
                off,
                size_of::<DirEnt>(),
            )
            .expect("dirlink read");
            if de.inum == 0 {
                break;
            }
            off += size_of::<DirEnt>() as u32;
        }

        de.set_name(name);
        de.inum = inum as u16;
        self.write(
            VirtAddr::Kernel(&de as *const DirEnt as usize),
            off,
            size_of::<DirEnt>(),
        )
        .map(|_| ())
    }

    // Is the directory empty except for "." and ".." ?
    pub fn is_dir_empty(&mut self) -> bool {
        let mut de = DirEnt::default();
        for off in
            ((2 * size_of::<DirEnt>()) as u32..self.size).step_by(size_of::<DirEnt>())
        {
            self.read(
                VirtAddr::Kernel(&mut de as *mut DirEnt as usize),
                off,
                size_of::<DirEnt>(),
            )
            .expect("is_dir_empty read");
            if de.inum != 0 {
                return false;
            }
        }
        true
    }
}

#[cfg(target_os = "none")]
impl MInode {
    fn new(dev: u32, inum: u32) -> Self {
        Self {
            dev,
            inum,
            data: SleepLock::new(InodeData::default(), "inode"),
        }
    }

    // Lock the inode, reading it from disk if it has not been read
    // yet. Unlock happens when the guard drops.
    pub fn lock(&self) -> SleepLockGuard<'_, InodeData> {
        let mut guard = self.data.lock();
        if !guard.valid {
            let sb = SB.get().unwrap();
            {
                let bp = BCACHE.read(self.dev, sb.iblock(self.inum));
                let dip = bp.align_to::<DInode>().get(self.inum as usize % IPB).unwrap();
                guard.itype = IType::from_u16(dip.itype);
                guard.major = Major::from_u16(dip.major);
                guard.minor = dip.minor;
                guard.nlink = dip.nlink;
                guard.size = dip.size;
                guard.addrs.copy_from_slice(&dip.addrs);
            }
            guard.valid = true;
            guard.dev = self.dev;
            guard.inum = self.inum;
            assert!(guard.itype != IType::None, "ilock: no type");
        }
        guard
    }
}

#[cfg(target_os = "none")]
impl Inode {
    fn new(ip: Arc<MInode>) -> Self {
        Self { ip: Some(ip) }
    }

    // Increment the reference count; ip.dup() gives a second handle.
    pub fn dup(&self) -> Self {
        Self {
            ip: self.ip.clone(),
        }
    }
}

#[cfg(target_os = "none")]
impl Deref for Inode {
    type Target = MInode;
    fn deref(&self) -> &MInode {
        self.ip.as_ref().unwrap()
    }
}

#[cfg(target_os = "none")]
impl Drop for Inode {
    // iput: must be called inside a transaction.
    fn drop(&mut self) {
        ITABLE.put(self.ip.take().unwrap());
    }
}

#[cfg(target_os = "none")]
impl Itable {
    // Allocate an inode on device dev, marking it allocated on disk by
    // giving it type itype. Returns an unlocked but referenced handle.
    pub fn alloc(&self, dev: u32, itype: IType) -> Option<Inode> {
        let sb = SB.get().unwrap();
        for inum in 1..sb.ninodes {
            let mut bp = BCACHE.read(dev, sb.iblock(inum));
            let dip = bp
                .align_to_mut::<DInode>()
                .get_mut(inum as usize % IPB)
                .unwrap();
            if dip.itype == IType::None as u16 {
                // a free inode
                *dip = DInode::default();
                dip.itype = itype as u16;
                LOG.write(bp); // mark it allocated on the disk
                return Some(self.get(dev, inum));
            }
        }
        println!("ialloc: no inodes");
        None
    }

    // Find the inode with number inum on device dev and return its
    // in-memory handle. Does not lock the inode and does not read it
    // from disk.
    pub fn get(&self, dev: u32, inum: u32) -> Inode {
        let mut table = self.lock();

        // Is the inode already in the table?
        let mut empty: Option<&mut Option<Arc<MInode>>> = None;
        for entry in table.iter_mut() {
            match entry {
                Some(ip) if ip.dev == dev && ip.inum == inum => {
                    return Inode::new(Arc::clone(ip));
                }
                None if empty.is_none() => empty = Some(entry),
                _ => (),
            }
        }

        // Recycle an entry.
        let empty = empty.expect("iget: no inodes");
        let ip = Arc::new(MInode::new(dev, inum));
        empty.replace(Arc::clone(&ip));
        Inode::new(ip)
    }

    // Drop a reference to an in-memory inode. If that was the last
    // reference and the inode has no links, free the inode (and its
    // content) on disk. Must be inside a transaction.
    fn put(&self, inode: Arc<MInode>) {
        let mut table = self.lock();

        if Arc::strong_count(&inode) == 2 {
            // The handle being dropped plus the table entry: no other
            // process can have it locked, so this lock won't block.
            let mut idata = inode.data.lock();
            let itable = Mutex::unlock(table);

            if idata.valid && idata.nlink == 0 {
                // inode has no links and no other references:
                // truncate and free.
                idata.trunc();
                idata.itype = IType::None;
                idata.update();
                idata.valid = false;
            }
            drop(idata);

            table = itable.lock();
            for entry in table.iter_mut() {
                match entry {
                    Some(ip) if Arc::ptr_eq(&inode, ip) => {
                        entry.take();
                    }
                    _ => (),
                }
            }
        }
    }
}

// Create the path new as a link to the same inode as old.
#[cfg(target_os = "none")]
pub fn link(old: &Path, new: &Path) -> Result<(), ()> {
    let ip = old.namei().ok_or(())?;
    {
        let mut ip_guard = ip.lock();
        if ip_guard.itype == IType::Dir {
            return Err(());
        }
        ip_guard.nlink += 1;
        ip_guard.update();
    }

    let linked = (|| {
        let (name, dp) = new.nameiparent().ok_or(())?;
        let mut dp_guard = dp.lock();
        if dp.dev != ip.dev {
            return Err(());
        }
        dp_guard.dirlink(name, ip.inum)
    })();

    if linked.is_err() {
        let mut ip_guard = ip.lock();
        ip_guard.nlink -= 1;
        ip_guard.update();
    }
    linked
}

#[cfg(target_os = "none")]
pub fn unlink(path: &Path) -> Result<(), ()> {
    let (name, dp) = path.nameiparent().ok_or(())?;
    let mut dp_guard = dp.lock();

    // Cannot unlink "." or "..".
    if name == "." || name == ".." {
        return Err(());
    }

    let mut off: u32 = 0;
    let ip = dp_guard.dirlookup(name, Some(&mut off)).ok_or(())?;
    let mut ip_guard = ip.lock();

    assert!(ip_guard.nlink >= 1, "unlink: nlink < 1");
    if ip_guard.itype == IType::Dir && !ip_guard.is_dir_empty() {
        return Err(());
    }

    let de = DirEnt::default();
    dp_guard
        .write(
            VirtAddr::Kernel(&de as *const DirEnt as usize),
            off,
            size_of::<DirEnt>(),
        )
        .expect("unlink: writei");
    if ip_guard.itype == IType::Dir {
        dp_guard.nlink -= 1;
        dp_guard.update();
    }
    drop(dp_guard);

    ip_guard.nlink -= 1;
    ip_guard.update();
    Ok(())
}

// Create a new inode at path. Must be called inside a transaction.
#[cfg(target_os = "none")]
pub fn create(path: &Path, itype: IType, major: u16, minor: u16) -> Option<Inode> {
    let (name, dp) = path.nameiparent()?;
    let mut dp_guard = dp.lock();

    if let Some(ip) = dp_guard.dirlookup(name, None) {
        drop(dp_guard);
        let ip_guard = ip.lock();
        if itype == IType::File
            && (ip_guard.itype == IType::File || ip_guard.itype == IType::Device)
        {
            drop(ip_guard);
            return Some(ip);
        }
        return None;
    }

    let ip = ITABLE.alloc(dp.dev, itype)?;
    let mut ip_guard = ip.lock();
    ip_guard.major = Major::from_u16(major);
    ip_guard.minor = minor;
    ip_guard.nlink = 1;
    ip_guard.update();

    if itype == IType::Dir {
        // Create . and .. entries.
        dp_guard.nlink += 1; // for ".."
        dp_guard.update();
        // No nlink++ for ".": avoid cyclic ref count.
        ip_guard.dirlink(".", ip.inum).ok()?;
        ip_guard.dirlink("..", dp.inum).ok()?;
    }

    dp_guard.dirlink(name, ip.inum).ok()?;
    drop(ip_guard);
    Some(ip)
}

// Paths.

// A path slice, wrapping str the way Path wraps OsStr elsewhere.
#[cfg(target_os = "none")]
#[repr(transparent)]
pub struct Path {
    inner: str,
}

#[cfg(target_os = "none")]
impl AsRef<Path> for str {
    fn as_ref(&self) -> &Path {
        Path::new(self)
    }
}

#[cfg(target_os = "none")]
impl Path {
    pub fn new<S: AsRef<str> + ?Sized>(s: &S) -> &Path {
        unsafe { &*(s.as_ref() as *const str as *const Path) }
    }

    // The final component, for deriving a process name from an exec
    // path.
    pub fn file_name(&self) -> &str {
        match self.inner.trim_end_matches('/').rsplit_once('/') {
            Some((_, name)) => name,
            None => self.inner.trim_end_matches('/'),
        }
    }

    // Split off the next path element:
    //   skip("a/bb/c")  = (Some("a"), "bb/c")
    //   skip("///a//bb") = (Some("a"), "/bb")
    //   skip("a")       = (Some("a"), "")
    //   skip("")        = skip("////") = (None, "")
    fn skip(s: &str) -> (Option<&str>, &str) {
        let s = s.trim_start_matches('/');
        if s.is_empty() {
            return (None, "");
        }
        match s.split_once('/') {
            Some((name, rest)) => (Some(name), rest),
            None => (Some(s), ""),
        }
    }

    // Look up and return the inode for this path. If parent is true,
    // return the inode for the parent and the final path element.
    // Must be called inside a transaction since it drops handles.
    fn namex(&self, parent: bool) -> Option<(&str, Inode)> {
        let mut ip = if self.inner.starts_with('/') {
            ITABLE.get(ROOTDEV, ROOTINO)
        } else {
            let p = Cpus::my_proc().unwrap();
            unsafe { &*p.data.get() }.cwd.as_ref().unwrap().dup()
        };

        let mut rest = &self.inner;
        let mut last = "";
        loop {
            let (elem, next) = Self::skip(rest);
            let name = match elem {
                None => break,
                Some(name) => name,
            };

            let mut guard = ip.lock();
            if guard.itype != IType::Dir {
                return None;
            }
            if parent && Self::skip(next).0.is_none() {
                // Stop one level early.
                drop(guard);
                return Some((name, ip));
            }
            let next_ip = guard.dirlookup(name, None)?;
            drop(guard);
            ip = next_ip;
            rest = next;
            last = name;
        }

        if parent {
            return None;
        }
        Some((last, ip))
    }

    pub fn namei(&self) -> Option<Inode> {
        self.namex(false).map(|(_, ip)| ip)
    }

    pub fn nameiparent(&self) -> Option<(&str, Inode)> {
        self.namex(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn on_disk_records_are_hardware_sized() {
        assert_eq!(size_of::<DInode>(), 64);
        assert_eq!(IPB, 8);
        assert_eq!(size_of::<DirEnt>(), 16);
        assert_eq!(size_of::<SuperBlock>(), 32);
    }

    #[test]
    fn dirent_name_packing() {
        let mut de = DirEnt::default();
        de.set_name("init");
        assert_eq!(de.name(), "init");

        // a max-length name fills the field with no terminator
        de.set_name("abcdefghijklmn");
        assert_eq!(de.name(), "abcdefghijklmn");

        // longer names are truncated to DIRSIZ
        de.set_name("abcdefghijklmnOVERFLOW");
        assert_eq!(de.name(), "abcdefghijklmn");
    }

    #[test]
    fn short_names_are_nul_terminated() {
        let mut de = DirEnt::default();
        de.set_name("abcdefghijklmn");
        de.set_name("x");
        assert_eq!(de.name(), "x");
    }
}
