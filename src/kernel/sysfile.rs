// File-system system calls.
// Arguments are checked by the fetchers in syscall.rs.

use crate::defs::as_bytes;
use crate::exec::exec;
use crate::fcntl::OMode;
use crate::file::{FType, File, FTABLE};
use crate::fs::{self, Path};
use crate::log::LOG;
use crate::param::MAXARG;
use crate::pipe::Pipe;
use crate::proc::{Cpus, ProcData};
use crate::stat::{IType, Stat};
use crate::vm::VirtAddr;
use alloc::sync::Arc;
use core::mem::size_of;

// Allocate a file descriptor for the given file in the current
// process's table.
fn fdalloc(data: &mut ProcData, f: File) -> Result<usize, ()> {
    let fd = data.ofile.iter().position(|s| s.is_none()).ok_or(())?;
    data.ofile[fd] = Some(Arc::new(f));
    Ok(fd)
}

pub fn sys_dup() -> Result<usize, ()> {
    let p = Cpus::my_proc().unwrap();
    let data = unsafe { &mut *p.data.get() };
    let (_, f) = data.arg_fd(0)?;
    let fd = data.ofile.iter().position(|s| s.is_none()).ok_or(())?;
    data.ofile[fd] = Some(f);
    Ok(fd)
}

pub fn sys_read() -> Result<usize, ()> {
    let p = Cpus::my_proc().unwrap();
    let data = unsafe { &*p.data.get() };
    let (_, f) = data.arg_fd(0)?;
    let n = data.arg_int(2)?;
    if n < 0 {
        return Err(());
    }
    let addr = data.arg_ptr(1, n as usize)?;
    f.read(VirtAddr::User(addr), n as usize)
}

pub fn sys_write() -> Result<usize, ()> {
    let p = Cpus::my_proc().unwrap();
    let data = unsafe { &*p.data.get() };
    let (_, f) = data.arg_fd(0)?;
    let n = data.arg_int(2)?;
    if n < 0 {
        return Err(());
    }
    let addr = data.arg_ptr(1, n as usize)?;
    f.write(VirtAddr::User(addr), n as usize)
}

pub fn sys_close() -> Result<usize, ()> {
    let p = Cpus::my_proc().unwrap();
    let data = unsafe { &mut *p.data.get() };
    let (fd, f) = data.arg_fd(0)?;
    drop(f);
    data.ofile[fd].take();
    Ok(0)
}

pub fn sys_fstat() -> Result<usize, ()> {
    let p = Cpus::my_proc().unwrap();
    let data = unsafe { &*p.data.get() };
    let (_, f) = data.arg_fd(0)?;
    let addr = data.arg_ptr(1, size_of::<Stat>())?;
    f.stat(VirtAddr::User(addr)).map(|_| 0)
}

// Create the path new as a link to the same inode as old.
pub fn sys_link() -> Result<usize, ()> {
    let p = Cpus::my_proc().unwrap();
    let data = unsafe { &*p.data.get() };

    LOG.begin_op();
    let res = (|| {
        let old = data.arg_str(0)?;
        let new = data.arg_str(1)?;
        fs::link(Path::new(old), Path::new(new))
    })();
    LOG.end_op();
    res.map(|_| 0)
}

pub fn sys_unlink() -> Result<usize, ()> {
    let p = Cpus::my_proc().unwrap();
    let data = unsafe { &*p.data.get() };

    LOG.begin_op();
    let res = (|| {
        let path = data.arg_str(0)?;
        fs::unlink(Path::new(path))
    })();
    LOG.end_op();
    res.map(|_| 0)
}

pub fn sys_open() -> Result<usize, ()> {
    let p = Cpus::my_proc().unwrap();
    let data = unsafe { &mut *p.data.get() };

    LOG.begin_op();
    let res = (|| {
        let path = data.arg_str(0)?;
        let omode = OMode::from_bits_truncate(data.arg_int(1)? as u32);
        FTABLE.alloc(omode, FType::Node(Path::new(path))).ok_or(())
    })();
    LOG.end_op();

    fdalloc(data, res?)
}

pub fn sys_mkdir() -> Result<usize, ()> {
    let p = Cpus::my_proc().unwrap();
    let data = unsafe { &*p.data.get() };

    LOG.begin_op();
    let res = (|| {
        let path = data.arg_str(0)?;
        // the new handle drops here, inside the transaction.
        fs::create(Path::new(path), IType::Dir, 0, 0).map(|_| 0).ok_or(())
    })();
    LOG.end_op();
    res
}

pub fn sys_mknod() -> Result<usize, ()> {
    let p = Cpus::my_proc().unwrap();
    let data = unsafe { &*p.data.get() };

    LOG.begin_op();
    let res = (|| {
        let path = data.arg_str(0)?;
        let major = data.arg_int(1)?;
        let minor = data.arg_int(2)?;
        // the new handle drops here, inside the transaction.
        fs::create(Path::new(path), IType::Device, major as u16, minor as u16)
            .map(|_| 0)
            .ok_or(())
    })();
    LOG.end_op();
    res
}

pub fn sys_chdir() -> Result<usize, ()> {
    let p = Cpus::my_proc().unwrap();
    let data = unsafe { &mut *p.data.get() };

    LOG.begin_op();
    let res = (|| {
        let path = data.arg_str(0)?;
        let ip = Path::new(path).namei().ok_or(())?;
        {
            let guard = ip.lock();
            if guard.itype() != IType::Dir {
                return Err(());
            }
        }
        // the old cwd handle drops here, inside the transaction.
        data.cwd.replace(ip);
        Ok(0)
    })();
    LOG.end_op();
    res
}

pub fn sys_exec() -> Result<usize, ()> {
    let p = Cpus::my_proc().unwrap();
    let data = unsafe { &*p.data.get() };

    let path = data.arg_str(0)?;
    let uargv = data.arg_int(1)? as u32 as usize;

    let mut argv: [Option<&str>; MAXARG] = [None; MAXARG];
    let mut i = 0;
    loop {
        if i >= MAXARG {
            return Err(());
        }
        let uarg = data.fetch_int(uargv + 4 * i)? as u32 as usize;
        if uarg == 0 {
            break;
        }
        argv[i] = Some(data.fetch_str(uarg)?);
        i += 1;
    }

    exec(Path::new(path), &argv)
}

pub fn sys_pipe() -> Result<usize, ()> {
    let p = Cpus::my_proc().unwrap();
    let data = unsafe { &mut *p.data.get() };

    let fdarray = data.arg_ptr(0, 2 * size_of::<u32>())?;
    let (rf, wf) = Pipe::alloc().ok_or(())?;

    let fd0 = fdalloc(data, rf)?;
    let fd1 = match fdalloc(data, wf) {
        Ok(fd) => fd,
        Err(()) => {
            data.ofile[fd0].take();
            return Err(());
        }
    };

    let fds = [fd0 as u32, fd1 as u32];
    if crate::vm::either_copyout(VirtAddr::User(fdarray), unsafe { as_bytes(&fds) }).is_err() {
        data.ofile[fd0].take();
        data.ofile[fd1].take();
        return Err(());
    }
    Ok(0)
}
