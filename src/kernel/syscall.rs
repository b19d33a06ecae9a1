#[cfg(target_os = "none")]
use crate::file::File;
#[cfg(target_os = "none")]
use crate::proc::{Cpus, ProcData, PTABLE};
#[cfg(target_os = "none")]
use crate::println;
#[cfg(target_os = "none")]
use crate::{sysfile, sysproc};
#[cfg(target_os = "none")]
use alloc::sync::Arc;

// System call numbers, part of the user ABI.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum SysCalls {
    Invalid = 0,
    Fork = 1,
    Exit = 2,
    Wait = 3,
    Pipe = 4,
    Read = 5,
    Kill = 6,
    Exec = 7,
    Fstat = 8,
    Chdir = 9,
    Dup = 10,
    Getpid = 11,
    Sbrk = 12,
    Sleep = 13,
    Uptime = 14,
    Open = 15,
    Write = 16,
    Mknod = 17,
    Unlink = 18,
    Link = 19,
    Mkdir = 20,
    Close = 21,
}

impl SysCalls {
    pub fn from_usize(n: usize) -> Self {
        match n {
            1 => Self::Fork,
            2 => Self::Exit,
            3 => Self::Wait,
            4 => Self::Pipe,
            5 => Self::Read,
            6 => Self::Kill,
            7 => Self::Exec,
            8 => Self::Fstat,
            9 => Self::Chdir,
            10 => Self::Dup,
            11 => Self::Getpid,
            12 => Self::Sbrk,
            13 => Self::Sleep,
            14 => Self::Uptime,
            15 => Self::Open,
            16 => Self::Write,
            17 => Self::Mknod,
            18 => Self::Unlink,
            19 => Self::Link,
            20 => Self::Mkdir,
            21 => Self::Close,
            _ => Self::Invalid,
        }
    }
}

// Fetching system call arguments.
//
// User code passes arguments on the user stack: the int instruction
// leaves the user esp in the trap frame, the (fake) return PC sits at
// esp, and the arguments follow at esp+4, esp+8, ... The kernel runs
// with the process's page table installed, so a bounds check against
// the process size is all that stands between a pointer argument and
// the rest of the address space.
#[cfg(target_os = "none")]
impl ProcData {
    // Fetch the int at addr from the current process.
    pub fn fetch_int(&self, addr: usize) -> Result<i32, ()> {
        if addr >= self.sz || addr + 4 > self.sz {
            return Err(());
        }
        Ok(unsafe { core::ptr::read(addr as *const i32) })
    }

    // Fetch the nul-terminated string at addr from the current
    // process.
    pub fn fetch_str(&self, addr: usize) -> Result<&str, ()> {
        if addr >= self.sz {
            return Err(());
        }
        let mem = unsafe {
            core::slice::from_raw_parts(addr as *const u8, self.sz - addr)
        };
        let len = mem.iter().position(|&b| b == 0).ok_or(())?;
        core::str::from_utf8(&mem[..len]).map_err(|_| ())
    }

    // Fetch the n-th 32-bit system call argument.
    pub fn arg_int(&self, n: usize) -> Result<i32, ()> {
        let tf = unsafe { self.tf.unwrap().as_ref() };
        self.fetch_int(tf.esp as usize + 4 + 4 * n)
    }

    // Fetch the n-th argument as a pointer to a block of at least
    // size bytes, checking that it lies within the process's address
    // space.
    pub fn arg_ptr(&self, n: usize, size: usize) -> Result<usize, ()> {
        let i = self.arg_int(n)?;
        let addr = i as u32 as usize;
        if i < 0 || addr >= self.sz || addr + size > self.sz {
            return Err(());
        }
        Ok(addr)
    }

    // Fetch the n-th argument as a nul-terminated string.
    pub fn arg_str(&self, n: usize) -> Result<&str, ()> {
        let addr = self.arg_int(n)? as u32 as usize;
        self.fetch_str(addr)
    }

    // Fetch the n-th argument as a file descriptor and return both
    // the descriptor and the open file.
    pub fn arg_fd(&self, n: usize) -> Result<(usize, Arc<File>), ()> {
        let fd = self.arg_int(n)? as usize;
        match self.ofile.get(fd) {
            Some(Some(f)) => Ok((fd, Arc::clone(f))),
            _ => Err(()),
        }
    }
}

#[cfg(target_os = "none")]
pub fn syscall() {
    let p = Cpus::my_proc().unwrap();
    let data = unsafe { &mut *p.data.get() };
    let num = unsafe { data.tf.unwrap().as_ref() }.eax as usize;

    let ret = match SysCalls::from_usize(num) {
        SysCalls::Fork => sysproc::sys_fork(),
        SysCalls::Exit => sysproc::sys_exit(),
        SysCalls::Wait => sysproc::sys_wait(),
        SysCalls::Pipe => sysfile::sys_pipe(),
        SysCalls::Read => sysfile::sys_read(),
        SysCalls::Kill => sysproc::sys_kill(),
        SysCalls::Exec => sysfile::sys_exec(),
        SysCalls::Fstat => sysfile::sys_fstat(),
        SysCalls::Chdir => sysfile::sys_chdir(),
        SysCalls::Dup => sysfile::sys_dup(),
        SysCalls::Getpid => sysproc::sys_getpid(),
        SysCalls::Sbrk => sysproc::sys_sbrk(),
        SysCalls::Sleep => sysproc::sys_sleep(),
        SysCalls::Uptime => sysproc::sys_uptime(),
        SysCalls::Open => sysfile::sys_open(),
        SysCalls::Write => sysfile::sys_write(),
        SysCalls::Mknod => sysfile::sys_mknod(),
        SysCalls::Unlink => sysfile::sys_unlink(),
        SysCalls::Link => sysfile::sys_link(),
        SysCalls::Mkdir => sysfile::sys_mkdir(),
        SysCalls::Close => sysfile::sys_close(),
        SysCalls::Invalid => {
            println!("{} {}: unknown sys call {}", PTABLE.pid(p), data.name, num);
            Err(())
        }
    };

    let tf = unsafe { data.tf.unwrap().as_mut() };
    tf.eax = match ret {
        Ok(v) => v as u32,
        Err(()) => -1i32 as u32,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_round_trip() {
        for n in 1..=21 {
            let call = SysCalls::from_usize(n);
            assert_ne!(call, SysCalls::Invalid);
            assert_eq!(call as usize, n);
        }
        assert_eq!(SysCalls::from_usize(0), SysCalls::Invalid);
        assert_eq!(SysCalls::from_usize(22), SysCalls::Invalid);
    }
}
