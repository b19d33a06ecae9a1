use crate::proc::{self, sleep, Cpus, PTABLE};
use crate::trap::TICKS;

pub fn sys_fork() -> Result<usize, ()> {
    proc::fork().map(|pid| pid as usize)
}

pub fn sys_exit() -> Result<usize, ()> {
    proc::exit()
}

pub fn sys_wait() -> Result<usize, ()> {
    proc::wait().map(|pid| pid as usize).ok_or(())
}

pub fn sys_kill() -> Result<usize, ()> {
    let p = Cpus::my_proc().unwrap();
    let data = unsafe { &*p.data.get() };
    let pid = data.arg_int(0)?;
    if pid < 0 {
        return Err(());
    }
    proc::kill(pid as u32).map(|_| 0)
}

pub fn sys_getpid() -> Result<usize, ()> {
    let p = Cpus::my_proc().unwrap();
    Ok(PTABLE.pid(p) as usize)
}

pub fn sys_sbrk() -> Result<usize, ()> {
    let p = Cpus::my_proc().unwrap();
    let data = unsafe { &*p.data.get() };
    let n = data.arg_int(0)?;
    let addr = data.sz;
    proc::grow_proc(n)?;
    Ok(addr)
}

pub fn sys_sleep() -> Result<usize, ()> {
    let p = Cpus::my_proc().unwrap();
    let data = unsafe { &*p.data.get() };
    let n = data.arg_int(0)?;
    if n < 0 {
        return Err(());
    }
    let n = n as u32;

    let mut ticks = TICKS.lock();
    let ticks0 = *ticks;
    while *ticks - ticks0 < n {
        if PTABLE.killed(p) {
            return Err(());
        }
        let chan = &*ticks as *const u32 as usize;
        ticks = sleep(chan, ticks);
    }
    Ok(0)
}

// return how many clock tick interrupts have occurred
// since start.
pub fn sys_uptime() -> Result<usize, ()> {
    Ok(*TICKS.lock() as usize)
}
