// Console input and output.
// Input is from the serial port, a line at a time.
// Output goes to both the serial port and the CGA text display.
// Implements special input characters:
//   newline -- end of line
//   control-h -- backspace
//   control-u -- kill line
//   control-d -- end of file
//   control-p -- print process list

use crate::file::{Device, Major, DEVSW};
use crate::memlayout::p2v;
use crate::proc::{procdump, sleep, Cpus, PTABLE};
use crate::spinlock::Mutex;
use crate::uart;
use crate::vm::{either_copyin, either_copyout, VirtAddr};
use crate::x86::{inb, outb};
use core::num::Wrapping;
use core::ptr;

pub static CONS: Mutex<Cons> = Mutex::new(Cons::new(), "console");

const BS: u8 = 0x08;
const CRTPORT: u16 = 0x3d4;

// Control-x
const fn ctrl(x: u8) -> u8 {
    x - b'@'
}

const INPUT_BUF: usize = 128;

pub struct Cons {
    buf: [u8; INPUT_BUF],
    r: Wrapping<usize>, // read index
    w: Wrapping<usize>, // write index
    e: Wrapping<usize>, // edit index
}

impl Cons {
    const fn new() -> Cons {
        Cons {
            buf: [0; INPUT_BUF],
            r: Wrapping(0),
            w: Wrapping(0),
            e: Wrapping(0),
        }
    }
}

// CGA text-mode display, 80x25, memory-mapped at 0xb8000.
fn cgaputc(c: u8) {
    let crt = p2v(0xb8000) as *mut u16;

    // Cursor position: col + 80*row.
    outb(CRTPORT, 14);
    let mut pos = (inb(CRTPORT + 1) as usize) << 8;
    outb(CRTPORT, 15);
    pos |= inb(CRTPORT + 1) as usize;

    match c {
        b'\n' => pos += 80 - pos % 80,
        BS => {
            if pos > 0 {
                pos -= 1;
            }
        }
        _ => {
            unsafe { *crt.add(pos) = c as u16 | 0x0700 }; // black on white
            pos += 1;
        }
    }

    if pos / 80 >= 24 {
        // Scroll up.
        unsafe {
            ptr::copy(crt.add(80), crt, 23 * 80);
        }
        pos -= 80;
        for i in pos..24 * 80 {
            unsafe { *crt.add(i) = b' ' as u16 | 0x0700 };
        }
    }

    outb(CRTPORT, 14);
    outb(CRTPORT + 1, (pos >> 8) as u8);
    outb(CRTPORT, 15);
    outb(CRTPORT + 1, pos as u8);
    unsafe { *crt.add(pos) = b' ' as u16 | 0x0700 };
}

//
// send one character to the console.
// called by printf, and to echo input characters,
// but not from write().
//
pub fn putc(c: u8) {
    if c == ctrl(b'H') {
        uart::putc_sync(BS);
        uart::putc_sync(b' ');
        uart::putc_sync(BS);
        cgaputc(BS);
        cgaputc(b' ');
        cgaputc(BS);
    } else {
        uart::putc_sync(c);
        cgaputc(c);
    }
}

impl Device for Mutex<Cons> {
    //
    // user read()s from the console go here.
    // copy (up to) a whole input line to dst.
    //
    fn read(&self, mut dst: VirtAddr, n: usize) -> Result<usize, ()> {
        let mut cons = self.lock();
        let target = n;
        let mut n = n;
        while n > 0 {
            // wait until the interrupt handler has put some
            // input into the buffer.
            while cons.r == cons.w {
                let p = Cpus::my_proc().unwrap();
                if PTABLE.killed(p) {
                    return Err(());
                }
                let chan = &cons.r as *const _ as usize;
                cons = sleep(chan, cons);
            }

            let c = cons.buf[cons.r.0 % INPUT_BUF];
            cons.r += Wrapping(1);

            if c == ctrl(b'D') {
                // end of file
                if n < target {
                    // Save ^D for next time, so the caller gets a
                    // 0-byte result.
                    cons.r -= Wrapping(1);
                }
                break;
            }

            // copy the input byte to the user-space buffer.
            if either_copyout(dst, &c).is_err() {
                break;
            }
            dst = dst + 1;
            n -= 1;

            if c == b'\n' {
                // a whole line has arrived; return to the
                // user-level read().
                break;
            }
        }
        Ok(target - n)
    }

    //
    // user write()s to the console go here.
    //
    fn write(&self, src: VirtAddr, n: usize) -> Result<usize, ()> {
        let _cons = self.lock();
        for i in 0..n {
            let mut c: u8 = 0;
            if either_copyin(&mut c, src + i).is_err() {
                return Ok(i);
            }
            putc(c);
        }
        Ok(n)
    }

    fn major(&self) -> Major {
        Major::Console
    }
}

impl Mutex<Cons> {
    //
    // the console input interrupt handler.
    // uart::intr() calls this for each input character.
    // do erase/kill processing, append to the buffer,
    // wake up read() if a whole line has arrived.
    //
    pub fn intr(&self, c: u8) {
        let mut cons = self.lock();
        match c {
            // Print process list.
            m if m == ctrl(b'P') => procdump(),
            // Kill line.
            m if m == ctrl(b'U') => {
                while cons.e != cons.w
                    && cons.buf[(cons.e - Wrapping(1)).0 % INPUT_BUF] != b'\n'
                {
                    cons.e -= Wrapping(1);
                    putc(ctrl(b'H'));
                }
            }
            // Backspace.
            m if m == ctrl(b'H') || m == b'\x7f' => {
                if cons.e != cons.w {
                    cons.e -= Wrapping(1);
                    putc(ctrl(b'H'));
                }
            }
            _ => {
                if c != 0 && (cons.e - cons.r).0 < INPUT_BUF {
                    let c = if c == b'\r' { b'\n' } else { c };

                    // echo back to the user.
                    putc(c);

                    // store for consumption by read().
                    let e_idx = cons.e.0 % INPUT_BUF;
                    cons.buf[e_idx] = c;
                    cons.e += Wrapping(1);

                    if c == b'\n'
                        || c == ctrl(b'D')
                        || (cons.e - cons.r).0 == INPUT_BUF
                    {
                        // wake up read() if a whole line (or end
                        // of file) has arrived.
                        cons.w = cons.e;
                        let chan = &cons.r as *const _ as usize;
                        PTABLE.wakeup(chan);
                    }
                }
            }
        }
    }
}

pub fn init() {
    DEVSW.set(Major::Console, &CONS).expect("console::init");
}
