// Intel 8250 serial port (UART).

use crate::console;
use crate::ioapic;
use crate::lapic;
use crate::trap::IRQ_COM1;
use crate::x86::{inb, outb};
use core::sync::atomic::{AtomicBool, Ordering};

const COM1: u16 = 0x3f8;

static PRESENT: AtomicBool = AtomicBool::new(false);

pub unsafe fn init() {
    // Turn off the FIFO
    outb(COM1 + 2, 0);

    // 9600 baud, 8 data bits, 1 stop bit, parity off.
    outb(COM1 + 3, 0x80); // unlock divisor
    outb(COM1 + 0, (115200u32 / 9600) as u8);
    outb(COM1 + 1, 0);
    outb(COM1 + 3, 0x03); // lock divisor, 8 data bits
    outb(COM1 + 4, 0);
    outb(COM1 + 1, 0x01); // enable receive interrupts

    // If status is 0xFF, no serial port.
    if inb(COM1 + 5) == 0xFF {
        return;
    }
    PRESENT.store(true, Ordering::Release);

    // Acknowledge pre-existing interrupt conditions;
    // enable interrupts.
    inb(COM1 + 2);
    inb(COM1 + 0);
    ioapic::enable(IRQ_COM1, 0);
}

pub fn putc_sync(c: u8) {
    if !PRESENT.load(Ordering::Acquire) {
        return;
    }
    for _ in 0..128 {
        if inb(COM1 + 5) & 0x20 != 0 {
            break;
        }
        lapic::microdelay(10);
    }
    outb(COM1 + 0, c);
}

fn getc() -> Option<u8> {
    if !PRESENT.load(Ordering::Acquire) {
        return None;
    }
    if inb(COM1 + 5) & 0x01 != 0 {
        Some(inb(COM1 + 0))
    } else {
        None
    }
}

pub fn intr() {
    while let Some(c) = getc() {
        console::CONS.intr(c);
    }
}
