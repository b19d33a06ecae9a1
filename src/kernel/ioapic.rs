// The I/O APIC manages hardware interrupts for an SMP system.
// http://www.intel.com/design/chipsets/datashts/29056601.pdf

use crate::println;
use crate::trap::T_IRQ0;
use core::ptr;
use core::sync::atomic::{AtomicU8, Ordering};

const IOAPIC: usize = 0xFEC00000; // default physical address of IO APIC

const REG_ID: u32 = 0x00; // Register index: ID
const REG_VER: u32 = 0x01; // Register index: version
const REG_TABLE: u32 = 0x10; // Redirection table base

// The redirection table starts at REG_TABLE and uses
// two registers to configure each interrupt.
// The first (low) register in a pair contains configuration bits.
// The second (high) register contains a bitmask telling which
// CPUs can serve that interrupt.
const INT_DISABLED: u32 = 0x00010000; // Interrupt disabled

// set by mp::init from the MP tables
static IOAPICID: AtomicU8 = AtomicU8::new(0);

pub fn set_id(id: u8) {
    IOAPICID.store(id, Ordering::Release);
}

// IO APIC MMIO: write the register index, then read or write data.
fn read(reg: u32) -> u32 {
    let ioapic = IOAPIC as *mut u32;
    unsafe {
        ptr::write_volatile(ioapic, reg);
        ptr::read_volatile(ioapic.add(4)) // data register at +0x10
    }
}

fn write(reg: u32, data: u32) {
    let ioapic = IOAPIC as *mut u32;
    unsafe {
        ptr::write_volatile(ioapic, reg);
        ptr::write_volatile(ioapic.add(4), data);
    }
}

pub fn init() {
    let maxintr = (read(REG_VER) >> 16) & 0xFF;
    let id = (read(REG_ID) >> 24) as u8;
    if id != IOAPICID.load(Ordering::Acquire) {
        println!("ioapicinit: id isn't equal to ioapicid; not a MP");
    }

    // Mark all interrupts edge-triggered, active high, disabled,
    // and not routed to any CPUs.
    for i in 0..=maxintr {
        write(REG_TABLE + 2 * i, INT_DISABLED | (T_IRQ0 + i));
        write(REG_TABLE + 2 * i + 1, 0);
    }
}

pub fn enable(irq: u32, cpunum: u32) {
    // Mark interrupt edge-triggered, active high,
    // enabled, and routed to the given cpunum,
    // which happens to be that cpu's APIC ID.
    write(REG_TABLE + 2 * irq, T_IRQ0 + irq);
    write(REG_TABLE + 2 * irq + 1, cpunum << 24);
}
