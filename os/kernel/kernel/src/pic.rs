//! # 8259A Programmable Interrupt Controllers
//!
//! The two cascaded PICs deliver IRQs 0..=15. At reset they overlap the CPU
//! exception vectors, so [`remap`] moves them to `0x20..0x30`.

use crate::ports::{inb, io_wait, outb};

const PIC1_COMMAND: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_COMMAND: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;

const ICW1_ICW4: u8 = 0x01;
const ICW1_INIT: u8 = 0x10;
const ICW4_8086: u8 = 0x01;
const OCW3_READ_ISR: u8 = 0x0B;
const EOI: u8 = 0x20;

/// First vector of the master PIC after [`remap`].
pub const MASTER_OFFSET: u8 = 0x20;

/// First vector of the slave PIC after [`remap`].
pub const SLAVE_OFFSET: u8 = 0x28;

/// IRQ lines the kernel handles: the timer (0) and the cascade (2).
const MASTER_MASK: u8 = 0b1111_1010;
const SLAVE_MASK: u8 = 0b1111_1111;

/// Reinitialize both controllers with their vectors at `master` and
/// `slave`, then unmask only the lines the kernel handles.
///
/// # Safety
/// Interrupts must be disabled; the IDT must have gates for the new vectors
/// before they are enabled.
pub unsafe fn remap(master: u8, slave: u8) {
    unsafe {
        outb(PIC1_COMMAND, ICW1_INIT | ICW1_ICW4);
        io_wait();
        outb(PIC2_COMMAND, ICW1_INIT | ICW1_ICW4);
        io_wait();
        outb(PIC1_DATA, master);
        io_wait();
        outb(PIC2_DATA, slave);
        io_wait();
        // Slave on IRQ 2 of the master; cascade identity 2.
        outb(PIC1_DATA, 4);
        io_wait();
        outb(PIC2_DATA, 2);
        io_wait();
        outb(PIC1_DATA, ICW4_8086);
        io_wait();
        outb(PIC2_DATA, ICW4_8086);
        io_wait();

        outb(PIC1_DATA, MASTER_MASK);
        outb(PIC2_DATA, SLAVE_MASK);
    }
    log::debug!("PIC remapped to {master:#04x}/{slave:#04x}");
}

/// Acknowledge `irq`. IRQs of the slave need both controllers acknowledged.
pub fn eoi(irq: u8) {
    // SAFETY: writes the EOI command, which only affects the PIC state.
    unsafe {
        if irq >= 8 {
            outb(PIC2_COMMAND, EOI);
        }
        outb(PIC1_COMMAND, EOI);
    }
}

/// Whether `irq` 7 or 15 was raised without a matching in-service bit.
///
/// A spurious IRQ 7 must not be acknowledged; a spurious IRQ 15 only on the
/// master.
pub fn is_spurious(irq: u8) -> bool {
    let (command, line) = match irq {
        7 => (PIC1_COMMAND, 7),
        15 => (PIC2_COMMAND, 7),
        _ => return false,
    };
    // SAFETY: OCW3 selects the in-service register for the next read.
    let isr = unsafe {
        outb(command, OCW3_READ_ISR);
        inb(command)
    };
    isr & (1 << line) == 0
}
