//! # x86 I/O Port Access
//!
//! The legacy devices this kernel drives all live in the 16-bit I/O port
//! space:
//!
//! ```text
//! 0x0020-0x0021   PIC #1 (command, data)
//! 0x0040-0x0043   PIT channels 0..2, mode register
//! 0x0070-0x0071   CMOS/RTC (index, data)
//! 0x0080          POST code port, used as an I/O delay
//! 0x00A0-0x00A1   PIC #2 (command, data)
//! ```
//!
//! # Safety
//! Every access must be made at CPL 0 and target the intended device
//! register. Writing the wrong port can wedge the machine (reprogramming the
//! PIC or the timer), so callers document which device they talk to.

/// Write one byte to an I/O port.
///
/// # Safety
/// See the module documentation.
#[inline]
pub unsafe fn outb(port: u16, val: u8) {
    unsafe {
        core::arch::asm!("out dx, al", in("dx") port, in("al") val, options(nomem, nostack, preserves_flags));
    }
}

/// Read one byte from an I/O port.
///
/// # Safety
/// See the module documentation.
#[inline]
pub unsafe fn inb(port: u16) -> u8 {
    let mut v: u8;
    unsafe {
        core::arch::asm!("in al, dx", in("dx") port, out("al") v, options(nomem, nostack, preserves_flags));
    }
    v
}

/// Give a slow device time to settle between two port writes.
///
/// # Safety
/// Writes the POST code port, which nothing else in this kernel uses.
#[inline]
pub unsafe fn io_wait() {
    unsafe { outb(0x80, 0) };
}
