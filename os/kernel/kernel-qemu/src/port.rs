//! Byte-level access to the debug console.

/// I/O port of QEMU's `-debugcon` device (default `iobase`).
pub const DEBUGCON_PORT: u16 = 0xE9;

#[cfg(all(feature = "enabled", target_arch = "x86", target_os = "none"))]
#[allow(clippy::inline_always)]
#[inline(always)]
pub fn putc(c: u8) {
    unsafe {
        core::arch::asm!(
            "out dx, al",
            in("dx") DEBUGCON_PORT,
            in("al") c,
            options(nomem, nostack, preserves_flags)
        );
    }
}

#[cfg(all(feature = "enabled", test))]
std::thread_local! {
    static CAPTURE: std::cell::RefCell<Vec<u8>> = const { std::cell::RefCell::new(Vec::new()) };
}

#[cfg(all(feature = "enabled", test))]
pub fn putc(c: u8) {
    CAPTURE.with(|b| b.borrow_mut().push(c));
}

/// Drain everything this thread wrote to the port.
#[cfg(all(feature = "enabled", test))]
pub fn take_captured() -> String {
    CAPTURE.with(|b| String::from_utf8_lossy(&core::mem::take(&mut *b.borrow_mut())).into_owned())
}

#[cfg(not(any(
    all(feature = "enabled", target_arch = "x86", target_os = "none"),
    all(feature = "enabled", test)
)))]
#[inline]
pub const fn putc(_c: u8) {}
