use crate::syscall::print;
use core::ffi::CStr;
use core::fmt::{self, Write};

const LINE: usize = 256;

/// Formats into a stack buffer and prints it whenever it fills up.
///
/// `print` takes a NUL-terminated string, so one byte of the buffer is
/// always kept for the terminator and interior NULs are dropped.
pub struct SyscallSink {
    buf: [u8; LINE],
    len: usize,
}

impl SyscallSink {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buf: [0; LINE],
            len: 0,
        }
    }

    pub fn flush(&mut self) {
        if self.len == 0 {
            return;
        }
        self.buf[self.len] = 0;
        if let Ok(s) = CStr::from_bytes_with_nul(&self.buf[..=self.len]) {
            print(s);
        }
        self.len = 0;
    }

    /// Bytes waiting for the next flush.
    #[must_use]
    pub fn pending(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl Default for SyscallSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for SyscallSink {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &b in s.as_bytes().iter().filter(|&&b| b != 0) {
            if self.len == LINE - 1 {
                self.flush();
            }
            self.buf[self.len] = b;
            self.len += 1;
        }
        Ok(())
    }
}

impl Drop for SyscallSink {
    fn drop(&mut self) {
        self.flush();
    }
}

#[doc(hidden)]
pub fn syscall_write(args: fmt::Arguments) {
    // Best-effort output; a formatting error just truncates.
    SyscallSink::new().write_fmt(args).ok();
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {{
        $crate::stdlib::fmt::syscall_write(core::format_args!($($arg)*));
    }};
}

#[macro_export]
macro_rules! println {
    () => {{
        $crate::print!("\n");
    }};
    ($($arg:tt)*) => {{
        $crate::stdlib::fmt::syscall_write(core::format_args!("{}\n", core::format_args!($($arg)*)));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_output_keeps_room_for_the_terminator() {
        let mut sink = SyscallSink::new();
        let long = "x".repeat(LINE + 10);
        sink.write_str(&long).unwrap();
        // One full line went out, the rest is pending.
        assert_eq!(sink.pending().len(), 11);
    }

    #[test]
    fn interior_nul_is_dropped() {
        let mut sink = SyscallSink::new();
        write!(sink, "a\0b{}", 1).unwrap();
        assert_eq!(sink.pending(), b"ab1");
    }
}
