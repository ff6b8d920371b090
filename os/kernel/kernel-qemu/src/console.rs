//! Kernel console on top of the debug port.

use crate::port;
use core::fmt::{self, Write};

/// `fmt::Write` adapter over the debug port.
pub struct DebugconSink;

impl Write for DebugconSink {
    #[inline]
    fn write_str(&mut self, s: &str) -> fmt::Result {
        write_bytes(s.as_bytes());
        Ok(())
    }
}

/// Write raw bytes, e.g. a user C string handed to the `print` system call.
#[inline]
pub fn write_bytes(bytes: &[u8]) {
    for &b in bytes {
        port::putc(b);
    }
}

/// Write formatted output; errors are impossible on this sink.
#[inline]
pub fn write_fmt(args: fmt::Arguments<'_>) {
    let _ = DebugconSink.write_fmt(args);
}

#[cfg(all(test, feature = "enabled"))]
mod tests {
    use crate::port::take_captured;

    #[test]
    fn macros_share_the_port() {
        take_captured();
        crate::kprint!("pid {}", 3);
        crate::kprintln!(": {}", "init");
        crate::kprintln!();
        super::write_bytes(b"raw");
        assert_eq!(take_captured(), "pid 3: init\n\nraw");
    }
}
