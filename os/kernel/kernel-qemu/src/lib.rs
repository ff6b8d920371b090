//! # QEMU Debug Console and Kernel Logging
//!
//! Kernel output goes to QEMU's `-debugcon` device, an I/O port that forwards
//! every byte it receives to the host. It needs no initialization, works
//! before paging is up, and cannot fail, which makes it the right target for
//! both the `log` facade and the kernel console used by the `print` system
//! call and the panic path.
//!
//! ## Output Mechanism
//! ```text
//! log::info!(..)          kprint!(..)        print syscall (C string)
//!       ↓                      ↓                      ↓
//! QemuLogger::log     console::write_fmt     console::write_bytes
//!       ↓                      ↓                      ↓
//!       └──────────────── DebugconSink ───────────────┘
//!                              ↓
//!                      outb → I/O port 0xE9
//! ```
//!
//! ## Components
//!
//! * [`QemuLogger`]: `log::Log` implementation, `"[LEVEL] target: message"`.
//! * [`console`]: raw byte and `fmt::Arguments` output, plus the
//!   [`kprint!`] / [`kprintln!`] macros.
//! * [`qemu_trace!`]: formatted output bypassing the log level filter.
//!
//! ## Feature System
//!
//! With the default `enabled` feature every write reaches the port. Without
//! it all output compiles to nothing. Port I/O only exists on bare-metal x86;
//! hosted builds (unit tests) record output in a per-thread buffer instead so
//! the formatting can be asserted on.
//!
//! ## Host-Side Configuration
//! ```bash
//! qemu-system-i386 -cdrom os.iso -debugcon stdio
//! qemu-system-i386 -cdrom os.iso -debugcon file:debug.log
//! ```
//!
//! ## Usage
//! ```rust,no_run
//! use kernel_qemu::QemuLogger;
//! use log::{LevelFilter, info};
//!
//! QemuLogger::new(LevelFilter::Debug).init().expect("logger initialization");
//! info!("frame allocator ready");
//! kernel_qemu::kprintln!("hello from ring 0");
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod console;
mod logger;
mod port;

pub use logger::QemuLogger;

/// Formatted output straight to the debug console, ignoring log levels.
#[macro_export]
macro_rules! qemu_trace {
    ($($arg:tt)*) => {{
        $crate::console::write_fmt(core::format_args!($($arg)*));
    }};
}

/// Kernel console output without a trailing newline.
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {{
        $crate::console::write_fmt(core::format_args!($($arg)*));
    }};
}

/// Kernel console output with a trailing newline.
#[macro_export]
macro_rules! kprintln {
    () => {{
        $crate::console::write_bytes(b"\n");
    }};
    ($($arg:tt)*) => {{
        $crate::console::write_fmt(core::format_args!($($arg)*));
        $crate::console::write_bytes(b"\n");
    }};
}
