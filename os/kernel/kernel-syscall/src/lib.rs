//! # System call dispatch
//!
//! The `int 0x80` entry stub saves the segment registers and `pusha` block
//! on top of the CPU's interrupt frame, which yields a [`SyscallFrame`].
//! [`dispatch`] decodes `eax`, calls the matching [`SyscallHandler`] method
//! and writes the result back into the saved `eax`, so the value shows up in
//! the caller's register after `iret`.
//!
//! ```
//! use kernel_syscall::{SyscallFrame, SyscallHandler, dispatch};
//! use stdlib::syscall_abi::Sysno;
//!
//! struct Count(u32);
//! impl SyscallHandler for Count {
//!     fn exit(&mut self, _code: i32) {}
//!     fn print(&mut self, _text: &[u8]) { self.0 += 1; }
//!     fn yield_now(&mut self) {}
//! }
//!
//! let text = c"hi";
//! let mut frame = SyscallFrame::new(Sysno::Print as u32, text.as_ptr() as usize);
//! let mut handler = Count(0);
//! unsafe { dispatch(&mut frame, &mut handler) };
//! assert_eq!(frame.eax, 0);
//! assert_eq!(handler.0, 1);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

use log::{debug, trace};
use stdlib::syscall_abi::{PRINT_EFAULT, Sysno};

pub use stdlib::syscall_abi::SYSCALL_VECTOR;

/// Longest string `print` will read from user memory.
pub const MAX_PRINT_LEN: usize = 4096;

/// Registers as laid out on the kernel stack by the `int 0x80` stub.
///
/// Field order is the push order reversed: segment registers, then the
/// `pusha` block, then vector and error code, then the CPU-pushed frame.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct SyscallFrame {
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub int_no: u32,
    pub err_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub useresp: u32,
    pub ss: u32,
}

const _: () = assert!(size_of::<SyscallFrame>() == 19 * 4);

impl SyscallFrame {
    /// A frame as a user program would leave it: number in `eax`, first
    /// argument in `ebx`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new(sysno: u32, arg0: usize) -> Self {
        Self {
            gs: 0,
            fs: 0,
            es: 0,
            ds: 0,
            edi: 0,
            esi: 0,
            ebp: 0,
            esp: 0,
            ebx: arg0 as u32,
            edx: 0,
            ecx: 0,
            eax: sysno,
            int_no: SYSCALL_VECTOR as u32,
            err_code: 0,
            eip: 0,
            cs: 0,
            eflags: 0,
            useresp: 0,
            ss: 0,
        }
    }

    /// Arguments in ABI order.
    #[must_use]
    pub const fn args(&self) -> [u32; 5] {
        [self.ebx, self.ecx, self.edx, self.esi, self.edi]
    }
}

/// Kernel services behind the system calls.
pub trait SyscallHandler {
    /// Terminate the current process. Does not return on hardware; the
    /// scheduler switches to the next process.
    fn exit(&mut self, code: i32);

    /// Write `text` (without terminator) to the kernel console.
    fn print(&mut self, text: &[u8]);

    /// Reschedule the current process.
    fn yield_now(&mut self);
}

/// Borrow the NUL-terminated string at `addr`, reading at most `max` bytes.
///
/// Returns `None` for a null pointer. A string without terminator inside the
/// limit is cut at `max` bytes.
///
/// # Safety
/// `addr..addr + max` must be readable, or contain a NUL before the first
/// unreadable byte.
#[must_use]
pub unsafe fn user_cstr<'a>(addr: usize, max: usize) -> Option<&'a [u8]> {
    if addr == 0 {
        return None;
    }
    let base = addr as *const u8;
    let mut len = 0;
    while len < max && unsafe { base.add(len).read() } != 0 {
        len += 1;
    }
    Some(unsafe { core::slice::from_raw_parts(base, len) })
}

/// Decode and run the system call in `frame`, storing the result in `eax`.
///
/// Unknown numbers leave `eax` untouched.
///
/// # Safety
/// Pointer arguments in `frame` are dereferenced in the active address
/// space (see [`user_cstr`]).
pub unsafe fn dispatch<H: SyscallHandler + ?Sized>(frame: &mut SyscallFrame, handler: &mut H) {
    let [arg0, ..] = frame.args();
    match Sysno::try_from(frame.eax) {
        Ok(Sysno::Exit) => {
            trace!("sys_exit({})", arg0.cast_signed());
            handler.exit(arg0.cast_signed());
            frame.eax = 0;
        }
        Ok(Sysno::Print) => {
            frame.eax = match unsafe { user_cstr(arg0 as usize, MAX_PRINT_LEN) } {
                Some(text) => {
                    handler.print(text);
                    0
                }
                None => PRINT_EFAULT.cast_unsigned(),
            };
        }
        Ok(Sysno::Yield) => {
            handler.yield_now();
            frame.eax = 0;
        }
        Err(unknown) => debug!("unknown system call {unknown}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        exits: Vec<i32>,
        printed: Vec<u8>,
        yields: usize,
    }

    impl SyscallHandler for Recorder {
        fn exit(&mut self, code: i32) {
            self.exits.push(code);
        }

        fn print(&mut self, text: &[u8]) {
            self.printed.extend_from_slice(text);
        }

        fn yield_now(&mut self) {
            self.yields += 1;
        }
    }

    fn run(frame: &mut SyscallFrame) -> Recorder {
        let mut rec = Recorder::default();
        unsafe { dispatch(frame, &mut rec) };
        rec
    }

    #[test]
    fn print_copies_up_to_terminator() {
        let msg = b"hello\0world\0";
        let mut frame = SyscallFrame::new(Sysno::Print as u32, msg.as_ptr() as usize);
        let rec = run(&mut frame);
        assert_eq!(rec.printed, b"hello");
        assert_eq!(frame.eax, 0);
    }

    #[test]
    fn print_null_is_efault() {
        let mut frame = SyscallFrame::new(Sysno::Print as u32, 0);
        let rec = run(&mut frame);
        assert!(rec.printed.is_empty());
        assert_eq!(frame.eax.cast_signed(), -1);
    }

    #[test]
    fn exit_passes_signed_code() {
        let mut frame = SyscallFrame::new(Sysno::Exit as u32, 0);
        frame.ebx = (-3i32).cast_unsigned();
        let rec = run(&mut frame);
        assert_eq!(rec.exits, [-3]);
    }

    #[test]
    fn yield_and_unknown() {
        let mut frame = SyscallFrame::new(Sysno::Yield as u32, 0);
        assert_eq!(run(&mut frame).yields, 1);

        let mut frame = SyscallFrame::new(99, 0);
        let rec = run(&mut frame);
        assert_eq!(frame.eax, 99);
        assert_eq!(rec.yields, 0);
    }

    #[test]
    fn unterminated_string_is_capped() {
        let bytes = [b'a'; 16];
        let s = unsafe { user_cstr(bytes.as_ptr() as usize, 8) };
        assert_eq!(s, Some(&bytes[..8]));
    }
}
