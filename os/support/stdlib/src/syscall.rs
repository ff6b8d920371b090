//! Raw `int 0x80` wrappers.

use crate::syscall_abi::Sysno;
use core::ffi::CStr;

/// Terminate the calling process with `code`.
pub fn exit(code: i32) -> ! {
    arch::syscall1(Sysno::Exit, code.cast_unsigned());
    // The kernel never schedules an exited process again.
    loop {
        core::hint::spin_loop();
    }
}

/// Write `s` to the kernel console. Returns `0`, or `-1` for a null pointer.
pub fn print(s: &CStr) -> i32 {
    arch::syscall1(Sysno::Print, s.as_ptr() as usize as u32).cast_signed()
}

/// Give up the rest of the time slice.
pub fn sched_yield() {
    arch::syscall1(Sysno::Yield, 0);
}

#[cfg(target_arch = "x86")]
mod arch {
    use super::Sysno;

    #[inline(always)]
    #[allow(clippy::inline_always)]
    pub fn syscall1(sysno: Sysno, arg0: u32) -> u32 {
        let ret: u32;
        unsafe {
            core::arch::asm!(
                "int 0x80",
                inlateout("eax") sysno as u32 => ret,
                in("ebx") arg0,
                options(nostack)
            );
        }
        ret
    }
}

#[cfg(not(target_arch = "x86"))]
mod arch {
    use super::Sysno;

    /// Host builds have no kernel to trap into.
    pub const fn syscall1(_sysno: Sysno, _arg0: u32) -> u32 {
        0
    }
}
