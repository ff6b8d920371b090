//! System call numbers and register conventions shared by the kernel and
//! user programs.
//!
//! A call is `int 0x80` with the number in `eax` and arguments in `ebx`,
//! `ecx`, `edx`, `esi`, `edi`. The result comes back in `eax`.

/// Interrupt vector of the system call gate.
pub const SYSCALL_VECTOR: u8 = 0x80;

#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Sysno {
    /// `exit(code)`: terminate the calling process.
    Exit = 0,
    /// `print(str)`: write a NUL-terminated string to the kernel console.
    Print = 1,
    /// `yield()`: give up the rest of the time slice.
    Yield = 2,
}

impl TryFrom<u32> for Sysno {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Exit),
            1 => Ok(Self::Print),
            2 => Ok(Self::Yield),
            other => Err(other),
        }
    }
}

/// `print` result for a null string pointer.
pub const PRINT_EFAULT: i32 = -1;
