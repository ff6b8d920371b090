use crate::context::Context;
use crate::fd::FdTable;
use alloc::string::String;
use core::fmt;
use kernel_memory_addresses::PhysicalAddress;

/// Process identifier. `init` is always `Pid(0)`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Pid(pub u32);

impl Pid {
    pub const INIT: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn is_init(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Saved kernel-side execution state.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct Thread {
    /// Where to resume. All zero for a process that never ran.
    pub context: Context,
    /// Physical address of the page directory (the CR3 value).
    pub directory: PhysicalAddress,
    /// [`FORK_MAGIC`](crate::FORK_MAGIC) once `fork`/`clone` prepared the context.
    pub magic: u32,
}

/// Memory layout of the process.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct Image {
    /// Lowest loaded user address.
    pub entry: u32,
    /// Bytes from `entry` to the end of the highest segment.
    pub size: u32,
    /// Current end of the user heap (after the argument block).
    pub heap: u32,
    /// `heap` rounded up to the next page; everything below is mapped.
    pub heap_aligned: u32,
    /// Top of the kernel stack (`TSS.esp0` while this process runs).
    pub stack: u32,
    /// Size of the kernel stack in bytes.
    pub stack_size: u32,
    /// Initial user stack pointer region end.
    pub user_stack: u32,
}

impl Image {
    #[inline]
    #[must_use]
    pub const fn stack_base(&self) -> u32 {
        self.stack - self.stack_size
    }
}

/// A process control block.
#[derive(Debug)]
pub struct Process {
    pub pid: Pid,
    pub name: String,
    pub thread: Thread,
    pub image: Image,
    pub fds: FdTable,
    /// Working directory path.
    pub cwd: String,
    /// Image offset of the working directory's entry.
    pub cwd_entry: u32,
    /// Exit code, valid once `finished`.
    pub status: i32,
    pub finished: bool,
    /// Running or resumable without going through the ready queue first.
    pub started: bool,
    /// Address of the [`SyscallFrame`](kernel_syscall::SyscallFrame) of the
    /// system call in progress, `0` outside of one.
    pub syscall_frame: u32,
    /// The kernel stack came from the frame allocator and is freed on reap.
    pub(crate) owns_stack: bool,
    pub(crate) queued: bool,
}

impl Process {
    pub(crate) fn new(pid: Pid, name: &str) -> Self {
        Self {
            pid,
            name: name.into(),
            thread: Thread::default(),
            image: Image::default(),
            fds: FdTable::new(),
            cwd: "/".into(),
            cwd_entry: 0,
            status: 0,
            finished: false,
            started: false,
            syscall_frame: 0,
            owns_stack: false,
            queued: false,
        }
    }
}
