//! # Processes and scheduling
//!
//! Everything the kernel knows about a running program lives in a
//! [`Process`]: its saved kernel context, page directory, kernel stack,
//! user image, file descriptors and working directory. Processes form a
//! tree ([`ProcessTree`]) rooted at `init` (PID 0).
//!
//! The [`Scheduler`] owns the tree plus two FIFO queues:
//!
//! ```text
//!  spawn ──► ready ──► running ──┬─► ready         (yield / preemption)
//!                                └─► finished ──► reap queue ──► freed
//! ```
//!
//! A process that exits cannot free the kernel stack it is standing on, so
//! the resources are released by whichever process is resumed next.
//!
//! The few instructions that really touch the CPU (saving a resume point,
//! jumping into another context, writing `TSS.esp0`, `iret` to ring 3) sit
//! behind the [`ContextSwitch`] trait. The kernel implements it with inline
//! assembly; tests use a recording mock.
//!
//! ## `fork`
//!
//! [`Scheduler::fork`] copies the parent's kernel stack into the child's,
//! rebases the saved stack and frame pointers by the distance between the
//! two stacks and queues the child. Both continuations come back out of the
//! same call, told apart by [`Snapshot`]. The parent does its copying
//! inside [`ContextSwitch::checkpoint`], while the frame the child will
//! resume in is still live:
//!
//! ```text
//!   parent: checkpoint(stage child) == Taken(..)  ──► ForkOutcome::Parent(child)
//!   child:  checkpoint(..)          == Resumed    ──► ForkOutcome::Child
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod context;
pub mod elf;
mod exec;
pub mod fd;
pub mod panic;
mod process;
mod scheduler;
mod tree;
mod user_memory;

pub use crate::context::{Context, ContextSwitch, FORK_MAGIC, ForkOutcome, Snapshot, UserEntry};
pub use crate::exec::SystemOutcome;
pub use crate::fd::{FdTable, FileDescriptor, FileOps};
pub use crate::process::{Image, Pid, Process, Thread};
pub use crate::scheduler::{ForkPlan, Scheduler, THREAD_RETURN};
pub use crate::tree::ProcessTree;
pub use crate::user_memory::UserMemory;

use kernel_vmem::VmemError;
use packer_abi::VfsError;
use thiserror::Error;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum ProcError {
    #[error("no process is running")]
    NoCurrentProcess,
    #[error("process {0} does not exist")]
    NoSuchProcess(Pid),
    #[error("attempt to kill init")]
    KillInit,
    #[error("no kernel stack could be allocated")]
    OutOfStacks,
    #[error("not inside a system call")]
    NotInSyscall,
    #[error("file not found")]
    NotFound,
    #[error("not an executable: {0}")]
    Elf(#[from] elf::ElfError),
    #[error("paging: {0}")]
    Vmem(#[from] VmemError),
    #[error("filesystem: {0}")]
    Vfs(#[from] VfsError),
}
