//! # Kernel synchronization primitives
//!
//! There is one CPU, so every primitive here is about the two ways another
//! execution context can get in between: an interrupt, or a context switch.
//!
//! | Primitive | Waits by | Used for |
//! |:----------|:---------|:---------|
//! | [`SpinLock`] | [`relax`] (the scheduler's yield once installed) | the kernel heap |
//! | [`SpinMutex`] | spinning; [`lock_irq`](SpinMutex::lock_irq) keeps interrupts off | the frame allocator |
//! | [`IrqCell`] | never; interrupts off, borrow may span a switch | the process table |
//! | [`SyncOnceCell`] | [`relax`] while another writer finishes | initrd, logger |
//!
//! A [`SpinLock`] waiter cannot make progress by spinning when the holder
//! is a preempted process, which is why the kernel points the
//! [relax hook](set_relax_hook) at its yield.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod irq_cell;
mod raw_spin;
mod relax;
mod spin_lock;
mod spin_mutex;
mod sync_once_cell;

pub use irq::IrqGuard;
pub use irq_cell::IrqCell;
pub use raw_spin::RawSpin;
pub use relax::{relax, set_relax_hook};
pub use spin_lock::{SpinLock, SpinLockGuard};
pub use spin_mutex::{IrqMutex, SpinMutex, SpinMutexGuard};
pub use sync_once_cell::SyncOnceCell;
