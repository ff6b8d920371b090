//! # Virtual Memory Support
//!
//! Two-level i386 paging (no PAE) for the kernel and its processes.
//!
//! ## What you get
//! - An [`AddressSpace`] handle over one [`PageDirectory`] with mapping,
//!   translation, cloning and teardown.
//! - [`PageEntry`], the 32-bit directory/table entry, and [`MapFlags`] for
//!   requesting permissions.
//! - A tiny allocator/mapper interface ([`FrameAlloc`], [`PhysMapper`]) so the
//!   same code runs on the identity-mapped kernel and on simulated RAM in tests.
//!
//! ## i386 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 31‒22     | 21‒12  | 11‒0   |
//! | Directory | Table  | Offset |
//! ```
//!
//! ```text
//!  CR3 → Page Directory → Page Table → Physical Page
//!          (1024 PDEs)     (1024 PTEs)    (4 KiB)
//! ```
//!
//! ## Directory layout
//!
//! A [`PageDirectory`] spans three contiguous frames:
//!
//! | Frame | Contents |
//! |:------|:---------|
//! | 0 | the hardware directory (what CR3 points at): one entry per table, `table | 0x07` |
//! | 1 | the frame address of every table, for the kernel's own walks |
//! | 2 | the directory's own physical address |
//!
//! The directory slots `HEAP_START_TABLE..HEAP_END_TABLE` hold the kernel
//! heap's tables. They are allocated once in the kernel directory and copied
//! verbatim into every clone, so a heap mapping made through any directory is
//! visible through all of them. Every other slot is private per directory.

#![cfg_attr(not(any(test, feature = "sim")), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

pub mod address_space;
mod directory;
mod entry;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use crate::address_space::{AddressSpace, enable_paging};
pub use crate::directory::{DIRECTORY_FRAMES, PageDirectory, PageTable};
pub use crate::entry::{MapFlags, PageEntry};
pub use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

use thiserror::Error;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum VmemError {
    #[error("out of physical frames")]
    OutOfFrames,
    #[error("{0} is not mapped")]
    NotMapped(VirtualAddress),
    #[error("{0} is not page aligned")]
    Misaligned(u32),
}

/// Source of **physical** 4 KiB frames for page tables, directories and
/// private page copies.
///
/// Returned frames **must** be 4 KiB aligned. Returns `None` on out-of-memory.
pub trait FrameAlloc {
    /// Allocate one 4 KiB frame.
    fn alloc_4k(&mut self) -> Option<PhysicalAddress>;

    /// Allocate `count` physically contiguous frames and return the first.
    fn alloc_contiguous(&mut self, count: u32) -> Option<PhysicalAddress>;

    /// Return a frame. Freeing a frame that is not allocated is a no-op.
    fn free_4k(&mut self, frame: PhysicalAddress);
}

/// Converts physical addresses to *temporarily* usable pointers in the current
/// virtual address space.
///
/// The kernel identity maps physical memory, so its mapper is a plain cast;
/// tests index into a vector of frames.
///
/// # Safety
/// - You must ensure `pa` is mapped as writable in the current page tables
///   for `&mut T`.
/// - Lifetime `'a` is purely borrow-checked; the mapping must remain valid
///   for `'a`.
/// - Type `T` must match the bytes at `pa` (no aliasing UB).
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable reference.
    ///
    /// # Safety
    /// See the trait documentation.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

/// View the 4 KiB frame at `phys` as a [`PageTable`].
///
/// # Safety
/// - `phys` must point to a valid 4 KiB page containing a page table.
/// - The mapping must be writable for mut access.
#[inline]
unsafe fn get_table<'a, M: PhysMapper>(m: &M, phys: PhysicalAddress) -> &'a mut PageTable {
    unsafe { m.phys_to_mut::<PageTable>(phys) }
}

/// View the 4 KiB frame at `phys` as raw bytes.
///
/// # Safety
/// Same as [`get_table`].
#[inline]
unsafe fn get_frame<'a, M: PhysMapper>(m: &M, phys: PhysicalAddress) -> &'a mut [u8; 4096] {
    unsafe { m.phys_to_mut::<[u8; 4096]>(phys) }
}
