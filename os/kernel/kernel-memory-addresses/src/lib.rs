//! # Virtual and Physical Memory Address Types (i386)
//!
//! Strongly typed wrappers for 32-bit memory addresses used by the frame
//! allocator, the two-level paging code and the process loader.
//!
//! ## Overview
//!
//! Protected-mode x86 without PAE translates a 32-bit virtual address through
//! a page directory and a page table:
//!
//! ```text
//! | 31‒22     | 21‒12  | 11‒0   |
//! | Directory | Table  | Offset |
//! ```
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`VirtualAddress`] | An address as seen by code running under paging. |
//! | [`PhysicalAddress`] | A frame address as seen by the memory bus / DMA engines. |
//!
//! Both are `#[repr(transparent)]` over `u32`, so they cost nothing at runtime
//! but keep the two address kinds from being mixed up.
//!
//! ## Page Sizes
//!
//! - [`Size4K`]: a single page, mapped by one page-table entry.
//! - [`Size4M`]: the span covered by one page-directory slot (one full page table).
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x8040_1234);
//! assert_eq!(va.directory_index(), 0x201);
//! assert_eq!(va.table_index(), 0x001);
//! assert_eq!(va.page_offset(), 0x234);
//! assert_eq!(VirtualAddress::from_indices(0x201, 0x001).as_u32(), 0x8040_1000);
//!
//! let pa = PhysicalAddress::new(0x0030_0042);
//! assert_eq!(pa.align_down::<Size4K>().as_u32(), 0x0030_0000);
//! assert_eq!(pa.frame_number(), 0x300);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod page_size;
mod physical_address;
mod virtual_address;

pub use page_size::{PageSize, Size4K, Size4M};
pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

/// Size of one page (and one physical frame) in bytes.
pub const PAGE_SIZE: u32 = 4096;

/// Number of low address bits that select a byte inside a page.
pub const PAGE_SHIFT: u32 = 12;

/// Entries per page directory and per page table.
pub const ENTRIES_PER_TABLE: usize = 1024;

/// Round `x` down to a multiple of `a` (`a` must be a power of two).
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0x1FFF, 0x1000), 0x1000);
/// assert_eq!(align_down(0x2000, 0x1000), 0x2000);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u32, a: u32) -> u32 {
    x & !(a - 1)
}

/// Round `x` up to a multiple of `a` (`a` must be a power of two), saturating
/// at the highest aligned value instead of wrapping.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(1, 16), 16);
/// assert_eq!(align_up(32, 16), 32);
/// assert_eq!(align_up(u32::MAX, 0x1000), 0xFFFF_F000);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u32, a: u32) -> u32 {
    match x.checked_add(a - 1) {
        Some(v) => v & !(a - 1),
        None => align_down(u32::MAX, a),
    }
}

/// Number of pages needed to hold `bytes` bytes.
///
/// ```rust
/// # use kernel_memory_addresses::pages_for;
/// assert_eq!(pages_for(0), 0);
/// assert_eq!(pages_for(1), 1);
/// assert_eq!(pages_for(4096), 1);
/// assert_eq!(pages_for(4097), 2);
/// ```
#[inline(always)]
#[must_use]
pub const fn pages_for(bytes: u32) -> u32 {
    bytes / PAGE_SIZE + if bytes % PAGE_SIZE == 0 { 0 } else { 1 }
}
