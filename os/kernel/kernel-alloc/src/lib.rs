//! # Kernel memory allocation
//!
//! Two allocators sit on top of the paging code in `kernel-vmem`:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  LockedHeap  (malloc / free, GlobalAlloc)    │  kernel virtual memory
//! │    SegmentHeap: first-fit segment list       │  0x8000_0000..0x9000_0000
//! └───────────────┬──────────────────────────────┘
//!                 │ HeapBacking::map_page
//! ┌───────────────▼──────────────────────────────┐
//! │  PageFrameAllocator                          │  physical frames
//! │    bitmap, one bit per 4 KiB frame           │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Frame allocator ([`frame_alloc`])
//!
//! Built once from the firmware memory map. It keeps the kernel image, the
//! initial ramdisk and its own bitmap locked, reserves low memory and
//! firmware regions, and implements [`FrameAlloc`](kernel_vmem::FrameAlloc)
//! so page tables can be allocated from it.
//!
//! ## Heap ([`heap`], [`locked_heap`])
//!
//! [`SegmentHeap`] carves allocations out of a linked list of segments and
//! grows page by page through a [`HeapBacking`]. [`LockedHeap`] serializes
//! access and runs every operation in the kernel page directory, so the
//! heap can be used while any process directory is loaded:
//!
//! ```rust
//! use kernel_alloc::{HeapBacking, SegmentHeap};
//!
//! #[repr(C, align(4096))]
//! struct Arena([u8; 4 * 4096]);
//!
//! struct Mapped;
//! impl HeapBacking for Mapped {
//!     fn map_page(&mut self, _va: usize) -> bool { true }
//!     fn set_user(&mut self, _va: usize, _user: bool) {}
//! }
//!
//! let mut arena = Box::new(Arena([0; 4 * 4096]));
//! let start = arena.0.as_mut_ptr() as usize;
//! let mut heap = unsafe { SegmentHeap::new(start, start + 4 * 4096, Mapped) };
//! heap.init(1).unwrap();
//!
//! let p = heap.malloc(100);
//! assert_eq!(heap.allocation_size(p), Some(112));
//! heap.free(p);
//! assert_eq!(heap.stats().used, 0);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod frame_alloc;
pub mod heap;
pub mod locked_heap;
pub mod phys_mapper;

pub use frame_alloc::{FrameAllocError, PageFrameAllocator};
pub use heap::{HeapBacking, HeapError, HeapStats, SegmentHeap};
pub use locked_heap::{AddressSpaceSwitch, KernelSpaceGuard, LockedHeap};
pub use phys_mapper::IdentityPhysMapper;
