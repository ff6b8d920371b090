//! # Memory Layout
//!
//! The kernel is linked and loaded at 1 MiB and runs identity mapped. Every
//! page directory shares the heap tables between [`HEAP_START_TABLE`] and
//! [`HEAP_END_TABLE`]; everything else is private to its directory.

use kernel_memory_addresses::{PAGE_SIZE as ADDR_PAGE_SIZE, Size4M, PageSize};

/// Size of a page and of a physical frame.
pub const PAGE_SIZE: u32 = ADDR_PAGE_SIZE;

/// Where the bootloader places the kernel image (LMA == VMA).
///
/// # Kernel Build
/// This information is sourced in the kernel's `build.rs` to configure
/// the linker.
pub const PHYS_LOAD: u32 = 0x0010_0000; // 1 MiB

/// Physical memory below this address is never handed out by the frame allocator.
pub const LOW_MEMORY_END: u64 = 0x0010_0000;

/// Physical memory above this address is ignored (no PAE).
pub const PHYS_MEMORY_LIMIT: u64 = 0x1_0000_0000;

/// Every directory identity maps `0..IDENTITY_MAP_END` as supervisor memory.
/// The frame allocator only hands out frames below it, so a frame address is
/// always a usable pointer in ring 0.
pub const IDENTITY_MAP_END: u32 = 0x1000_0000;

/// Where user programs are linked (`userland/*/linker.ld`).
pub const USER_IMAGE_BASE: u32 = 0x4000_0000;

/// First virtual address of the kernel heap.
pub const HEAP_START: u32 = 0x8000_0000;

/// One past the last virtual address the kernel heap may grow into.
pub const HEAP_END: u32 = 0x9000_0000;

/// First page-directory slot shared by every address space.
pub const HEAP_START_TABLE: usize = (HEAP_START >> Size4M::SHIFT) as usize;

/// One past the last shared page-directory slot.
pub const HEAP_END_TABLE: usize = (HEAP_END >> Size4M::SHIFT) as usize;

/// Pages mapped for the heap during bring-up.
pub const HEAP_INITIAL_PAGES: u32 = 0x10;

/// Per-process kernel stack size in pages.
pub const KERNEL_STACK_PAGES: u32 = 8;

/// Per-process kernel stack size in bytes.
pub const KERNEL_STACK_SIZE: u32 = KERNEL_STACK_PAGES * PAGE_SIZE;

/// Bottom of the user stack mapped by `exec`.
pub const USER_STACK_START: u32 = 0x1000_0000;

/// Top of the user stack (initial `esp` in ring 3).
pub const USER_STACK_END: u32 = 0x1001_0000;

/// The size of the boot stack the kernel entry point runs on.
pub const BOOT_STACK_SIZE: usize = 16 * 1024;

/// GDT selector of the ring-0 code segment.
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;

/// GDT selector of the ring-0 data segment.
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;

/// GDT selector of the ring-3 code segment, RPL 3.
pub const USER_CODE_SELECTOR: u16 = 0x18 | 3;

/// GDT selector of the ring-3 data segment, RPL 3.
pub const USER_DATA_SELECTOR: u16 = 0x20 | 3;

/// GDT selector of the task state segment.
pub const TSS_SELECTOR: u16 = 0x28;

/// EFLAGS for the first entry into ring 3: IF set plus the reserved bit 1.
pub const USER_EFLAGS: u32 = 0x202;

const _: () = {
    assert!(HEAP_START.is_multiple_of(Size4M::SIZE));
    assert!(HEAP_END.is_multiple_of(Size4M::SIZE));
    assert!(HEAP_START_TABLE < HEAP_END_TABLE);
    assert!(HEAP_END_TABLE <= 1024);
    assert!(USER_STACK_END > USER_STACK_START);
    assert!(USER_STACK_END <= HEAP_START);
    assert!(IDENTITY_MAP_END <= USER_STACK_START);
    assert!(USER_IMAGE_BASE >= USER_STACK_END);
    assert!(USER_IMAGE_BASE < HEAP_START);
    assert!(IDENTITY_MAP_END.is_multiple_of(Size4M::SIZE));
    assert!(KERNEL_STACK_SIZE.is_multiple_of(PAGE_SIZE));
    assert!((PHYS_LOAD as u64) >= LOW_MEMORY_END);
    assert!(BOOT_STACK_SIZE.is_multiple_of(4096));
};
