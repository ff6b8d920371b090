//! # Kernel Configuration and Boot Interface
//!
//! This crate defines the memory layout constants and the boot interface
//! contract that govern the kernel's initialization and runtime operation.
//! It is the single source of truth for addresses shared between the linker
//! script, the kernel and its subsystems (frame allocator, paging, heap,
//! process loader).
//!
//! ## Architecture
//!
//! ### Boot Information ([`boot`])
//! Parses the Multiboot 1 handoff:
//! * **Loader Magic**: `0x2BADB002` in `eax`, validated before anything else
//! * **Memory Map**: `{size, addr, len, type}` records, stride `size + 4`
//! * **Modules**: the initial ramdisk is module 0
//! * **VBE**: framebuffer base and geometry for the console
//!
//! ### Memory Layout ([`memory`])
//! Establishes the kernel's 32-bit virtual memory architecture.
//!
//! ```text
//! Virtual Address Space Layout (i386, no PAE):
//!
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │  Identity map (low memory)      │
//! 0x0010_0000 ├─────────────────────────────────┤ PHYS_LOAD
//!             │  Kernel text & data, then the   │
//!             │  frames the allocator hands out │
//! 0x1000_0000 ├─────────────────────────────────┤ IDENTITY_MAP_END, USER_STACK_START
//!             │       User stack (64 KiB)       │
//! 0x1001_0000 ├─────────────────────────────────┤ USER_STACK_END
//!             │              ...                │
//! 0x4000_0000 ├─────────────────────────────────┤ USER_IMAGE_BASE
//!             │       User ELF images           │
//! 0x8000_0000 ├─────────────────────────────────┤ HEAP_START  (table 512)
//!             │  Kernel heap, shared by every   │
//!             │  page directory                 │
//! 0x9000_0000 ├─────────────────────────────────┤ HEAP_END    (table 576)
//!             │              ...                │
//! 0xFFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! ### Design Principles
//! * **Shared Heap Tables**: the heap's page tables are aliased into every
//!   directory so kernel allocations stay valid across address-space switches
//! * **Fixed Layout**: compile-time constants with `const` assertions
//!
//! ## Usage Patterns
//!
//! ### Build Script Integration
//! ```rust
//! // In build.rs
//! use kernel_info::memory::PHYS_LOAD;
//!
//! println!("cargo:rustc-link-arg=--defsym=PHYS_LOAD={:#x}", PHYS_LOAD);
//! ```
//!
//! ### Kernel Entry
//! ```rust
//! use kernel_info::boot::{MultibootInfo, MemoryMap, MULTIBOOT_BOOTLOADER_MAGIC, INFO_SIZE};
//!
//! let raw = [0u8; INFO_SIZE];
//! let info = MultibootInfo::parse(MULTIBOOT_BOOTLOADER_MAGIC, &raw).unwrap();
//! assert!(info.memory_map_region().is_err());
//! assert_eq!(MemoryMap::new(&[]).count(), 0);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
