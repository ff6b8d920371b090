//! # Global Descriptor Table (GDT)
//!
//! Segmentation is flat: every code and data segment spans the full 4 GiB, so
//! the only thing the GDT still decides is the privilege level. The table
//! has six slots, matching the selectors in [`kernel_info::memory`]:
//!
//! | Index | Selector | Descriptor              |
//! |:------|:---------|:------------------------|
//! | 0     | `0x00`   | null                    |
//! | 1     | `0x08`   | kernel code, DPL 0      |
//! | 2     | `0x10`   | kernel data, DPL 0      |
//! | 3     | `0x1B`   | user code, DPL 3        |
//! | 4     | `0x23`   | user data, DPL 3        |
//! | 5     | `0x28`   | 32-bit available TSS    |
//!
//! The TSS only exists to give the CPU a ring-0 stack (`esp0`/`ss0`) when an
//! interrupt arrives in ring 3; see [`crate::tss`].

use crate::tss::{self, Tss32};
use bitfield_struct::bitfield;
use kernel_info::memory::{KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR, TSS_SELECTOR};

/// The access byte of a segment descriptor.
#[bitfield(u8)]
pub struct Access {
    /// Set by the CPU on first use; for a TSS this is bit 0 of the type.
    pub accessed: bool,
    /// Readable (code) or writable (data). For a TSS: busy.
    pub rw: bool,
    /// Conforming (code) or expand-down (data).
    pub dc: bool,
    pub executable: bool,
    /// `true` for code/data, `false` for system descriptors.
    pub s: bool,
    #[bits(2)]
    pub dpl: u8,
    pub present: bool,
}

/// One 8-byte segment descriptor.
///
/// ```text
/// 63      56 55 54 53 52 51    48 47      40 39        16 15         0
/// +---------+--+--+--+--+--------+----------+------------+------------+
/// | base hi | G|DB| L|AV|limit hi|  access  |  base lo   |  limit lo  |
/// +---------+--+--+--+--+--------+----------+------------+------------+
/// ```
#[bitfield(u64)]
pub struct SegmentDescriptor {
    pub limit_lo: u16,
    #[bits(24)]
    pub base_lo: u32,
    #[bits(8)]
    pub access: Access,
    #[bits(4)]
    pub limit_hi: u8,
    pub available: bool,
    pub long_mode: bool,
    /// 32-bit default operand size.
    pub db: bool,
    /// The limit counts 4 KiB pages instead of bytes.
    pub granularity: bool,
    pub base_hi: u8,
}

impl SegmentDescriptor {
    /// Base 0, limit 4 GiB, 32-bit.
    const fn flat(access: Access) -> Self {
        Self::new()
            .with_limit_lo(0xFFFF)
            .with_limit_hi(0xF)
            .with_access(access)
            .with_db(true)
            .with_granularity(true)
    }

    #[must_use]
    pub const fn code(dpl: u8) -> Self {
        Self::flat(
            Access::new()
                .with_rw(true)
                .with_executable(true)
                .with_s(true)
                .with_dpl(dpl)
                .with_present(true),
        )
    }

    #[must_use]
    pub const fn data(dpl: u8) -> Self {
        Self::flat(
            Access::new()
                .with_rw(true)
                .with_s(true)
                .with_dpl(dpl)
                .with_present(true),
        )
    }

    /// A 32-bit available TSS (type `0x9`) at `base` with byte-granular `limit`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn tss(base: u32, limit: u32) -> Self {
        Self::new()
            .with_limit_lo(limit as u16)
            .with_limit_hi(((limit >> 16) & 0xF) as u8)
            .with_base_lo(base & 0x00FF_FFFF)
            .with_base_hi((base >> 24) as u8)
            .with_access(
                Access::new()
                    .with_accessed(true)
                    .with_executable(true)
                    .with_present(true),
            )
    }
}

const _: () = assert!(size_of::<SegmentDescriptor>() == 8);

const GDT_ENTRIES: usize = 6;

static mut GDT: [SegmentDescriptor; GDT_ENTRIES] = [
    SegmentDescriptor::new(),
    SegmentDescriptor::code(0),
    SegmentDescriptor::data(0),
    SegmentDescriptor::code(3),
    SegmentDescriptor::data(3),
    SegmentDescriptor::new(),
];

/// Operand of `lgdt`.
#[repr(C, packed)]
struct DescTablePtr {
    limit: u16,
    base: u32,
}

/// Install the GDT, reload every segment register and load the task register.
///
/// # Safety
/// Run once, at CPL 0, with interrupts disabled.
#[allow(clippy::cast_possible_truncation)]
pub unsafe fn init() {
    let tss_base = tss::base();
    let tss_limit = (size_of::<Tss32>() - 1) as u32;

    unsafe {
        let gdt = &raw mut GDT;
        (*gdt)[usize::from(TSS_SELECTOR >> 3)] = SegmentDescriptor::tss(tss_base, tss_limit);

        let ptr = DescTablePtr {
            limit: (size_of::<[SegmentDescriptor; GDT_ENTRIES]>() - 1) as u16,
            base: gdt as u32,
        };
        core::arch::asm!(
            "lgdt [{}]",
            in(reg) &raw const ptr,
            options(readonly, nostack, preserves_flags)
        );

        core::arch::asm!(
            "mov ds, {0:x}",
            "mov es, {0:x}",
            "mov fs, {0:x}",
            "mov gs, {0:x}",
            "mov ss, {0:x}",
            in(reg) u32::from(KERNEL_DATA_SELECTOR),
            options(nostack, preserves_flags)
        );

        // Reload CS with a far return.
        core::arch::asm!(
            "push {cs}",
            "lea {tmp}, [2f]",
            "push {tmp}",
            "retf",
            "2:",
            cs = const KERNEL_CODE_SELECTOR,
            tmp = out(reg) _,
        );

        core::arch::asm!(
            "ltr {0:x}",
            in(reg) u32::from(TSS_SELECTOR),
            options(nostack, preserves_flags)
        );
    }
    log::debug!("GDT loaded, TSS at {tss_base:#010x}");
}

