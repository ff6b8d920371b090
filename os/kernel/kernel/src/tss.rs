//! # Task State Segment (TSS)
//!
//! Hardware task switching is not used. The one TSS exists for its
//! `ss0:esp0` pair: when an interrupt or `int 0x80` arrives while the CPU
//! runs in ring 3, it loads that stack before pushing the interrupt frame.
//! The scheduler points `esp0` at the top of the next process's kernel stack
//! on every switch (see [`set_kernel_stack`]).

use kernel_info::memory::KERNEL_DATA_SELECTOR;

/// The 32-bit TSS layout (Intel SDM Vol. 3A, 8.2.1).
#[repr(C)]
pub struct Tss32 {
    prev_task: u32,
    /// Stack pointer loaded on a transition to ring 0.
    pub esp0: u32,
    /// Stack segment loaded on a transition to ring 0.
    pub ss0: u32,
    esp1: u32,
    ss1: u32,
    esp2: u32,
    ss2: u32,
    cr3: u32,
    eip: u32,
    eflags: u32,
    eax: u32,
    ecx: u32,
    edx: u32,
    ebx: u32,
    esp: u32,
    ebp: u32,
    esi: u32,
    edi: u32,
    es: u32,
    cs: u32,
    ss: u32,
    ds: u32,
    fs: u32,
    gs: u32,
    ldt: u32,
    trap: u16,
    /// Offset of the I/O permission bitmap. Pointing past the limit means
    /// there is none, so ring 3 port I/O faults.
    pub iomap_base: u16,
}

const _: () = assert!(size_of::<Tss32>() == 104);

impl Tss32 {
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new() -> Self {
        Self {
            prev_task: 0,
            esp0: 0,
            ss0: KERNEL_DATA_SELECTOR as u32,
            esp1: 0,
            ss1: 0,
            esp2: 0,
            ss2: 0,
            cr3: 0,
            eip: 0,
            eflags: 0,
            eax: 0,
            ecx: 0,
            edx: 0,
            ebx: 0,
            esp: 0,
            ebp: 0,
            esi: 0,
            edi: 0,
            es: 0,
            cs: 0,
            ss: 0,
            ds: 0,
            fs: 0,
            gs: 0,
            ldt: 0,
            trap: 0,
            iomap_base: size_of::<Self>() as u16,
        }
    }
}

static mut TSS: Tss32 = Tss32::new();

/// Linear address of the TSS, for its GDT descriptor.
pub fn base() -> u32 {
    (&raw const TSS) as u32
}

/// Update the ring-0 stack used on user → kernel transitions.
pub fn set_kernel_stack(top: u32) {
    // SAFETY: single CPU; the CPU only reads `esp0` on the next ring change.
    unsafe { (&raw mut TSS.esp0).write_volatile(top) };
}
