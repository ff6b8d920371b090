//! # i386 Interrupt Descriptor Table (IDT)
//!
//! A `no_std` IDT with a fluent builder for its gates:
//!
//! ```ignore
//! // int 0x80, callable from ring 3, interrupts masked on entry:
//! idt[0x80]
//!     .set_handler(isr_0x80)
//!     .selector(KERNEL_CODE_SELECTOR)
//!     .dpl(3)
//!     .present(true)
//!     .gate_interrupt();
//!
//! unsafe { idt.load() };
//! ```
//!
//! ## Vectors
//!
//! | Vectors       | Source                      | Handling                          |
//! |:--------------|:----------------------------|:----------------------------------|
//! | `0x00..0x20`  | CPU exceptions              | kernel: panic; ring 3: kill task  |
//! | `0x20..0x30`  | PIC IRQs 0..=15             | EOI; IRQ 0 ticks and preempts     |
//! | `0x80`        | `int 0x80` from user space  | [`syscall::handle`]               |
//!
//! Every vector enters through a stub in [`entry`] that builds a
//! [`SyscallFrame`] on the kernel stack and calls [`isr_dispatch`].
//!
//! ## Gate kinds
//! - **Interrupt gates** clear IF on entry. Every gate here is one, so the
//!   kernel never nests interrupts.
//! - **Trap gates** leave IF unchanged.

mod entry;
mod page_fault;
pub mod syscall;
mod timer;

use crate::pic;
use bitfield_struct::bitfield;
use core::arch::asm;
use core::ops::{Index, IndexMut};
use kernel_info::memory::KERNEL_CODE_SELECTOR;
use kernel_registers::eflags::Eflags;
use kernel_syscall::{SYSCALL_VECTOR, SyscallFrame};
use log::{debug, error, trace};
use syscall::SyscallInterrupt;

const _: () = assert!(size_of::<IdtEntry>() == 8);

/// The attribute byte of a gate: `| P | DPL(2) | S(0) | Type(4) |`.
#[bitfield(u8)]
pub struct IdtGateAttr {
    /// **Type**: 0xE = 32-bit interrupt gate, 0xF = 32-bit trap gate.
    #[bits(4)]
    pub typ: u8,

    /// **S**: must be `0` for interrupt and trap gates.
    pub s: bool,

    /// **DPL**: the lowest privilege allowed to raise the vector with `int n`.
    #[bits(2)]
    pub dpl: u8,

    /// **P**: the gate is valid.
    pub present: bool,
}

impl IdtGateAttr {
    #[inline]
    #[must_use]
    pub const fn interrupt_gate() -> Self {
        Self::new().with_typ(0xE).with_s(false)
    }
}

/// All 256 gates.
#[repr(C, align(8))]
pub struct Idt {
    entries: [IdtEntry; 256],
}

impl Default for Idt {
    fn default() -> Self {
        Self::new()
    }
}

impl Idt {
    /// An IDT with every gate marked **not present**.
    pub const fn new() -> Self {
        Self {
            entries: [IdtEntry::MISSING; 256],
        }
    }

    /// Load this IDT into **IDTR**.
    ///
    /// # Safety
    /// CPL 0; every present gate must point at valid handler code.
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub unsafe fn load(&'static self) {
        let idtr = Idtr {
            limit: (size_of::<Self>() - 1) as u16,
            base: core::ptr::from_ref(self) as u32,
        };
        unsafe {
            asm!("lidt [{}]", in(reg) &raw const idtr, options(nostack, preserves_flags, readonly));
        }
    }
}

impl Index<usize> for Idt {
    type Output = IdtEntry;
    fn index(&self, i: usize) -> &Self::Output {
        &self.entries[i]
    }
}

impl IndexMut<usize> for Idt {
    fn index_mut(&mut self, i: usize) -> &mut Self::Output {
        &mut self.entries[i]
    }
}

/// Operand of `lidt`.
#[repr(C, packed)]
struct Idtr {
    limit: u16,
    base: u32,
}

/// One 8-byte i386 gate descriptor.
///
/// ```text
/// 63            48 47  46 45 44 43    40 39      32 31          16 15           0
/// +---------------+---+-----+--+--------+----------+--------------+--------------+
/// | offset[31:16] | P | DPL |S |  type  |   zero   |   selector   | offset[15:0] |
/// +---------------+---+-----+--+--------+----------+--------------+--------------+
/// ```
#[repr(C)]
#[derive(Copy, Clone)]
pub struct IdtEntry {
    offset_lo: u16,
    selector: u16,
    zero: u8,
    /// Manipulated through [`IdtGateAttr`].
    type_attr: u8,
    offset_hi: u16,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum GateType {
    /// Masks maskable interrupts on entry (clears `IF`).
    InterruptGate,
    /// Leaves `IF` unchanged.
    TrapGate,
}

impl IdtEntry {
    /// A zeroed, non-present entry.
    pub const MISSING: Self = Self {
        offset_lo: 0,
        selector: 0,
        zero: 0,
        type_attr: IdtGateAttr::new().into_bits(),
        offset_hi: 0,
    };

    /// Point this entry at `handler` and return a builder for the rest.
    ///
    /// The selector defaults to the kernel code segment. The entry stays
    /// **not present** until [`IdtEntryBuilder::present`] is called.
    #[allow(clippy::cast_possible_truncation)]
    pub fn set_handler(&mut self, handler: extern "C" fn()) -> IdtEntryBuilder<'_> {
        let addr = handler as usize as u32;
        self.offset_lo = (addr & 0xFFFF) as u16;
        self.offset_hi = (addr >> 16) as u16;
        self.selector = KERNEL_CODE_SELECTOR;
        self.zero = 0;
        self.type_attr = IdtGateAttr::interrupt_gate()
            .with_present(false)
            .with_dpl(0)
            .into_bits();

        IdtEntryBuilder { entry: self }
    }
}

/// Fluent builder for an [`IdtEntry`].
pub struct IdtEntryBuilder<'a> {
    entry: &'a mut IdtEntry,
}

impl IdtEntryBuilder<'_> {
    #[inline]
    pub const fn present(self, p: bool) -> Self {
        let bf = IdtGateAttr::from_bits(self.entry.type_attr).with_present(p);
        self.entry.type_attr = bf.into_bits();
        self
    }

    /// Set **DPL**, 0..=3. `dpl(3)` lets user code raise the vector.
    #[inline]
    pub fn dpl(self, dpl: u8) -> Self {
        debug_assert!(dpl <= 3);
        let bf = IdtGateAttr::from_bits(self.entry.type_attr).with_dpl(dpl);
        self.entry.type_attr = bf.into_bits();
        self
    }

    #[inline]
    pub const fn gate_interrupt(self) -> Self {
        let bf = IdtGateAttr::from_bits(self.entry.type_attr)
            .with_typ(0xE)
            .with_s(false);
        self.entry.type_attr = bf.into_bits();
        self
    }

    #[inline]
    pub const fn gate_trap(self) -> Self {
        let bf = IdtGateAttr::from_bits(self.entry.type_attr)
            .with_typ(0xF)
            .with_s(false);
        self.entry.type_attr = bf.into_bits();
        self
    }

    #[inline]
    pub const fn gate_type(self, gate_type: GateType) -> Self {
        match gate_type {
            GateType::InterruptGate => self.gate_interrupt(),
            GateType::TrapGate => self.gate_trap(),
        }
    }

    #[inline]
    pub const fn selector(self, sel: u16) -> Self {
        self.entry.selector = sel;
        self
    }
}

/// An IDT with a kernel-only gate for every exception and IRQ and the
/// user-callable system call gate.
pub fn build() -> Idt {
    let mut idt = Idt::new();
    for &(vector, stub) in entry::STUBS {
        if vector == SYSCALL_VECTOR {
            continue;
        }
        let gate = if vector == BREAKPOINT_VECTOR {
            GateType::TrapGate
        } else {
            GateType::InterruptGate
        };
        idt[usize::from(vector)]
            .set_handler(stub)
            .selector(KERNEL_CODE_SELECTOR)
            .present(true)
            .gate_type(gate);
    }
    idt.init_syscall_gate(entry::SYSCALL_STUB);
    idt
}

const EXCEPTIONS: [&str; 32] = [
    "Division error",
    "Debug",
    "Non-maskable interrupt",
    "Breakpoint",
    "Overflow",
    "Bound range exceeded",
    "Invalid opcode",
    "Device not available",
    "Double fault",
    "Coprocessor segment overrun",
    "Invalid TSS",
    "Segment not present",
    "Stack-segment fault",
    "General protection fault",
    "Page fault",
    "Reserved",
    "x87 floating-point exception",
    "Alignment check",
    "Machine check",
    "SIMD floating-point exception",
    "Virtualization exception",
    "Control protection exception",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Hypervisor injection exception",
    "VMM communication exception",
    "Security exception",
    "Reserved",
];

const BREAKPOINT_VECTOR: u8 = 0x03;
const PAGE_FAULT_VECTOR: u32 = 0x0E;

/// Common Rust entry for every vector, called by the stubs with the saved
/// registers.
#[allow(clippy::cast_possible_truncation)]
extern "C" fn isr_dispatch(frame: &mut SyscallFrame) {
    match frame.int_no {
        PAGE_FAULT_VECTOR => page_fault::handle(frame),
        // A trap: the saved eip is already past the `int3`.
        v if v == u32::from(BREAKPOINT_VECTOR) => debug!("breakpoint at eip {:#010x}", frame.eip),
        v @ 0..32 => exception(frame, EXCEPTIONS[v as usize]),
        v @ 0x20..0x30 => irq((v - 0x20) as u8),
        v if v == u32::from(SYSCALL_VECTOR) => syscall::handle(frame),
        v => trace!("stray interrupt {v:#04x}"),
    }
}

/// A ring-3 fault ends the process; a ring-0 fault is fatal.
fn exception(frame: &SyscallFrame, name: &str) {
    if frame.cs & 3 == 3 {
        error!(
            "{name} in user mode at eip {:#010x} (error {:#x}), terminating process",
            frame.eip, frame.err_code
        );
        crate::tasks::exit(-1);
        return;
    }
    let flags = Eflags::from_bits(frame.eflags);
    panic!(
        "{name} (vector {}, error {:#x}) at eip {:#010x}, IF={} IOPL={}",
        frame.int_no,
        frame.err_code,
        frame.eip,
        flags.if_interrupt_enable(),
        flags.iopl()
    );
}

fn irq(line: u8) {
    if pic::is_spurious(line) {
        // The slave still expects an EOI on the master for its cascade line.
        if line == 15 {
            pic::eoi(2);
        }
        trace!("spurious IRQ {line}");
        return;
    }
    pic::eoi(line);
    if line == 0 {
        timer::on_tick();
    } else {
        trace!("IRQ {line}");
    }
}
