//! # The global Interrupt Descriptor Table
//!
//! `lidt` only records where the table lives; the CPU reads gates from
//! memory on every interrupt. The table therefore sits in static storage
//! and is loaded once, after the GDT and TSS (the CPU takes `ss0:esp0`
//! from the TSS when a gate is entered from ring 3) and before `sti`.
//!
//! ```text
//! gdt::init ─► idt::init_idt_once(interrupts::build()) ─► pic::remap ─► sti
//! ```

use crate::interrupts::Idt;
use core::mem::MaybeUninit;

static mut IDT: MaybeUninit<Idt> = MaybeUninit::uninit();

/// Move `idt` into the global slot and load it into **IDTR**.
///
/// # Safety
/// Call once, at CPL 0, with interrupts disabled. Every present gate must
/// point at a valid handler.
pub unsafe fn init_idt_once(idt: Idt) {
    #[allow(static_mut_refs)]
    unsafe {
        IDT.write(idt);
        IDT.assume_init_ref().load();
    }
    log::debug!("IDT loaded");
}
