//! Interrupt entry stubs.
//!
//! The CPU pushes `eflags`, `cs` and `eip` (plus `useresp`/`ss` when it
//! comes from ring 3) and, for some exceptions, an error code. Each stub
//! evens this out by pushing a dummy error code where the CPU did not,
//! pushes its vector number and jumps to [`isr_common`], which completes
//! the [`SyscallFrame`](kernel_syscall::SyscallFrame):
//!
//! ```text
//!  higher addresses
//!  ss, useresp          (ring 3 only)
//!  eflags, cs, eip      (CPU)
//!  err_code             (CPU or stub)
//!  int_no               (stub)
//!  eax ecx edx ebx esp ebp esi edi   (pushad)
//!  ds es fs gs          ◄── esp handed to isr_dispatch
//! ```

use super::isr_dispatch;
use core::arch::naked_asm;
use kernel_info::memory::KERNEL_DATA_SELECTOR;

macro_rules! stub {
    ($name:ident, $vector:literal) => {
        #[unsafe(naked)]
        extern "C" fn $name() {
            naked_asm!(
                "push 0",
                "push {vector}",
                "jmp {common}",
                vector = const $vector,
                common = sym isr_common,
            );
        }
    };
    ($name:ident, $vector:literal, error) => {
        #[unsafe(naked)]
        extern "C" fn $name() {
            naked_asm!(
                "push {vector}",
                "jmp {common}",
                vector = const $vector,
                common = sym isr_common,
            );
        }
    };
}

macro_rules! stubs {
    ($($vector:literal => $name:ident $(($err:ident))?),* $(,)?) => {
        $(stub!($name, $vector $(, $err)?);)*

        /// Every installed vector and its stub.
        pub(super) const STUBS: &[(u8, extern "C" fn())] = &[$(($vector, $name)),*];
    };
}

stubs! {
    0x00 => isr_0x00,
    0x01 => isr_0x01,
    0x02 => isr_0x02,
    0x03 => isr_0x03,
    0x04 => isr_0x04,
    0x05 => isr_0x05,
    0x06 => isr_0x06,
    0x07 => isr_0x07,
    0x08 => isr_0x08 (error),
    0x09 => isr_0x09,
    0x0A => isr_0x0a (error),
    0x0B => isr_0x0b (error),
    0x0C => isr_0x0c (error),
    0x0D => isr_0x0d (error),
    0x0E => isr_0x0e (error),
    0x0F => isr_0x0f,
    0x10 => isr_0x10,
    0x11 => isr_0x11 (error),
    0x12 => isr_0x12,
    0x13 => isr_0x13,
    0x14 => isr_0x14,
    0x15 => isr_0x15 (error),
    0x16 => isr_0x16,
    0x17 => isr_0x17,
    0x18 => isr_0x18,
    0x19 => isr_0x19,
    0x1A => isr_0x1a,
    0x1B => isr_0x1b,
    0x1C => isr_0x1c,
    0x1D => isr_0x1d (error),
    0x1E => isr_0x1e (error),
    0x1F => isr_0x1f,
    0x20 => irq_0x00,
    0x21 => irq_0x01,
    0x22 => irq_0x02,
    0x23 => irq_0x03,
    0x24 => irq_0x04,
    0x25 => irq_0x05,
    0x26 => irq_0x06,
    0x27 => irq_0x07,
    0x28 => irq_0x08,
    0x29 => irq_0x09,
    0x2A => irq_0x0a,
    0x2B => irq_0x0b,
    0x2C => irq_0x0c,
    0x2D => irq_0x0d,
    0x2E => irq_0x0e,
    0x2F => irq_0x0f,
    0x80 => isr_0x80,
}

/// The `int 0x80` stub, installed with DPL 3.
pub(super) const SYSCALL_STUB: extern "C" fn() = isr_0x80;

/// Save the remaining registers, switch to kernel data segments and call
/// [`isr_dispatch`] with a pointer to the frame. On return everything is
/// restored in reverse and the vector and error code are dropped before
/// `iretd`.
#[unsafe(naked)]
extern "C" fn isr_common() {
    naked_asm!(
        "pushad",
        "push ds",
        "push es",
        "push fs",
        "push gs",
        "mov ax, {data}",
        "mov ds, ax",
        "mov es, ax",
        "mov fs, ax",
        "mov gs, ax",
        "cld",
        "push esp",
        "call {dispatch}",
        "add esp, 4",
        "pop gs",
        "pop fs",
        "pop es",
        "pop ds",
        "popad",
        "add esp, 8",
        "iretd",
        data = const KERNEL_DATA_SELECTOR,
        dispatch = sym isr_dispatch,
    );
}
