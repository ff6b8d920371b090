//! # Context switching on the CPU
//!
//! [`Cpu`] implements [`ContextSwitch`] for the scheduler. A saved
//! [`Context`] is a `setjmp`-style resume point:
//!
//! | Offset | Field | Saved value                                 |
//! |:-------|:------|:--------------------------------------------|
//! | 0      | `esp` | the stack pointer after `save_context` returns |
//! | 4      | `ebp` | frame pointer of [`Cpu::checkpoint`]         |
//! | 8      | `eip` | return address into it                      |
//! | 12..24 | `ebx`, `esi`, `edi` | callee-saved registers        |
//!
//! `save_context` returns 0; jumping back through `switch_to` makes it
//! return 1 a second time, on whichever stack the context points at.

use crate::tss;
use core::arch::naked_asm;
use kernel_info::memory::{USER_CODE_SELECTOR, USER_DATA_SELECTOR, USER_EFLAGS};
use kernel_proc::{Context, ContextSwitch, Snapshot, Thread, UserEntry};

const _: () = assert!(size_of::<Context>() == 24);

/// Store the caller's resume point into `ctx`; returns 0, and 1 when resumed.
#[unsafe(naked)]
extern "C" fn save_context(ctx: *mut Context) -> u32 {
    naked_asm!(
        "mov eax, [esp + 4]",
        // esp as the caller sees it after `ret`
        "lea ecx, [esp + 4]",
        "mov [eax], ecx",
        "mov [eax + 4], ebp",
        "mov ecx, [esp]",
        "mov [eax + 8], ecx",
        "mov [eax + 12], ebx",
        "mov [eax + 16], esi",
        "mov [eax + 20], edi",
        "xor eax, eax",
        "ret",
    );
}

/// Load `dir` into CR3 (when it differs) and continue at `ctx`.
#[unsafe(naked)]
extern "C" fn switch_to(ctx: *const Context, dir: u32) -> ! {
    naked_asm!(
        "mov eax, [esp + 4]",
        "mov edx, [esp + 8]",
        "mov ecx, cr3",
        "cmp ecx, edx",
        "je 2f",
        "mov cr3, edx",
        "2:",
        "mov ebx, [eax + 12]",
        "mov esi, [eax + 16]",
        "mov edi, [eax + 20]",
        "mov ebp, [eax + 4]",
        "mov ecx, [eax + 8]",
        "mov esp, [eax]",
        "mov eax, 1",
        "jmp ecx",
    );
}

/// The CPU as seen by the scheduler.
pub struct Cpu;

impl ContextSwitch for Cpu {
    /// The resume point lies in this function's frame (or its caller's, if
    /// inlined). Either way the frame is live while `taken` runs, so a stack
    /// copied or abandoned there still holds it.
    #[inline(never)]
    fn checkpoint<R>(&mut self, taken: impl FnOnce(&mut Self, Context) -> R) -> Snapshot<R> {
        let mut ctx = Context::default();
        if save_context(&raw mut ctx) == 0 {
            Snapshot::Taken(taken(self, ctx))
        } else {
            Snapshot::Resumed
        }
    }

    fn resume(&mut self, thread: &Thread) {
        switch_to(&raw const thread.context, thread.directory.as_u32());
    }

    fn set_kernel_stack(&mut self, top: u32) {
        tss::set_kernel_stack(top);
    }

    fn enter_userspace(&mut self, entry: &UserEntry) {
        // SAFETY: the image and its stack are mapped user-accessible in the
        // active directory and TSS.esp0 points at this process's kernel
        // stack.
        unsafe {
            core::arch::asm!(
                "mov ds, {sel:x}",
                "mov es, {sel:x}",
                "mov fs, {sel:x}",
                "mov gs, {sel:x}",
                "push {ss}",
                "push {stack}",
                "push {eflags}",
                "push {cs}",
                "push {entry}",
                "iretd",
                sel = in(reg) u32::from(USER_DATA_SELECTOR),
                ss = const USER_DATA_SELECTOR,
                stack = in(reg) entry.stack,
                eflags = const USER_EFLAGS,
                cs = const USER_CODE_SELECTOR,
                entry = in(reg) entry.entry,
                options(noreturn)
            );
        }
    }
}
