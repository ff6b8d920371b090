//! The `int 0x80` gate and the kernel side of the system calls.

use crate::interrupts::{GateType, Idt};
use crate::tasks;
use kernel_info::memory::KERNEL_CODE_SELECTOR;
use kernel_syscall::{SYSCALL_VECTOR, SyscallFrame, SyscallHandler, dispatch};

pub trait SyscallInterrupt {
    fn init_syscall_gate(&mut self, handler: extern "C" fn()) -> &mut Self;
}

impl SyscallInterrupt for Idt {
    fn init_syscall_gate(&mut self, handler: extern "C" fn()) -> &mut Self {
        self[usize::from(SYSCALL_VECTOR)]
            .set_handler(handler)
            .selector(KERNEL_CODE_SELECTOR)
            .present(true)
            .dpl(3)
            .gate_type(GateType::InterruptGate);
        self
    }
}

struct KernelServices;

impl SyscallHandler for KernelServices {
    fn exit(&mut self, code: i32) {
        tasks::exit(code);
    }

    fn print(&mut self, text: &[u8]) {
        kernel_qemu::console::write_bytes(text);
    }

    fn yield_now(&mut self) {
        tasks::yield_now();
    }
}

/// Run the system call in `frame`.
///
/// The frame's address is recorded in the current process for the
/// duration of the call so `clone` can find the user state to copy.
#[allow(clippy::cast_possible_truncation)]
pub(super) fn handle(frame: &mut SyscallFrame) {
    let addr = core::ptr::from_mut(frame) as usize as u32;
    tasks::set_syscall_frame(addr);
    // SAFETY: the caller's address space is active, so user pointers in
    // the arguments resolve the way the caller sees them.
    unsafe { dispatch(frame, &mut KernelServices) };
    tasks::set_syscall_frame(0);
}
