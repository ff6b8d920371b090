use bitfield_struct::bitfield;
use kernel_registers::LoadRegisterUnsafe;
use kernel_registers::cr2::Cr2;
use kernel_syscall::SyscallFrame;
use log::error;

/// Page-fault error code (Intel SDM Vol. 3A, §6.15 "Page-Fault Exception").
#[bitfield(u32)]
pub struct PageFaultError {
    /// 0 = non-present page, 1 = protection violation.
    pub present: bool, // bit 0

    /// 0 = read, 1 = write.
    pub write: bool, // bit 1

    /// 0 = supervisor, 1 = user mode (CPL 3).
    pub user: bool, // bit 2

    /// A reserved bit was set in a paging structure.
    pub reserved_bit: bool, // bit 3

    /// Instruction fetch.
    pub instruction_fetch: bool, // bit 4

    #[bits(27)]
    __: u32,
}

impl PageFaultError {
    pub const fn explain(&self) -> &'static str {
        if !self.present() {
            "Non-present page"
        } else if self.reserved_bit() {
            "Reserved bit set in a paging structure"
        } else if self.user() && !self.write() {
            "User-mode read of a supervisor page"
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }
}

/// Faults from ring 3 end the process; faults in the kernel are fatal.
pub(super) fn handle(frame: &SyscallFrame) {
    // SAFETY: CR2 still holds the faulting address; interrupts are masked.
    let Cr2(addr) = unsafe { Cr2::load_unsafe() };
    let err = PageFaultError::from_bits(frame.err_code);

    if err.user() {
        error!(
            "Page fault in user mode at {addr} (eip {:#010x}): {}, terminating process",
            frame.eip,
            err.explain()
        );
        crate::tasks::exit(-1);
        return;
    }
    panic!(
        "Page fault at {addr}: {} (error {:#x}, eip {:#010x})",
        err.explain(),
        err.into_bits(),
        frame.eip
    );
}
