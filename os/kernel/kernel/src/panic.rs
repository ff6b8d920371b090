//! The kernel panic handler.

use crate::tasks;
use core::panic::PanicInfo;
use kernel_info::memory::IDENTITY_MAP_END;
use kernel_proc::panic::{PanicGuard, PanicStage, walk_frames};
use kernel_qemu::kprintln;
use kernel_sync::irq::cli_stop_interrupts;

static PANIC_GUARD: PanicGuard = PanicGuard::new();

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    cli_stop_interrupts();
    match PANIC_GUARD.enter() {
        PanicStage::First => {
            kprintln!();
            kprintln!("==================== KERNEL PANIC ====================");
            kprintln!("{}", info.message());
            if let Some(location) = info.location() {
                kprintln!("  at {location}");
            }
            backtrace();
        }
        PanicStage::Nested => kprintln!("Panic has caused another panic"),
        PanicStage::Silent => {}
    }
    halt()
}

fn backtrace() {
    let ebp: u32;
    // SAFETY: reads the frame pointer register only.
    unsafe { core::arch::asm!("mov {}, ebp", out(reg) ebp, options(nomem, nostack, preserves_flags)) };

    kprintln!("Stack trace:");
    let symbols = tasks::symbols();
    for eip in walk_frames(ebp, read_stack) {
        match symbols.and_then(|t| t.lookup(eip)) {
            Some(sym) => kprintln!("  {eip:#010x}  {}+{:#x}", sym.name, eip - sym.start),
            None => kprintln!("  {eip:#010x}  ??"),
        }
    }
}

/// Read a stack word, refusing anything outside identity-mapped memory.
fn read_stack(addr: u32) -> Option<u32> {
    if !(0x1000..=IDENTITY_MAP_END - 4).contains(&addr) || addr % 4 != 0 {
        return None;
    }
    // SAFETY: identity mapped in every directory and 4-byte aligned.
    Some(unsafe { (addr as *const u32).read_volatile() })
}

fn halt() -> ! {
    loop {
        // SAFETY: interrupts are off, so this halts for good.
        unsafe { core::arch::asm!("cli", "hlt", options(nomem, nostack)) };
    }
}
