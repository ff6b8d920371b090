//! The interrupt flag.
//!
//! On the kernel target these are the `cli`/`sti`/`pushfd` instructions.
//! Hosted builds model `EFLAGS.IF` with a flag so that code bracketing
//! critical sections stays testable.

/// EFLAGS.IF
const IF_FLAG: u32 = 1 << 9;

/// EFLAGS bit 1 always reads as set.
const EFLAGS_RESERVED: u32 = 1 << 1;

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod arch {
    #[inline]
    pub fn cli() {
        // SAFETY: ring 0 only; touches nothing but IF.
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    pub fn sti() {
        // SAFETY: ring 0 only; touches nothing but IF.
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    pub fn eflags() -> u32 {
        let r: u32;
        // SAFETY: balanced push/pop on the current stack.
        unsafe { core::arch::asm!("pushfd", "pop {}", out(reg) r, options(preserves_flags)) }
        r
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
mod arch {
    use super::{EFLAGS_RESERVED, IF_FLAG};

    /// Own unit tests run on parallel threads, each its own "CPU".
    #[cfg(test)]
    mod flag {
        use core::cell::Cell;

        std::thread_local! {
            static IF: Cell<bool> = const { Cell::new(true) };
        }

        pub fn set(on: bool) {
            IF.with(|f| f.set(on));
        }

        pub fn get() -> bool {
            IF.with(Cell::get)
        }
    }

    #[cfg(not(test))]
    mod flag {
        use core::sync::atomic::{AtomicBool, Ordering};

        static IF: AtomicBool = AtomicBool::new(true);

        pub fn set(on: bool) {
            IF.store(on, Ordering::SeqCst);
        }

        pub fn get() -> bool {
            IF.load(Ordering::SeqCst)
        }
    }

    pub fn cli() {
        flag::set(false);
    }

    pub fn sti() {
        flag::set(true);
    }

    pub fn eflags() -> u32 {
        if flag::get() {
            IF_FLAG | EFLAGS_RESERVED
        } else {
            EFLAGS_RESERVED
        }
    }
}

/// `cli`. Ring 0 only.
#[inline]
pub fn cli_stop_interrupts() {
    arch::cli();
}

/// `sti`. Ring 0 only.
#[inline]
pub fn sti_enable_interrupts() {
    arch::sti();
}

#[inline]
#[must_use]
pub fn eflags() -> u32 {
    arch::eflags()
}

#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    eflags() & IF_FLAG != 0
}

/// Interrupts stay off while this lives.
///
/// Only the outermost guard (the one that actually found `IF` set)
/// re-enables them, so guards nest.
pub struct IrqGuard {
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let were_enabled = interrupts_enabled();
        if were_enabled {
            cli_stop_interrupts();
        }
        Self { were_enabled }
    }

    /// Whether dropping this guard re-enables interrupts.
    #[inline]
    #[must_use]
    pub const fn restores(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            sti_enable_interrupts();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_outer_guard_restores() {
        sti_enable_interrupts();
        {
            let outer = IrqGuard::new();
            assert!(outer.restores());
            assert!(!interrupts_enabled());
            {
                let inner = IrqGuard::new();
                assert!(!inner.restores());
            }
            assert!(!interrupts_enabled());
        }
        assert!(interrupts_enabled());
    }

    #[test]
    fn guard_leaves_disabled_interrupts_disabled() {
        cli_stop_interrupts();
        drop(IrqGuard::new());
        assert!(!interrupts_enabled());
        assert_eq!(eflags(), EFLAGS_RESERVED);
        sti_enable_interrupts();
    }
}
