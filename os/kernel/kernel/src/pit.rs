//! # 8253/8254 Programmable Interval Timer
//!
//! Channel 0 drives IRQ 0 at [`TICK_HZ`]; every interrupt adds one to the
//! tick counter. At 1000 Hz a tick is one millisecond, which is the unit the
//! network stack's timers use.

use crate::ports::outb;
use core::sync::atomic::{AtomicU32, Ordering};

/// Input clock of the PIT in Hz.
pub const BASE_HZ: u32 = 1_193_180;

/// Timer interrupts per second.
pub const TICK_HZ: u32 = 1000;

const CHANNEL0: u16 = 0x40;
const MODE: u16 = 0x43;

/// Channel 0, lobyte/hibyte access, mode 3 (square wave), binary.
const MODE_SQUARE_WAVE: u8 = 0x36;

static TICKS: AtomicU32 = AtomicU32::new(0);

/// Program channel 0 to fire `hz` times per second.
///
/// # Safety
/// Reprograms the timer; call once during boot with interrupts disabled.
#[allow(clippy::cast_possible_truncation)]
pub unsafe fn set_phase(hz: u32) {
    let divisor = (BASE_HZ / hz.max(19)).min(0xFFFF);
    unsafe {
        outb(MODE, MODE_SQUARE_WAVE);
        outb(CHANNEL0, (divisor & 0xFF) as u8);
        outb(CHANNEL0, (divisor >> 8) as u8);
    }
    log::debug!("PIT running at {hz} Hz (divisor {divisor})");
}

/// Count one timer interrupt; returns the new tick count.
pub fn tick() -> u32 {
    TICKS.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
}

/// Ticks since [`set_phase`].
pub fn ticks() -> u32 {
    TICKS.load(Ordering::Relaxed)
}
