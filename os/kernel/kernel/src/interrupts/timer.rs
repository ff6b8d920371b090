use crate::{pit, tasks};

/// Timer ticks a process may run before it is preempted.
pub const QUANTUM_TICKS: u32 = 10;

/// IRQ 0, after the EOI: count the tick and rotate the ready queue at the
/// end of each quantum.
pub(super) fn on_tick() {
    let ticks = pit::tick();
    if ticks % QUANTUM_TICKS == 0 {
        tasks::preempt();
    }
}
