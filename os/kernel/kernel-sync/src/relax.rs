use crate::SyncOnceCell;
use core::hint::spin_loop;

static RELAX_HOOK: SyncOnceCell<fn()> = SyncOnceCell::new();

/// Install the function contended [`SpinLock`](crate::SpinLock)s call while
/// they wait. The kernel installs its cooperative yield here.
///
/// Only the first call has an effect; returns `false` if a hook was already set.
pub fn set_relax_hook(hook: fn()) -> bool {
    RELAX_HOOK.set(hook).is_ok()
}

/// Give up the CPU for a moment: runs the installed hook, or a spin-loop
/// hint before one is installed.
#[inline]
pub fn relax() {
    match RELAX_HOOK.get() {
        Some(hook) => hook(),
        None => spin_loop(),
    }
}
