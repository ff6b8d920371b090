use core::sync::atomic::{AtomicBool, Ordering};

/// The lock word under [`SpinLock`](crate::SpinLock) and
/// [`SpinMutex`](crate::SpinMutex).
///
/// Test-and-test-and-set: a waiter only retries the exchange once a plain
/// load sees the word free. What it does in between is the caller's choice.
pub struct RawSpin(AtomicBool);

impl Default for RawSpin {
    fn default() -> Self {
        Self::new()
    }
}

impl RawSpin {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    #[inline]
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Take the word, calling `wait` for as long as it reads held.
    #[inline]
    pub fn acquire(&self, wait: impl Fn()) {
        while !self.try_acquire() {
            while self.is_held() {
                wait();
            }
        }
    }

    /// # Safety
    /// The caller must be the one that acquired the word.
    #[inline]
    pub unsafe fn release(&self) {
        self.0.store(false, Ordering::Release);
    }

    #[inline]
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
