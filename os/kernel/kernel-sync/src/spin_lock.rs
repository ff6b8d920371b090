use crate::{RawSpin, relax};
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

/// A lock whose waiters [`relax`] between attempts.
///
/// On the single CPU a waiter gets the lock only after the holder has run
/// again. Once the kernel points the relax hook at the scheduler's yield, a
/// contended `lock()` hands the CPU over until the holder is done, which is
/// what the kernel heap relies on.
pub struct SpinLock<T> {
    word: RawSpin,
    inner: UnsafeCell<T>,
}

// Safety: the lock word serializes every access to `inner`.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(inner: T) -> Self {
        Self {
            word: RawSpin::new(),
            inner: UnsafeCell::new(inner),
        }
    }

    #[inline]
    #[must_use]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        // Lazily: a guard built on failure would release the holder's lock.
        self.word.try_acquire().then(|| SpinLockGuard { lock: self })
    }

    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.word.acquire(relax);
        SpinLockGuard { lock: self }
    }

    #[inline]
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.lock())
    }

    /// Held by some guard right now. Only a hint; it may change at once.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.word.is_held()
    }

    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard owns the lock word.
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard owns the lock word.
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: this guard acquired the word.
        unsafe { self.lock.word.release() }
    }
}
