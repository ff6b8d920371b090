//! A busy-waiting lock for state shared with interrupt handlers.
//!
//! The frame allocator is one: the heap grows from it in process context
//! while the scheduler frees kernel stacks with interrupts off. With one
//! CPU a held [`SpinMutex`] can only be seen by code that interrupted the
//! holder, and spinning there never ends. [`SpinMutex::lock_irq`] closes
//! that window by disabling interrupts before taking the lock, so in the
//! kernel it never actually spins.

use crate::{IrqGuard, RawSpin};
use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};

pub struct SpinMutex<T> {
    word: RawSpin,
    value: UnsafeCell<T>,
}

// Safety: the lock word serializes every access to `value`.
unsafe impl<T: Send> Sync for SpinMutex<T> {}
unsafe impl<T: Send> Send for SpinMutex<T> {}

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            word: RawSpin::new(),
            value: UnsafeCell::new(value),
        }
    }

    #[inline]
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        self.word.acquire(spin_loop);
        SpinMutexGuard { mutex: self }
    }

    #[inline]
    #[must_use]
    pub fn try_lock(&self) -> Option<SpinMutexGuard<'_, T>> {
        self.word.try_acquire().then(|| SpinMutexGuard { mutex: self })
    }

    /// Disable interrupts, then lock. Both are undone when the guard drops,
    /// the lock first.
    #[inline]
    pub fn lock_irq(&self) -> IrqMutex<'_, T> {
        let irq = IrqGuard::new();
        IrqMutex {
            guard: self.lock(),
            _irq: irq,
        }
    }

    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

pub struct SpinMutexGuard<'a, T> {
    mutex: &'a SpinMutex<T>,
}

impl<T> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard owns the lock word.
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T> DerefMut for SpinMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard owns the lock word.
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T> Drop for SpinMutexGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: this guard acquired the word.
        unsafe { self.mutex.word.release() }
    }
}

/// A [`SpinMutexGuard`] taken with interrupts disabled.
///
/// ```no_run
/// use kernel_sync::SpinMutex;
///
/// static FREE_FRAMES: SpinMutex<u32> = SpinMutex::new(0);
///
/// *FREE_FRAMES.lock_irq() += 1;
/// ```
pub struct IrqMutex<'a, T> {
    // Field order: the lock is released before interrupts come back.
    guard: SpinMutexGuard<'a, T>,
    _irq: IrqGuard,
}

impl<T> Deref for IrqMutex<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqMutex<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irq::interrupts_enabled;

    #[test]
    fn lock_irq_restores_interrupts_after_unlock() {
        crate::irq::sti_enable_interrupts();
        let m = SpinMutex::new(5u32);
        {
            let mut g = m.lock_irq();
            *g += 1;
            assert!(!interrupts_enabled());
            assert!(m.try_lock().is_none());
        }
        assert!(interrupts_enabled());
        assert_eq!(*m.lock(), 6);
    }
}
