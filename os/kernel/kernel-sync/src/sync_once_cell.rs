use crate::relax;
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU8, Ordering};

const EMPTY: u8 = 0;
const WRITING: u8 = 1;
const READY: u8 = 2;

/// A value written once and then shared, like the mounted initrd or the
/// logger.
///
/// A reader that finds another initializer mid-write [`relax`]es until the
/// value is published; on the single CPU that initializer is a preempted
/// process and has to run again to finish.
pub struct SyncOnceCell<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

// Safety: the value is written once before READY and only read after it.
unsafe impl<T: Sync + Send> Sync for SyncOnceCell<T> {}
unsafe impl<T: Send> Send for SyncOnceCell<T> {}

impl<T> Default for SyncOnceCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SyncOnceCell<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    #[inline]
    pub fn get(&self) -> Option<&T> {
        (self.state.load(Ordering::Acquire) == READY).then(|| {
            // SAFETY: READY is stored only after the write.
            unsafe { (*self.value.get()).assume_init_ref() }
        })
    }

    /// Store `value` if the cell is still empty; otherwise hand it back.
    ///
    /// # Errors
    /// The cell already holds a value, or another caller is writing one.
    pub fn set(&self, value: T) -> Result<(), T> {
        if self.claim() {
            self.publish(value);
            Ok(())
        } else {
            Err(value)
        }
    }

    /// The value, initializing it with `init` if the cell is empty.
    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> &T {
        if let Some(value) = self.get() {
            return value;
        }
        if self.claim() {
            self.publish(init());
        }
        loop {
            if let Some(value) = self.get() {
                return value;
            }
            relax();
        }
    }

    fn claim(&self) -> bool {
        self.state
            .compare_exchange(EMPTY, WRITING, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn publish(&self, value: T) {
        // SAFETY: `claim` made this the only writer; no reader looks before READY.
        unsafe { (*self.value.get()).write(value) };
        self.state.store(READY, Ordering::Release);
    }
}

impl<T> Drop for SyncOnceCell<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == READY {
            // SAFETY: READY means initialized, and `&mut self` means unshared.
            unsafe { self.value.get_mut().assume_init_drop() };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn first_writer_wins() {
        let cell = SyncOnceCell::new();
        assert!(cell.get().is_none());
        assert_eq!(*cell.get_or_init(|| "initrd"), "initrd");
        assert_eq!(cell.set("other"), Err("other"));
        assert_eq!(*cell.get_or_init(|| unreachable!()), "initrd");
    }

    #[test]
    fn drops_the_stored_value() {
        let witness = Rc::new(());
        let cell = SyncOnceCell::new();
        assert!(cell.set(Rc::clone(&witness)).is_ok());
        assert_eq!(Rc::strong_count(&witness), 2);
        drop(cell);
        assert_eq!(Rc::strong_count(&witness), 1);

        let empty: SyncOnceCell<Rc<()>> = SyncOnceCell::new();
        drop(empty);
    }
}
