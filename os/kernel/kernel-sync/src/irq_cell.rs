use crate::IrqGuard;
use core::cell::UnsafeCell;

/// State that is only touched with interrupts disabled on the one CPU.
///
/// Unlike a [`SpinLock`](crate::SpinLock), no lock is held: a borrow may stay
/// open across a context switch (the scheduler switches stacks from inside
/// [`with`](Self::with)) and the next process opens its own. What keeps the
/// borrows apart is that only one stack executes at a time and a timer tick
/// cannot interrupt the closure.
///
/// ```
/// use kernel_sync::IrqCell;
///
/// static COUNTER: IrqCell<u32> = IrqCell::new(0);
///
/// COUNTER.with(|n| *n += 2);
/// assert_eq!(COUNTER.with(|n| *n), 2);
/// ```
pub struct IrqCell<T> {
    value: UnsafeCell<T>,
}

// Safety: access is serialized by disabling interrupts on a single CPU.
unsafe impl<T: Send> Sync for IrqCell<T> {}

impl<T> IrqCell<T> {
    pub const fn new(value: T) -> Self {
        Self {
            value: UnsafeCell::new(value),
        }
    }

    /// Run `f` on the value with interrupts disabled.
    ///
    /// `f` must not call `with` on the same cell again on this stack.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let _irq = IrqGuard::new();
        // SAFETY: interrupts are off and nested calls on this stack are ruled
        // out by contract; other stacks only run after a switch away from here.
        f(unsafe { &mut *self.value.get() })
    }

    pub const fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn borrows_are_sequential() {
        let mut cell = IrqCell::new(Vec::<u8>::new());
        cell.with(|v| v.push(1));
        let len = cell.with(|v| {
            v.push(2);
            v.len()
        });
        assert_eq!(len, 2);
        assert_eq!(cell.get_mut().as_slice(), [1, 2]);
    }
}
