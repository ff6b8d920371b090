//! The relax hook is process-global, so it gets its own test binary.

use kernel_sync::{SpinLock, relax, set_relax_hook};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

static YIELDS: AtomicUsize = AtomicUsize::new(0);

fn count_and_yield() {
    YIELDS.fetch_add(1, Ordering::SeqCst);
    thread::yield_now();
}

#[test]
fn contended_lock_relaxes_through_the_hook() {
    assert!(set_relax_hook(count_and_yield));
    assert!(!set_relax_hook(count_and_yield), "hook is set once");

    relax();
    assert_eq!(YIELDS.load(Ordering::SeqCst), 1);

    let lock = Arc::new(SpinLock::new(0u32));
    let held = Arc::new(Barrier::new(2));
    let guard = lock.lock();

    let waiter = {
        let lock = Arc::clone(&lock);
        let held = Arc::clone(&held);
        thread::spawn(move || {
            held.wait();
            *lock.lock() += 1;
        })
    };

    held.wait();
    while YIELDS.load(Ordering::SeqCst) < 3 {
        thread::yield_now();
    }
    drop(guard);
    waiter.join().unwrap();

    assert_eq!(*lock.lock(), 1);
    assert!(!lock.is_locked());
}
