//! The shared kernel heap: a [`SegmentHeap`] behind a [`SpinLock`], entered
//! with interrupts off and the kernel page directory active.

use crate::heap::{ALIGN, HeapBacking, HeapError, HeapStats, SegmentHeap};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr;
use kernel_memory_addresses::PhysicalAddress;
use kernel_sync::{IrqGuard, SpinLock};

/// Reads and replaces the active page directory.
pub trait AddressSpaceSwitch {
    /// Physical address of the active page directory.
    fn current(&self) -> PhysicalAddress;

    /// Physical address of the kernel's own page directory.
    fn kernel(&self) -> PhysicalAddress;

    /// Make `directory` the active page directory.
    fn activate(&self, directory: PhysicalAddress);
}

/// Runs with the kernel page directory active and restores the previous one
/// on drop.
///
/// Heap metadata and the page tables it edits are only guaranteed to be
/// mapped in the kernel directory.
pub struct KernelSpaceGuard<'a, S: AddressSpaceSwitch> {
    switch: &'a S,
    previous: Option<PhysicalAddress>,
}

impl<'a, S: AddressSpaceSwitch> KernelSpaceGuard<'a, S> {
    #[must_use]
    pub fn enter(switch: &'a S) -> Self {
        let current = switch.current();
        let kernel = switch.kernel();
        let previous = if current == kernel || kernel.is_null() {
            None
        } else {
            switch.activate(kernel);
            Some(current)
        };
        Self { switch, previous }
    }

    /// Whether dropping the guard switches back.
    #[must_use]
    pub const fn switched(&self) -> bool {
        self.previous.is_some()
    }
}

impl<S: AddressSpaceSwitch> Drop for KernelSpaceGuard<'_, S> {
    fn drop(&mut self) {
        if let Some(previous) = self.previous {
            self.switch.activate(previous);
        }
    }
}

pub struct LockedHeap<B, S> {
    heap: SpinLock<SegmentHeap<B>>,
    switch: S,
}

impl<B: HeapBacking + Send, S: AddressSpaceSwitch> LockedHeap<B, S> {
    /// # Safety
    /// See [`SegmentHeap::new`].
    pub const unsafe fn new(start: usize, limit: usize, backing: B, switch: S) -> Self {
        Self {
            heap: SpinLock::new(unsafe { SegmentHeap::new(start, limit, backing) }),
            switch,
        }
    }

    /// Map the initial heap pages.
    ///
    /// # Errors
    /// See [`SegmentHeap::init`].
    pub fn init(&self, pages: usize) -> Result<(), HeapError> {
        self.with_heap(|heap| heap.init(pages))
    }

    fn with_heap<R>(&self, f: impl FnOnce(&mut SegmentHeap<B>) -> R) -> R {
        let _irq = IrqGuard::new();
        let mut heap = self.heap.lock();
        let _space = KernelSpaceGuard::enter(&self.switch);
        f(&mut heap)
    }

    pub fn malloc(&self, size: usize) -> *mut u8 {
        self.with_heap(|heap| heap.malloc(size))
    }

    pub fn free(&self, addr: *mut u8) {
        self.with_heap(|heap| heap.free(addr));
    }

    pub fn map_user_segment(&self, addr: *mut u8) {
        self.with_heap(|heap| heap.map_user_segment(addr));
    }

    pub fn map_kernel_segment(&self, addr: *mut u8) {
        self.with_heap(|heap| heap.map_kernel_segment(addr));
    }

    pub fn stats(&self) -> HeapStats {
        self.with_heap(|heap| heap.stats())
    }

    pub fn is_initialized(&self) -> bool {
        self.with_heap(|heap| heap.is_initialized())
    }
}

unsafe impl<B: HeapBacking + Send, S: AddressSpaceSwitch + Sync> GlobalAlloc for LockedHeap<B, S> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGN {
            return ptr::null_mut();
        }
        self.malloc(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.free(ptr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::tests::BufferBacking;
    use core::cell::Cell;

    struct FakeCr3 {
        active: Cell<u32>,
        switches: Cell<u32>,
    }

    impl FakeCr3 {
        const KERNEL: u32 = 0x0010_0000;

        fn new(active: u32) -> Self {
            Self {
                active: Cell::new(active),
                switches: Cell::new(0),
            }
        }
    }

    impl AddressSpaceSwitch for FakeCr3 {
        fn current(&self) -> PhysicalAddress {
            PhysicalAddress::new(self.active.get())
        }

        fn kernel(&self) -> PhysicalAddress {
            PhysicalAddress::new(Self::KERNEL)
        }

        fn activate(&self, directory: PhysicalAddress) {
            self.switches.set(self.switches.get() + 1);
            self.active.set(directory.as_u32());
        }
    }

    #[test]
    fn guard_switches_to_kernel_and_back() {
        let cr3 = FakeCr3::new(0x0040_0000);
        {
            let guard = KernelSpaceGuard::enter(&cr3);
            assert!(guard.switched());
            assert_eq!(cr3.active.get(), FakeCr3::KERNEL);
        }
        assert_eq!(cr3.active.get(), 0x0040_0000);
        assert_eq!(cr3.switches.get(), 2);
    }

    #[test]
    fn guard_is_free_inside_kernel_space() {
        let cr3 = FakeCr3::new(FakeCr3::KERNEL);
        let guard = KernelSpaceGuard::enter(&cr3);
        assert!(!guard.switched());
        drop(guard);
        assert_eq!(cr3.switches.get(), 0);
    }

    /// A switch that is `Sync` so the heap can act as a `GlobalAlloc`.
    struct NoSwitch;

    impl AddressSpaceSwitch for NoSwitch {
        fn current(&self) -> PhysicalAddress {
            PhysicalAddress::zero()
        }

        fn kernel(&self) -> PhysicalAddress {
            PhysicalAddress::zero()
        }

        fn activate(&self, _directory: PhysicalAddress) {
            unreachable!("no switch without a kernel directory");
        }
    }

    #[test]
    fn global_alloc_honours_alignment_limit() {
        let backing = BufferBacking::new(4);
        let (start, limit) = (backing.start(), backing.limit());
        let heap = unsafe { LockedHeap::new(start, limit, backing, NoSwitch) };
        heap.init(1).unwrap();

        unsafe {
            let p = heap.alloc(Layout::from_size_align(40, 8).unwrap());
            assert!(!p.is_null());
            assert_eq!(p as usize % ALIGN, 0);
            assert!(heap.alloc(Layout::from_size_align(64, 64).unwrap()).is_null());
            heap.dealloc(p, Layout::from_size_align(40, 8).unwrap());
        }
        let stats = heap.stats();
        assert_eq!(stats.segments, 1);
        assert_eq!(stats.used, 0);
    }

    #[test]
    fn heap_calls_run_in_kernel_space() {
        let backing = BufferBacking::new(4);
        let (start, limit) = (backing.start(), backing.limit());
        let heap = unsafe { LockedHeap::new(start, limit, backing, FakeCr3::new(0x0070_0000)) };
        heap.init(1).unwrap();
        let p = heap.malloc(10);
        heap.free(p);
        assert_eq!(heap.switch.active.get(), 0x0070_0000);
        assert_eq!(heap.switch.switches.get(), 6);
    }
}
