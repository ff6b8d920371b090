//! Simulated physical memory for host-side tests.
//!
//! Physical address `pa` is byte `pa` of one contiguous, 4 KiB-aligned
//! buffer, so structures spanning several frames (a [`PageDirectory`]) work
//! exactly as on hardware. Frame 0 is never handed out, keeping `0` usable
//! as a null address.
//!
//! [`PageDirectory`]: crate::PageDirectory

use crate::{FrameAlloc, PhysMapper};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};

#[repr(C, align(4096))]
#[derive(Clone)]
struct Aligned4K([u8; 4096]);

/// A run of zeroed, 4 KiB-aligned frames standing in for RAM.
pub struct SimPhys {
    base: *mut Aligned4K,
    frames: usize,
}

impl SimPhys {
    #[must_use]
    pub fn with_frames(frames: usize) -> Self {
        let buf = vec![Aligned4K([0; 4096]); frames].into_boxed_slice();
        Self {
            base: Box::into_raw(buf).cast::<Aligned4K>(),
            frames,
        }
    }

    #[must_use]
    pub const fn frame_count(&self) -> usize {
        self.frames
    }

    #[must_use]
    pub const fn len(&self) -> u32 {
        (self.frames * 4096) as u32
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.frames == 0
    }

    fn byte_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        assert!(pa.as_u32() < self.len(), "{pa} outside simulated RAM");
        unsafe { self.base.cast::<u8>().add(pa.as_usize()) }
    }

    /// Copy `bytes` to physical memory at `pa`.
    pub fn write(&self, pa: PhysicalAddress, bytes: &[u8]) {
        assert!(pa.as_usize() + bytes.len() <= self.len() as usize);
        unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.byte_ptr(pa), bytes.len()) };
    }

    /// Copy the 4 KiB frame containing `pa`, starting at `pa`'s offset.
    #[must_use]
    pub fn read(&self, pa: PhysicalAddress) -> Vec<u8> {
        let len = (PAGE_SIZE - pa.page_offset()) as usize;
        let mut out = vec![0; len];
        unsafe { core::ptr::copy_nonoverlapping(self.byte_ptr(pa), out.as_mut_ptr(), len) };
        out
    }
}

impl Drop for SimPhys {
    fn drop(&mut self) {
        let slice = core::ptr::slice_from_raw_parts_mut(self.base, self.frames);
        drop(unsafe { Box::from_raw(slice) });
    }
}

impl PhysMapper for SimPhys {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        assert!(pa.as_usize() + size_of::<T>() <= self.len() as usize);
        unsafe { &mut *self.byte_ptr(pa).cast::<T>() }
    }
}

/// Bitmap frame allocator over a [`SimPhys`], with an optional cap to
/// provoke out-of-memory paths.
pub struct SimFrames {
    used: Vec<bool>,
    limit: usize,
}

impl SimFrames {
    #[must_use]
    pub fn new(phys: &SimPhys) -> Self {
        let mut used = vec![false; phys.frame_count()];
        used[0] = true;
        Self {
            used,
            limit: usize::MAX,
        }
    }

    /// Frames currently handed out (frame 0 excluded).
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.used.iter().filter(|u| **u).count() - 1
    }

    /// Refuse allocations once [`allocated`](Self::allocated) reaches `limit`.
    pub const fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    #[must_use]
    pub fn is_allocated(&self, frame: PhysicalAddress) -> bool {
        self.used
            .get(frame.frame_number() as usize)
            .copied()
            .unwrap_or(false)
    }
}

impl FrameAlloc for SimFrames {
    fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
        self.alloc_contiguous(1)
    }

    fn alloc_contiguous(&mut self, count: u32) -> Option<PhysicalAddress> {
        let count = count as usize;
        if self.allocated() + count > self.limit {
            return None;
        }
        let start = (1..=self.used.len().checked_sub(count)?)
            .find(|&i| self.used[i..i + count].iter().all(|u| !u))?;
        self.used[start..start + count].fill(true);
        Some(PhysicalAddress::from_frame_number(start as u32))
    }

    fn free_4k(&mut self, frame: PhysicalAddress) {
        if frame.is_null() {
            return;
        }
        if let Some(u) = self.used.get_mut(frame.frame_number() as usize) {
            *u = false;
        }
    }
}
