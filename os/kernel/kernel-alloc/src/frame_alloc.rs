//! # Physical Frame Allocator
//!
//! One bit per 4 KiB frame, most significant bit first within each byte
//! (`mask = 0x80 >> (index % 8)`), covering physical memory up to the highest
//! available address the firmware reported.
//!
//! A second bitmap of the same size marks *reserved* frames: low memory,
//! firmware regions and holes. Reserved frames read as used, are never handed
//! out, and ignore `free_page`. Every byte is therefore in exactly one bucket:
//!
//! ```text
//! free_memory() + used_memory() + reserved_memory() == total_memory()
//! ```
//!
//! `page_index` is the scan cursor: every frame below it is in use, so
//! `request_page` resumes there instead of rescanning from zero.

use core::ops::Range;
use kernel_info::boot::MemoryMapEntry;
use kernel_info::memory::{LOW_MEMORY_END, PHYS_MEMORY_LIMIT};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, align_up};
use kernel_vmem::{FrameAlloc, PhysMapper};
use log::{debug, info, warn};
use thiserror::Error;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum FrameAllocError {
    #[error("memory map has no usable region")]
    NoUsableMemory,
    #[error("largest free region ({0} bytes) cannot hold the frame bitmap")]
    BitmapTooLarge(u64),
}

const PAGE: u64 = PAGE_SIZE as u64;

pub struct PageFrameAllocator<'a> {
    used: &'a mut [u8],
    reserved: &'a mut [u8],
    pages: u32,
    page_index: u32,
    free_memory: u64,
    used_memory: u64,
    reserved_memory: u64,
}

/// Clamp a memory map entry to the part this allocator manages.
fn usable(entry: &MemoryMapEntry) -> Option<Range<u64>> {
    let start = entry.addr.max(LOW_MEMORY_END);
    let end = entry.end().min(PHYS_MEMORY_LIMIT);
    (entry.is_available() && start < end).then_some(start..end)
}

/// `region` minus `hole`, as up to two pieces.
fn subtract(region: Range<u64>, hole: &Range<u64>) -> [Option<Range<u64>>; 2] {
    if hole.end <= region.start || hole.start >= region.end {
        return [Some(region), None];
    }
    let left = (region.start < hole.start).then(|| region.start..hole.start);
    let right = (hole.end < region.end).then(|| hole.end..region.end);
    [left, right]
}

impl<'a> PageFrameAllocator<'a> {
    /// Build the allocator from the firmware memory map.
    ///
    /// The bitmaps are placed at the start of the largest available region
    /// that does not overlap the kernel image or the initial ramdisk. Kernel,
    /// initrd and bitmap frames are then locked; everything below 1 MiB,
    /// every non-available region and every hole in the map is reserved.
    ///
    /// # Errors
    /// Fails when no available region exists or none can hold the bitmaps.
    ///
    /// # Safety
    /// `mapper` must make the chosen bitmap region writable, and nothing else
    /// may use that memory for `'a`.
    pub unsafe fn read_memory_map<M, I>(
        map: I,
        kernel: Range<u32>,
        initrd: Range<u32>,
        mapper: &M,
    ) -> Result<Self, FrameAllocError>
    where
        M: PhysMapper,
        I: Iterator<Item = MemoryMapEntry> + Clone,
    {
        let kernel = u64::from(kernel.start)..u64::from(kernel.end);
        let initrd = u64::from(initrd.start)..u64::from(initrd.end);

        let top = map
            .clone()
            .filter_map(|e| usable(&e))
            .map(|r| r.end)
            .max()
            .ok_or(FrameAllocError::NoUsableMemory)?;
        let pages = u32::try_from(top / PAGE).unwrap_or(u32::MAX);
        let bitmap_len = (pages as usize).div_ceil(8);

        let largest = map
            .clone()
            .filter_map(|e| usable(&e))
            .flat_map(|r| subtract(r, &kernel))
            .flatten()
            .flat_map(|r| subtract(r, &initrd))
            .flatten()
            .map(|r| align_up(r.start as u32, PAGE_SIZE) as u64..r.end)
            .filter(|r| r.start < r.end)
            .max_by_key(|r| r.end - r.start)
            .ok_or(FrameAllocError::NoUsableMemory)?;

        if ((largest.end - largest.start) as usize) < 2 * bitmap_len {
            return Err(FrameAllocError::BitmapTooLarge(largest.end - largest.start));
        }

        let base = PhysicalAddress::new(largest.start as u32);
        let bytes = unsafe {
            let ptr = mapper.phys_to_mut::<u8>(base) as *mut u8;
            core::slice::from_raw_parts_mut(ptr, 2 * bitmap_len)
        };
        let (used, reserved) = bytes.split_at_mut(bitmap_len);

        // Start with everything reserved, then release what the map offers.
        used.fill(0xFF);
        reserved.fill(0xFF);
        let mut pfa = Self {
            used,
            reserved,
            pages,
            page_index: 0,
            free_memory: 0,
            used_memory: 0,
            reserved_memory: u64::from(pages) * PAGE,
        };

        for range in map.clone().filter_map(|e| usable(&e)) {
            let first = align_up(range.start as u32, PAGE_SIZE) / PAGE_SIZE;
            let last = (range.end / PAGE) as u32;
            for index in first..last {
                pfa.release(index);
            }
        }
        for entry in map.filter(|e| !e.is_available()) {
            let first = (entry.addr / PAGE).min(u64::from(pages)) as u32;
            let last = entry.end().div_ceil(PAGE).min(u64::from(pages)) as u32;
            for index in first..last {
                pfa.reserve(index);
            }
        }

        pfa.lock_range(&kernel);
        pfa.lock_range(&initrd);
        pfa.lock_pages(base, (2 * bitmap_len as u32).div_ceil(PAGE_SIZE));
        pfa.page_index = 0;

        info!(
            "frame allocator: {} KiB free, {} KiB used, {} KiB reserved, bitmap at {}",
            pfa.free_memory / 1024,
            pfa.used_memory / 1024,
            pfa.reserved_memory / 1024,
            base
        );
        Ok(pfa)
    }

    fn lock_range(&mut self, range: &Range<u64>) {
        if range.start >= range.end {
            return;
        }
        let first = (range.start / PAGE) as u32;
        let last = range.end.div_ceil(PAGE) as u32;
        self.lock_pages(PhysicalAddress::from_frame_number(first), last - first);
    }

    #[inline]
    const fn mask(index: u32) -> (usize, u8) {
        ((index / 8) as usize, 0x80 >> (index % 8))
    }

    #[inline]
    fn get(bits: &[u8], index: u32) -> bool {
        let (byte, mask) = Self::mask(index);
        bits.get(byte).is_some_and(|b| b & mask != 0)
    }

    #[inline]
    fn set(bits: &mut [u8], index: u32, value: bool) {
        let (byte, mask) = Self::mask(index);
        if let Some(b) = bits.get_mut(byte) {
            if value {
                *b |= mask;
            } else {
                *b &= !mask;
            }
        }
    }

    /// Turn a reserved frame into a free one (bring-up only).
    fn release(&mut self, index: u32) {
        if index >= self.pages || !Self::get(self.reserved, index) {
            return;
        }
        Self::set(self.reserved, index, false);
        Self::set(self.used, index, false);
        self.reserved_memory -= PAGE;
        self.free_memory += PAGE;
    }

    fn reserve(&mut self, index: u32) {
        if index >= self.pages || Self::get(self.reserved, index) {
            return;
        }
        if Self::get(self.used, index) {
            self.used_memory -= PAGE;
        } else {
            self.free_memory -= PAGE;
        }
        Self::set(self.reserved, index, true);
        Self::set(self.used, index, true);
        self.reserved_memory += PAGE;
        if self.page_index > index {
            self.page_index = index;
        }
    }

    /// Mark a frame used. Locking a used or reserved frame is a no-op.
    pub fn lock_page(&mut self, page: PhysicalAddress) {
        let index = page.frame_number();
        if index >= self.pages || Self::get(self.used, index) {
            return;
        }
        Self::set(self.used, index, true);
        self.free_memory -= PAGE;
        self.used_memory += PAGE;
    }

    /// Mark a frame free. Freeing a free or reserved frame is a no-op.
    pub fn free_page(&mut self, page: PhysicalAddress) {
        let index = page.frame_number();
        if index >= self.pages
            || !Self::get(self.used, index)
            || Self::get(self.reserved, index)
        {
            return;
        }
        Self::set(self.used, index, false);
        self.free_memory += PAGE;
        self.used_memory -= PAGE;
        if index < self.page_index {
            self.page_index = index;
        }
    }

    pub fn lock_pages(&mut self, first: PhysicalAddress, count: u32) {
        for i in 0..count {
            self.lock_page(first + i * PAGE_SIZE);
        }
    }

    pub fn free_pages(&mut self, first: PhysicalAddress, count: u32) {
        for i in 0..count {
            self.free_page(first + i * PAGE_SIZE);
        }
    }

    /// Hand out the lowest free frame at or after the cursor.
    ///
    /// Returns `None` (and logs) when memory is exhausted; there is no swap.
    pub fn request_page(&mut self) -> Option<PhysicalAddress> {
        while self.page_index < self.pages {
            let index = self.page_index;
            if !Self::get(self.used, index) {
                let page = PhysicalAddress::from_frame_number(index);
                self.lock_page(page);
                return Some(page);
            }
            self.page_index += 1;
        }
        warn!("out of physical memory");
        None
    }

    /// Find `count` contiguous free frames, lock them and return the first.
    ///
    /// Probes windows of `count` frames from the cursor upwards; a window
    /// that hits a used frame resumes right after that frame.
    pub fn request_pages(&mut self, count: u32) -> Option<PhysicalAddress> {
        if count <= 1 {
            return if count == 1 { self.request_page() } else { None };
        }

        let mut start = self.page_index;
        while start.checked_add(count)? <= self.pages {
            match (start..start + count).rfind(|&i| Self::get(self.used, i)) {
                Some(blocker) => start = blocker + 1,
                None => {
                    let first = PhysicalAddress::from_frame_number(start);
                    self.lock_pages(first, count);
                    debug!("allocated {count} contiguous frames at {first}");
                    return Some(first);
                }
            }
        }
        warn!("no run of {count} free frames");
        None
    }

    #[must_use]
    pub fn is_used(&self, page: PhysicalAddress) -> bool {
        Self::get(self.used, page.frame_number())
    }

    #[must_use]
    pub const fn free_memory(&self) -> u64 {
        self.free_memory
    }

    #[must_use]
    pub const fn used_memory(&self) -> u64 {
        self.used_memory
    }

    #[must_use]
    pub const fn reserved_memory(&self) -> u64 {
        self.reserved_memory
    }

    /// Bytes covered by the bitmap.
    #[must_use]
    pub const fn total_memory(&self) -> u64 {
        self.pages as u64 * PAGE
    }
}

impl FrameAlloc for PageFrameAllocator<'_> {
    fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
        self.request_page()
    }

    fn alloc_contiguous(&mut self, count: u32) -> Option<PhysicalAddress> {
        self.request_pages(count)
    }

    fn free_4k(&mut self, frame: PhysicalAddress) {
        self.free_page(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::boot::MemoryKind;
    use kernel_vmem::sim::SimPhys;

    const MIB: u64 = 1024 * 1024;

    fn entry(addr: u64, len: u64, kind: MemoryKind) -> MemoryMapEntry {
        MemoryMapEntry { addr, len, kind }
    }

    /// 4 MiB of RAM: low memory, a firmware hole at 3 MiB, and a region above 4 GiB.
    fn map() -> Vec<MemoryMapEntry> {
        vec![
            entry(0, 0x9_FC00, MemoryKind::Available),
            entry(0xF_0000, 0x1_0000, MemoryKind::Reserved),
            entry(MIB, 2 * MIB, MemoryKind::Available),
            entry(3 * MIB, 0x2000, MemoryKind::Reserved),
            entry(3 * MIB + 0x2000, MIB - 0x2000, MemoryKind::Available),
            entry(0x1_0000_0000, MIB, MemoryKind::Available),
        ]
    }

    fn build(phys: &SimPhys) -> PageFrameAllocator<'_> {
        let kernel = 0x10_0000..0x12_3456;
        let initrd = 0x13_0000..0x13_8000;
        unsafe { PageFrameAllocator::read_memory_map(map().into_iter(), kernel, initrd, phys) }
            .unwrap()
    }

    fn assert_accounting(pfa: &PageFrameAllocator<'_>) {
        assert_eq!(
            pfa.free_memory() + pfa.used_memory() + pfa.reserved_memory(),
            pfa.total_memory()
        );
    }

    #[test]
    fn bring_up_locks_kernel_initrd_and_bitmap() {
        let phys = SimPhys::with_frames(1024);
        let pfa = build(&phys);

        assert_eq!(pfa.total_memory(), 4 * MIB);
        assert_accounting(&pfa);

        // Low memory and the firmware hole are reserved, not used.
        assert_eq!(pfa.reserved_memory(), MIB + 0x2000);
        assert!(pfa.is_used(PhysicalAddress::new(0x12_3000)));
        assert!(pfa.is_used(PhysicalAddress::new(0x13_7000)));
        assert!(!pfa.is_used(PhysicalAddress::new(0x12_4000)));

        // Kernel (0x24 pages), initrd (8 pages), one bitmap page.
        assert_eq!(pfa.used_memory(), (0x24 + 8 + 1) * PAGE);
    }

    #[test]
    fn request_never_returns_a_used_page() {
        let phys = SimPhys::with_frames(1024);
        let mut pfa = build(&phys);

        let mut seen = std::collections::HashSet::new();
        while let Some(page) = pfa.request_page() {
            assert!(page.as_u32() as u64 >= MIB);
            assert!(seen.insert(page), "{page} handed out twice");
            assert_accounting(&pfa);
        }
        assert_eq!(pfa.free_memory(), 0);
        assert!(!seen.contains(&PhysicalAddress::new(3 * 0x10_0000)));
    }

    #[test]
    fn double_lock_and_double_free_are_noops() {
        let phys = SimPhys::with_frames(1024);
        let mut pfa = build(&phys);
        let page = pfa.request_page().unwrap();
        let used = pfa.used_memory();

        pfa.lock_page(page);
        assert_eq!(pfa.used_memory(), used);

        pfa.free_page(page);
        pfa.free_page(page);
        assert_eq!(pfa.used_memory(), used - PAGE);
        assert_accounting(&pfa);

        // Reserved frames stay reserved.
        pfa.free_page(PhysicalAddress::new(0x1000));
        pfa.free_page(PhysicalAddress::new(0x30_0000));
        assert_eq!(pfa.reserved_memory(), MIB + 0x2000);
        assert_accounting(&pfa);
    }

    #[test]
    fn freed_page_below_cursor_is_reused() {
        let phys = SimPhys::with_frames(1024);
        let mut pfa = build(&phys);
        let a = pfa.request_page().unwrap();
        let b = pfa.request_page().unwrap();
        assert!(b > a);
        pfa.free_page(a);
        assert_eq!(pfa.request_page(), Some(a));
    }

    #[test]
    fn contiguous_runs_skip_used_frames_and_the_hole() {
        let phys = SimPhys::with_frames(1024);
        let mut pfa = build(&phys);

        let run = pfa.request_pages(3).unwrap();
        for i in 0..3 {
            assert!(pfa.is_used(run + i * PAGE_SIZE));
        }

        // Leave a one-frame gap that is too small for the next request.
        let lone = pfa.request_page().unwrap();
        let next = pfa.request_page().unwrap();
        pfa.free_page(lone);
        let second = pfa.request_pages(2).unwrap();
        assert!(second > next);
        assert_accounting(&pfa);

        // Nothing spans the reserved 3 MiB hole.
        let big = pfa.request_pages(200).unwrap();
        let end = big.as_u32() + 200 * PAGE_SIZE;
        assert!(end <= 3 * 0x10_0000 || big.as_u32() >= 3 * 0x10_0000 + 0x2000);
        assert_eq!(pfa.request_pages(0), None);
        assert_eq!(pfa.request_pages(2000), None);
    }

    #[test]
    fn empty_map_is_an_error() {
        let phys = SimPhys::with_frames(4);
        let r = unsafe {
            PageFrameAllocator::read_memory_map(
                [entry(0, 0x9_F000, MemoryKind::Available)].into_iter(),
                0..0,
                0..0,
                &phys,
            )
        };
        assert_eq!(r.err(), Some(FrameAllocError::NoUsableMemory));
    }
}
