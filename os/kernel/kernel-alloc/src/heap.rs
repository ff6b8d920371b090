//! # Segment-list kernel heap
//!
//! The heap is a doubly linked list of segments laid out back to back from
//! the heap start. Each segment begins with a [`SegmentHeader`] followed by
//! `length` payload bytes, so the segments tile the mapped heap exactly:
//!
//! ```text
//! start                                                        end
//! ┌──────┬────────────┬──────┬─────────┬──────┬─────────────────┐
//! │ hdr  │  used (48) │ hdr  │ free(16)│ hdr  │   free (rest)   │
//! └──────┴────────────┴──────┴─────────┴──────┴─────────────────┘
//! ```
//!
//! Allocation is first fit. A segment larger than the request is split when
//! both halves keep at least [`MIN_SEGMENT`] payload bytes. Freeing merges
//! with free neighbours on both sides, so two free segments are never
//! adjacent. When no segment fits, the heap grows by whole pages at its end
//! and the new space merges into a free tail segment.

use core::ptr;
use kernel_memory_addresses::PAGE_SIZE;
use log::{debug, warn};
use thiserror::Error;

/// Payload alignment and size granularity.
pub const ALIGN: usize = 16;

/// A split never leaves a segment with less payload than this.
pub const MIN_SEGMENT: usize = 16;

const PAGE: usize = PAGE_SIZE as usize;

#[repr(C, align(16))]
struct SegmentHeader {
    length: usize,
    next: *mut SegmentHeader,
    last: *mut SegmentHeader,
    free: bool,
}

/// Bytes of bookkeeping in front of every payload.
pub const HEADER_SIZE: usize = size_of::<SegmentHeader>();

/// Provides the pages the heap lives in.
pub trait HeapBacking {
    /// Back the page at `va` with a fresh frame. Returns `false` when memory
    /// is exhausted.
    fn map_page(&mut self, va: usize) -> bool;

    /// Make the page at `va` accessible (or not) from ring 3.
    fn set_user(&mut self, va: usize, user: bool);
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum HeapError {
    #[error("heap is already initialized")]
    AlreadyInitialized,
    #[error("cannot map initial heap page at {0:#x}")]
    OutOfMemory(usize),
    #[error("initial heap does not fit below {0:#x}")]
    TooLarge(usize),
}

/// One entry of [`SegmentHeap::segments`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SegmentInfo {
    /// Address of the payload.
    pub addr: usize,
    pub length: usize,
    pub free: bool,
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct HeapStats {
    pub total: usize,
    pub free: usize,
    pub used: usize,
    pub overhead: usize,
    pub segments: usize,
}

pub struct SegmentHeap<B> {
    start: usize,
    end: usize,
    limit: usize,
    first: *mut SegmentHeader,
    last: *mut SegmentHeader,
    backing: B,
}

// Safety: the heap owns its segment list; raw pointers never escape except
// as payload addresses.
unsafe impl<B: Send> Send for SegmentHeap<B> {}

impl<B: HeapBacking> SegmentHeap<B> {
    /// A heap that will occupy `[start, limit)` once initialized.
    ///
    /// # Safety
    /// The range must be reserved for this heap alone and `start` must be
    /// page aligned. Pages reported mapped by `backing` must be writable.
    pub const unsafe fn new(start: usize, limit: usize, backing: B) -> Self {
        Self {
            start,
            end: start,
            limit,
            first: ptr::null_mut(),
            last: ptr::null_mut(),
            backing,
        }
    }

    /// Map `pages` pages and make them one free segment.
    ///
    /// # Errors
    /// Fails when called twice, when the pages exceed the heap range or when
    /// a page cannot be mapped.
    pub fn init(&mut self, pages: usize) -> Result<(), HeapError> {
        if !self.first.is_null() {
            return Err(HeapError::AlreadyInitialized);
        }
        let bytes = pages.max(1) * PAGE;
        if self.start + bytes > self.limit {
            return Err(HeapError::TooLarge(self.limit));
        }
        for va in (self.start..self.start + bytes).step_by(PAGE) {
            if !self.backing.map_page(va) {
                return Err(HeapError::OutOfMemory(va));
            }
        }

        let first = self.start as *mut SegmentHeader;
        unsafe {
            first.write(SegmentHeader {
                length: bytes - HEADER_SIZE,
                next: ptr::null_mut(),
                last: ptr::null_mut(),
                free: true,
            });
        }
        self.first = first;
        self.last = first;
        self.end = self.start + bytes;
        debug!("heap at {:#x}, {} pages", self.start, bytes / PAGE);
        Ok(())
    }

    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        !self.first.is_null()
    }

    /// First address past the mapped heap.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.end
    }

    pub const fn backing_mut(&mut self) -> &mut B {
        &mut self.backing
    }

    /// Allocate `size` bytes, 16-byte aligned. Returns null for `size == 0`
    /// and when the heap cannot grow.
    pub fn malloc(&mut self, size: usize) -> *mut u8 {
        if size == 0 || self.first.is_null() {
            return ptr::null_mut();
        }
        let Some(size) = size.checked_next_multiple_of(ALIGN) else {
            return ptr::null_mut();
        };

        for attempt in 0..2 {
            let mut seg = self.first;
            while !seg.is_null() {
                let (free, length, next) = unsafe { ((*seg).free, (*seg).length, (*seg).next) };
                if free && length >= size {
                    if length > size {
                        self.split(seg, size);
                    }
                    unsafe { (*seg).free = false };
                    return unsafe { seg.cast::<u8>().add(HEADER_SIZE) };
                }
                seg = next;
            }

            if attempt == 0 && !self.expand(size + HEADER_SIZE) {
                break;
            }
        }

        warn!("heap exhausted allocating {size} bytes");
        ptr::null_mut()
    }

    /// Release an allocation. Null is ignored, as are pointers that are not
    /// live allocations of this heap.
    pub fn free(&mut self, addr: *mut u8) {
        let Some(seg) = self.header_of(addr) else {
            if !addr.is_null() {
                warn!("free of foreign pointer {addr:p}");
            }
            return;
        };
        let header = unsafe { &mut *seg };
        if header.free {
            warn!("double free of {addr:p}");
            return;
        }
        header.free = true;
        self.combine_forward(seg);
        self.combine_backward(seg);
    }

    /// Set the user flag on every page the allocation at `addr` touches,
    /// including its header.
    pub fn map_user_segment(&mut self, addr: *mut u8) {
        self.set_segment_user(addr, true);
    }

    /// Undo [`map_user_segment`](Self::map_user_segment).
    pub fn map_kernel_segment(&mut self, addr: *mut u8) {
        self.set_segment_user(addr, false);
    }

    fn set_segment_user(&mut self, addr: *mut u8, user: bool) {
        let Some(seg) = self.header_of(addr) else {
            return;
        };
        let first = seg as usize & !(PAGE - 1);
        let end = seg as usize + HEADER_SIZE + unsafe { (*seg).length };
        for va in (first..end).step_by(PAGE) {
            self.backing.set_user(va, user);
        }
    }

    /// Payload length of the live allocation at `addr`.
    #[must_use]
    pub fn allocation_size(&self, addr: *mut u8) -> Option<usize> {
        let seg = self.header_of(addr)?;
        let header = unsafe { &*seg };
        (!header.free).then_some(header.length)
    }

    pub fn segments(&self) -> impl Iterator<Item = SegmentInfo> + '_ {
        let mut seg = self.first;
        core::iter::from_fn(move || {
            if seg.is_null() {
                return None;
            }
            let header = unsafe { &*seg };
            let info = SegmentInfo {
                addr: seg as usize + HEADER_SIZE,
                length: header.length,
                free: header.free,
            };
            seg = header.next;
            Some(info)
        })
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            total: self.end - self.start,
            ..HeapStats::default()
        };
        for seg in self.segments() {
            stats.segments += 1;
            stats.overhead += HEADER_SIZE;
            if seg.free {
                stats.free += seg.length;
            } else {
                stats.used += seg.length;
            }
        }
        stats
    }

    /// Find the header for a payload pointer, accepting only pointers that
    /// start a segment of this heap.
    fn header_of(&self, addr: *mut u8) -> Option<*mut SegmentHeader> {
        let addr = addr as usize;
        if addr < self.start + HEADER_SIZE || addr >= self.end {
            return None;
        }
        let target = (addr - HEADER_SIZE) as *mut SegmentHeader;
        let mut seg = self.first;
        while !seg.is_null() {
            if seg == target {
                return Some(seg);
            }
            seg = unsafe { (*seg).next };
        }
        None
    }

    /// Shrink `seg` to `length` and turn the rest into a new segment with the
    /// same free flag. Skipped when either side would fall below
    /// [`MIN_SEGMENT`].
    fn split(&mut self, seg: *mut SegmentHeader, length: usize) {
        let header = unsafe { &mut *seg };
        if length < MIN_SEGMENT {
            return;
        }
        let Some(remainder) = header.length.checked_sub(length + HEADER_SIZE) else {
            return;
        };
        if remainder < MIN_SEGMENT {
            return;
        }

        let new = (seg as usize + HEADER_SIZE + length) as *mut SegmentHeader;
        unsafe {
            new.write(SegmentHeader {
                length: remainder,
                next: header.next,
                last: seg,
                free: header.free,
            });
            if let Some(next) = header.next.as_mut() {
                next.last = new;
            }
        }
        header.next = new;
        header.length = length;
        if self.last == seg {
            self.last = new;
        }
    }

    /// Grow the heap by enough whole pages for `bytes` and append the space
    /// as a free segment. Returns `false` if the heap could not grow at all.
    fn expand(&mut self, bytes: usize) -> bool {
        let pages = bytes.div_ceil(PAGE);
        let wanted = pages * PAGE;
        if self.end + wanted > self.limit {
            warn!("heap limit {:#x} reached", self.limit);
            return false;
        }

        let base = self.end;
        let mut mapped = 0;
        while mapped < wanted && self.backing.map_page(base + mapped) {
            mapped += PAGE;
        }
        if mapped == 0 {
            return false;
        }

        let new = base as *mut SegmentHeader;
        unsafe {
            new.write(SegmentHeader {
                length: mapped - HEADER_SIZE,
                next: ptr::null_mut(),
                last: self.last,
                free: true,
            });
            (*self.last).next = new;
        }
        self.last = new;
        self.end = base + mapped;
        debug!("heap grown by {} pages to {:#x}", mapped / PAGE, self.end);

        self.combine_backward(new);
        mapped == wanted
    }

    /// Absorb the following segment into `seg` if it is free.
    fn combine_forward(&mut self, seg: *mut SegmentHeader) {
        let header = unsafe { &mut *seg };
        let Some(next) = (unsafe { header.next.as_mut() }) else {
            return;
        };
        if !next.free {
            return;
        }
        let absorbed = header.next;
        header.length += next.length + HEADER_SIZE;
        header.next = next.next;
        if let Some(after) = unsafe { header.next.as_mut() } {
            after.last = seg;
        }
        if self.last == absorbed {
            self.last = seg;
        }
    }

    /// Let a free predecessor absorb `seg`.
    fn combine_backward(&mut self, seg: *mut SegmentHeader) {
        let last = unsafe { (*seg).last };
        if !last.is_null() && unsafe { (*last).free } {
            self.combine_forward(last);
        }
    }
}
