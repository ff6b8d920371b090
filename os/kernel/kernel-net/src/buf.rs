//! Packet buffers and the pool they come from.
//!
//! A [`NetBuf`] is one page-sized block with a movable window
//! `[start, end)`. Receive paths consume headers by moving `start` forward;
//! send paths build the payload first and then push each lower-layer header
//! into the headroom in front of it.
//!
//! Blocks are physical frames. [`NET_BUFS`] keeps the free ones on a list
//! linked through their first word; a dropped buffer goes back on that list,
//! never back to the frame allocator. When the list is empty the pool asks
//! its [`BlockSource`] for another frame.
//!
//! Ownership replaces reference counting: whoever holds the value (a
//! pending ARP resolution, the TCP resequencing queue, a device TX ring)
//! keeps it alive, and dropping it releases the block.

use crate::NetError;
use core::ptr::NonNull;
use kernel_memory_addresses::PAGE_SIZE;
use kernel_sync::SpinMutex;
use kernel_vmem::{FrameAlloc, PhysMapper};

pub const NET_BUF_SIZE: usize = PAGE_SIZE as usize;

/// Headroom reserved in front of a fresh buffer's payload.
pub const NET_BUF_START: usize = 256;

/// The storage behind one [`NetBuf`]: exactly one frame.
#[repr(C, align(4096))]
pub struct NetBlock([u8; NET_BUF_SIZE]);

const _: () = assert!(size_of::<NetBlock>() == PAGE_SIZE as usize);

/// Hands an empty pool a fresh block, or `None` when memory is gone.
pub type BlockSource = fn() -> Option<NonNull<NetBlock>>;

/// The pool [`NetBuf::alloc`] draws from.
#[cfg(not(test))]
pub static NET_BUFS: NetBufPool = NetBufPool::new();

#[cfg(test)]
pub static NET_BUFS: NetBufPool = NetBufPool::with_source(tests::heap_block);

/// Take one frame from `alloc` as a packet block.
#[must_use]
pub fn frame_block<A: FrameAlloc, M: PhysMapper>(alloc: &mut A, mapper: &M) -> Option<NonNull<NetBlock>> {
    let frame = alloc.alloc_4k()?;
    // SAFETY: a freshly allocated frame; nothing else refers to it.
    let block: &mut NetBlock = unsafe { mapper.phys_to_mut(frame) };
    Some(NonNull::from(block))
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct PoolStats {
    /// Blocks on the free list.
    pub free: usize,
    /// Blocks held by live buffers.
    pub in_use: usize,
}

/// Free list of packet blocks.
pub struct NetBufPool {
    state: SpinMutex<PoolState>,
}

struct PoolState {
    /// Linked through each block's first word.
    free: Option<NonNull<NetBlock>>,
    stats: PoolStats,
    source: Option<BlockSource>,
}

// Safety: blocks on the list belong to the pool and are reached only under its lock.
unsafe impl Send for PoolState {}

impl PoolState {
    fn push(&mut self, block: NonNull<NetBlock>) {
        // SAFETY: the block is free and page aligned; its first word is the link.
        unsafe { block.cast::<Option<NonNull<NetBlock>>>().write(self.free) };
        self.free = Some(block);
        self.stats.free += 1;
    }

    fn pop(&mut self) -> Option<NonNull<NetBlock>> {
        let block = self.free?;
        // SAFETY: written by `push` while the block sat on the list.
        self.free = unsafe { block.cast::<Option<NonNull<NetBlock>>>().read() };
        self.stats.free -= 1;
        Some(block)
    }
}

impl Default for NetBufPool {
    fn default() -> Self {
        Self::new()
    }
}

impl NetBufPool {
    /// An empty pool without a source; it only hands out what [`grow`](Self::grow) adds.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: SpinMutex::new(PoolState {
                free: None,
                stats: PoolStats { free: 0, in_use: 0 },
                source: None,
            }),
        }
    }

    #[must_use]
    pub const fn with_source(source: BlockSource) -> Self {
        Self {
            state: SpinMutex::new(PoolState {
                free: None,
                stats: PoolStats { free: 0, in_use: 0 },
                source: Some(source),
            }),
        }
    }

    pub fn set_source(&self, source: BlockSource) {
        self.state.lock_irq().source = Some(source);
    }

    /// Put up to `count` frames from `alloc` on the free list. Returns how
    /// many it got.
    pub fn grow<A: FrameAlloc, M: PhysMapper>(&self, alloc: &mut A, mapper: &M, count: usize) -> usize {
        let mut added = 0;
        while added < count {
            let Some(block) = frame_block(alloc, mapper) else {
                break;
            };
            self.state.lock_irq().push(block);
            added += 1;
        }
        added
    }

    /// A buffer with an empty payload after [`NET_BUF_START`] bytes of headroom.
    ///
    /// # Errors
    /// [`NetError::NoBuffers`] if the list is empty and the source (if any)
    /// has nothing left.
    pub fn alloc(&'static self) -> Result<NetBuf, NetError> {
        let block = {
            let mut state = self.state.lock_irq();
            let block = match state.pop() {
                Some(block) => block,
                None => state.source.and_then(|source| source()).ok_or(NetError::NoBuffers)?,
            };
            state.stats.in_use += 1;
            block
        };
        Ok(NetBuf {
            block,
            pool: self,
            start: NET_BUF_START,
            end: NET_BUF_START,
            seq: 0,
            fin: false,
        })
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.state.lock_irq().stats
    }

    fn release(&self, block: NonNull<NetBlock>) {
        let mut state = self.state.lock_irq();
        state.stats.in_use -= 1;
        state.push(block);
    }
}

pub struct NetBuf {
    block: NonNull<NetBlock>,
    pool: &'static NetBufPool,
    start: usize,
    end: usize,
    /// Sequence number of the first payload byte while queued for TCP
    /// resequencing.
    pub(crate) seq: u32,
    /// The segment carried FIN.
    pub(crate) fin: bool,
}

// Safety: the block is owned by this buffer alone until it is dropped.
unsafe impl Send for NetBuf {}

impl NetBuf {
    /// A fresh buffer from [`NET_BUFS`].
    ///
    /// # Errors
    /// [`NetError::NoBuffers`] when the pool is exhausted.
    pub fn alloc() -> Result<Self, NetError> {
        NET_BUFS.alloc()
    }

    /// A buffer holding a received frame, with the usual headroom in front.
    ///
    /// # Errors
    /// [`NetError::BufferFull`] if the frame is larger than the buffer, or
    /// [`NetError::NoBuffers`].
    pub fn from_frame(frame: &[u8]) -> Result<Self, NetError> {
        let mut buf = Self::alloc()?;
        buf.append(frame)?;
        Ok(buf)
    }

    fn data(&self) -> &[u8; NET_BUF_SIZE] {
        // SAFETY: the block is ours until drop.
        unsafe { &self.block.as_ref().0 }
    }

    fn data_mut(&mut self) -> &mut [u8; NET_BUF_SIZE] {
        // SAFETY: as above, and `&mut self` makes the access unique.
        unsafe { &mut self.block.as_mut().0 }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.end - self.start
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end == self.start
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.data()[self.start..self.end]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let (start, end) = (self.start, self.end);
        &mut self.data_mut()[start..end]
    }

    /// Bytes that can still be appended.
    #[must_use]
    pub const fn tailroom(&self) -> usize {
        NET_BUF_SIZE - self.end
    }

    /// Copy `bytes` after the current payload.
    ///
    /// # Errors
    /// [`NetError::BufferFull`] if they do not fit.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), NetError> {
        self.append_zeroed(bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    /// Grow the payload by `len` zero bytes and return them.
    ///
    /// # Errors
    /// [`NetError::BufferFull`] if they do not fit.
    pub fn append_zeroed(&mut self, len: usize) -> Result<&mut [u8], NetError> {
        if len > self.tailroom() {
            return Err(NetError::BufferFull);
        }
        let at = self.end;
        self.end += len;
        let end = self.end;
        let tail = &mut self.data_mut()[at..end];
        tail.fill(0);
        Ok(tail)
    }

    /// Prepend a zeroed header of `len` bytes and return it.
    ///
    /// # Errors
    /// [`NetError::BufferFull`] if the headroom is exhausted.
    pub fn push_header(&mut self, len: usize) -> Result<&mut [u8], NetError> {
        if len > self.start {
            return Err(NetError::BufferFull);
        }
        self.start -= len;
        let start = self.start;
        let head = &mut self.data_mut()[start..start + len];
        head.fill(0);
        Ok(head)
    }

    /// Consume `len` bytes from the front. Returns `false` (and consumes
    /// nothing) if the payload is shorter than that.
    pub fn pull(&mut self, len: usize) -> bool {
        if len > self.len() {
            return false;
        }
        self.start += len;
        true
    }

    /// Shorten the payload to at most `len` bytes.
    pub fn truncate(&mut self, len: usize) {
        if len < self.len() {
            self.end = self.start + len;
        }
    }

    /// Drop `len` bytes from the end.
    pub(crate) fn trim_end(&mut self, len: usize) {
        self.end -= len.min(self.len());
    }
}

impl Drop for NetBuf {
    fn drop(&mut self) {
        self.pool.release(self.block);
    }
}

impl core::fmt::Debug for NetBuf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NetBuf")
            .field("len", &self.len())
            .field("seq", &self.seq)
            .field("fin", &self.fin)
            .finish_non_exhaustive()
    }
}
