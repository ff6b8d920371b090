use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_vmem::{AddressSpace, FrameAlloc, PhysMapper, VmemError};

/// Byte access to another address space's memory by walking its tables.
///
/// Works whether or not the space is loaded in CR3.
pub struct UserMemory<'m, M: PhysMapper> {
    space: AddressSpace<'m, M>,
}

impl<'m, M: PhysMapper> UserMemory<'m, M> {
    #[must_use]
    pub const fn new(space: AddressSpace<'m, M>) -> Self {
        Self { space }
    }

    #[must_use]
    pub const fn space(&self) -> AddressSpace<'m, M> {
        self.space
    }

    /// Map a zeroed user frame at the page holding `va` unless one is there.
    ///
    /// # Errors
    /// [`VmemError::OutOfFrames`] when no frame (or table) can be allocated.
    pub fn ensure_page<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
    ) -> Result<PhysicalAddress, VmemError> {
        let page = VirtualAddress::new(va.as_u32() & !(PAGE_SIZE - 1));
        if let Some(pa) = self.space.get_phys_addr(page) {
            return Ok(pa);
        }
        let frame = alloc.alloc_4k().ok_or(VmemError::OutOfFrames)?;
        unsafe { self.frame(frame) }.fill(0);
        if let Err(e) = self.space.map_user_memory(alloc, page, frame) {
            alloc.free_4k(frame);
            return Err(e);
        }
        Ok(frame)
    }

    /// Map every page overlapping `[start, end)`.
    ///
    /// # Errors
    /// See [`ensure_page`](Self::ensure_page).
    pub fn ensure_range<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        start: u32,
        end: u32,
    ) -> Result<(), VmemError> {
        let mut page = start & !(PAGE_SIZE - 1);
        while page < end {
            self.ensure_page(alloc, VirtualAddress::new(page))?;
            page = match page.checked_add(PAGE_SIZE) {
                Some(next) => next,
                None => break,
            };
        }
        Ok(())
    }

    /// Copy `bytes` to `va`, crossing pages as needed.
    ///
    /// # Errors
    /// [`VmemError::NotMapped`] at the first unmapped page; earlier pages
    /// are already written.
    pub fn write(&self, va: u32, bytes: &[u8]) -> Result<(), VmemError> {
        self.for_each_chunk(va, bytes.len(), |frame, off, done, len| {
            frame[off..off + len].copy_from_slice(&bytes[done..done + len]);
        })
    }

    /// Set `len` bytes at `va` to `value`.
    ///
    /// # Errors
    /// As for [`write`](Self::write).
    pub fn fill(&self, va: u32, value: u8, len: usize) -> Result<(), VmemError> {
        self.for_each_chunk(va, len, |frame, off, _, n| frame[off..off + n].fill(value))
    }

    /// Copy from `va` into `out`.
    ///
    /// # Errors
    /// As for [`write`](Self::write).
    pub fn read(&self, va: u32, out: &mut [u8]) -> Result<(), VmemError> {
        self.for_each_chunk(va, out.len(), |frame, off, done, len| {
            out[done..done + len].copy_from_slice(&frame[off..off + len]);
        })
    }

    /// Store a little-endian word.
    ///
    /// # Errors
    /// As for [`write`](Self::write).
    pub fn write_u32(&self, va: u32, value: u32) -> Result<(), VmemError> {
        self.write(va, &value.to_le_bytes())
    }

    /// Load a little-endian word.
    ///
    /// # Errors
    /// As for [`write`](Self::write).
    pub fn read_u32(&self, va: u32) -> Result<u32, VmemError> {
        let mut b = [0; 4];
        self.read(va, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn for_each_chunk(
        &self,
        va: u32,
        len: usize,
        mut f: impl FnMut(&mut [u8; 4096], usize, usize, usize),
    ) -> Result<(), VmemError> {
        let mut done = 0;
        while done < len {
            let at = VirtualAddress::new(va.wrapping_add(done as u32));
            let pa = self
                .space
                .get_phys_addr(at)
                .ok_or(VmemError::NotMapped(at))?;
            let off = at.page_offset() as usize;
            let n = (PAGE_SIZE as usize - off).min(len - done);
            let base = PhysicalAddress::new(pa.as_u32() & !(PAGE_SIZE - 1));
            f(unsafe { self.frame(base) }, off, done, n);
            done += n;
        }
        Ok(())
    }

    unsafe fn frame<'a>(&self, pa: PhysicalAddress) -> &'a mut [u8; 4096] {
        unsafe { self.space.mapper().phys_to_mut::<[u8; 4096]>(pa) }
    }
}
