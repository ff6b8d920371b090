//! # Address Space (i386, page-directory rooted)
//!
//! Strongly-typed helpers to build and manipulate a **single** virtual
//! address space (tree rooted at a [`PageDirectory`]).
//!
//! ## Highlights
//!
//! - [`AddressSpace::alloc`] / [`AddressSpace::init`] create a directory and
//!   make sure the shared heap tables are linked in.
//! - [`AddressSpace::map_memory`] / [`AddressSpace::map_user_memory`] install
//!   one 4 KiB mapping, allocating the covering table on demand.
//! - [`AddressSpace::get_phys_addr`] translates a virtual address, e.g. for
//!   handing buffers to DMA engines.
//! - [`AddressSpace::clone_directory`] builds the child's space on `fork`.
//! - [`AddressSpace::free`] tears a space down on reap.
//!
//! ## Copy rules for [`clone_directory`](AddressSpace::clone_directory)
//!
//! | Slot / entry | Child gets |
//! |:-------------|:-----------|
//! | heap slot | the parent's table, shared |
//! | other slot | a fresh copy of the table |
//! | user page | a fresh frame with a byte copy of the contents |
//! | supervisor page | the same frame (kernel identity map) |
//!
//! [`free`](AddressSpace::free) mirrors this: it releases private tables and
//! user frames but never touches the heap tables or supervisor frames.
//!
//! ## Safety
//!
//! Mutating the *active* directory needs TLB maintenance; the kernel reloads
//! CR3 on every switch, and [`AddressSpace::unmap`] invalidates the page when
//! built for x86.

use crate::info::{HEAP_END_TABLE, HEAP_START_TABLE};
use crate::{
    DIRECTORY_FRAMES, FrameAlloc, MapFlags, PageDirectory, PageEntry, PhysMapper, VmemError,
    get_frame, get_table,
};
use kernel_memory_addresses::{ENTRIES_PER_TABLE, PAGE_SIZE, PhysicalAddress, VirtualAddress};
use log::trace;

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysicalAddress,
    mapper: &'m M,
}

impl<M: PhysMapper> Clone for AddressSpace<'_, M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M: PhysMapper> Copy for AddressSpace<'_, M> {}

#[inline]
const fn is_shared_slot(slot: usize) -> bool {
    slot >= HEAP_START_TABLE && slot < HEAP_END_TABLE
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Allocate a fresh, empty directory (three contiguous zeroed frames).
    ///
    /// # Errors
    /// [`VmemError::OutOfFrames`] if the frame allocator has no run of three frames.
    pub fn alloc<A: FrameAlloc>(mapper: &'m M, alloc: &mut A) -> Result<Self, VmemError> {
        let root = alloc
            .alloc_contiguous(DIRECTORY_FRAMES)
            .ok_or(VmemError::OutOfFrames)?;
        if !root.is_aligned::<kernel_memory_addresses::Size4K>() {
            return Err(VmemError::Misaligned(root.as_u32()));
        }
        let space = Self { root, mapper };
        space.directory().reset(root);
        Ok(space)
    }

    /// Wrap an existing directory.
    #[inline]
    pub const fn from_root(mapper: &'m M, root: PhysicalAddress) -> Self {
        Self { root, mapper }
    }

    /// View the **currently active** address space by reading CR3.
    ///
    /// # Safety
    /// Paging must be enabled with CR3 pointing at a [`PageDirectory`].
    #[cfg(target_arch = "x86")]
    #[inline]
    pub unsafe fn from_current(mapper: &'m M) -> Self {
        use kernel_registers::LoadRegisterUnsafe;
        let cr3 = unsafe { kernel_registers::cr3::Cr3::load_unsafe() };
        Self {
            root: cr3.directory_phys(),
            mapper,
        }
    }

    /// Physical address of the directory (the CR3 value).
    #[inline]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    #[inline]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }

    #[inline]
    pub(crate) fn directory(&self) -> &'m mut PageDirectory {
        unsafe { self.mapper.phys_to_mut::<PageDirectory>(self.root) }
    }

    /// Wire the directory up for use: record its own address and make sure
    /// every shared heap table exists.
    ///
    /// Called once on the kernel directory before the heap is set up; clones
    /// inherit the heap slots from it.
    ///
    /// # Errors
    /// [`VmemError::OutOfFrames`] if a heap table cannot be allocated.
    pub fn init<A: FrameAlloc>(&self, alloc: &mut A) -> Result<(), VmemError> {
        self.directory().physical_address = self.root;
        for slot in HEAP_START_TABLE..HEAP_END_TABLE {
            self.ensure_table(alloc, slot)?;
        }
        Ok(())
    }

    /// Return the table behind `slot`, allocating and linking a zeroed one if absent.
    fn ensure_table<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        slot: usize,
    ) -> Result<PhysicalAddress, VmemError> {
        let dir = self.directory();
        if let Some(table) = dir.table(slot) {
            return Ok(table);
        }

        let table = alloc.alloc_4k().ok_or(VmemError::OutOfFrames)?;
        unsafe { get_table(self.mapper, table).zero() };
        dir.tables[slot] = table;
        dir.physical_tables[slot] = PageEntry::table_link(table);
        Ok(table)
    }

    /// Map **one** page `va → pa` with `flags`.
    ///
    /// # Errors
    /// [`VmemError::Misaligned`] for unaligned addresses and
    /// [`VmemError::OutOfFrames`] if the covering table cannot be allocated.
    pub fn map<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: MapFlags,
    ) -> Result<(), VmemError> {
        if va.page_offset() != 0 {
            return Err(VmemError::Misaligned(va.as_u32()));
        }
        if pa.page_offset() != 0 {
            return Err(VmemError::Misaligned(pa.as_u32()));
        }

        let table = self.ensure_table(alloc, va.directory_index())?;
        let table = unsafe { get_table(self.mapper, table) };
        table.entries[va.table_index()] = PageEntry::leaf(pa, flags);
        Ok(())
    }

    /// Install a supervisor read/write mapping.
    ///
    /// # Errors
    /// See [`map`](Self::map).
    #[inline]
    pub fn map_memory<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
    ) -> Result<(), VmemError> {
        self.map(alloc, va, pa, MapFlags::KERNEL)
    }

    /// Install a mapping ring 3 may read and write.
    ///
    /// # Errors
    /// See [`map`](Self::map).
    #[inline]
    pub fn map_user_memory<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
    ) -> Result<(), VmemError> {
        self.map(alloc, va, pa, MapFlags::USER)
    }

    /// Identity map `count` pages starting at `start` (supervisor).
    ///
    /// # Errors
    /// See [`map`](Self::map).
    pub fn identity_map<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        start: PhysicalAddress,
        count: u32,
    ) -> Result<(), VmemError> {
        for i in 0..count {
            let pa = start + i * PAGE_SIZE;
            self.map_memory(alloc, VirtualAddress::new(pa.as_u32()), pa)?;
        }
        Ok(())
    }

    fn entry_mut(&self, va: VirtualAddress) -> Option<&'m mut PageEntry> {
        let table = self.directory().table(va.directory_index())?;
        let table = unsafe { get_table(self.mapper, table) };
        let entry = &mut table.entries[va.table_index()];
        entry.present().then_some(entry)
    }

    /// The leaf entry for `va`, if mapped.
    #[must_use]
    pub fn entry(&self, va: VirtualAddress) -> Option<PageEntry> {
        self.entry_mut(va).map(|e| *e)
    }

    /// Translate `va` by walking directory → table → entry.
    #[must_use]
    pub fn get_phys_addr(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.entry(va).map(|e| e.address() + va.page_offset())
    }

    /// Toggle the user bit of the existing mapping at `va`.
    ///
    /// # Errors
    /// [`VmemError::NotMapped`] if nothing is mapped at `va`.
    pub fn set_user(&self, va: VirtualAddress, user: bool) -> Result<(), VmemError> {
        let entry = self.entry_mut(va).ok_or(VmemError::NotMapped(va))?;
        entry.set_user(user);
        Ok(())
    }

    /// Clear the mapping at `va` and return the frame it pointed at.
    ///
    /// # Errors
    /// [`VmemError::NotMapped`] if nothing is mapped at `va`.
    pub fn unmap(&self, va: VirtualAddress) -> Result<PhysicalAddress, VmemError> {
        let entry = self.entry_mut(va).ok_or(VmemError::NotMapped(va))?;
        let frame = entry.address();
        *entry = PageEntry::new();
        invalidate(va);
        Ok(frame)
    }

    /// Build the address space of a forked child.
    ///
    /// Heap slots are shared, every other table is duplicated, user pages get
    /// private copies and supervisor pages stay aliased. On failure every
    /// frame taken so far is returned.
    ///
    /// # Errors
    /// [`VmemError::OutOfFrames`] when memory runs out midway.
    pub fn clone_directory<A: FrameAlloc>(&self, alloc: &mut A) -> Result<Self, VmemError> {
        let child = Self::alloc(self.mapper, alloc)?;
        if let Err(e) = self.copy_into(&child, alloc) {
            child.free(alloc);
            return Err(e);
        }
        trace!("cloned directory {} into {}", self.root, child.root);
        Ok(child)
    }

    fn copy_into<A: FrameAlloc>(&self, child: &Self, alloc: &mut A) -> Result<(), VmemError> {
        let src = self.directory();

        for slot in 0..ENTRIES_PER_TABLE {
            let Some(src_table) = src.table(slot) else {
                continue;
            };

            if is_shared_slot(slot) {
                let dst = child.directory();
                dst.tables[slot] = src_table;
                dst.physical_tables[slot] = src.physical_tables[slot];
                continue;
            }

            let dst_table = child.ensure_table(alloc, slot)?;
            let (src_table, dst_table) = unsafe {
                (
                    get_table(self.mapper, src_table),
                    get_table(self.mapper, dst_table),
                )
            };

            for (from, to) in src_table.entries.iter().zip(dst_table.entries.iter_mut()) {
                if !from.present() {
                    continue;
                }
                if !from.user() {
                    *to = *from;
                    continue;
                }

                let frame = alloc.alloc_4k().ok_or(VmemError::OutOfFrames)?;
                unsafe {
                    get_frame(self.mapper, frame)
                        .copy_from_slice(get_frame(self.mapper, from.address()));
                }
                // Link before continuing so a later failure frees this frame too.
                *to = from.with_frame(frame.frame_number());
            }
        }
        Ok(())
    }

    /// Release everything this directory owns: user frames and tables in
    /// private slots, then the directory's own frames.
    pub fn free<A: FrameAlloc>(self, alloc: &mut A) {
        let dir = self.directory();
        for slot in 0..ENTRIES_PER_TABLE {
            if is_shared_slot(slot) {
                continue;
            }
            let Some(table_pa) = dir.table(slot) else {
                continue;
            };

            let table = unsafe { get_table(self.mapper, table_pa) };
            for entry in table.entries.iter().filter(|e| e.present() && e.user()) {
                alloc.free_4k(entry.address());
            }
            alloc.free_4k(table_pa);
        }

        for i in 0..DIRECTORY_FRAMES {
            alloc.free_4k(self.root + i * PAGE_SIZE);
        }
    }

    /// Make this the active address space.
    ///
    /// # Safety
    /// The code and stack currently executing must be mapped identically in
    /// this directory.
    #[cfg(target_arch = "x86")]
    #[inline]
    pub unsafe fn activate(&self) {
        unsafe { enable_paging(self.root) };
    }
}

/// Load CR3 with `directory` and set CR0.PG.
///
/// # Safety
/// `directory` must be a fully initialized [`PageDirectory`] that maps the
/// currently executing code.
#[cfg(target_arch = "x86")]
pub unsafe fn enable_paging(directory: PhysicalAddress) {
    use kernel_registers::cr0::Cr0;
    use kernel_registers::cr3::Cr3;
    use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe};

    unsafe {
        Cr3::from_directory_phys(directory).store_unsafe();
        Cr0::load_unsafe().with_pg_paging(true).store_unsafe();
    }
}

/// Host builds have no MMU; nothing to enable.
///
/// # Safety
/// Always safe on the host; `unsafe` mirrors the x86 signature.
#[cfg(not(target_arch = "x86"))]
pub const unsafe fn enable_paging(_directory: PhysicalAddress) {}

#[cfg(target_arch = "x86")]
#[inline]
fn invalidate(va: VirtualAddress) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u32(), options(nostack, preserves_flags));
    }
}

#[cfg(not(target_arch = "x86"))]
#[inline]
const fn invalidate(_va: VirtualAddress) {}
