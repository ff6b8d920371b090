//! # Kernel memory bring-up
//!
//! Three layers come up in order, each needing the one before:
//!
//! 1. **Frames**: [`init_frames`] builds the bitmap allocator from the
//!    Multiboot memory map, keeping the kernel image and the initrd locked.
//! 2. **Paging**: [`init_paging`] identity maps physical memory up to
//!    [`IDENTITY_MAP_END`], allocates the shared heap tables and turns on
//!    `CR0.PG`. Page 0 stays unmapped so null pointers fault.
//! 3. **Heap**: the global allocator maps its first pages on [`init_heap`]
//!    and grows a page at a time from the frame allocator.
//!
//! [`Frames`] is the handle every other subsystem uses for frames. It is a
//! zero-sized type, so a handle on one kernel stack stays valid when a
//! `fork` copies that stack.

use core::ops::Range;
use core::sync::atomic::{AtomicU32, Ordering};
use kernel_alloc::{AddressSpaceSwitch, HeapBacking, IdentityPhysMapper, LockedHeap, PageFrameAllocator};
use kernel_info::boot::MemoryMapEntry;
use kernel_info::memory::{HEAP_END, HEAP_INITIAL_PAGES, HEAP_START, IDENTITY_MAP_END, PAGE_SIZE};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_registers::cr3::Cr3;
use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use kernel_sync::SpinMutex;
use kernel_vmem::{AddressSpace, FrameAlloc, VmemError, enable_paging};
use log::{info, warn};

unsafe extern "C" {
    static __kernel_start: u8;
    static __kernel_end: u8;
}

/// Physical range of the loaded kernel image, from the linker script.
pub fn kernel_image() -> Range<u32> {
    let start = (&raw const __kernel_start) as u32;
    let end = (&raw const __kernel_end) as u32;
    start..end
}

pub static MAPPER: IdentityPhysMapper = IdentityPhysMapper;

static FRAMES: SpinMutex<Option<PageFrameAllocator<'static>>> = SpinMutex::new(None);

/// Directory the heap is mapped through; set once paging is on.
static KERNEL_DIRECTORY: AtomicU32 = AtomicU32::new(0);

/// Handle to the global frame allocator.
pub struct Frames;

impl Frames {
    fn with<R>(f: impl FnOnce(&mut PageFrameAllocator<'static>) -> Option<R>) -> Option<R> {
        FRAMES.lock_irq().as_mut().and_then(f)
    }
}

impl FrameAlloc for Frames {
    fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
        Self::with(PageFrameAllocator::request_page)
    }

    fn alloc_contiguous(&mut self, count: u32) -> Option<PhysicalAddress> {
        Self::with(|pfa| pfa.request_pages(count))
    }

    fn free_4k(&mut self, frame: PhysicalAddress) {
        Self::with(|pfa| {
            pfa.free_page(frame);
            Some(())
        });
    }
}

/// Build the frame allocator from the memory map. Entries are clipped to
/// the identity-mapped range, the only memory the kernel can address.
///
/// # Safety
/// Call once, before paging is enabled; `map` must describe real memory.
pub unsafe fn init_frames<I>(map: I, initrd: Range<u32>) -> Result<(), kernel_alloc::FrameAllocError>
where
    I: Iterator<Item = MemoryMapEntry> + Clone,
{
    let end = u64::from(IDENTITY_MAP_END);
    let map = map.filter(|e| e.addr < end).map(move |mut e| {
        e.len = e.len.min(end - e.addr);
        e
    });
    let pfa = unsafe { PageFrameAllocator::read_memory_map(map, kernel_image(), initrd, &MAPPER)? };
    info!(
        "{} KiB free, {} KiB used, {} KiB reserved",
        pfa.free_memory() / 1024,
        pfa.used_memory() / 1024,
        pfa.reserved_memory() / 1024
    );
    *FRAMES.lock_irq() = Some(pfa);
    Ok(())
}

/// Build the kernel directory, switch paging on and return the directory.
///
/// # Safety
/// Call once, after [`init_frames`], with interrupts disabled.
pub unsafe fn init_paging() -> Result<PhysicalAddress, VmemError> {
    let space = AddressSpace::alloc(&MAPPER, &mut Frames)?;
    space.identity_map(
        &mut Frames,
        PhysicalAddress::new(PAGE_SIZE),
        IDENTITY_MAP_END / PAGE_SIZE - 1,
    )?;
    space.init(&mut Frames)?;

    let root = space.root();
    KERNEL_DIRECTORY.store(root.as_u32(), Ordering::Release);
    unsafe { enable_paging(root) };
    info!("paging enabled, kernel directory at {root}");
    Ok(root)
}

/// The heap's page source: a fresh frame mapped in the kernel directory.
pub struct KernelHeapBacking;

impl KernelHeapBacking {
    fn space() -> AddressSpace<'static, IdentityPhysMapper> {
        AddressSpace::from_root(&MAPPER, kernel_directory())
    }
}

#[allow(clippy::cast_possible_truncation)]
impl HeapBacking for KernelHeapBacking {
    fn map_page(&mut self, va: usize) -> bool {
        let Some(frame) = Frames.alloc_4k() else {
            warn!("heap: out of frames at {va:#x}");
            return false;
        };
        match Self::space().map_memory(&mut Frames, VirtualAddress::new(va as u32), frame) {
            Ok(()) => true,
            Err(e) => {
                warn!("heap: cannot map {va:#x}: {e}");
                Frames.free_4k(frame);
                false
            }
        }
    }

    fn set_user(&mut self, va: usize, user: bool) {
        if let Err(e) = Self::space().set_user(VirtualAddress::new(va as u32), user) {
            warn!("heap: cannot change access of {va:#x}: {e}");
        }
    }
}

/// CR3 access for the heap's kernel-directory guard.
pub struct KernelDirectories;

impl AddressSpaceSwitch for KernelDirectories {
    fn current(&self) -> PhysicalAddress {
        // SAFETY: reading CR3 has no side effects.
        unsafe { Cr3::load_unsafe() }.directory_phys()
    }

    fn kernel(&self) -> PhysicalAddress {
        kernel_directory()
    }

    fn activate(&self, directory: PhysicalAddress) {
        // SAFETY: every directory shares the kernel's identity map and heap
        // tables, so the code running here stays mapped.
        unsafe { Cr3::from_directory_phys(directory).store_unsafe() };
    }
}

#[global_allocator]
static ALLOCATOR: LockedHeap<KernelHeapBacking, KernelDirectories> = unsafe {
    LockedHeap::new(
        HEAP_START as usize,
        HEAP_END as usize,
        KernelHeapBacking,
        KernelDirectories,
    )
};

/// Map the first heap pages.
pub fn init_heap() -> Result<(), kernel_alloc::HeapError> {
    ALLOCATOR.init(HEAP_INITIAL_PAGES as usize)?;
    let stats = ALLOCATOR.stats();
    info!("heap ready: {} bytes at {HEAP_START:#010x}", stats.total);
    Ok(())
}

pub fn kernel_directory() -> PhysicalAddress {
    PhysicalAddress::new(KERNEL_DIRECTORY.load(Ordering::Acquire))
}
