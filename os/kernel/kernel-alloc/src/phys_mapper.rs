//! # Identity `PhysMapper`
//!
//! The i386 kernel identity-maps every frame it manages before paging is
//! switched on, so a physical address is also a valid pointer in the kernel
//! page directory. [`KernelSpaceGuard`](crate::KernelSpaceGuard) ensures
//! that directory is the active one when heap or page table code runs.

use kernel_vmem::{PhysMapper, PhysicalAddress};

/// [`PhysMapper`] for identity-mapped physical memory.
///
/// # Safety
/// The referenced frames must be identity mapped in the active directory
/// (or paging must be off).
pub struct IdentityPhysMapper;

impl PhysMapper for IdentityPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = pa.as_usize() as *mut T;
        // SAFETY: caller guarantees `pa` is identity mapped and writable.
        unsafe { &mut *va }
    }
}
