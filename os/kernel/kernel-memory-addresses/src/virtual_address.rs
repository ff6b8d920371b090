use crate::{PAGE_SHIFT, PageSize, Size4K};
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// Virtual memory address.
///
/// Carries the *kind* of address at the type level and knows how the MMU
/// splits it into a directory slot, a table slot and a byte offset.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u32);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u32) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Convert a pointer-sized integer, rejecting values above 4 GiB.
    #[inline]
    #[must_use]
    pub fn try_from_usize(v: usize) -> Option<Self> {
        u32::try_from(v).ok().map(Self)
    }

    /// Build the address that selects `directory` and `table` with offset 0.
    #[inline]
    #[must_use]
    pub const fn from_indices(directory: usize, table: usize) -> Self {
        debug_assert!(directory < 1024 && table < 1024);
        Self(((directory as u32) << 22) | ((table as u32) << PAGE_SHIFT))
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Page-directory slot (bits 31..22).
    #[inline]
    #[must_use]
    pub const fn directory_index(self) -> usize {
        (self.0 >> 22) as usize
    }

    /// Page-table slot (bits 21..12).
    #[inline]
    #[must_use]
    pub const fn table_index(self) -> usize {
        ((self.0 >> PAGE_SHIFT) & 0x3FF) as usize
    }

    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> u32 {
        self.0 & (Size4K::SIZE - 1)
    }

    /// Index of the 4 KiB virtual page containing this address.
    #[inline]
    #[must_use]
    pub const fn page_number(self) -> u32 {
        self.0 >> PAGE_SHIFT
    }

    #[inline]
    #[must_use]
    pub const fn align_down<S: PageSize>(self) -> Self {
        Self(self.0 & !(S::SIZE - 1))
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned<S: PageSize>(self) -> bool {
        self.0 & (S::SIZE - 1) == 0
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u32) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:08X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

impl From<u32> for VirtualAddress {
    #[inline]
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl From<VirtualAddress> for u32 {
    #[inline]
    fn from(v: VirtualAddress) -> Self {
        v.0
    }
}

impl Add<u32> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u32) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u32> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u32) {
        self.0 += rhs;
    }
}

impl Sub for VirtualAddress {
    type Output = u32;
    #[inline]
    fn sub(self, rhs: Self) -> u32 {
        self.0 - rhs.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_into_directory_table_and_offset() {
        let va = VirtualAddress::new(0xC030_2ABC);
        assert_eq!(va.directory_index(), 0x300);
        assert_eq!(va.table_index(), 0x302);
        assert_eq!(va.page_offset(), 0xABC);
        assert_eq!(va.page_number(), 0xC0302);
    }

    #[test]
    fn heap_base_lands_on_directory_slot_512() {
        let heap = VirtualAddress::new(0x8000_0000);
        assert_eq!(heap.directory_index(), 512);
        assert_eq!(heap.table_index(), 0);
    }

    #[test]
    fn try_from_usize_rejects_wide_values() {
        assert_eq!(VirtualAddress::try_from_usize(0x1000), Some(VirtualAddress::new(0x1000)));
        #[cfg(target_pointer_width = "64")]
        assert_eq!(VirtualAddress::try_from_usize(0x1_0000_0000), None);
    }
}
