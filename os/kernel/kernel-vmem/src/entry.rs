use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;
use utils_accessors_derive::Accessors;

/// A page-directory or page-table entry (32-bit paging).
///
/// The same layout serves both levels: a directory entry points at a page
/// table, a table entry points at a 4 KiB page. Permissions are the
/// intersection of both levels, which is why directory entries are written
/// permissively (see [`PageEntry::table_link`]).
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageEntry {
    /// Bit 0: Present (P).
    ///
    /// Cleared entries fault on access; all other bits are then ignored by
    /// the hardware.
    pub present: bool,

    /// Bit 1: Read/Write (RW).
    ///
    /// Read-only when clear. Ring 0 may still write unless CR0.WP is set.
    pub writable: bool,

    /// Bit 2: User/Supervisor (US).
    ///
    /// Ring 3 may access the page only when set at both levels.
    pub user: bool,

    /// Bit 3: Page-level Write-Through (PWT).
    pub write_through: bool,

    /// Bit 4: Page-level Cache Disable (PCD).
    ///
    /// Set for MMIO such as NIC register windows.
    pub cache_disable: bool,

    /// Bit 5: Accessed (A), set by the CPU.
    pub accessed: bool,

    /// Bit 6: Dirty (D), set by the CPU on write (table entries only).
    pub dirty: bool,

    /// Bit 7: Page Size (PS) in a directory entry, PAT in a table entry.
    ///
    /// This kernel never uses 4 MiB pages; always 0.
    pub large_page: bool,

    /// Bit 8: Global (G), ignored unless CR4.PGE is set.
    pub global: bool,

    /// Bits 9–11: Available to the OS.
    #[bits(3)]
    pub available: u8,

    /// Bits 12–31: Frame number (physical address >> 12).
    #[bits(20)]
    pub frame: u32,
}

impl PageEntry {
    /// A directory entry pointing at the page table in `table`: present,
    /// writable and user, so the table's own entries decide.
    #[inline]
    #[must_use]
    pub const fn table_link(table: PhysicalAddress) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(true)
            .with_frame(table.frame_number())
    }

    /// A present leaf mapping to `frame` with `flags`.
    #[inline]
    #[must_use]
    pub const fn leaf(frame: PhysicalAddress, flags: MapFlags) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(flags.writable())
            .with_user(flags.user())
            .with_write_through(flags.write_through())
            .with_cache_disable(flags.cache_disable())
            .with_global(flags.global())
            .with_frame(frame.frame_number())
    }

    /// Physical base address of the referenced frame.
    #[inline]
    #[must_use]
    pub const fn address(&self) -> PhysicalAddress {
        PhysicalAddress::from_frame_number(self.frame())
    }
}

/// Permissions requested for a leaf mapping.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Accessors)]
#[accessors(get)]
#[allow(clippy::struct_excessive_bools)]
pub struct MapFlags {
    writable: bool,
    user: bool,
    write_through: bool,
    cache_disable: bool,
    global: bool,
}

impl MapFlags {
    /// Ring-0 read/write.
    pub const KERNEL: Self = Self {
        writable: true,
        user: false,
        write_through: false,
        cache_disable: false,
        global: false,
    };

    /// Ring-3 read/write.
    pub const USER: Self = Self::KERNEL.with_user(true);

    /// Ring-0 uncached device memory.
    pub const MMIO: Self = Self::KERNEL.with_cache_disable(true);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_link_encodes_as_phys_or_7() {
        let e = PageEntry::table_link(PhysicalAddress::new(0x0012_3000));
        assert_eq!(e.into_bits(), 0x0012_3007);
    }

    #[test]
    fn leaf_carries_requested_flags() {
        let e = PageEntry::leaf(PhysicalAddress::new(0x0040_0000), MapFlags::USER);
        assert!(e.present() && e.writable() && e.user());
        assert!(!e.cache_disable());
        assert_eq!(e.address().as_u32(), 0x0040_0000);

        let mmio = PageEntry::leaf(PhysicalAddress::new(0xFEBC_0000), MapFlags::MMIO);
        assert!(mmio.cache_disable() && !mmio.user());
        assert_eq!(mmio.into_bits(), 0xFEBC_0013);
    }
}
