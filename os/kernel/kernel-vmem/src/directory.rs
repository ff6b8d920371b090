use crate::PageEntry;
use kernel_memory_addresses::{ENTRIES_PER_TABLE, PhysicalAddress};

/// Frames occupied by one [`PageDirectory`].
pub const DIRECTORY_FRAMES: u32 = 3;

/// One page table: 1024 entries, 4 KiB-aligned.
#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [PageEntry; ENTRIES_PER_TABLE],
}

impl PageTable {
    /// Clear all entries.
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageEntry::new());
    }
}

/// A page directory plus the bookkeeping the kernel needs to walk it.
///
/// `physical_tables` must stay the first field: CR3 is loaded with the
/// address of the structure itself.
#[repr(C, align(4096))]
pub struct PageDirectory {
    /// Hardware view: one [`PageEntry::table_link`] per present table.
    pub physical_tables: [PageEntry; ENTRIES_PER_TABLE],
    /// Frame address of the table behind each slot (`0` if absent).
    pub tables: [PhysicalAddress; ENTRIES_PER_TABLE],
    /// Where this directory lives.
    pub physical_address: PhysicalAddress,
}

const _: () = {
    assert!(size_of::<PageTable>() == 4096);
    assert!(size_of::<PageDirectory>() == DIRECTORY_FRAMES as usize * 4096);
};

impl PageDirectory {
    /// Clear every slot and record where the directory lives.
    pub fn reset(&mut self, at: PhysicalAddress) {
        self.physical_tables.fill(PageEntry::new());
        self.tables.fill(PhysicalAddress::zero());
        self.physical_address = at;
    }

    /// Frame of the table behind `slot`, if one is present.
    #[inline]
    #[must_use]
    pub fn table(&self, slot: usize) -> Option<PhysicalAddress> {
        self.physical_tables[slot]
            .present()
            .then_some(self.tables[slot])
    }
}
