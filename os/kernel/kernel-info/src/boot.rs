//! # Kernel Boot Information (Multiboot 1)
//!
//! The bootloader leaves the magic `0x2BADB002` in `eax` and the physical
//! address of a `multiboot_info` block in `ebx`. The kernel turns the block
//! (and the memory map it points to) into byte slices and parses them here,
//! so nothing in this module touches raw pointers.

use thiserror::Error;

/// Value the bootloader leaves in `eax`.
pub const MULTIBOOT_BOOTLOADER_MAGIC: u32 = 0x2BAD_B002;

/// `flags` bit: `mods_count` / `mods_addr` are valid.
pub const FLAG_MODULES: u32 = 1 << 3;

/// `flags` bit: `mmap_length` / `mmap_addr` are valid.
pub const FLAG_MEMORY_MAP: u32 = 1 << 6;

/// `flags` bit: the VBE fields are valid.
pub const FLAG_VBE: u32 = 1 << 11;

/// Size of the fixed `multiboot_info` block up to and including the VBE fields.
pub const INFO_SIZE: usize = 88;

/// Size of a module descriptor.
pub const MODULE_ENTRY_SIZE: usize = 16;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum BootInfoError {
    #[error("Invalid multiboot header")]
    BadMagic(u32),
    #[error("Invalid memory map")]
    NoMemoryMap,
    #[error("Initial ramdisk not found")]
    NoModules,
    #[error("multiboot block truncated")]
    Truncated,
}

#[inline]
fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

#[inline]
fn read_u64(bytes: &[u8], at: usize) -> Option<u64> {
    let lo = read_u32(bytes, at)?;
    let hi = read_u32(bytes, at + 4)?;
    Some(u64::from(lo) | (u64::from(hi) << 32))
}

/// The parts of `multiboot_info` the kernel consumes.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct MultibootInfo {
    pub flags: u32,
    pub mem_lower: u32,
    pub mem_upper: u32,
    pub mods_count: u32,
    pub mods_addr: u32,
    pub mmap_length: u32,
    pub mmap_addr: u32,
    pub vbe_control_info: u32,
    pub vbe_mode_info: u32,
}

impl MultibootInfo {
    /// Parse the fixed block after checking the loader's magic.
    ///
    /// # Errors
    /// [`BootInfoError::BadMagic`] for a foreign loader, [`BootInfoError::Truncated`]
    /// if `bytes` is shorter than [`INFO_SIZE`].
    pub fn parse(magic: u32, bytes: &[u8]) -> Result<Self, BootInfoError> {
        if magic != MULTIBOOT_BOOTLOADER_MAGIC {
            return Err(BootInfoError::BadMagic(magic));
        }
        if bytes.len() < INFO_SIZE {
            return Err(BootInfoError::Truncated);
        }

        let field = |at| read_u32(bytes, at).unwrap_or(0);
        Ok(Self {
            flags: field(0),
            mem_lower: field(4),
            mem_upper: field(8),
            mods_count: field(20),
            mods_addr: field(24),
            mmap_length: field(44),
            mmap_addr: field(48),
            vbe_control_info: field(72),
            vbe_mode_info: field(76),
        })
    }

    #[must_use]
    pub const fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    /// Physical location of the memory map, if the loader provided one.
    ///
    /// # Errors
    /// [`BootInfoError::NoMemoryMap`] when flag bit 6 is clear.
    pub const fn memory_map_region(&self) -> Result<(u32, u32), BootInfoError> {
        if !self.has(FLAG_MEMORY_MAP) {
            return Err(BootInfoError::NoMemoryMap);
        }
        Ok((self.mmap_addr, self.mmap_length))
    }

    /// Physical location of the module table.
    ///
    /// # Errors
    /// [`BootInfoError::NoModules`] when no module was loaded.
    pub const fn modules_region(&self) -> Result<(u32, u32), BootInfoError> {
        if !self.has(FLAG_MODULES) || self.mods_count == 0 {
            return Err(BootInfoError::NoModules);
        }
        Ok((self.mods_addr, self.mods_count * MODULE_ENTRY_SIZE as u32))
    }
}

/// Memory region type as reported by the firmware.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemoryKind {
    Available,
    Reserved,
    AcpiReclaimable,
    AcpiNvs,
    BadRam,
    Other(u32),
}

impl From<u32> for MemoryKind {
    fn from(v: u32) -> Self {
        match v {
            1 => Self::Available,
            2 => Self::Reserved,
            3 => Self::AcpiReclaimable,
            4 => Self::AcpiNvs,
            5 => Self::BadRam,
            other => Self::Other(other),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryMapEntry {
    pub addr: u64,
    pub len: u64,
    pub kind: MemoryKind,
}

impl MemoryMapEntry {
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.addr.saturating_add(self.len)
    }

    #[must_use]
    pub const fn is_available(&self) -> bool {
        matches!(self.kind, MemoryKind::Available)
    }
}

/// Iterator over the raw memory map bytes.
///
/// Each record starts with its own `size` field which does not count itself,
/// so the next record begins `size + 4` bytes later.
#[derive(Debug, Clone)]
pub struct MemoryMap<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> MemoryMap<'a> {
    #[must_use]
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, at: 0 }
    }
}

impl Iterator for MemoryMap<'_> {
    type Item = MemoryMapEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let size = read_u32(self.bytes, self.at)? as usize;
        let addr = read_u64(self.bytes, self.at + 4)?;
        let len = read_u64(self.bytes, self.at + 12)?;
        let kind = read_u32(self.bytes, self.at + 20)?;
        self.at += size.max(20) + 4;
        Some(MemoryMapEntry {
            addr,
            len,
            kind: kind.into(),
        })
    }
}

/// A boot module (the initial ramdisk is module 0).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Module {
    pub start: u32,
    pub end: u32,
    pub cmdline: u32,
}

impl Module {
    #[must_use]
    pub const fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Iterate module descriptors from the bytes of the module table.
pub fn modules(bytes: &[u8]) -> impl Iterator<Item = Module> + '_ {
    bytes.chunks_exact(MODULE_ENTRY_SIZE).filter_map(|m| {
        Some(Module {
            start: read_u32(m, 0)?,
            end: read_u32(m, 4)?,
            cmdline: read_u32(m, 8)?,
        })
    })
}

/// The subset of the VBE mode info block used to find the framebuffer.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct VbeModeInfo {
    pub pitch: u16,
    pub width: u16,
    pub height: u16,
    pub bpp: u8,
    pub framebuffer: u32,
}

impl VbeModeInfo {
    /// Size of the mode info block as defined by VBE 3.0.
    pub const SIZE: usize = 256;

    /// Parse the VBE mode info block.
    #[must_use]
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let u16_at = |at: usize| bytes.get(at..at + 2).map(|b| u16::from_le_bytes([b[0], b[1]]));
        Some(Self {
            pitch: u16_at(16)?,
            width: u16_at(18)?,
            height: u16_at(20)?,
            bpp: *bytes.get(25)?,
            framebuffer: read_u32(bytes, 40)?,
        })
    }

    /// Bytes spanned by the visible framebuffer.
    #[must_use]
    pub const fn framebuffer_len(&self) -> u32 {
        self.pitch as u32 * self.height as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(addr: u64, len: u64, kind: u32) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&20u32.to_le_bytes());
        v.extend_from_slice(&addr.to_le_bytes());
        v.extend_from_slice(&len.to_le_bytes());
        v.extend_from_slice(&kind.to_le_bytes());
        v
    }

    fn info(flags: u32) -> Vec<u8> {
        let mut v = vec![0u8; INFO_SIZE];
        v[0..4].copy_from_slice(&flags.to_le_bytes());
        v[20..24].copy_from_slice(&1u32.to_le_bytes());
        v[24..28].copy_from_slice(&0x9000u32.to_le_bytes());
        v[44..48].copy_from_slice(&48u32.to_le_bytes());
        v[48..52].copy_from_slice(&0x8000u32.to_le_bytes());
        v
    }

    #[test]
    fn rejects_foreign_magic() {
        assert_eq!(
            MultibootInfo::parse(0x1234, &info(FLAG_MEMORY_MAP)),
            Err(BootInfoError::BadMagic(0x1234))
        );
        assert_eq!(
            MultibootInfo::parse(MULTIBOOT_BOOTLOADER_MAGIC, &[0; 12]),
            Err(BootInfoError::Truncated)
        );
    }

    #[test]
    fn memory_map_requires_flag_bit_6() {
        let mbi = MultibootInfo::parse(MULTIBOOT_BOOTLOADER_MAGIC, &info(0)).unwrap();
        assert_eq!(mbi.memory_map_region(), Err(BootInfoError::NoMemoryMap));
        assert_eq!(mbi.modules_region(), Err(BootInfoError::NoModules));

        let mbi =
            MultibootInfo::parse(MULTIBOOT_BOOTLOADER_MAGIC, &info(FLAG_MEMORY_MAP | FLAG_MODULES))
                .unwrap();
        assert_eq!(mbi.memory_map_region(), Ok((0x8000, 48)));
        assert_eq!(mbi.modules_region(), Ok((0x9000, 16)));
    }

    #[test]
    fn iterates_entries_with_size_stride() {
        let mut raw = entry(0, 0x9_FC00, 1);
        raw.extend(entry(0x10_0000, 0x7EE_0000, 1));
        let mut odd = entry(0xFFFC_0000, 0x4_0000, 2);
        // A record that claims four extra bytes; the iterator must honour it.
        odd[0..4].copy_from_slice(&24u32.to_le_bytes());
        odd.extend_from_slice(&[0xAA; 4]);
        raw.extend(odd);
        raw.extend(entry(0x1_0000_0000, 0x1000, 5));

        let entries: Vec<_> = MemoryMap::new(&raw).collect();
        assert_eq!(entries.len(), 4);
        assert!(entries[1].is_available());
        assert_eq!(entries[1].end(), 0x10_0000 + 0x7EE_0000);
        assert_eq!(entries[2].kind, MemoryKind::Reserved);
        assert_eq!(entries[3].kind, MemoryKind::BadRam);
        assert_eq!(entries[3].addr, 0x1_0000_0000);
    }

    #[test]
    fn reads_module_table() {
        let mut raw = Vec::new();
        for w in [0x20_0000u32, 0x20_8000, 0, 0, 0x30_0000, 0x30_1000, 0, 0] {
            raw.extend_from_slice(&w.to_le_bytes());
        }
        let mods: Vec<_> = modules(&raw).collect();
        assert_eq!(mods.len(), 2);
        assert_eq!(mods[0].len(), 0x8000);
        assert_eq!(mods[1].start, 0x30_0000);
    }

    #[test]
    fn vbe_mode_info_framebuffer() {
        let mut raw = vec![0u8; VbeModeInfo::SIZE];
        raw[16..18].copy_from_slice(&4096u16.to_le_bytes());
        raw[18..20].copy_from_slice(&1024u16.to_le_bytes());
        raw[20..22].copy_from_slice(&768u16.to_le_bytes());
        raw[25] = 32;
        raw[40..44].copy_from_slice(&0xFD00_0000u32.to_le_bytes());
        let vbe = VbeModeInfo::parse(&raw).unwrap();
        assert_eq!(vbe.framebuffer, 0xFD00_0000);
        assert_eq!(vbe.framebuffer_len(), 4096 * 768);
        assert_eq!(vbe.bpp, 32);
    }
}
