//! Minimal ELF32 reader for `exec`: header validation and program headers.

use bitfield_struct::bitfield;
use kernel_memory_addresses::VirtualAddress;
use thiserror::Error;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum ElfError {
    #[error("file too short")]
    TooShort,
    #[error("bad magic")]
    BadMagic,
    #[error("not a 32-bit image")]
    BadClass,
    #[error("not little-endian")]
    BadEncoding,
    #[error("not an i386 image")]
    BadMachine,
    #[error("malformed header")]
    BadHeader,
    #[error("program header or segment out of bounds")]
    OutOfBounds,
    #[error("no loadable segments")]
    NoLoadSegments,
    #[error("segment at {0:#010x} lies outside the user image area")]
    SegmentOutsideUserArea(u32),
}

#[derive(Copy, Clone, Debug)]
#[allow(dead_code, clippy::struct_field_names)]
pub struct Eh32 {
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: VirtualAddress,
    e_phoff: u32,
    e_shoff: u32,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
}

#[derive(Copy, Clone, Debug)]
#[allow(clippy::struct_field_names)]
pub struct Ph32 {
    pub p_type: u32,
    pub p_offset: u32,
    pub p_vaddr: VirtualAddress,
    pub p_paddr: u32,
    pub p_filesz: u32,
    pub p_memsz: u32,
    pub p_flags: PFlags,
    pub p_align: u32,
}

/// `Elf32_Phdr.p_flags`: bit0=X, bit1=W, bit2=R.
#[bitfield(u32)]
pub struct PFlags {
    #[bits(1)]
    pub execute: bool,
    #[bits(1)]
    pub write: bool,
    #[bits(1)]
    pub read: bool,
    #[bits(29)]
    __: u32,
}

const EH_SIZE: usize = 52;
const PH_SIZE: usize = 32;
const ET_EXEC: u16 = 2;
const EM_386: u16 = 3;
const PT_LOAD: u32 = 1;

#[inline]
fn le16(x: &[u8]) -> u16 {
    u16::from_le_bytes([x[0], x[1]])
}

#[inline]
fn le32(x: &[u8]) -> u32 {
    u32::from_le_bytes([x[0], x[1], x[2], x[3]])
}

pub struct ElfView<'a> {
    bytes: &'a [u8],
    pub eh: Eh32,
    ph: PhSlice<'a>,
}

/// Validate `bytes` as a static i386 executable.
///
/// # Errors
/// One [`ElfError`] per failed check, in header order.
pub fn elf32_view(bytes: &[u8]) -> Result<ElfView<'_>, ElfError> {
    use ElfError::{BadClass, BadEncoding, BadHeader, BadMachine, BadMagic, OutOfBounds, TooShort};
    if bytes.len() < EH_SIZE {
        return Err(TooShort);
    }

    if &bytes[0..4] != b"\x7FELF" {
        return Err(BadMagic);
    }

    // ELFCLASS32
    if bytes[4] != 1 {
        return Err(BadClass);
    }

    if bytes[5] != 1 {
        return Err(BadEncoding);
    }

    let eh = Eh32 {
        e_type: le16(&bytes[16..18]),
        e_machine: le16(&bytes[18..20]),
        e_version: le32(&bytes[20..24]),
        e_entry: VirtualAddress::new(le32(&bytes[24..28])),
        e_phoff: le32(&bytes[28..32]),
        e_shoff: le32(&bytes[32..36]),
        e_flags: le32(&bytes[36..40]),
        e_ehsize: le16(&bytes[40..42]),
        e_phentsize: le16(&bytes[42..44]),
        e_phnum: le16(&bytes[44..46]),
    };

    if eh.e_type != ET_EXEC {
        return Err(BadHeader);
    }

    if eh.e_machine != EM_386 {
        return Err(BadMachine);
    }

    if eh.e_version != 1 {
        return Err(BadHeader);
    }

    if eh.e_phnum > 0 && eh.e_phentsize as usize != PH_SIZE {
        return Err(BadHeader);
    }

    let phoff = eh.e_phoff as usize;
    let phnum = eh.e_phnum as usize;
    let need = phoff
        .checked_add(phnum.checked_mul(PH_SIZE).ok_or(OutOfBounds)?)
        .ok_or(OutOfBounds)?;
    if need > bytes.len() {
        return Err(OutOfBounds);
    }

    let ph = PhSlice {
        b: bytes,
        off: phoff,
        num: phnum,
    };

    Ok(ElfView { bytes, eh, ph })
}

#[derive(Copy, Clone)]
struct PhSlice<'a> {
    b: &'a [u8],
    off: usize,
    num: usize,
}

impl PhSlice<'_> {
    fn get(&self, i: usize) -> Option<Ph32> {
        if i >= self.num {
            return None;
        }
        let p = self.off + i * PH_SIZE;
        let s = self.b.get(p..p + PH_SIZE)?;
        Some(Ph32 {
            p_type: le32(&s[0..4]),
            p_offset: le32(&s[4..8]),
            p_vaddr: VirtualAddress::new(le32(&s[8..12])),
            p_paddr: le32(&s[12..16]),
            p_filesz: le32(&s[16..20]),
            p_memsz: le32(&s[20..24]),
            p_flags: PFlags::from_bits(le32(&s[24..28])),
            p_align: le32(&s[28..32]),
        })
    }
}

pub struct PhIter<'a> {
    ps: PhSlice<'a>,
    i: usize,
}

impl Iterator for PhIter<'_> {
    type Item = Ph32;
    fn next(&mut self) -> Option<Self::Item> {
        let v = self.ps.get(self.i)?;
        self.i += 1;
        Some(v)
    }
    fn size_hint(&self) -> (usize, Option<usize>) {
        let r = self.ps.num.saturating_sub(self.i);
        (r, Some(r))
    }
}

impl core::iter::FusedIterator for PhIter<'_> {}

impl<'a> ElfView<'a> {
    #[must_use]
    pub const fn iter_ph(&self) -> PhIter<'a> {
        PhIter { ps: self.ph, i: 0 }
    }

    pub fn iter_pt_load(&self) -> impl Iterator<Item = Ph32> + 'a {
        self.iter_ph().filter(|ph| ph.p_type == PT_LOAD)
    }

    #[must_use]
    pub const fn entry(&self) -> VirtualAddress {
        self.eh.e_entry
    }

    /// The file bytes backing a segment (`p_filesz` may be below `p_memsz`).
    ///
    /// # Errors
    /// [`ElfError::OutOfBounds`] if the segment reaches past the file, or if
    /// `p_filesz > p_memsz`.
    pub fn segment_bytes(&self, ph: &Ph32) -> Result<&'a [u8], ElfError> {
        if ph.p_filesz > ph.p_memsz {
            return Err(ElfError::OutOfBounds);
        }
        let off = ph.p_offset as usize;
        let end = off
            .checked_add(ph.p_filesz as usize)
            .ok_or(ElfError::OutOfBounds)?;
        self.bytes.get(off..end).ok_or(ElfError::OutOfBounds)
    }
}

/// Build a tiny executable image for tests: one header plus the given
/// `(vaddr, memsz, data)` segments laid out back to back after the headers.
#[cfg(test)]
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn build_test_image(entry: u32, segments: &[(u32, u32, &[u8])]) -> alloc::vec::Vec<u8> {
    use alloc::vec::Vec;
    let mut out = Vec::new();
    out.extend_from_slice(b"\x7FELF");
    out.extend_from_slice(&[1, 1, 1]);
    out.resize(16, 0);
    out.extend_from_slice(&ET_EXEC.to_le_bytes());
    out.extend_from_slice(&EM_386.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&entry.to_le_bytes());
    out.extend_from_slice(&(EH_SIZE as u32).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&(EH_SIZE as u16).to_le_bytes());
    out.extend_from_slice(&(PH_SIZE as u16).to_le_bytes());
    out.extend_from_slice(&(segments.len() as u16).to_le_bytes());
    out.resize(EH_SIZE, 0);

    let mut data_off = (EH_SIZE + segments.len() * PH_SIZE) as u32;
    for (vaddr, memsz, data) in segments {
        for v in [
            PT_LOAD,
            data_off,
            *vaddr,
            *vaddr,
            data.len() as u32,
            *memsz,
            0b101,
            0x1000,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        data_off += data.len() as u32;
    }
    for (_, _, data) in segments {
        out.extend_from_slice(data);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_segments() {
        let img = build_test_image(
            0x4000_0010,
            &[(0x4000_0000, 0x2000, &b"code"[..]), (0x4000_3000, 8, &b"dt"[..])],
        );
        let view = elf32_view(&img).unwrap();
        assert_eq!(view.entry().as_u32(), 0x4000_0010);
        let segs: alloc::vec::Vec<_> = view.iter_pt_load().collect();
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].p_memsz, 0x2000);
        assert!(segs[0].p_flags.execute() && segs[0].p_flags.read());
        assert!(!segs[0].p_flags.write());
        assert_eq!(view.segment_bytes(&segs[1]).unwrap(), b"dt");
    }

    #[test]
    fn rejects_bad_headers() {
        let good = build_test_image(0, &[]);
        assert!(elf32_view(&good).is_ok());

        assert_eq!(elf32_view(&good[..10]).err(), Some(ElfError::TooShort));

        let mut bad = good.clone();
        bad[1] = b'X';
        assert_eq!(elf32_view(&bad).err(), Some(ElfError::BadMagic));

        let mut bad = good.clone();
        bad[4] = 2;
        assert_eq!(elf32_view(&bad).err(), Some(ElfError::BadClass));

        let mut bad = good.clone();
        bad[5] = 2;
        assert_eq!(elf32_view(&bad).err(), Some(ElfError::BadEncoding));

        let mut bad = good;
        bad[18] = 62;
        assert_eq!(elf32_view(&bad).err(), Some(ElfError::BadMachine));
    }

    #[test]
    fn program_headers_must_fit() {
        let mut img = build_test_image(0, &[(0x1000, 4, &b"abcd"[..])]);
        img.truncate(EH_SIZE + 8);
        assert_eq!(elf32_view(&img).err(), Some(ElfError::OutOfBounds));
    }

    #[test]
    fn segment_past_end_is_rejected() {
        let mut img = build_test_image(0, &[(0x1000, 4, &b"abcd"[..])]);
        img.truncate(img.len() - 1);
        let view = elf32_view(&img).unwrap();
        let ph = view.iter_pt_load().next().unwrap();
        assert_eq!(view.segment_bytes(&ph).err(), Some(ElfError::OutOfBounds));
    }
}
