//! # Initial ramdisk image format
//!
//! A flat, little-endian, packed image: a [`Header`] followed by entries.
//! Every entry is an [`ENTRY_SIZE`]-byte record; a file's bytes follow its
//! record directly, a directory's children follow its record.
//!
//! ```text
//! 0      ┌──────────────────────────────┐
//!        │ Header (27 bytes)            │  root_entry ──┐
//! 27     ├──────────────────────────────┤               │
//!        │ Entry "" (root directory)    │◄──────────────┘
//!        │   target_entry ──┐           │
//! 302    ├──────────────────▼───────────┤
//!        │ Entry "init" (file)          │  next_entry ──┐
//!        │ ... file bytes ...           │               │
//!        ├──────────────────────────────┤               │
//!        │ Entry "etc" (directory)      │◄──────────────┘
//!        │ ...                          │
//! ```
//!
//! Offsets in entries are absolute from the start of the image; `0` means
//! "none" for `next_entry` and `target_entry`.

#![cfg_attr(not(any(test, doctest, feature = "builder")), no_std)]

#[cfg(feature = "builder")]
pub mod builder;
#[cfg(feature = "reader")]
pub mod reader;

use thiserror::Error;

pub const SIGNATURE: u16 = 0xF3F5;
pub const VERSION: u8 = 1;
pub const LABEL_LEN: usize = 16;
pub const NAME_LEN: usize = 256;
pub const HEADER_SIZE: usize = 27;
pub const ENTRY_SIZE: usize = 275;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum VfsError {
    #[error("image is shorter than its header")]
    TooShort,
    #[error("bad image signature {0:#06x}")]
    BadSignature(u16),
    #[error("unsupported image version {0}")]
    UnsupportedVersion(u8),
    #[error("image size {0} is invalid")]
    BadSize(u32),
    #[error("entry at {0:#x} lies outside the image")]
    OutOfBounds(u32),
    #[error("unknown entry type {0}")]
    BadEntryType(u8),
    #[error("link chain does not end")]
    LinkLoop,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EntryType {
    File = 0,
    Directory = 1,
    Link = 2,
}

impl TryFrom<u8> for EntryType {
    type Error = VfsError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::File),
            1 => Ok(Self::Directory),
            2 => Ok(Self::Link),
            other => Err(VfsError::BadEntryType(other)),
        }
    }
}

#[inline]
fn le16(b: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([b[at], b[at + 1]])
}

#[inline]
fn le32(b: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

/// Bytes up to (not including) the first NUL.
fn until_nul(b: &[u8]) -> &[u8] {
    b.iter().position(|&c| c == 0).map_or(b, |n| &b[..n])
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Header {
    pub signature: u16,
    pub version: u8,
    pub label: [u8; LABEL_LEN],
    /// Total image size in bytes.
    pub size: u32,
    pub root_entry: u32,
}

impl Header {
    /// Decode and validate the header at the start of `image`.
    ///
    /// # Errors
    /// Rejects short images, a wrong signature or version, and a size that
    /// does not even cover the header.
    pub fn parse(image: &[u8]) -> Result<Self, VfsError> {
        let b = image.get(..HEADER_SIZE).ok_or(VfsError::TooShort)?;
        let mut label = [0; LABEL_LEN];
        label.copy_from_slice(&b[3..3 + LABEL_LEN]);
        let header = Self {
            signature: le16(b, 0),
            version: b[2],
            label,
            size: le32(b, 19),
            root_entry: le32(b, 23),
        };

        if header.signature != SIGNATURE {
            return Err(VfsError::BadSignature(header.signature));
        }
        if header.version != VERSION {
            return Err(VfsError::UnsupportedVersion(header.version));
        }
        if (header.size as usize) < HEADER_SIZE {
            return Err(VfsError::BadSize(header.size));
        }
        Ok(header)
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut b = [0; HEADER_SIZE];
        b[0..2].copy_from_slice(&self.signature.to_le_bytes());
        b[2] = self.version;
        b[3..19].copy_from_slice(&self.label);
        b[19..23].copy_from_slice(&self.size.to_le_bytes());
        b[23..27].copy_from_slice(&self.root_entry.to_le_bytes());
        b
    }

    /// The label without trailing NULs.
    #[must_use]
    pub fn label(&self) -> &[u8] {
        until_nul(&self.label)
    }
}

/// One decoded entry record.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Entry<'a> {
    pub name: &'a [u8],
    /// Offset of this record in the image.
    pub offset: u32,
    pub kind: EntryType,
    /// Next sibling, `0` for the last one.
    pub next_entry: u32,
    /// First child of a directory, or the target of a link.
    pub target_entry: u32,
    /// Content length of a file.
    pub size: u32,
}

impl<'a> Entry<'a> {
    /// Decode the record at `offset`.
    ///
    /// # Errors
    /// Fails when the record does not fit in `image` or has an unknown type.
    pub fn parse(image: &'a [u8], offset: u32) -> Result<Self, VfsError> {
        let start = offset as usize;
        let b = start
            .checked_add(ENTRY_SIZE)
            .and_then(|end| image.get(start..end))
            .ok_or(VfsError::OutOfBounds(offset))?;
        Ok(Self {
            name: until_nul(&b[1..=NAME_LEN]),
            offset: le32(b, 257),
            kind: EntryType::try_from(b[261])?,
            next_entry: le32(b, 263),
            target_entry: le32(b, 267),
            size: le32(b, 271),
        })
    }

    #[must_use]
    pub const fn is_dir(&self) -> bool {
        matches!(self.kind, EntryType::Directory)
    }

    #[must_use]
    pub const fn is_file(&self) -> bool {
        matches!(self.kind, EntryType::File)
    }

    /// Encode a record. Names longer than 255 bytes are cut.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; ENTRY_SIZE] {
        let mut b = [0; ENTRY_SIZE];
        let n = self.name.len().min(NAME_LEN - 1);
        b[1..=n].copy_from_slice(&self.name[..n]);
        b[257..261].copy_from_slice(&self.offset.to_le_bytes());
        b[261] = self.kind as u8;
        b[263..267].copy_from_slice(&self.next_entry.to_le_bytes());
        b[267..271].copy_from_slice(&self.target_entry.to_le_bytes());
        b[271..275].copy_from_slice(&self.size.to_le_bytes());
        b
    }
}
