use crate::{ENTRY_SIZE, Entry, EntryType, Header, VfsError};

/// Link chains longer than this are treated as loops.
const MAX_LINK_DEPTH: usize = 32;

/// A parsed image borrowed from memory (the initrd module).
#[derive(Debug, Clone, Copy)]
pub struct Filesystem<'a> {
    header: Header,
    data: &'a [u8],
}

impl<'a> Filesystem<'a> {
    /// # Errors
    /// See [`Header::parse`]. The image is cut to the size its header claims
    /// and must be at least that long.
    pub fn parse(data: &'a [u8]) -> Result<Self, VfsError> {
        let header = Header::parse(data)?;
        let data = data
            .get(..header.size as usize)
            .ok_or(VfsError::BadSize(header.size))?;
        Ok(Self { header, data })
    }

    #[must_use]
    pub const fn header(&self) -> &Header {
        &self.header
    }

    /// # Errors
    /// Fails when the record at `offset` is truncated or malformed.
    pub fn entry_at(&self, offset: u32) -> Result<Entry<'a>, VfsError> {
        Entry::parse(self.data, offset)
    }

    /// # Errors
    /// Fails when the root record is truncated or malformed.
    pub fn root(&self) -> Result<Entry<'a>, VfsError> {
        self.entry_at(self.header.root_entry)
    }

    /// The target of `entry` if it is a link, otherwise `entry` itself.
    ///
    /// # Errors
    /// Fails when the link target is not a valid record.
    pub fn follow_link(&self, entry: Entry<'a>) -> Result<Entry<'a>, VfsError> {
        match entry.kind {
            EntryType::Link => self.entry_at(entry.target_entry),
            _ => Ok(entry),
        }
    }

    /// Follow links until a file or directory is reached.
    ///
    /// # Errors
    /// Fails on invalid targets and on chains that look like loops.
    pub fn follow_links(&self, mut entry: Entry<'a>) -> Result<Entry<'a>, VfsError> {
        for _ in 0..MAX_LINK_DEPTH {
            if entry.kind != EntryType::Link {
                return Ok(entry);
            }
            entry = self.entry_at(entry.target_entry)?;
        }
        Err(VfsError::LinkLoop)
    }

    /// Children of a directory (after following links). Empty for files.
    #[must_use]
    pub fn children(&self, dir: Entry<'a>) -> Children<'a> {
        let next = match self.follow_links(dir) {
            Ok(dir) if dir.is_dir() => dir.target_entry,
            _ => 0,
        };
        Children {
            fs: *self,
            next,
            remaining: self.data.len() / ENTRY_SIZE + 1,
        }
    }

    /// Look up `name` among the children of `dir`.
    #[must_use]
    pub fn find_entry_in(&self, dir: Entry<'a>, name: &[u8]) -> Option<Entry<'a>> {
        self.children(dir).find(|e| e.name == name)
    }

    /// Look up `name` in the root directory.
    #[must_use]
    pub fn find_entry(&self, name: &[u8]) -> Option<Entry<'a>> {
        self.find_entry_in(self.root().ok()?, name)
    }

    /// Resolve a `/`-separated path. Absolute paths start at the root,
    /// relative ones at `cwd`. Empty components are skipped.
    #[must_use]
    pub fn open(&self, path: &[u8], cwd: Entry<'a>) -> Option<Entry<'a>> {
        let start = if path.first() == Some(&b'/') {
            self.root().ok()?
        } else {
            cwd
        };
        path.split(|&c| c == b'/')
            .filter(|c| !c.is_empty())
            .try_fold(start, |dir, name| self.find_entry_in(dir, name))
    }

    /// The bytes of a file.
    ///
    /// With `follow_links` unset, a link entry yields its own (empty) body.
    #[must_use]
    pub fn file_content(&self, entry: Entry<'a>, follow_links: bool) -> Option<&'a [u8]> {
        let entry = if follow_links {
            self.follow_links(entry).ok()?
        } else {
            entry
        };
        let start = (entry.offset as usize).checked_add(ENTRY_SIZE)?;
        let end = start.checked_add(entry.size as usize)?;
        self.data.get(start..end)
    }
}

/// Walks a sibling chain. Stops early on malformed records and on chains
/// longer than the image could hold.
pub struct Children<'a> {
    fs: Filesystem<'a>,
    next: u32,
    remaining: usize,
}

impl<'a> Iterator for Children<'a> {
    type Item = Entry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == 0 || self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let entry = self.fs.entry_at(self.next).ok()?;
        self.next = entry.next_entry;
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HEADER_SIZE, LABEL_LEN, SIGNATURE, VERSION};

    /// Hand-assembled image:
    ///
    /// ```text
    /// /            (root)
    ///   hello      "hi there"
    ///   bin/
    ///     init     "ELF"
    ///   shell -> bin/init
    /// ```
    fn image() -> Vec<u8> {
        let root = HEADER_SIZE as u32;
        let hello = root + ENTRY_SIZE as u32;
        let bin = hello + ENTRY_SIZE as u32 + 8;
        let init = bin + ENTRY_SIZE as u32;
        let shell = init + ENTRY_SIZE as u32 + 3;
        let end = shell + ENTRY_SIZE as u32;

        let entry = |name: &'static [u8], offset, kind, next_entry, target_entry, size| Entry {
            name,
            offset,
            kind,
            next_entry,
            target_entry,
            size,
        };

        let mut out = Header {
            signature: SIGNATURE,
            version: VERSION,
            label: [b'x'; LABEL_LEN],
            size: end,
            root_entry: root,
        }
        .to_bytes()
        .to_vec();
        out.extend(entry(b"", root, EntryType::Directory, 0, hello, 0).to_bytes());
        out.extend(entry(b"hello", hello, EntryType::File, bin, 0, 8).to_bytes());
        out.extend(b"hi there");
        out.extend(entry(b"bin", bin, EntryType::Directory, shell, init, 0).to_bytes());
        out.extend(entry(b"init", init, EntryType::File, 0, 0, 3).to_bytes());
        out.extend(b"ELF");
        out.extend(entry(b"shell", shell, EntryType::Link, 0, init, 0).to_bytes());
        out
    }

    #[test]
    fn finds_root_entries_and_content() {
        let data = image();
        let fs = Filesystem::parse(&data).unwrap();
        let hello = fs.find_entry(b"hello").unwrap();
        assert_eq!(fs.file_content(hello, false), Some(&b"hi there"[..]));
        assert!(fs.find_entry(b"init").is_none());
        assert_eq!(fs.children(fs.root().unwrap()).count(), 3);
    }

    #[test]
    fn links_resolve_to_their_target() {
        let data = image();
        let fs = Filesystem::parse(&data).unwrap();
        let shell = fs.find_entry(b"shell").unwrap();
        assert_eq!(fs.follow_link(shell).unwrap().name, b"init");
        assert_eq!(fs.file_content(shell, true), Some(&b"ELF"[..]));
        assert_eq!(fs.file_content(shell, false), Some(&b""[..]));
    }

    #[test]
    fn paths_absolute_and_relative() {
        let data = image();
        let fs = Filesystem::parse(&data).unwrap();
        let root = fs.root().unwrap();
        let bin = fs.open(b"/bin", root).unwrap();
        assert_eq!(fs.open(b"init", bin).map(|e| e.name), Some(&b"init"[..]));
        assert_eq!(fs.open(b"//bin//init", bin).map(|e| e.size), Some(3));
        assert!(fs.open(b"/hello/x", root).is_none());
        assert_eq!(fs.open(b"/", bin), Some(root));
    }

    #[test]
    fn link_cycles_are_reported() {
        let mut data = image();
        // Point "shell" at itself.
        let shell = data.len() - ENTRY_SIZE;
        let own = u32::try_from(shell).unwrap().to_le_bytes();
        data[shell + 267..shell + 271].copy_from_slice(&own);
        let fs = Filesystem::parse(&data).unwrap();
        let link = fs.find_entry(b"shell").unwrap();
        assert_eq!(fs.follow_links(link), Err(VfsError::LinkLoop));
        assert_eq!(fs.file_content(link, true), None);
    }

    #[test]
    fn truncated_image_is_rejected() {
        let data = image();
        assert_eq!(
            Filesystem::parse(&data[..data.len() - 1]).err(),
            Some(VfsError::BadSize(data.len() as u32))
        );
    }
}
