//! Image writer used by the `packer` tool.

use crate::{ENTRY_SIZE, Entry, EntryType, HEADER_SIZE, Header, LABEL_LEN, SIGNATURE, VERSION};

/// A file tree to pack.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Node {
    File { name: String, data: Vec<u8> },
    Dir { name: String, children: Vec<Node> },
}

impl Node {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::File { name, .. } | Self::Dir { name, .. } => name,
        }
    }
}

/// Serialize `root`'s children into an image labelled `label` (at most
/// [`LABEL_LEN`] bytes are kept).
///
/// Entries are written depth first. A directory record is followed by its
/// children; its sibling link skips over all of them.
#[must_use]
pub fn build_image(label: &str, children: &[Node]) -> Vec<u8> {
    let mut out = vec![0; HEADER_SIZE];
    let root_offset = HEADER_SIZE as u32;
    let first_child = root_offset + ENTRY_SIZE as u32;
    out.extend_from_slice(&[0; ENTRY_SIZE]);
    let body = write_children(&mut out, children);

    let root = Entry {
        name: b"",
        offset: root_offset,
        kind: EntryType::Directory,
        next_entry: 0,
        target_entry: first_child,
        size: body,
    };
    out[HEADER_SIZE..HEADER_SIZE + ENTRY_SIZE].copy_from_slice(&root.to_bytes());

    let mut label_bytes = [0; LABEL_LEN];
    let n = label.len().min(LABEL_LEN);
    label_bytes[..n].copy_from_slice(&label.as_bytes()[..n]);
    let header = Header {
        signature: SIGNATURE,
        version: VERSION,
        label: label_bytes,
        size: first_child + body,
        root_entry: root_offset,
    };
    out[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
    out
}

/// Append `nodes` as a sibling chain; returns the bytes written.
#[allow(clippy::cast_possible_truncation)]
fn write_children(out: &mut Vec<u8>, nodes: &[Node]) -> u32 {
    let mut written = 0;
    for (i, node) in nodes.iter().enumerate() {
        let offset = out.len() as u32;
        out.extend_from_slice(&[0; ENTRY_SIZE]);

        let (kind, body, target, size) = match node {
            Node::File { data, .. } => {
                out.extend_from_slice(data);
                (EntryType::File, data.len() as u32, 0, data.len() as u32)
            }
            Node::Dir { children, .. } => {
                let body = write_children(out, children);
                let target = if body == 0 { 0 } else { offset + ENTRY_SIZE as u32 };
                (EntryType::Directory, body, target, body)
            }
        };

        let is_last = i + 1 == nodes.len();
        let entry = Entry {
            name: node.name().as_bytes(),
            offset,
            kind,
            next_entry: if is_last { 0 } else { offset + ENTRY_SIZE as u32 + body },
            target_entry: target,
            size,
        };
        let at = offset as usize;
        out[at..at + ENTRY_SIZE].copy_from_slice(&entry.to_bytes());
        written += ENTRY_SIZE as u32 + body;
    }
    written
}

#[cfg(all(test, feature = "reader"))]
mod tests {
    use super::*;
    use crate::reader::Filesystem;

    fn file(name: &str, data: &[u8]) -> Node {
        Node::File {
            name: name.into(),
            data: data.to_vec(),
        }
    }

    #[test]
    fn built_image_reads_back() {
        let tree = vec![
            file(".initrd_test", b"optimizedfish"),
            Node::Dir {
                name: "bin".into(),
                children: vec![file("init", b"\x7fELF"), file("sh", b"#!")],
            },
            Node::Dir {
                name: "empty".into(),
                children: vec![],
            },
            file("z", b"last"),
        ];
        let image = build_image("ramdisk", &tree);
        let fs = Filesystem::parse(&image).unwrap();
        assert_eq!(fs.header().size as usize, image.len());
        assert_eq!(fs.header().label(), b"ramdisk");

        let root = fs.root().unwrap();
        let names: Vec<_> = fs.children(root).map(|e| e.name).collect();
        assert_eq!(names, [&b".initrd_test"[..], b"bin", b"empty", b"z"]);

        let test = fs.find_entry(b".initrd_test").unwrap();
        assert_eq!(fs.file_content(test, false), Some(&b"optimizedfish"[..]));
        let sh = fs.open(b"/bin/sh", root).unwrap();
        assert_eq!(fs.file_content(sh, false), Some(&b"#!"[..]));
        let empty = fs.find_entry(b"empty").unwrap();
        assert_eq!(empty.target_entry, 0);
        assert_eq!(fs.children(empty).count(), 0);
        assert_eq!(fs.file_content(fs.find_entry(b"z").unwrap(), false), Some(&b"last"[..]));
    }
}
