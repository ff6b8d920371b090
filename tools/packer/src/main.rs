//! Packs a host directory into an initial ramdisk image.
//!
//! ```text
//! packer [--label=NAME] <source-dir> <image>
//! ```

use packer_abi::LABEL_LEN;
use packer_abi::builder::{Node, build_image};
use std::path::Path;
use std::{env, fs, io};

fn main() -> io::Result<()> {
    let mut args: Vec<String> = env::args().skip(1).collect();
    let label = match args.first().and_then(|a| a.strip_prefix("--label=")) {
        Some(label) => {
            let label = label.to_owned();
            args.remove(0);
            label
        }
        None => String::new(),
    };
    if label.len() > LABEL_LEN {
        return Err(invalid("label is too long"));
    }
    let [source, target] = args.as_slice() else {
        eprintln!("usage: packer [--label=NAME] <source-dir> <image>");
        return Err(invalid("expected a source directory and a target image"));
    };

    let tree = read_tree(Path::new(source))?;
    let image = build_image(&label, &tree);
    fs::write(target, &image)?;
    eprintln!("packed {} into {target} ({} bytes)", source, image.len());
    Ok(())
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.to_owned())
}

/// Regular files and directories below `dir`, sorted by name. Symlinks and
/// special files are skipped.
fn read_tree(dir: &Path) -> io::Result<Vec<Node>> {
    let mut nodes = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry
            .file_name()
            .into_string()
            .map_err(|_| invalid("file name is not UTF-8"))?;
        let kind = entry.file_type()?;
        if kind.is_file() {
            nodes.push(Node::File {
                name,
                data: fs::read(entry.path())?,
            });
        } else if kind.is_dir() {
            nodes.push(Node::Dir {
                name,
                children: read_tree(&entry.path())?,
            });
        } else {
            eprintln!("note: skipping {}", entry.path().display());
        }
    }
    nodes.sort_by(|a, b| a.name().cmp(b.name()));
    Ok(nodes)
}
