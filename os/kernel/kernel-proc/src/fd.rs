//! Per-process file descriptor tables.
//!
//! A descriptor is a number, a shared handle to the open file and the
//! process's own position in it. Forked children copy the table; the
//! underlying file is closed when the last descriptor naming it goes away.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

/// Behaviour of an open file.
pub trait FileOps: Send + Sync {
    /// Read from `pos` into `buf`; returns the number of bytes read.
    fn read(&self, pos: u32, buf: &mut [u8]) -> usize;

    /// Write `buf` at `pos`; returns the number of bytes written.
    fn write(&self, pos: u32, buf: &[u8]) -> usize;

    /// Called once, when the last descriptor referring to the file is dropped.
    fn close(&self) {}
}

#[derive(Clone)]
pub struct FileDescriptor {
    pub fd: u32,
    pub file: Arc<dyn FileOps>,
    pub position: u32,
    pub length: u32,
}

impl fmt::Debug for FileDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileDescriptor")
            .field("fd", &self.fd)
            .field("position", &self.position)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

impl FileDescriptor {
    /// Read at the current position and advance it.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = self.file.read(self.position, buf);
        self.position = self.position.saturating_add(u32::try_from(n).unwrap_or(u32::MAX));
        n
    }

    /// Write at the current position and advance it.
    pub fn write(&mut self, buf: &[u8]) -> usize {
        let n = self.file.write(self.position, buf);
        self.position = self.position.saturating_add(u32::try_from(n).unwrap_or(u32::MAX));
        self.length = self.length.max(self.position);
        n
    }
}

#[derive(Debug, Clone, Default)]
pub struct FdTable {
    entries: Vec<FileDescriptor>,
    /// Highest number handed out so far.
    current: u32,
}

impl FdTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            current: 0,
        }
    }

    /// Install `file` under the next free number. Numbers start at 1 and are
    /// never reused.
    pub fn add(&mut self, file: Arc<dyn FileOps>, length: u32) -> u32 {
        self.current += 1;
        self.entries.push(FileDescriptor {
            fd: self.current,
            file,
            position: 0,
            length,
        });
        self.current
    }

    #[must_use]
    pub fn get(&self, fd: u32) -> Option<&FileDescriptor> {
        self.entries.iter().find(|d| d.fd == fd)
    }

    pub fn get_mut(&mut self, fd: u32) -> Option<&mut FileDescriptor> {
        self.entries.iter_mut().find(|d| d.fd == fd)
    }

    /// Make `to` refer to the same file and position as `from`, replacing
    /// whatever `to` was. Returns `false` if `from` is not open.
    pub fn clone_fd(&mut self, from: u32, to: u32) -> bool {
        let Some(mut copy) = self.get(from).cloned() else {
            return false;
        };
        copy.fd = to;
        if let Some(old) = self.entries.iter().position(|d| d.fd == to) {
            let old = core::mem::replace(&mut self.entries[old], copy);
            Self::release(old);
        } else {
            self.entries.push(copy);
        }
        self.current = self.current.max(to);
        true
    }

    /// Drop one descriptor.
    pub fn close(&mut self, fd: u32) -> bool {
        let Some(at) = self.entries.iter().position(|d| d.fd == fd) else {
            return false;
        };
        Self::release(self.entries.remove(at));
        true
    }

    /// Drop every descriptor.
    pub fn close_all(&mut self) {
        for d in self.entries.drain(..) {
            Self::release(d);
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub const fn current(&self) -> u32 {
        self.current
    }

    fn release(d: FileDescriptor) {
        if Arc::strong_count(&d.file) == 1 {
            d.file.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        closed: Arc<AtomicUsize>,
    }

    fn counting() -> (Arc<dyn FileOps>, Arc<AtomicUsize>) {
        let closed = Arc::new(AtomicUsize::new(0));
        let file = Arc::new(Counting {
            closed: closed.clone(),
        });
        (file, closed)
    }

    impl FileOps for Counting {
        fn read(&self, pos: u32, buf: &mut [u8]) -> usize {
            let n = buf.len().min(4);
            buf[..n].fill(pos as u8);
            n
        }

        fn write(&self, _pos: u32, buf: &[u8]) -> usize {
            buf.len()
        }

        fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn numbers_start_at_one_and_grow() {
        let (file, _) = counting();
        let mut t = FdTable::new();
        assert_eq!(t.add(file.clone(), 0), 1);
        assert_eq!(t.add(file.clone(), 0), 2);
        assert!(t.close(1));
        assert_eq!(t.add(file, 0), 3);
    }

    #[test]
    fn clone_fd_bumps_counter() {
        let (file, _) = counting();
        let mut t = FdTable::new();
        let a = t.add(file, 10);
        assert!(t.clone_fd(a, 7));
        assert_eq!(t.get(7).map(|d| d.length), Some(10));
        assert_eq!(t.add(counting().0, 0), 8);
        assert!(!t.clone_fd(42, 9));
    }

    #[test]
    fn position_advances() {
        let mut t = FdTable::new();
        let fd = t.add(counting().0, 0);
        let d = t.get_mut(fd).unwrap();
        let mut buf = [0; 8];
        assert_eq!(d.read(&mut buf), 4);
        assert_eq!(d.write(&[1, 2, 3]), 3);
        assert_eq!(d.position, 7);
        assert_eq!(d.length, 7);
    }

    #[test]
    fn file_closed_with_last_descriptor() {
        let (file, closed) = counting();
        let mut parent = FdTable::new();
        parent.add(file, 0);
        let mut child = parent.clone();

        child.close_all();
        assert_eq!(closed.load(Ordering::SeqCst), 0);
        parent.close_all();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(parent.is_empty());
    }

    #[test]
    fn replacing_target_of_clone_fd_closes_it() {
        let (a, _) = counting();
        let (b, b_closed) = counting();
        let mut t = FdTable::new();
        let fa = t.add(a, 0);
        let fb = t.add(b, 0);
        assert!(t.clone_fd(fa, fb));
        assert_eq!(b_closed.load(Ordering::SeqCst), 1);
        assert_eq!(t.len(), 2);
    }
}
