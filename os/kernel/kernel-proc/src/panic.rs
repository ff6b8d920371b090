//! Kernel panic support: re-entry tiers, frame-pointer stack walks and the
//! `.funcs` symbol table shipped in the initial ramdisk.
//!
//! The kernel's panic handler asks [`PanicGuard::enter`] what to do:
//!
//! | Entry | [`PanicStage`] | Output |
//! |:------|:---------------|:-------|
//! | 1st   | `First`        | banner, message, stack trace |
//! | 2nd   | `Nested`       | one warning line |
//! | later | `Silent`       | nothing |
//!
//! Every stage ends with interrupts off and the CPU halted.

use core::sync::atomic::{AtomicU8, Ordering};

/// Frames printed in a stack trace.
pub const MAX_FRAMES: usize = 20;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PanicStage {
    First,
    Nested,
    Silent,
}

pub struct PanicGuard {
    entries: AtomicU8,
}

impl PanicGuard {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: AtomicU8::new(0),
        }
    }

    /// Record one more entry into the panic path.
    pub fn enter(&self) -> PanicStage {
        let previous = self
            .entries
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_add(1))
            })
            .unwrap_or(u8::MAX);
        match previous {
            0 => PanicStage::First,
            1 => PanicStage::Nested,
            _ => PanicStage::Silent,
        }
    }
}

impl Default for PanicGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Return addresses along a chain of saved frame pointers.
///
/// Each frame is `[ebp] = caller's ebp`, `[ebp + 4] = return address`. The
/// walk stops at a null or non-increasing frame pointer, when `read` fails,
/// or after [`MAX_FRAMES`] frames.
pub fn walk_frames<R: Fn(u32) -> Option<u32>>(ebp: u32, read: R) -> FrameWalk<R> {
    FrameWalk {
        ebp,
        read,
        left: MAX_FRAMES,
    }
}

pub struct FrameWalk<R> {
    ebp: u32,
    read: R,
    left: usize,
}

impl<R: Fn(u32) -> Option<u32>> Iterator for FrameWalk<R> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.ebp == 0 || self.left == 0 {
            return None;
        }
        self.left -= 1;
        let eip = (self.read)(self.ebp.checked_add(4)?)?;
        let next = (self.read)(self.ebp).unwrap_or(0);
        self.ebp = if next > self.ebp { next } else { 0 };
        Some(eip)
    }
}

/// One function's address range.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Symbol<'a> {
    pub name: &'a str,
    pub start: u32,
    /// One past the last byte.
    pub end: u32,
}

/// The `.funcs` table: records of `len: u16` (record size including this
/// field), `start: u32`, `end: u32` and a NUL-terminated name. A zero
/// length ends the table.
#[derive(Debug, Copy, Clone)]
pub struct FuncTable<'a> {
    data: &'a [u8],
}

impl<'a> FuncTable<'a> {
    #[must_use]
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    #[must_use]
    pub const fn iter(&self) -> FuncIter<'a> {
        FuncIter {
            data: self.data,
            at: 0,
        }
    }

    /// The function containing `addr`.
    #[must_use]
    pub fn lookup(&self, addr: u32) -> Option<Symbol<'a>> {
        self.iter().find(|s| (s.start..s.end).contains(&addr))
    }
}

pub struct FuncIter<'a> {
    data: &'a [u8],
    at: usize,
}

impl<'a> Iterator for FuncIter<'a> {
    type Item = Symbol<'a>;

    fn next(&mut self) -> Option<Symbol<'a>> {
        let rec = self.data.get(self.at..)?;
        let len = usize::from(u16::from_le_bytes([*rec.first()?, *rec.get(1)?]));
        if len < 11 {
            return None;
        }
        let rec = rec.get(..len)?;
        let start = u32::from_le_bytes([rec[2], rec[3], rec[4], rec[5]]);
        let end = u32::from_le_bytes([rec[6], rec[7], rec[8], rec[9]]);
        let name = &rec[10..len - 1];
        self.at += len;
        Some(Symbol {
            name: core::str::from_utf8(name).unwrap_or("?"),
            start,
            end,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeMap;
    use alloc::vec::Vec;

    fn table(funcs: &[(&str, u32, u32)]) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, start, end) in funcs {
            let len = u16::try_from(11 + name.len()).unwrap();
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(&start.to_le_bytes());
            out.extend_from_slice(&end.to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            out.push(0);
        }
        out.extend_from_slice(&[0, 0]);
        out
    }

    #[test]
    fn tiers() {
        let guard = PanicGuard::new();
        assert_eq!(guard.enter(), PanicStage::First);
        assert_eq!(guard.enter(), PanicStage::Nested);
        for _ in 0..300 {
            assert_eq!(guard.enter(), PanicStage::Silent);
        }
    }

    #[test]
    fn symbol_lookup() {
        let data = table(&[
            ("kmain", 0x10_0000, 0x10_0100),
            ("panic", 0x10_0100, 0x10_0180),
        ]);
        let funcs = FuncTable::new(&data);
        assert_eq!(funcs.iter().count(), 2);
        assert_eq!(funcs.lookup(0x10_0120).map(|s| s.name), Some("panic"));
        assert_eq!(funcs.lookup(0x10_0000).map(|s| s.name), Some("kmain"));
        assert!(funcs.lookup(0x10_0180).is_none());
    }

    #[test]
    fn truncated_table_stops() {
        let mut data = table(&[("a", 0, 4), ("bb", 4, 8)]);
        data.truncate(14);
        assert_eq!(FuncTable::new(&data).iter().count(), 1);
    }

    #[test]
    fn walks_ebp_chain() {
        // Three frames: 0x1000 -> 0x1100 -> 0x1200 -> end.
        let mem: BTreeMap<u32, u32> = [
            (0x1000, 0x1100),
            (0x1004, 0xAAAA),
            (0x1100, 0x1200),
            (0x1104, 0xBBBB),
            (0x1200, 0),
            (0x1204, 0xCCCC),
        ]
        .into_iter()
        .collect();
        let eips: Vec<u32> = walk_frames(0x1000, |a| mem.get(&a).copied()).collect();
        assert_eq!(eips, [0xAAAA, 0xBBBB, 0xCCCC]);
    }

    #[test]
    fn walk_stops_on_loops_and_limit() {
        let looped: Vec<u32> =
            walk_frames(0x1000, |a| Some(if a == 0x1000 { 0x1000 } else { 1 })).collect();
        assert_eq!(looped, [1]);

        let endless = walk_frames(0x1000, |a| Some(if a % 8 == 0 { a + 8 } else { 7 }));
        assert_eq!(endless.count(), MAX_FRAMES);
    }
}
