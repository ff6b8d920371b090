use crate::process::{Pid, Process};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

#[derive(Debug)]
struct Node {
    process: Process,
    parent: Option<Pid>,
    children: Vec<Pid>,
}

/// Arena of processes keyed by PID, linked into a parent/child tree.
#[derive(Debug, Default)]
pub struct ProcessTree {
    nodes: BTreeMap<Pid, Node>,
    root: Option<Pid>,
}

impl ProcessTree {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            root: None,
        }
    }

    #[must_use]
    pub const fn root(&self) -> Option<Pid> {
        self.root
    }

    /// Install the parentless root. Replaces any previous tree.
    pub fn set_root(&mut self, process: Process) {
        let pid = process.pid;
        self.nodes.clear();
        self.nodes.insert(
            pid,
            Node {
                process,
                parent: None,
                children: Vec::new(),
            },
        );
        self.root = Some(pid);
    }

    /// Insert `process` as the last child of `parent`. Gives the process back
    /// if `parent` is unknown.
    pub fn insert(&mut self, parent: Pid, process: Process) -> Result<(), Process> {
        let Some(node) = self.nodes.get_mut(&parent) else {
            return Err(process);
        };
        let pid = process.pid;
        node.children.push(pid);
        self.nodes.insert(
            pid,
            Node {
                process,
                parent: Some(parent),
                children: Vec::new(),
            },
        );
        Ok(())
    }

    #[must_use]
    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.nodes.get(&pid).map(|n| &n.process)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.nodes.get_mut(&pid).map(|n| &mut n.process)
    }

    #[must_use]
    pub fn parent(&self, pid: Pid) -> Option<Pid> {
        self.nodes.get(&pid)?.parent
    }

    #[must_use]
    pub fn children(&self, pid: Pid) -> &[Pid] {
        self.nodes.get(&pid).map_or(&[], |n| &n.children)
    }

    /// Unlink `pid` and hand its children to its parent. The root cannot be
    /// removed this way.
    pub fn remove_and_merge(&mut self, pid: Pid) -> Option<Process> {
        let parent = self.nodes.get(&pid)?.parent?;
        let node = self.nodes.remove(&pid)?;
        for child in &node.children {
            if let Some(c) = self.nodes.get_mut(child) {
                c.parent = Some(parent);
            }
        }
        if let Some(p) = self.nodes.get_mut(&parent) {
            p.children.retain(|c| *c != pid);
            p.children.extend_from_slice(&node.children);
        }
        Some(node.process)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Process> {
        self.nodes.values().map(|n| &n.process)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> ProcessTree {
        let mut t = ProcessTree::new();
        t.set_root(Process::new(Pid::INIT, "init"));
        t.insert(Pid(0), Process::new(Pid(1), "a")).unwrap();
        t.insert(Pid(1), Process::new(Pid(2), "b")).unwrap();
        t.insert(Pid(1), Process::new(Pid(3), "c")).unwrap();
        t
    }

    #[test]
    fn insert_links_both_ways() {
        let t = tree();
        assert_eq!(t.children(Pid(1)), &[Pid(2), Pid(3)]);
        assert_eq!(t.parent(Pid(3)), Some(Pid(1)));
        assert_eq!(t.get(Pid(2)).map(|p| p.name.as_str()), Some("b"));
        assert_eq!(t.len(), 4);
    }

    #[test]
    fn orphan_insert_is_refused() {
        let mut t = tree();
        let back = t.insert(Pid(9), Process::new(Pid(10), "x")).unwrap_err();
        assert_eq!(back.pid, Pid(10));
        assert!(t.get(Pid(10)).is_none());
    }

    #[test]
    fn removing_reparents_children() {
        let mut t = tree();
        let gone = t.remove_and_merge(Pid(1)).unwrap();
        assert_eq!(gone.pid, Pid(1));
        assert_eq!(t.children(Pid(0)), &[Pid(2), Pid(3)]);
        assert_eq!(t.parent(Pid(2)), Some(Pid(0)));
        assert!(t.get(Pid(1)).is_none());
    }

    #[test]
    fn root_stays() {
        let mut t = tree();
        assert!(t.remove_and_merge(Pid::INIT).is_none());
        assert_eq!(t.root(), Some(Pid::INIT));
    }
}
