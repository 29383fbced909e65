//! Process address spaces by slot.
//!
//! A [`ProcessId`] is the index of the slot holding its [`ProcessDirectory`],
//! so ids come back in use as soon as a directory is removed.

use crate::vma::RegionList;
use core::fmt;
use kernel_vmem::RootPage;

/// Process slots available for address spaces.
pub const MAX_PROCESSES: usize = 64;

/// Identifies a process address space. Ids are slot numbers and are reused
/// once the address space is destroyed.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProcessId(u16);

impl ProcessId {
    #[inline]
    #[must_use]
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    #[inline]
    const fn slot(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}", self.0)
    }
}

/// A process's top-level page table and its regions.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ProcessDirectory {
    pub pid: ProcessId,
    pub root: RootPage,
    /// Holders of this address space; shared after a fork-like retain.
    pub ref_count: u32,
    pub regions: RegionList,
}

/// Fixed table of live process address spaces.
pub struct ProcessTable {
    slots: [Option<ProcessDirectory>; MAX_PROCESSES],
    live: usize,
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [None; MAX_PROCESSES],
            live: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.live
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Whether another directory can be inserted.
    #[must_use]
    pub fn has_room(&self) -> bool {
        self.live < MAX_PROCESSES
    }

    /// Store a new directory for `root` in the lowest free slot.
    pub fn insert(&mut self, root: RootPage) -> Option<ProcessId> {
        let slot = self.slots.iter().position(Option::is_none)?;
        #[allow(clippy::cast_possible_truncation)]
        let pid = ProcessId::new(slot as u16);
        self.slots[slot] = Some(ProcessDirectory {
            pid,
            root,
            ref_count: 1,
            regions: RegionList::new(),
        });
        self.live += 1;
        Some(pid)
    }

    #[must_use]
    pub fn get(&self, pid: ProcessId) -> Option<&ProcessDirectory> {
        self.slots.get(pid.slot())?.as_ref()
    }

    pub fn get_mut(&mut self, pid: ProcessId) -> Option<&mut ProcessDirectory> {
        self.slots.get_mut(pid.slot())?.as_mut()
    }

    pub fn remove(&mut self, pid: ProcessId) -> Option<ProcessDirectory> {
        let directory = self.slots.get_mut(pid.slot())?.take()?;
        self.live -= 1;
        Some(directory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::PhysicalAddress;

    fn root(frame: u64) -> RootPage {
        PhysicalAddress::from_frame_number(frame).page()
    }

    #[test]
    fn slots_are_reused_lowest_first() {
        let mut table = ProcessTable::new();
        let a = table.insert(root(1)).unwrap();
        let b = table.insert(root(2)).unwrap();
        assert_eq!((a.as_u16(), b.as_u16()), (0, 1));

        assert_eq!(table.remove(a).map(|d| d.root), Some(root(1)));
        assert_eq!(table.remove(a), None);
        assert_eq!(table.insert(root(3)), Some(a));
        assert_eq!(table.get(a).unwrap().root, root(3));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn full_table_rejects_inserts() {
        let mut table = ProcessTable::new();
        for frame in 0..MAX_PROCESSES as u64 {
            table.insert(root(frame)).unwrap();
        }
        assert!(!table.has_room());
        assert_eq!(table.insert(root(999)), None);
        assert!(table.get(ProcessId::new(MAX_PROCESSES as u16)).is_none());
    }
}
