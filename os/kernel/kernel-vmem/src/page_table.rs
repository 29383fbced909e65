//! # Page-Table Entries and Tables
//!
//! One entry layout serves all four levels; the *level* an entry is read at
//! decides whether `huge` (PS) is meaningful and what a present entry means.
//!
//! | Bits      | Field             | Meaning |
//! |-----------|-------------------|----------|
//! | 0         | `present`         | Valid entry if set |
//! | 1         | `writable`        | Writable if set |
//! | 2         | `user`            | User-mode accessible if set |
//! | 3         | `write_through`   | Write-through caching |
//! | 4         | `cache_disable`   | Disable caching |
//! | 5         | `accessed`        | Set by the CPU on access |
//! | 6         | `dirty`           | Set by the CPU on write (leaf only) |
//! | 7         | `huge`            | PS: PDPT/PD entry maps 1 GiB / 2 MiB directly |
//! | 8         | `global`          | Survives CR3 reloads (leaf only) |
//! | 9–11      | `os_low`          | Free for OS use |
//! | 12–51     | `frame`           | Physical frame number |
//! | 52–58     | `os_high`         | Free for OS use |
//! | 59–62     | `protection_key`  | PKU |
//! | 63        | `no_execute`      | Execute disable |

use crate::flags::MappingFlags;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{
    PageSize, PhysicalAddress, PhysicalPage, Size1G, Size2M, Size4K, VirtualAddress,
};

/// Number of entries per table at every level.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Raw 64-bit x86-64 paging-structure entry.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub huge: bool,
    pub global: bool,
    #[bits(3)]
    pub os_low: u8,
    #[bits(40)]
    pub frame: u64,
    #[bits(7)]
    pub os_high: u8,
    #[bits(4)]
    pub protection_key: u8,
    pub no_execute: bool,
}

/// Granule of a leaf mapping.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LeafSize {
    Size4K,
    Size2M,
    Size1G,
}

impl LeafSize {
    #[inline]
    #[must_use]
    pub const fn bytes(self) -> u64 {
        match self {
            Self::Size4K => Size4K::SIZE,
            Self::Size2M => Size2M::SIZE,
            Self::Size1G => Size1G::SIZE,
        }
    }
}

/// Paging-structure level, top to bottom.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Level {
    Pml4,
    Pdpt,
    Pd,
    Pt,
}

impl Level {
    /// Bit position of this level's 9-bit index inside a virtual address.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Pml4 => 39,
            Self::Pdpt => 30,
            Self::Pd => 21,
            Self::Pt => 12,
        }
    }

    #[inline]
    #[must_use]
    pub const fn index_of(self, va: VirtualAddress) -> usize {
        va.table_index(self.shift())
    }

    /// Size a leaf at this level would map, if leaves are legal here.
    #[inline]
    #[must_use]
    pub const fn leaf_size(self) -> Option<LeafSize> {
        match self {
            Self::Pml4 => None,
            Self::Pdpt => Some(LeafSize::Size1G),
            Self::Pd => Some(LeafSize::Size2M),
            Self::Pt => Some(LeafSize::Size4K),
        }
    }
}

/// Decoded meaning of an entry at a given level.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EntryKind {
    Absent,
    /// Points at the next-level table.
    Table(PhysicalPage<Size4K>),
    /// Terminates the walk.
    Leaf { base: PhysicalAddress, size: LeafSize },
}

impl PageTableEntry {
    /// Link to a next-level table. Links are always writable so leaf flags
    /// alone decide permissions; `user` must be set for user-reachable leaves.
    #[inline]
    #[must_use]
    pub const fn table_link(table: PhysicalPage<Size4K>, user: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(user)
            .with_frame(table.frame_number())
    }

    /// Leaf mapping of `base` at `size` with the given permissions.
    #[must_use]
    pub fn leaf(base: PhysicalAddress, size: LeafSize, flags: MappingFlags) -> Self {
        Self::new()
            .with_present(true)
            .with_huge(!matches!(size, LeafSize::Size4K))
            .with_frame(base.frame_number())
            .with_writable(flags.contains(MappingFlags::WRITABLE))
            .with_user(flags.contains(MappingFlags::USER))
            .with_write_through(flags.contains(MappingFlags::WRITE_THROUGH))
            .with_cache_disable(flags.contains(MappingFlags::NO_CACHE))
            .with_global(flags.contains(MappingFlags::GLOBAL))
            .with_no_execute(flags.contains(MappingFlags::NO_EXECUTE))
    }

    #[inline]
    #[must_use]
    pub const fn address(self) -> PhysicalAddress {
        PhysicalAddress::from_frame_number(self.frame())
    }

    /// Interpret the entry as read at `level`.
    #[must_use]
    pub const fn kind(self, level: Level) -> EntryKind {
        if !self.present() {
            return EntryKind::Absent;
        }
        let leaf = match level {
            Level::Pml4 => None,
            Level::Pdpt | Level::Pd if !self.huge() => None,
            _ => level.leaf_size(),
        };
        match leaf {
            // Mask the PAT bit that shares bit 12 with the frame in large leaves.
            Some(size) => EntryKind::Leaf {
                base: PhysicalAddress::new(kernel_memory_addresses::align_down(
                    self.address().as_u64(),
                    size.bytes(),
                )),
                size,
            },
            None => EntryKind::Table(PhysicalPage::from_addr(self.address())),
        }
    }

    /// Permission bits of a leaf entry.
    #[must_use]
    pub fn mapping_flags(self) -> MappingFlags {
        let mut flags = MappingFlags::empty();
        flags.set(MappingFlags::WRITABLE, self.writable());
        flags.set(MappingFlags::USER, self.user());
        flags.set(MappingFlags::WRITE_THROUGH, self.write_through());
        flags.set(MappingFlags::NO_CACHE, self.cache_disable());
        flags.set(MappingFlags::GLOBAL, self.global());
        flags.set(MappingFlags::NO_EXECUTE, self.no_execute());
        flags
    }
}

/// One 4 KiB paging structure at any level.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    #[inline]
    #[must_use]
    pub const fn get(&self, index: usize) -> PageTableEntry {
        self.entries[index]
    }

    #[inline]
    pub const fn set(&mut self, index: usize, entry: PageTableEntry) {
        self.entries[index] = entry;
    }

    #[inline]
    pub const fn clear(&mut self, index: usize) {
        self.entries[index] = PageTableEntry::new();
    }

    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::new());
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, PageTableEntry)> + '_ {
        self.entries.iter().copied().enumerate()
    }

    /// Whether no entry is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.present())
    }
}
