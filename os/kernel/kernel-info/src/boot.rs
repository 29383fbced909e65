//! # Boot Memory Map
//!
//! The memory subsystem consumes a flat list of physical ranges produced by
//! the bootloader together with the offset of the higher-half direct map.

use kernel_memory_addresses::PhysicalAddress;

/// Classification of one boot memory-map entry.
///
/// Only [`Usable`](Self::Usable) memory is ever handed to an allocator; the
/// other kinds are kept for reporting.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemoryRegionKind {
    Usable = 0,
    Reserved = 1,
    AcpiReclaimable = 2,
    AcpiNvs = 3,
    BadMemory = 4,
    BootloaderReclaimable = 5,
    KernelAndModules = 6,
    Framebuffer = 7,
}

impl MemoryRegionKind {
    #[inline]
    #[must_use]
    pub const fn is_usable(self) -> bool {
        matches!(self, Self::Usable)
    }
}

/// One contiguous physical range of a single kind.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryMapEntry {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryRegionKind,
}

impl MemoryMapEntry {
    #[inline]
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: MemoryRegionKind) -> Self {
        Self { base, length, kind }
    }

    #[inline]
    #[must_use]
    pub const fn usable(base: u64, length: u64) -> Self {
        Self::new(base, length, MemoryRegionKind::Usable)
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base)
    }

    /// Exclusive end; saturates instead of wrapping for bogus entries.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base.saturating_add(self.length))
    }
}

/// Borrowed view of the bootloader's memory map.
#[derive(Debug, Copy, Clone)]
pub struct BootMemoryMap<'a> {
    /// Physical ranges, in any order.
    pub entries: &'a [MemoryMapEntry],
    /// Virtual address at which physical address zero is mapped.
    pub hhdm_offset: u64,
}

impl<'a> BootMemoryMap<'a> {
    #[inline]
    #[must_use]
    pub const fn new(entries: &'a [MemoryMapEntry], hhdm_offset: u64) -> Self {
        Self {
            entries,
            hhdm_offset,
        }
    }

    pub fn usable(&self) -> impl Iterator<Item = &'a MemoryMapEntry> + 'a {
        self.entries.iter().filter(|e| e.kind.is_usable())
    }

    /// Exclusive end of the highest usable range.
    #[must_use]
    pub fn highest_usable_end(&self) -> Option<PhysicalAddress> {
        self.usable().map(MemoryMapEntry::end).max()
    }

    /// Total bytes reported as usable.
    #[must_use]
    pub fn usable_bytes(&self) -> u64 {
        self.usable().map(|e| e.length).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usable_summary_ignores_other_kinds() {
        let entries = [
            MemoryMapEntry::usable(0x1000, 0x9F000),
            MemoryMapEntry::new(0xA0000, 0x60000, MemoryRegionKind::Reserved),
            MemoryMapEntry::usable(0x10_0000, 0x7F0_0000),
            MemoryMapEntry::new(0xFD00_0000, 0x100_0000, MemoryRegionKind::Framebuffer),
        ];
        let map = BootMemoryMap::new(&entries, 0);
        assert_eq!(map.usable().count(), 2);
        assert_eq!(map.usable_bytes(), 0x9F000 + 0x7F0_0000);
        assert_eq!(map.highest_usable_end(), Some(PhysicalAddress::new(0x800_0000)));
    }

    #[test]
    fn empty_map_has_no_usable_end() {
        let map = BootMemoryMap::new(&[], 0);
        assert_eq!(map.highest_usable_end(), None);
    }
}
