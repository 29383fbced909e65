//! # Virtual memory areas
//!
//! A [`Vma`] describes one contiguous range of a process's user address space
//! and how faults inside it are served. Descriptors live in a fixed-capacity
//! [`VmaPool`] whose storage comes from the kernel heap; each process threads
//! its own [`RegionList`] through the pool by slot index, sorted by start
//! address and free of overlaps.

use crate::process::ProcessId;
use core::ptr::NonNull;
use kernel_memory_addresses::{PageSize, Size4K, VirtualAddress};
use kernel_vmem::MappingFlags;

bitflags::bitflags! {
    /// Access rights and behaviour of a region.
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct VmaFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const USER = 1 << 3;
        const SHARED = 1 << 4;
        const GROWS_DOWN = 1 << 5;
        const LOCKED = 1 << 6;
    }
}

impl VmaFlags {
    /// Leaf permissions for pages of a region with these flags.
    #[must_use]
    pub fn mapping_flags(self) -> MappingFlags {
        let mut flags = MappingFlags::empty();
        if self.contains(Self::WRITE) {
            flags |= MappingFlags::WRITABLE;
        }
        if self.contains(Self::USER) {
            flags |= MappingFlags::USER;
        }
        if !self.contains(Self::EXEC) {
            flags |= MappingFlags::NO_EXECUTE;
        }
        flags
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum VmaKind {
    Code,
    Data,
    Heap,
    Stack,
    Shared,
    Device,
    Anonymous,
}

/// How pages of a region come into existence.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultPolicy {
    /// Mapped on first touch; contents undefined.
    Demand,
    /// Mapped and zeroed when the region is created.
    Prefault,
    /// Mapped on first touch and zeroed.
    ZeroFill,
}

impl FaultPolicy {
    #[inline]
    #[must_use]
    pub const fn zero_fills(self) -> bool {
        matches!(self, Self::Prefault | Self::ZeroFill)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Vma {
    pub start: VirtualAddress,
    /// Exclusive.
    pub end: VirtualAddress,
    pub flags: VmaFlags,
    pub kind: VmaKind,
    pub policy: FaultPolicy,
    pub owner: ProcessId,
    pub ref_count: u32,
}

impl Vma {
    #[inline]
    #[must_use]
    pub fn contains(&self, va: VirtualAddress) -> bool {
        self.start <= va && va < self.end
    }

    #[inline]
    #[must_use]
    pub fn overlaps(&self, start: VirtualAddress, end: VirtualAddress) -> bool {
        self.start < end && start < self.end
    }

    /// Whether `[start, end)` lies entirely inside this region.
    #[inline]
    #[must_use]
    pub fn covers(&self, start: VirtualAddress, end: VirtualAddress) -> bool {
        self.start <= start && end <= self.end
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.as_u64() - self.start.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    #[must_use]
    pub const fn pages(&self) -> u64 {
        self.len() / Size4K::SIZE
    }
}

/// Slot index into a [`VmaPool`].
pub type VmaIndex = u16;

const NO_VMA: VmaIndex = VmaIndex::MAX;

struct VmaSlot {
    vma: Option<Vma>,
    next: VmaIndex,
}

/// Fixed-capacity storage for region descriptors.
pub struct VmaPool {
    slots: NonNull<VmaSlot>,
    capacity: u16,
    free_head: VmaIndex,
    in_use: u16,
}

// SAFETY: the pool exclusively owns its slot storage.
unsafe impl Send for VmaPool {}

impl VmaPool {
    /// Most descriptors a pool can hold.
    pub const MAX_CAPACITY: u16 = NO_VMA - 1;

    /// Bytes of storage for `capacity` descriptors.
    #[inline]
    #[must_use]
    pub const fn storage_bytes(capacity: u16) -> usize {
        capacity as usize * size_of::<VmaSlot>()
    }

    /// Alignment the storage must have.
    #[inline]
    #[must_use]
    pub const fn storage_align() -> usize {
        align_of::<VmaSlot>()
    }

    /// Build an empty pool in `storage`.
    ///
    /// # Safety
    /// `storage` must point at [`storage_bytes(capacity)`](Self::storage_bytes)
    /// writable bytes aligned to [`storage_align`](Self::storage_align), owned
    /// by the pool for its lifetime.
    #[must_use]
    pub unsafe fn new(storage: NonNull<u8>, capacity: u16) -> Self {
        let capacity = capacity.min(Self::MAX_CAPACITY);
        let slots = storage.cast::<VmaSlot>();
        for index in 0..capacity {
            let next = if index + 1 == capacity { NO_VMA } else { index + 1 };
            // SAFETY: in bounds per the caller's contract.
            unsafe { slots.add(index as usize).write(VmaSlot { vma: None, next }) };
        }
        Self {
            slots,
            capacity,
            free_head: if capacity == 0 { NO_VMA } else { 0 },
            in_use: 0,
        }
    }

    /// A pool without storage; every [`alloc`](Self::alloc) fails.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            slots: NonNull::dangling(),
            capacity: 0,
            free_head: NO_VMA,
            in_use: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> u16 {
        self.capacity
    }

    #[inline]
    #[must_use]
    pub const fn in_use(&self) -> u16 {
        self.in_use
    }

    fn slot(&self, index: VmaIndex) -> &VmaSlot {
        assert!(index < self.capacity, "VMA index {index} out of range");
        // SAFETY: bounds checked, initialized in `new`.
        unsafe { self.slots.add(index as usize).as_ref() }
    }

    fn slot_mut(&mut self, index: VmaIndex) -> &mut VmaSlot {
        assert!(index < self.capacity, "VMA index {index} out of range");
        // SAFETY: as above, exclusive through `&mut self`.
        unsafe { self.slots.add(index as usize).as_mut() }
    }

    /// Store `vma` in a free slot. `None` when the pool is full.
    pub fn alloc(&mut self, vma: Vma) -> Option<VmaIndex> {
        let index = self.free_head;
        if index == NO_VMA {
            return None;
        }
        let slot = self.slot_mut(index);
        let next = slot.next;
        slot.vma = Some(vma);
        slot.next = NO_VMA;
        self.free_head = next;
        self.in_use += 1;
        Some(index)
    }

    /// Return a slot to the pool, handing back its descriptor.
    pub fn release(&mut self, index: VmaIndex) -> Option<Vma> {
        let head = self.free_head;
        let slot = self.slot_mut(index);
        let vma = slot.vma.take()?;
        slot.next = head;
        self.free_head = index;
        self.in_use -= 1;
        Some(vma)
    }

    #[must_use]
    pub fn get(&self, index: VmaIndex) -> Option<&Vma> {
        self.slot(index).vma.as_ref()
    }
}

/// One process's regions, sorted by start address.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RegionList {
    head: VmaIndex,
    len: u16,
}

impl Default for RegionList {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionList {
    #[must_use]
    pub const fn new() -> Self {
        Self { head: NO_VMA, len: 0 }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> u16 {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter<'p>(&self, pool: &'p VmaPool) -> RegionIter<'p> {
        RegionIter {
            pool,
            current: self.head,
        }
    }

    /// The region containing `va`.
    #[must_use]
    pub fn find(&self, pool: &VmaPool, va: VirtualAddress) -> Option<VmaIndex> {
        self.iter(pool)
            .take_while(|(_, vma)| vma.start <= va)
            .find(|(_, vma)| vma.contains(va))
            .map(|(index, _)| index)
    }

    /// The region starting exactly at `start`.
    #[must_use]
    pub fn find_start(&self, pool: &VmaPool, start: VirtualAddress) -> Option<VmaIndex> {
        self.iter(pool)
            .find(|(_, vma)| vma.start == start)
            .map(|(index, _)| index)
    }

    #[must_use]
    pub fn overlaps(&self, pool: &VmaPool, start: VirtualAddress, end: VirtualAddress) -> bool {
        self.iter(pool).any(|(_, vma)| vma.overlaps(start, end))
    }

    /// Lowest page-aligned start `>= floor` where `size` bytes fit below `ceiling`.
    #[must_use]
    pub fn first_gap(
        &self,
        pool: &VmaPool,
        size: u64,
        floor: VirtualAddress,
        ceiling: VirtualAddress,
    ) -> Option<VirtualAddress> {
        let mut candidate = floor.align_up::<Size4K>()?;
        for (_, vma) in self.iter(pool) {
            if vma.end <= candidate {
                continue;
            }
            if candidate.checked_add(size)? <= vma.start {
                break;
            }
            candidate = vma.end;
        }
        (candidate.checked_add(size)? <= ceiling).then_some(candidate)
    }

    /// Link `index` in start-address order. Overlap must be ruled out first.
    pub fn insert(&mut self, pool: &mut VmaPool, index: VmaIndex) {
        let Some(start) = pool.get(index).map(|vma| vma.start) else {
            return;
        };
        let mut prev = NO_VMA;
        let mut current = self.head;
        while current != NO_VMA {
            match pool.get(current) {
                Some(vma) if vma.start < start => {
                    prev = current;
                    current = pool.slot(current).next;
                }
                _ => break,
            }
        }
        pool.slot_mut(index).next = current;
        if prev == NO_VMA {
            self.head = index;
        } else {
            pool.slot_mut(prev).next = index;
        }
        self.len += 1;
    }

    /// Unlink `index`. Returns `false` if it was not on this list.
    pub fn remove(&mut self, pool: &mut VmaPool, index: VmaIndex) -> bool {
        let mut prev = NO_VMA;
        let mut current = self.head;
        while current != NO_VMA {
            let next = pool.slot(current).next;
            if current == index {
                if prev == NO_VMA {
                    self.head = next;
                } else {
                    pool.slot_mut(prev).next = next;
                }
                pool.slot_mut(index).next = NO_VMA;
                self.len -= 1;
                return true;
            }
            prev = current;
            current = next;
        }
        false
    }

    /// Unlink and return the first region.
    pub fn pop_front(&mut self, pool: &mut VmaPool) -> Option<VmaIndex> {
        let head = self.head;
        (head != NO_VMA && self.remove(pool, head)).then_some(head)
    }
}

pub struct RegionIter<'p> {
    pool: &'p VmaPool,
    current: VmaIndex,
}

impl<'p> Iterator for RegionIter<'p> {
    type Item = (VmaIndex, &'p Vma);

    fn next(&mut self) -> Option<Self::Item> {
        if self.current == NO_VMA {
            return None;
        }
        let index = self.current;
        let slot = self.pool.slot(index);
        self.current = slot.next;
        slot.vma.as_ref().map(|vma| (index, vma))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PoolStorage {
        _bytes: Vec<u128>,
        ptr: NonNull<u8>,
    }

    impl PoolStorage {
        fn new(capacity: u16) -> Self {
            let words = VmaPool::storage_bytes(capacity).div_ceil(16);
            let mut bytes = vec![0u128; words.max(1)];
            let ptr = NonNull::new(bytes.as_mut_ptr()).unwrap().cast();
            Self { _bytes: bytes, ptr }
        }

        fn pool(&self, capacity: u16) -> VmaPool {
            // SAFETY: sized and aligned for `capacity` slots, outlives the pool.
            unsafe { VmaPool::new(self.ptr, capacity) }
        }
    }

    fn vma(start: u64, end: u64) -> Vma {
        Vma {
            start: VirtualAddress::new(start),
            end: VirtualAddress::new(end),
            flags: VmaFlags::READ | VmaFlags::USER,
            kind: VmaKind::Anonymous,
            policy: FaultPolicy::Demand,
            owner: ProcessId::new(0),
            ref_count: 1,
        }
    }

    fn starts(list: &RegionList, pool: &VmaPool) -> Vec<u64> {
        list.iter(pool).map(|(_, v)| v.start.as_u64()).collect()
    }

    #[test]
    fn insert_keeps_regions_sorted() {
        let storage = PoolStorage::new(8);
        let mut pool = storage.pool(8);
        let mut list = RegionList::new();
        for (s, e) in [(0x5000, 0x6000), (0x1000, 0x2000), (0x3000, 0x4000)] {
            let index = pool.alloc(vma(s, e)).unwrap();
            list.insert(&mut pool, index);
        }
        assert_eq!(starts(&list, &pool), [0x1000, 0x3000, 0x5000]);
        assert_eq!(list.len(), 3);
        assert_eq!(pool.in_use(), 3);
    }

    #[test]
    fn lookups() {
        let storage = PoolStorage::new(4);
        let mut pool = storage.pool(4);
        let mut list = RegionList::new();
        let a = pool.alloc(vma(0x1000, 0x3000)).unwrap();
        list.insert(&mut pool, a);

        assert_eq!(list.find(&pool, VirtualAddress::new(0x2fff)), Some(a));
        assert_eq!(list.find(&pool, VirtualAddress::new(0x3000)), None);
        assert_eq!(list.find_start(&pool, VirtualAddress::new(0x1000)), Some(a));
        assert!(list.overlaps(&pool, VirtualAddress::new(0x2000), VirtualAddress::new(0x4000)));
        assert!(!list.overlaps(&pool, VirtualAddress::new(0x3000), VirtualAddress::new(0x4000)));
    }

    #[test]
    fn first_gap_skips_occupied_ranges() {
        let storage = PoolStorage::new(4);
        let mut pool = storage.pool(4);
        let mut list = RegionList::new();
        for (s, e) in [(0x1000, 0x3000), (0x4000, 0x5000)] {
            let index = pool.alloc(vma(s, e)).unwrap();
            list.insert(&mut pool, index);
        }
        let floor = VirtualAddress::new(0x1000);
        let ceiling = VirtualAddress::new(0x10000);
        assert_eq!(list.first_gap(&pool, 0x1000, floor, ceiling), Some(VirtualAddress::new(0x3000)));
        assert_eq!(list.first_gap(&pool, 0x2000, floor, ceiling), Some(VirtualAddress::new(0x5000)));
        assert_eq!(list.first_gap(&pool, 0x10000, floor, ceiling), None);
    }

    #[test]
    fn pool_exhaustion_and_reuse() {
        let storage = PoolStorage::new(2);
        let mut pool = storage.pool(2);
        let a = pool.alloc(vma(0x1000, 0x2000)).unwrap();
        let _b = pool.alloc(vma(0x2000, 0x3000)).unwrap();
        assert_eq!(pool.alloc(vma(0x3000, 0x4000)), None);

        assert_eq!(pool.release(a).map(|v| v.start.as_u64()), Some(0x1000));
        assert_eq!(pool.release(a), None);
        assert_eq!(pool.alloc(vma(0x3000, 0x4000)), Some(a));
    }

    #[test]
    fn remove_and_pop_front() {
        let storage = PoolStorage::new(4);
        let mut pool = storage.pool(4);
        let mut list = RegionList::new();
        let mut indices = Vec::new();
        for (s, e) in [(0x1000, 0x2000), (0x2000, 0x3000), (0x3000, 0x4000)] {
            let index = pool.alloc(vma(s, e)).unwrap();
            list.insert(&mut pool, index);
            indices.push(index);
        }
        assert!(list.remove(&mut pool, indices[1]));
        assert!(!list.remove(&mut pool, indices[1]));
        assert_eq!(starts(&list, &pool), [0x1000, 0x3000]);
        assert_eq!(list.pop_front(&mut pool), Some(indices[0]));
        assert_eq!(list.pop_front(&mut pool), Some(indices[2]));
        assert_eq!(list.pop_front(&mut pool), None);
        assert!(list.is_empty());
    }

    #[test]
    fn flags_translate_to_leaf_permissions() {
        let code = VmaFlags::READ | VmaFlags::EXEC | VmaFlags::USER;
        assert_eq!(code.mapping_flags(), MappingFlags::USER);
        let data = VmaFlags::READ | VmaFlags::WRITE | VmaFlags::USER;
        assert_eq!(
            data.mapping_flags(),
            MappingFlags::USER | MappingFlags::WRITABLE | MappingFlags::NO_EXECUTE
        );
    }
}
