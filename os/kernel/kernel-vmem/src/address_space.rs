//! # Address Space (x86-64, PML4-rooted)
//!
//! Helpers to build and manipulate a **single** virtual address space, i.e.
//! the tree rooted at one PML4 frame.
//!
//! ## Highlights
//!
//! - [`AddressSpace::map_4k`] allocates missing intermediate tables and undoes
//!   them again if the mapping cannot be completed.
//! - [`AddressSpace::map_2m`] / [`AddressSpace::map_1g`] install large leaves
//!   into *existing* parent tables and never allocate.
//! - [`AddressSpace::unmap`] removes whatever leaf covers an address and is
//!   idempotent.
//! - [`AddressSpace::translate`] walks the tree, stopping early at huge leaves.
//! - [`AddressSpace::activate`] loads CR3 with this space's root.
//!
//! ## Design
//!
//! - Intermediate links are always present + writable, and carry `USER` when a
//!   user leaf sits below them. Leaf permissions alone decide access.
//! - Every leaf change is followed by a single-page TLB invalidation through
//!   the [`Mmu`]. Full flushes only happen on root switches.
//! - `unsafe` is confined to turning a table frame into a `&mut PageTable`
//!   through the [`PhysMapper`].

use crate::page_table::{ENTRIES_PER_TABLE, EntryKind, LeafSize, Level, PageTable, PageTableEntry};
use crate::{FrameAlloc, MapError, MappingFlags, Mmu, PhysMapper};
use kernel_info::memory::KERNEL_PML4_FIRST_SLOT;
use kernel_memory_addresses::{
    PageSize, PhysicalAddress, PhysicalPage, Size1G, Size2M, Size4K, VirtualAddress,
};
use log::trace;

/// The PML4 root page of an [`AddressSpace`].
pub type RootPage = PhysicalPage<Size4K>;

/// A leaf mapping found by a walk or removed by [`AddressSpace::unmap`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Leaf {
    /// Virtual base of the whole leaf (aligned to `size`).
    pub va: VirtualAddress,
    /// Physical base of the whole leaf.
    pub base: PhysicalAddress,
    pub size: LeafSize,
    pub flags: MappingFlags,
}

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper, T: Mmu> {
    root: RootPage,
    mapper: &'m M,
    mmu: &'m T,
}

/// Up to three tables created by one `map_4k` call, for rollback.
struct CreatedTables {
    links: [Option<(PhysicalPage<Size4K>, usize, PhysicalPage<Size4K>)>; 3],
    len: usize,
}

impl CreatedTables {
    const fn new() -> Self {
        Self {
            links: [None; 3],
            len: 0,
        }
    }

    const fn push(&mut self, parent: PhysicalPage<Size4K>, index: usize, child: PhysicalPage<Size4K>) {
        self.links[self.len] = Some((parent, index, child));
        self.len += 1;
    }
}

impl<'m, M: PhysMapper, T: Mmu> AddressSpace<'m, M, T> {
    /// Wrap an existing PML4.
    #[inline]
    pub const fn from_root(mapper: &'m M, mmu: &'m T, root: RootPage) -> Self {
        Self { root, mapper, mmu }
    }

    /// View the address space the CPU is currently using.
    #[inline]
    pub fn from_active(mapper: &'m M, mmu: &'m T) -> Self {
        Self::from_root(mapper, mmu, mmu.active_root())
    }

    /// Allocate and zero a fresh, empty PML4.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if no frame is available or the frame cannot
    /// be reached through the mapper.
    pub fn new_empty<A: FrameAlloc + ?Sized>(
        mapper: &'m M,
        mmu: &'m T,
        alloc: &mut A,
    ) -> Result<Self, MapError> {
        let root = alloc.alloc_4k().ok_or(MapError::OutOfMemory)?;
        if mapper.zero_frame(root).is_err() {
            alloc.free_4k(root);
            return Err(MapError::OutOfMemory);
        }
        Ok(Self::from_root(mapper, mmu, root))
    }

    #[inline]
    pub const fn root_page(&self) -> RootPage {
        self.root
    }

    /// Load CR3 with this address space's root.
    ///
    /// # Safety
    /// The higher half must map the running kernel; see [`Mmu::switch_root`].
    #[inline]
    pub unsafe fn activate(&self) {
        // SAFETY: forwarded contract.
        unsafe { self.mmu.switch_root(self.root) }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.mmu.active_root() == self.root
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    fn table(&self, page: PhysicalPage<Size4K>) -> &mut PageTable {
        // SAFETY: every page handed in here is a paging structure owned by this tree.
        unsafe { self.mapper.phys_to_mut::<PageTable>(page.base()) }
    }

    fn check_canonical(va: VirtualAddress) -> Result<(), MapError> {
        if va.is_canonical() {
            Ok(())
        } else {
            Err(MapError::NonCanonical(va))
        }
    }

    /// Walk down to the leaf covering `va`, if any.
    #[must_use]
    pub fn leaf(&self, va: VirtualAddress) -> Option<Leaf> {
        if !va.is_canonical() {
            return None;
        }
        let mut table = self.root;
        for level in [Level::Pml4, Level::Pdpt, Level::Pd, Level::Pt] {
            let entry = self.table(table).get(level.index_of(va));
            match entry.kind(level) {
                EntryKind::Absent => return None,
                EntryKind::Table(next) => table = next,
                EntryKind::Leaf { base, size } => {
                    return Some(Leaf {
                        va: VirtualAddress::new(kernel_memory_addresses::align_down(
                            va.as_u64(),
                            size.bytes(),
                        )),
                        base,
                        size,
                        flags: entry.mapping_flags(),
                    });
                }
            }
        }
        None
    }

    /// Translate `va` to the physical address it currently maps to.
    ///
    /// Handles 1 GiB and 2 MiB leaves by adding the in-page offset.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.leaf(va)
            .map(|leaf| leaf.base + (va.as_u64() & (leaf.size.bytes() - 1)))
    }

    #[inline]
    #[must_use]
    pub fn is_mapped(&self, va: VirtualAddress) -> bool {
        self.leaf(va).is_some()
    }

    /// Map one 4 KiB page `va → pa`.
    ///
    /// Missing PDPT/PD/PT tables are allocated from `alloc` and zeroed. If the
    /// call fails after creating some of them (target already mapped, a huge
    /// leaf in the way, or allocation failure further down) every table created
    /// by this call is unlinked and freed again. Existing links only gain the
    /// `USER` bit once the leaf is actually written.
    ///
    /// # Errors
    /// - [`MapError::UnalignedVirtual`] / [`MapError::UnalignedPhysical`]
    /// - [`MapError::NonCanonical`]
    /// - [`MapError::AlreadyMapped`] if any leaf already covers `va`
    /// - [`MapError::OutOfMemory`] if an intermediate table cannot be allocated
    pub fn map_4k<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: MappingFlags,
    ) -> Result<(), MapError> {
        if !va.is_aligned::<Size4K>() {
            return Err(MapError::UnalignedVirtual(va));
        }
        if !pa.is_aligned::<Size4K>() {
            return Err(MapError::UnalignedPhysical(pa));
        }
        Self::check_canonical(va)?;

        let user = flags.contains(MappingFlags::USER);
        let mut created = CreatedTables::new();
        let mut table = self.root;

        for level in [Level::Pml4, Level::Pdpt, Level::Pd] {
            let index = level.index_of(va);
            let entry = self.table(table).get(index);
            table = match entry.kind(level) {
                EntryKind::Table(next) => next,
                EntryKind::Leaf { .. } => {
                    self.rollback(alloc, &created);
                    return Err(MapError::AlreadyMapped(va));
                }
                EntryKind::Absent => {
                    let Some(next) = self.alloc_table(alloc) else {
                        self.rollback(alloc, &created);
                        return Err(MapError::OutOfMemory);
                    };
                    self.table(table)
                        .set(index, PageTableEntry::table_link(next, user));
                    created.push(table, index, next);
                    next
                }
            };
        }

        let pt = self.table(table);
        let index = Level::Pt.index_of(va);
        if pt.get(index).present() {
            self.rollback(alloc, &created);
            return Err(MapError::AlreadyMapped(va));
        }
        if user {
            self.widen_user_links(va, Level::Pt);
        }
        pt.set(index, PageTableEntry::leaf(pa, LeafSize::Size4K, flags));
        self.mmu.invalidate_page(va);
        Ok(())
    }

    /// Map one 2 MiB page into an existing page directory.
    ///
    /// # Errors
    /// - [`MapError::ParentMissing`] if the PDPT or PD for `va` does not exist
    /// - [`MapError::AlreadyMapped`] if the PD slot is in use (leaf or page table)
    /// - alignment / canonical errors as in [`map_4k`](Self::map_4k)
    pub fn map_2m(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: MappingFlags,
    ) -> Result<(), MapError> {
        self.map_large::<Size2M>(Level::Pd, LeafSize::Size2M, va, pa, flags)
    }

    /// Map one 1 GiB page into an existing PDPT.
    ///
    /// # Errors
    /// As [`map_2m`](Self::map_2m), one level up.
    pub fn map_1g(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: MappingFlags,
    ) -> Result<(), MapError> {
        self.map_large::<Size1G>(Level::Pdpt, LeafSize::Size1G, va, pa, flags)
    }

    fn map_large<S: PageSize>(
        &self,
        leaf_level: Level,
        size: LeafSize,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: MappingFlags,
    ) -> Result<(), MapError> {
        if !va.is_aligned::<S>() {
            return Err(MapError::UnalignedVirtual(va));
        }
        if !pa.is_aligned::<S>() {
            return Err(MapError::UnalignedPhysical(pa));
        }
        Self::check_canonical(va)?;

        let parent = self
            .parent_table(va, leaf_level)?
            .ok_or(MapError::ParentMissing(va))?;
        let table = self.table(parent);
        let index = leaf_level.index_of(va);
        if table.get(index).present() {
            return Err(MapError::AlreadyMapped(va));
        }
        if flags.contains(MappingFlags::USER) {
            self.widen_user_links(va, leaf_level);
        }
        table.set(index, PageTableEntry::leaf(pa, size, flags));
        self.mmu.invalidate_page(va);
        Ok(())
    }

    /// The existing table that holds entries of `leaf_level` for `va`.
    ///
    /// `Ok(None)` if a link on the way is absent; `AlreadyMapped` if a huge
    /// leaf above `leaf_level` already covers `va`.
    fn parent_table(
        &self,
        va: VirtualAddress,
        leaf_level: Level,
    ) -> Result<Option<PhysicalPage<Size4K>>, MapError> {
        let mut table = self.root;
        for level in [Level::Pml4, Level::Pdpt, Level::Pd] {
            if level == leaf_level {
                return Ok(Some(table));
            }
            match self.table(table).get(level.index_of(va)).kind(level) {
                EntryKind::Absent => return Ok(None),
                EntryKind::Leaf { .. } => return Err(MapError::AlreadyMapped(va)),
                EntryKind::Table(next) => table = next,
            }
        }
        Ok(Some(table))
    }

    fn widen_user_links(&self, va: VirtualAddress, leaf_level: Level) {
        let mut table = self.root;
        for level in [Level::Pml4, Level::Pdpt, Level::Pd] {
            if level == leaf_level {
                return;
            }
            let index = level.index_of(va);
            let entry = self.table(table).get(index);
            let EntryKind::Table(next) = entry.kind(level) else {
                return;
            };
            if !entry.user() {
                self.table(table).set(index, entry.with_user(true));
            }
            table = next;
        }
    }

    /// Whether a 2 MiB leaf could be installed at the 2 MiB-aligned `va`
    /// without allocating: the page directory exists and its slot is empty.
    #[must_use]
    pub fn can_map_2m(&self, va: VirtualAddress) -> bool {
        if !va.is_aligned::<Size2M>() || !va.is_canonical() {
            return false;
        }
        match self.parent_table(va, Level::Pd) {
            Ok(Some(pd)) => !self.table(pd).get(Level::Pd.index_of(va)).present(),
            _ => false,
        }
    }

    /// Remove the leaf covering `va`, whatever its size.
    ///
    /// Succeeds with `Ok(None)` when nothing is mapped. Intermediate tables are
    /// left in place.
    ///
    /// # Errors
    /// [`MapError::NonCanonical`] for addresses in the non-canonical hole.
    pub fn unmap(&self, va: VirtualAddress) -> Result<Option<Leaf>, MapError> {
        Self::check_canonical(va)?;
        let mut table = self.root;
        for level in [Level::Pml4, Level::Pdpt, Level::Pd, Level::Pt] {
            let index = level.index_of(va);
            let entry = self.table(table).get(index);
            match entry.kind(level) {
                EntryKind::Absent => return Ok(None),
                EntryKind::Table(next) => table = next,
                EntryKind::Leaf { base, size } => {
                    self.table(table).clear(index);
                    let leaf_va = VirtualAddress::new(kernel_memory_addresses::align_down(
                        va.as_u64(),
                        size.bytes(),
                    ));
                    self.mmu.invalidate_page(leaf_va);
                    return Ok(Some(Leaf {
                        va: leaf_va,
                        base,
                        size,
                        flags: entry.mapping_flags(),
                    }));
                }
            }
        }
        Ok(None)
    }

    /// Copy the kernel half (PML4 slots 256..512) from `kernel_root`.
    ///
    /// Both roots then share the same PDPT frames, so kernel mappings made
    /// below those PDPTs are visible in both spaces. Returns whether any slot
    /// changed.
    pub fn copy_kernel_half_from(&self, kernel_root: RootPage) -> bool {
        if kernel_root == self.root {
            return false;
        }
        let src = self.table(kernel_root);
        let dst = self.table(self.root);
        let mut changed = false;
        for index in KERNEL_PML4_FIRST_SLOT..ENTRIES_PER_TABLE {
            let entry = src.get(index);
            if dst.get(index) != entry {
                dst.set(index, entry);
                changed = true;
            }
        }
        changed
    }

    /// Whether the kernel half of this root matches `kernel_root` exactly.
    #[must_use]
    pub fn kernel_half_matches(&self, kernel_root: RootPage) -> bool {
        let src = self.table(kernel_root);
        let dst = self.table(self.root);
        (KERNEL_PML4_FIRST_SLOT..ENTRIES_PER_TABLE).all(|i| src.get(i) == dst.get(i))
    }

    /// Free every PDPT, PD and PT of the user half and clear the PML4 links.
    ///
    /// Leaf frames are **not** freed; whoever mapped them owns them. Returns
    /// the number of table frames released.
    pub fn release_user_tables<A: FrameAlloc + ?Sized>(&self, alloc: &mut A) -> usize {
        let pml4 = self.table(self.root);
        let mut released = 0;
        for i4 in 0..KERNEL_PML4_FIRST_SLOT {
            let EntryKind::Table(pdpt) = pml4.get(i4).kind(Level::Pml4) else {
                continue;
            };
            for (i3, e3) in self.table(pdpt).iter() {
                let EntryKind::Table(pd) = e3.kind(Level::Pdpt) else {
                    continue;
                };
                for (_, e2) in self.table(pd).iter() {
                    if let EntryKind::Table(pt) = e2.kind(Level::Pd) {
                        alloc.free_4k(pt);
                        released += 1;
                    }
                }
                trace!("releasing PD {pd:?} under PDPT slot {i3}");
                alloc.free_4k(pd);
                released += 1;
            }
            alloc.free_4k(pdpt);
            released += 1;
            pml4.clear(i4);
        }
        released
    }

    fn alloc_table<A: FrameAlloc + ?Sized>(&self, alloc: &mut A) -> Option<PhysicalPage<Size4K>> {
        let page = alloc.alloc_4k()?;
        if self.mapper.zero_frame(page).is_err() {
            alloc.free_4k(page);
            return None;
        }
        Some(page)
    }

    fn rollback<A: FrameAlloc + ?Sized>(&self, alloc: &mut A, created: &CreatedTables) {
        for (parent, index, child) in created.links[..created.len].iter().rev().flatten() {
            trace!("rolling back page table {child:?}");
            self.table(*parent).clear(*index);
            alloc.free_4k(*child);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{BumpFrames, SimMmu, SimulatedRam};

    const RAM_FRAMES: u64 = 64;

    struct Fixture {
        ram: SimulatedRam,
        mmu: SimMmu,
        frames: BumpFrames,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                ram: SimulatedRam::with_frames(RAM_FRAMES),
                mmu: SimMmu::new(),
                // Frames 32.. back page tables; 0..32 play data pages.
                frames: BumpFrames::new(
                    PhysicalAddress::new(32 * 4096),
                    PhysicalAddress::new(RAM_FRAMES * 4096),
                ),
            }
        }
    }

    #[test]
    fn map_then_translate_returns_base_plus_offset() {
        let mut f = Fixture::new();
        let space = AddressSpace::new_empty(&f.ram, &f.mmu, &mut f.frames).unwrap();
        let va = VirtualAddress::new(0xFFFF_8000_0000_0000);
        let pa = PhysicalAddress::new(0x3000);

        space.map_4k(&mut f.frames, va, pa, MappingFlags::KERNEL_DATA).unwrap();

        assert_eq!(space.translate(va + 0x123), Some(pa + 0x123));
        assert_eq!(f.frames.outstanding(), 4, "root plus PDPT, PD and PT");
        assert_eq!(f.mmu.last_invalidated(), va);
        let leaf = space.leaf(va).unwrap();
        assert_eq!(leaf.size, LeafSize::Size4K);
        assert_eq!(leaf.flags, MappingFlags::KERNEL_DATA);
    }

    #[test]
    fn unmap_makes_translate_fail_and_is_idempotent() {
        let mut f = Fixture::new();
        let space = AddressSpace::new_empty(&f.ram, &f.mmu, &mut f.frames).unwrap();
        let va = VirtualAddress::new(0x40_0000);
        space
            .map_4k(&mut f.frames, va, PhysicalAddress::new(0x5000), MappingFlags::USER_DATA)
            .unwrap();

        let removed = space.unmap(va).unwrap().unwrap();
        assert_eq!(removed.base, PhysicalAddress::new(0x5000));
        assert_eq!(space.translate(va), None);
        assert_eq!(space.unmap(va), Ok(None));
    }

    #[test]
    fn double_map_fails_and_keeps_first_mapping() {
        let mut f = Fixture::new();
        let space = AddressSpace::new_empty(&f.ram, &f.mmu, &mut f.frames).unwrap();
        let va = VirtualAddress::new(0x7000_0000);
        space
            .map_4k(&mut f.frames, va, PhysicalAddress::new(0x1000), MappingFlags::WRITABLE)
            .unwrap();
        let before = f.frames.outstanding();

        let err = space
            .map_4k(&mut f.frames, va, PhysicalAddress::new(0x2000), MappingFlags::WRITABLE)
            .unwrap_err();

        assert_eq!(err, MapError::AlreadyMapped(va));
        assert_eq!(space.translate(va), Some(PhysicalAddress::new(0x1000)));
        assert_eq!(f.frames.outstanding(), before);
    }

    #[test]
    fn huge_leaf_in_the_way_is_already_mapped() {
        let mut f = Fixture::new();
        let space = AddressSpace::new_empty(&f.ram, &f.mmu, &mut f.frames).unwrap();
        let pd_area = VirtualAddress::new(0x8000_0000);
        // A 2 MiB leaf needs an existing PD; create it through a 4K mapping next door.
        space
            .map_4k(&mut f.frames, pd_area + 0x20_0000, PhysicalAddress::new(0x1000), MappingFlags::WRITABLE)
            .unwrap();
        space
            .map_2m(pd_area, PhysicalAddress::new(0x40_0000), MappingFlags::WRITABLE)
            .unwrap();
        let before = f.frames.outstanding();

        let err = space
            .map_4k(&mut f.frames, pd_area + 0x1000, PhysicalAddress::new(0x2000), MappingFlags::WRITABLE)
            .unwrap_err();
        assert_eq!(err, MapError::AlreadyMapped(pd_area + 0x1000));
        assert_eq!(f.frames.outstanding(), before);
    }

    #[test]
    fn out_of_memory_rolls_back_partial_chain() {
        let ram = SimulatedRam::with_frames(8);
        let mmu = SimMmu::new();
        // Root plus exactly one more frame: PDPT succeeds, PD fails.
        let mut frames = BumpFrames::new(PhysicalAddress::new(0x6000), PhysicalAddress::new(0x8000));
        let space = AddressSpace::new_empty(&ram, &mmu, &mut frames).unwrap();

        let err = space
            .map_4k(&mut frames, VirtualAddress::new(0x1000), PhysicalAddress::new(0), MappingFlags::empty())
            .unwrap_err();

        assert_eq!(err, MapError::OutOfMemory);
        assert_eq!(frames.outstanding(), 1);
        assert!(ram.frame_is_zero(space.root_page().base()));
    }

    #[test]
    fn map_2m_requires_existing_parent() {
        let mut f = Fixture::new();
        let space = AddressSpace::new_empty(&f.ram, &f.mmu, &mut f.frames).unwrap();
        let va = VirtualAddress::new(0x4000_0000);
        assert!(!space.can_map_2m(va));
        assert_eq!(
            space.map_2m(va, PhysicalAddress::new(0x20_0000), MappingFlags::WRITABLE),
            Err(MapError::ParentMissing(va))
        );
    }

    #[test]
    fn map_2m_translates_with_large_offset() {
        let mut f = Fixture::new();
        let space = AddressSpace::new_empty(&f.ram, &f.mmu, &mut f.frames).unwrap();
        let va = VirtualAddress::new(0x4000_0000);
        space
            .map_4k(&mut f.frames, va + 0x40_0000, PhysicalAddress::new(0x1000), MappingFlags::WRITABLE)
            .unwrap();
        assert!(space.can_map_2m(va));

        space
            .map_2m(va, PhysicalAddress::new(0x20_0000), MappingFlags::WRITABLE)
            .unwrap();

        assert_eq!(space.translate(va + 0x1_2345), Some(PhysicalAddress::new(0x21_2345)));
        assert!(!space.can_map_2m(va));
        let removed = space.unmap(va + 0x1_0000).unwrap().unwrap();
        assert_eq!(removed.size, LeafSize::Size2M);
        assert_eq!(removed.va, va);
    }

    #[test]
    fn map_1g_and_unaligned_rejections() {
        let mut f = Fixture::new();
        let space = AddressSpace::new_empty(&f.ram, &f.mmu, &mut f.frames).unwrap();
        let va = VirtualAddress::new(0x80_0000_0000);
        space
            .map_4k(&mut f.frames, va + 0x4000_0000, PhysicalAddress::new(0x1000), MappingFlags::WRITABLE)
            .unwrap();
        space
            .map_1g(va, PhysicalAddress::new(0x4000_0000), MappingFlags::WRITABLE)
            .unwrap();
        assert_eq!(space.translate(va + 0x10), Some(PhysicalAddress::new(0x4000_0010)));

        assert_eq!(
            space.map_1g(va + 0x1000, PhysicalAddress::new(0), MappingFlags::WRITABLE),
            Err(MapError::UnalignedVirtual(va + 0x1000))
        );
        assert_eq!(
            space.map_4k(&mut f.frames, VirtualAddress::new(0x1000), PhysicalAddress::new(0x10), MappingFlags::WRITABLE),
            Err(MapError::UnalignedPhysical(PhysicalAddress::new(0x10)))
        );
        let hole = VirtualAddress::new(0x0000_8000_0000_0000);
        assert_eq!(space.unmap(hole), Err(MapError::NonCanonical(hole)));
    }

    #[test]
    fn user_mapping_widens_links() {
        let mut f = Fixture::new();
        let space = AddressSpace::new_empty(&f.ram, &f.mmu, &mut f.frames).unwrap();
        let kernel_va = VirtualAddress::new(0x10_0000);
        space
            .map_4k(&mut f.frames, kernel_va, PhysicalAddress::new(0x1000), MappingFlags::WRITABLE)
            .unwrap();
        space
            .map_4k(&mut f.frames, kernel_va + 0x1000, PhysicalAddress::new(0x2000), MappingFlags::USER_DATA)
            .unwrap();

        let pml4 = space.table(space.root_page());
        assert!(pml4.get(0).user());
        assert!(!space.leaf(kernel_va).unwrap().flags.contains(MappingFlags::USER));
    }

    #[test]
    fn failed_user_mapping_leaves_links_untouched() {
        let mut f = Fixture::new();
        let space = AddressSpace::new_empty(&f.ram, &f.mmu, &mut f.frames).unwrap();
        let va = VirtualAddress::new(0x10_0000);
        space
            .map_4k(&mut f.frames, va, PhysicalAddress::new(0x1000), MappingFlags::WRITABLE)
            .unwrap();

        assert_eq!(
            space.map_4k(&mut f.frames, va, PhysicalAddress::new(0x2000), MappingFlags::USER_DATA),
            Err(MapError::AlreadyMapped(va))
        );

        let pml4 = space.table(space.root_page());
        assert!(!pml4.get(0).user());
        let EntryKind::Table(pdpt) = pml4.get(0).kind(Level::Pml4) else {
            panic!("PDPT link missing");
        };
        assert!(!space.table(pdpt).get(0).user());
    }

    #[test]
    fn active_space_follows_the_mmu() {
        let mut f = Fixture::new();
        let space = AddressSpace::new_empty(&f.ram, &f.mmu, &mut f.frames).unwrap();
        // SAFETY: simulated MMU.
        unsafe { space.activate() };
        let active = AddressSpace::from_active(&f.ram, &f.mmu);
        assert_eq!(active.root_page(), space.root_page());
        assert!(active.is_active());
    }

    #[test]
    fn kernel_half_copy_and_user_release() {
        let mut f = Fixture::new();
        let kernel = AddressSpace::new_empty(&f.ram, &f.mmu, &mut f.frames).unwrap();
        let kva = VirtualAddress::new(0xFFFF_FFFF_9000_0000);
        kernel
            .map_4k(&mut f.frames, kva, PhysicalAddress::new(0x1000), MappingFlags::KERNEL_DATA)
            .unwrap();

        let process = AddressSpace::new_empty(&f.ram, &f.mmu, &mut f.frames).unwrap();
        assert!(process.copy_kernel_half_from(kernel.root_page()));
        assert!(process.kernel_half_matches(kernel.root_page()));
        assert!(!process.copy_kernel_half_from(kernel.root_page()));
        assert_eq!(process.translate(kva), Some(PhysicalAddress::new(0x1000)));

        let before = f.frames.outstanding();
        process
            .map_4k(&mut f.frames, VirtualAddress::new(0x40_0000), PhysicalAddress::new(0x2000), MappingFlags::USER_DATA)
            .unwrap();
        assert_eq!(f.frames.outstanding(), before + 3);

        assert_eq!(process.release_user_tables(&mut f.frames), 3);
        assert_eq!(f.frames.outstanding(), before);
        assert_eq!(process.translate(VirtualAddress::new(0x40_0000)), None);
        assert_eq!(process.translate(kva), Some(PhysicalAddress::new(0x1000)));
    }

    #[test]
    fn activate_switches_root() {
        let mut f = Fixture::new();
        let space = AddressSpace::new_empty(&f.ram, &f.mmu, &mut f.frames).unwrap();
        assert!(!space.is_active());
        // SAFETY: simulated MMU.
        unsafe { space.activate() };
        assert!(space.is_active());
        assert_eq!(f.mmu.switches(), 1);
    }
}
