//! # Physical frame allocator
//!
//! One [`FrameDescriptor`] per 4 KiB frame of physical memory, stored in a
//! flat array that the init code carves out of usable RAM. Free frames are
//! threaded into a singly linked list through [`FrameDescriptor::next_free`],
//! using frame *indices* rather than pointers so the array can live anywhere.
//!
//! ```text
//! descriptors: [ R | R | F | A | F | F | K | ... ]
//!                        │       ▲   │
//! free_head ─────────────┘       │   └──► NO_FRAME
//!                 next_free ─────┘
//! ```
//!
//! - Single frames come off the list head in O(1) (DMA requests scan for the
//!   first free frame below the DMA limit).
//! - Contiguous runs are found by a linear scan over the descriptors and are
//!   all-or-nothing.
//! - Frames carry a reference count; a frame returns to the list only when it
//!   drops to zero.

use crate::error::{Corruption, MemoryError, halt_on_corruption};
use crate::request::AllocRequest;
use core::ptr::NonNull;
use kernel_info::boot::MemoryRegionKind;
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K};
use kernel_vmem::{FrameAlloc, PhysMapper};
use log::{debug, warn};

/// Terminates the free list.
pub const NO_FRAME: u32 = u32::MAX;

/// Maximum number of physical regions recorded by [`FrameAllocator::add_region`].
pub const MAX_REGIONS: usize = 64;

/// Maximum number of ranges excluded through [`FrameAllocator::reserve`].
pub const MAX_RESERVATIONS: usize = 8;

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FrameState {
    /// Not allocatable: firmware, MMIO, holes, allocator metadata.
    Reserved = 0,
    Free = 1,
    Allocated = 2,
    KernelOnly = 3,
    Dma = 4,
    /// Part of a buddy zone; only the buddy allocator may release it.
    Buddy = 5,
}

impl FrameState {
    /// In use by someone, i.e. has a non-zero reference count.
    #[inline]
    #[must_use]
    pub const fn is_in_use(self) -> bool {
        matches!(self, Self::Allocated | Self::KernelOnly | Self::Dma | Self::Buddy)
    }
}

/// Per-frame bookkeeping.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct FrameDescriptor {
    pub ref_count: u32,
    /// Index of the next free frame while on the free list.
    pub next_free: u32,
    /// Index of the region this frame was registered through.
    pub zone: u16,
    pub state: FrameState,
    /// Order of the run this frame was handed out in; 0 for single frames.
    pub order: u8,
}

const _: () = assert!(size_of::<FrameDescriptor>() == 12);

impl FrameDescriptor {
    pub const RESERVED: Self = Self {
        ref_count: 0,
        next_free: NO_FRAME,
        zone: u16::MAX,
        state: FrameState::Reserved,
        order: 0,
    };
}

/// A registered span of physical memory.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PhysicalRegion {
    pub start: PhysicalAddress,
    pub frames: u64,
    pub kind: MemoryRegionKind,
}

impl PhysicalRegion {
    #[inline]
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.start.as_u64() + self.frames * Size4K::SIZE)
    }

    const fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start.as_u64() < end && start < self.end().as_u64()
    }
}

/// Snapshot of one frame's descriptor.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FrameInfo {
    pub state: FrameState,
    pub ref_count: u32,
    pub order: u8,
    pub zone: u16,
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct FrameStats {
    /// Frames covered by the descriptor array.
    pub total: u64,
    pub free: u64,
    pub allocated: u64,
    /// Everything neither free nor allocated.
    pub reserved: u64,
}

/// The physical frame allocator.
pub struct FrameAllocator<'m, M: PhysMapper> {
    mapper: &'m M,
    descriptors: NonNull<FrameDescriptor>,
    frame_count: u32,
    free_head: u32,
    free_frames: u64,
    allocated_frames: u64,
    regions: [Option<PhysicalRegion>; MAX_REGIONS],
    region_count: usize,
    /// Frame index ranges `[start, end)` that must never become free.
    reservations: [(u64, u64); MAX_RESERVATIONS],
    reservation_count: usize,
    sealed: bool,
}

// SAFETY: the allocator exclusively owns its descriptor array; the mapper is
// only shared by reference and must itself be `Sync`.
unsafe impl<M: PhysMapper + Sync> Send for FrameAllocator<'_, M> {}

impl<'m, M: PhysMapper> FrameAllocator<'m, M> {
    /// Bytes of descriptor storage needed to track `frame_count` frames.
    #[inline]
    #[must_use]
    pub const fn metadata_bytes(frame_count: u64) -> u64 {
        frame_count * size_of::<FrameDescriptor>() as u64
    }

    /// Create an allocator tracking frames `0..frame_count`, all reserved.
    ///
    /// # Safety
    /// `descriptors` must point at [`metadata_bytes(frame_count)`](Self::metadata_bytes)
    /// bytes of writable memory, suitably aligned, that nothing else touches
    /// for the allocator's lifetime.
    pub unsafe fn new(mapper: &'m M, descriptors: NonNull<FrameDescriptor>, frame_count: u32) -> Self {
        for index in 0..frame_count as usize {
            // SAFETY: within the array per the caller's contract.
            unsafe { descriptors.add(index).write(FrameDescriptor::RESERVED) };
        }
        Self {
            mapper,
            descriptors,
            frame_count,
            free_head: NO_FRAME,
            free_frames: 0,
            allocated_frames: 0,
            regions: [None; MAX_REGIONS],
            region_count: 0,
            reservations: [(0, 0); MAX_RESERVATIONS],
            reservation_count: 0,
            sealed: false,
        }
    }

    #[inline]
    #[must_use]
    pub const fn frame_count(&self) -> u32 {
        self.frame_count
    }

    #[inline]
    fn desc(&self, index: u32) -> &FrameDescriptor {
        debug_assert!(index < self.frame_count);
        // SAFETY: index is in bounds; the array is initialized in `new`.
        unsafe { self.descriptors.add(index as usize).as_ref() }
    }

    #[inline]
    fn desc_mut(&mut self, index: u32) -> &mut FrameDescriptor {
        debug_assert!(index < self.frame_count);
        // SAFETY: as above, and `&mut self` guarantees exclusivity.
        unsafe { self.descriptors.add(index as usize).as_mut() }
    }

    #[inline]
    const fn address_of(index: u32) -> PhysicalAddress {
        PhysicalAddress::from_frame_number(index as u64)
    }

    /// Frame index for `pa`, if `pa` is covered by the descriptor array.
    #[inline]
    fn index_of(&self, pa: PhysicalAddress) -> Option<u32> {
        u32::try_from(pa.frame_number())
            .ok()
            .filter(|index| *index < self.frame_count)
    }

    /// Stop accepting regions and reservations.
    pub const fn seal(&mut self) {
        self.sealed = true;
    }

    #[inline]
    #[must_use]
    pub const fn is_sealed(&self) -> bool {
        self.sealed
    }

    fn ensure_unsealed(&self) -> Result<(), MemoryError> {
        if self.sealed {
            Err(MemoryError::InvalidArgument(
                "physical memory layout can only change during initialization",
            ))
        } else {
            Ok(())
        }
    }

    /// Frame indices `[first, end)` fully inside `[start, start + size)`.
    fn inward_frames(start: PhysicalAddress, size: u64) -> Option<(u64, u64)> {
        let first = kernel_memory_addresses::checked_align_up(start.as_u64(), Size4K::SIZE)?;
        let end = kernel_memory_addresses::align_down(start.as_u64().checked_add(size)?, Size4K::SIZE);
        (first < end).then_some((first / Size4K::SIZE, end / Size4K::SIZE))
    }

    /// Frame indices `[first, end)` touched by `[start, start + size)`.
    fn outward_frames(start: PhysicalAddress, size: u64) -> Option<(u64, u64)> {
        let first = start.as_u64() / Size4K::SIZE;
        let end = kernel_memory_addresses::checked_align_up(start.as_u64().checked_add(size)?, Size4K::SIZE)?;
        (size > 0).then_some((first, end / Size4K::SIZE))
    }

    fn is_excluded(&self, frame: u64) -> bool {
        self.reservations[..self.reservation_count]
            .iter()
            .any(|(start, end)| (*start..*end).contains(&frame))
    }

    /// Exclude `[start, start + size)` from allocation, e.g. the allocator
    /// metadata itself. Covered frames that are already free are pulled off
    /// the free list; later [`add_region`](Self::add_region) calls skip them.
    ///
    /// # Errors
    /// [`MemoryError::InvalidArgument`] after [`seal`](Self::seal), for an
    /// empty range, or if the reservation table is full.
    pub fn reserve(&mut self, start: PhysicalAddress, size: u64) -> Result<(), MemoryError> {
        self.ensure_unsealed()?;
        let (first, end) = Self::outward_frames(start, size)
            .ok_or(MemoryError::InvalidArgument("empty or overflowing reservation"))?;
        if self.reservation_count == MAX_RESERVATIONS {
            return Err(MemoryError::InvalidArgument("too many reservations"));
        }
        self.reservations[self.reservation_count] = (first, end);
        self.reservation_count += 1;

        let tracked_end = end.min(u64::from(self.frame_count));
        for frame in first..tracked_end {
            #[allow(clippy::cast_possible_truncation)]
            let index = frame as u32;
            if self.desc(index).state == FrameState::Free && self.unlink(index) {
                self.free_frames -= 1;
                *self.desc_mut(index) = FrameDescriptor::RESERVED;
            }
        }
        debug!("reserved frames {first:#x}..{end:#x}");
        Ok(())
    }

    /// Register a physical region reported by the boot memory map.
    ///
    /// The range is aligned inward to whole frames. Usable frames not covered
    /// by a [`reserve`](Self::reserve)d range join the free list; other kinds
    /// are only recorded. Returns the number of frames that became free.
    ///
    /// # Errors
    /// [`MemoryError::InvalidArgument`] after [`seal`](Self::seal), for an
    /// empty region, if it overlaps a registered region, or if the region
    /// table is full.
    pub fn add_region(
        &mut self,
        start: PhysicalAddress,
        size: u64,
        kind: MemoryRegionKind,
    ) -> Result<u64, MemoryError> {
        self.ensure_unsealed()?;
        if size == 0 {
            return Err(MemoryError::InvalidArgument("empty region"));
        }
        let Some((first, end)) = Self::inward_frames(start, size) else {
            debug!("ignoring {kind:?} region at {start} smaller than one frame");
            return Ok(0);
        };
        let (start_addr, end_addr) = (first * Size4K::SIZE, end * Size4K::SIZE);
        if self.regions().any(|r| r.overlaps(start_addr, end_addr)) {
            return Err(MemoryError::InvalidArgument("region overlaps a registered region"));
        }
        if self.region_count == MAX_REGIONS {
            return Err(MemoryError::InvalidArgument("too many regions"));
        }

        #[allow(clippy::cast_possible_truncation)]
        let zone = self.region_count as u16;
        self.regions[self.region_count] = Some(PhysicalRegion {
            start: PhysicalAddress::new(start_addr),
            frames: end - first,
            kind,
        });
        self.region_count += 1;

        if !kind.is_usable() {
            return Ok(0);
        }

        let tracked_end = end.min(u64::from(self.frame_count));
        if tracked_end < end {
            warn!(
                "{} frames of region at {start} lie beyond the descriptor array",
                end - tracked_end.max(first)
            );
        }

        // Push in descending order so the lowest frame ends up at the list head.
        let mut freed = 0;
        for frame in (first..tracked_end).rev() {
            if self.is_excluded(frame) {
                continue;
            }
            #[allow(clippy::cast_possible_truncation)]
            let index = frame as u32;
            self.desc_mut(index).zone = zone;
            self.push_free(index);
            freed += 1;
        }
        debug!("region {zone} at {start}: {freed} usable frames");
        Ok(freed)
    }

    /// Registered regions, in registration order.
    pub fn regions(&self) -> impl Iterator<Item = &PhysicalRegion> {
        self.regions[..self.region_count].iter().flatten()
    }

    fn push_free(&mut self, index: u32) {
        let head = self.free_head;
        let desc = self.desc_mut(index);
        desc.state = FrameState::Free;
        desc.ref_count = 0;
        desc.order = 0;
        desc.next_free = head;
        self.free_head = index;
        self.free_frames += 1;
    }

    /// Remove `index` from the free list. Does not touch the counters.
    fn unlink(&mut self, index: u32) -> bool {
        if self.free_head == index {
            self.free_head = self.desc(index).next_free;
            self.desc_mut(index).next_free = NO_FRAME;
            return true;
        }
        let mut prev = self.free_head;
        while prev != NO_FRAME {
            let next = self.desc(prev).next_free;
            if next == index {
                let after = self.desc(index).next_free;
                self.desc_mut(prev).next_free = after;
                self.desc_mut(index).next_free = NO_FRAME;
                return true;
            }
            prev = next;
        }
        false
    }

    /// Pop the first free frame that satisfies `request`.
    fn take_matching(&mut self, request: AllocRequest) -> Option<u32> {
        let mut prev = NO_FRAME;
        let mut current = self.free_head;
        while current != NO_FRAME {
            let next = self.desc(current).next_free;
            if request.fits(Self::address_of(current), 1) {
                if prev == NO_FRAME {
                    self.free_head = next;
                } else {
                    self.desc_mut(prev).next_free = next;
                }
                self.desc_mut(current).next_free = NO_FRAME;
                self.free_frames -= 1;
                return Some(current);
            }
            prev = current;
            current = next;
        }
        None
    }

    fn mark_in_use(&mut self, index: u32, request: AllocRequest, order: u8) {
        let desc = self.desc_mut(index);
        desc.state = request.allocated_state();
        desc.ref_count = 1;
        desc.order = order;
        self.allocated_frames += 1;
    }

    /// Give an in-use frame back without any checks. Rollback only.
    fn release(&mut self, index: u32) {
        self.allocated_frames -= 1;
        self.push_free(index);
    }

    /// Allocate one 4 KiB frame.
    ///
    /// # Errors
    /// [`MemoryError::OutOfMemory`] when no frame satisfies the request, or a
    /// zero-fill was requested and the frame cannot be reached.
    pub fn allocate_frame(&mut self, request: AllocRequest) -> Result<PhysicalAddress, MemoryError> {
        let index = self.take_matching(request).ok_or(MemoryError::OutOfMemory)?;
        self.mark_in_use(index, request, 0);
        let pa = Self::address_of(index);
        if request.wants_zero() && self.mapper.zero_frame(pa.page()).is_err() {
            warn!("frame {pa} cannot be zeroed through the physical mapper");
            self.release(index);
            return Err(MemoryError::OutOfMemory);
        }
        Ok(pa)
    }

    /// First index of `count` consecutive free frames satisfying `request`.
    fn find_run(&self, count: u32, request: AllocRequest) -> Option<u32> {
        let mut run_start = 0;
        let mut run_len = 0;
        for index in 0..self.frame_count {
            let usable = self.desc(index).state == FrameState::Free
                && request.fits(Self::address_of(index), 1);
            if !usable {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                run_start = index;
            }
            run_len += 1;
            if run_len == count {
                return Some(run_start);
            }
        }
        None
    }

    /// Allocate `count` physically contiguous frames.
    ///
    /// Either all frames are handed out or none are.
    ///
    /// # Errors
    /// - [`MemoryError::InvalidArgument`] for `count == 0` or more frames than exist
    /// - [`MemoryError::OutOfMemory`] when no suitable run exists
    pub fn allocate_contiguous(
        &mut self,
        count: u64,
        request: AllocRequest,
    ) -> Result<PhysicalAddress, MemoryError> {
        if count == 0 {
            return Err(MemoryError::InvalidArgument("zero frames requested"));
        }
        let count = u32::try_from(count)
            .ok()
            .filter(|c| *c <= self.frame_count)
            .ok_or(MemoryError::InvalidArgument("request exceeds physical memory"))?;
        let start = self.find_run(count, request).ok_or(MemoryError::OutOfMemory)?;

        for offset in 0..count {
            if !self.unlink(start + offset) {
                warn!("frame {} marked free but missing from the free list", start + offset);
                for undo in 0..offset {
                    self.relink(start + undo);
                }
                return Err(MemoryError::OutOfMemory);
            }
        }

        let order = order_for(u64::from(count));
        self.free_frames -= u64::from(count);
        for offset in 0..count {
            self.mark_in_use(start + offset, request, order);
        }

        if request.wants_zero() {
            for offset in 0..count {
                let page = Self::address_of(start + offset).page();
                if self.mapper.zero_frame(page).is_err() {
                    warn!("frame {} cannot be zeroed through the physical mapper", page.base());
                    for undo in 0..count {
                        self.release(start + undo);
                    }
                    return Err(MemoryError::OutOfMemory);
                }
            }
        }
        Ok(Self::address_of(start))
    }

    /// Hand a run obtained from [`allocate_contiguous`](Self::allocate_contiguous)
    /// over to the buddy allocator. The frames stay counted as allocated but
    /// are refused by [`free_frame`](Self::free_frame) and [`inc_ref`](Self::inc_ref).
    ///
    /// # Errors
    /// [`MemoryError::InvalidArgument`] if any frame of the run is untracked,
    /// shared, or not held by a single owner.
    pub fn hand_to_buddy(&mut self, pa: PhysicalAddress, count: u64) -> Result<(), MemoryError> {
        let first = self
            .index_of(pa)
            .filter(|_| pa.is_aligned::<Size4K>() && count > 0)
            .ok_or(MemoryError::InvalidArgument("not a tracked frame run"))?;
        let end = u64::from(first)
            .checked_add(count)
            .filter(|end| *end <= u64::from(self.frame_count))
            .ok_or(MemoryError::InvalidArgument("run exceeds physical memory"))?;
        #[allow(clippy::cast_possible_truncation)]
        let end = end as u32;
        let exclusive = (first..end).all(|index| {
            let desc = self.desc(index);
            desc.ref_count == 1 && desc.state != FrameState::Buddy && desc.state.is_in_use()
        });
        if !exclusive {
            return Err(MemoryError::InvalidArgument("run is not exclusively allocated"));
        }
        for index in first..end {
            self.desc_mut(index).state = FrameState::Buddy;
        }
        Ok(())
    }

    /// Put an unlinked but still `Free` frame back at the list head.
    fn relink(&mut self, index: u32) {
        self.desc_mut(index).next_free = self.free_head;
        self.free_head = index;
    }

    /// Drop one reference to the frame at `pa`; the frame becomes free when
    /// the count reaches zero.
    ///
    /// # Errors
    /// [`MemoryError::InvalidArgument`] for a misaligned address or a reserved frame.
    ///
    /// # Panics
    /// Halts on an untracked frame or a frame that is already free.
    pub fn free_frame(&mut self, pa: PhysicalAddress) -> Result<(), MemoryError> {
        if !pa.is_aligned::<Size4K>() {
            return Err(MemoryError::InvalidArgument("frame address is not page aligned"));
        }
        let Some(index) = self.index_of(pa) else {
            halt_on_corruption(Corruption::UntrackedFrame(pa));
        };
        match self.desc(index).state {
            FrameState::Free => halt_on_corruption(Corruption::FrameDoubleFree(pa)),
            FrameState::Reserved => {
                warn!("refusing to free reserved frame {pa}");
                Err(MemoryError::InvalidArgument("frame is reserved"))
            }
            FrameState::Buddy => {
                warn!("refusing to free frame {pa} owned by the buddy allocator");
                Err(MemoryError::InvalidArgument("frame belongs to the buddy allocator"))
            }
            FrameState::Allocated | FrameState::KernelOnly | FrameState::Dma => {
                let desc = self.desc_mut(index);
                desc.ref_count = desc.ref_count.saturating_sub(1);
                if desc.ref_count == 0 {
                    self.release(index);
                }
                Ok(())
            }
        }
    }

    /// Free each frame of a run obtained from [`allocate_contiguous`](Self::allocate_contiguous).
    ///
    /// # Errors
    /// As [`free_frame`](Self::free_frame); frames before the failing one stay freed.
    pub fn free_contiguous(&mut self, pa: PhysicalAddress, count: u64) -> Result<(), MemoryError> {
        for offset in 0..count {
            self.free_frame(pa + offset * Size4K::SIZE)?;
        }
        Ok(())
    }

    /// Take another reference to an in-use frame. Returns the new count.
    ///
    /// # Errors
    /// [`MemoryError::InvalidArgument`] if the frame is untracked or not in use.
    pub fn inc_ref(&mut self, pa: PhysicalAddress) -> Result<u32, MemoryError> {
        let index = self
            .index_of(pa)
            .ok_or(MemoryError::InvalidArgument("frame is not tracked"))?;
        let desc = self.desc_mut(index);
        if desc.state == FrameState::Buddy {
            return Err(MemoryError::InvalidArgument("frame belongs to the buddy allocator"));
        }
        if !desc.state.is_in_use() {
            return Err(MemoryError::InvalidArgument("frame is not allocated"));
        }
        desc.ref_count += 1;
        Ok(desc.ref_count)
    }

    #[must_use]
    pub fn ref_count(&self, pa: PhysicalAddress) -> Option<u32> {
        self.index_of(pa).map(|index| self.desc(index).ref_count)
    }

    #[must_use]
    pub fn is_tracked(&self, pa: PhysicalAddress) -> bool {
        self.index_of(pa).is_some()
    }

    #[must_use]
    pub fn frame_info(&self, pa: PhysicalAddress) -> Option<FrameInfo> {
        self.index_of(pa).map(|index| {
            let d = self.desc(index);
            FrameInfo {
                state: d.state,
                ref_count: d.ref_count,
                order: d.order,
                zone: d.zone,
            }
        })
    }

    /// Index of the first frame on the free list.
    #[must_use]
    pub fn free_list_head(&self) -> Option<PhysicalAddress> {
        (self.free_head != NO_FRAME).then(|| Self::address_of(self.free_head))
    }

    #[must_use]
    pub fn stats(&self) -> FrameStats {
        let total = u64::from(self.frame_count);
        FrameStats {
            total,
            free: self.free_frames,
            allocated: self.allocated_frames,
            reserved: total - self.free_frames - self.allocated_frames,
        }
    }
}

/// Smallest `order` with `1 << order >= count`.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub(crate) const fn order_for(count: u64) -> u8 {
    count.next_power_of_two().trailing_zeros() as u8
}

/// Page-table frames come out as `KernelOnly`.
impl<M: PhysMapper> FrameAlloc for FrameAllocator<'_, M> {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.allocate_frame(AllocRequest::KERNEL).ok().map(PhysicalAddress::page)
    }

    fn free_4k(&mut self, page: PhysicalPage<Size4K>) {
        if let Err(e) = self.free_frame(page.base()) {
            warn!("dropping page table frame {}: {e}", page.base());
        }
    }
}
