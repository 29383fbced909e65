//! # Buddy allocator
//!
//! Power-of-two blocks of frames for callers that need physically contiguous,
//! naturally aligned memory (2 MiB user pages, DMA buffers).
//!
//! Zones are frame ranges handed over by the frame allocator at init. Each
//! zone keeps one doubly linked free list per order, threaded through a
//! [`BuddyBlock`] array indexed by the *global* frame number. Because block
//! heads are aligned to their size in frame-number space, the buddy of the
//! block at index `i` and order `o` is simply `i ^ (1 << o)`:
//!
//! ```text
//! order 2:  [ 0  1  2  3 ][ 4  5  6  7 ]   buddies: 0 ↔ 4
//! order 1:  [ 0  1 ][ 2  3 ]               buddies: 0 ↔ 2
//! order 0:  [0][1]                         buddies: 0 ↔ 1
//! ```
//!
//! Only block heads carry `Free` or `Allocated`; the other frames of a block
//! are marked [`BlockState::Split`].

use crate::error::{Corruption, MemoryError, halt_on_corruption};
use crate::frame_alloc::order_for;
use crate::request::{AllocRequest, FramePurpose};
use core::ptr::NonNull;
use kernel_info::memory::DMA_LIMIT;
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size4K};
use kernel_vmem::PhysMapper;
use log::{debug, warn};

/// Largest order the free-list tables can hold.
pub const MAX_ORDER_LIMIT: u8 = 16;

pub const MAX_ZONES: usize = 4;

const ORDERS: usize = MAX_ORDER_LIMIT as usize + 1;
const NO_BLOCK: u32 = u32::MAX;
const NO_ZONE: u8 = u8::MAX;

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BlockState {
    /// Not managed by any zone.
    Reserved = 0,
    /// Head of a free block.
    Free = 1,
    /// Head of an allocated block.
    Allocated = 2,
    /// Inside a larger block whose head sits at a lower index.
    Split = 3,
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct BuddyBlock {
    pub next: u32,
    pub prev: u32,
    pub order: u8,
    pub state: BlockState,
    pub zone: u8,
    _reserved: u8,
}

const _: () = assert!(size_of::<BuddyBlock>() == 12);

impl BuddyBlock {
    pub const UNMANAGED: Self = Self {
        next: NO_BLOCK,
        prev: NO_BLOCK,
        order: 0,
        state: BlockState::Reserved,
        zone: NO_ZONE,
        _reserved: 0,
    };
}

#[derive(Debug, Copy, Clone)]
struct BuddyZone {
    first_frame: u32,
    frames: u32,
    dma: bool,
    free_heads: [u32; ORDERS],
    free_blocks: [u32; ORDERS],
    free_frames: u64,
}

impl BuddyZone {
    const fn contains(&self, index: u32) -> bool {
        index >= self.first_frame && index - self.first_frame < self.frames
    }

    const fn end(&self) -> u32 {
        self.first_frame + self.frames
    }
}

/// Occupancy of one zone.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ZoneStats {
    pub start: PhysicalAddress,
    pub frames: u64,
    pub dma: bool,
    pub free_frames: u64,
    /// Free blocks per order.
    pub free_blocks: [u32; ORDERS],
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct BuddyStats {
    pub zones: [Option<ZoneStats>; MAX_ZONES],
    pub total_frames: u64,
    pub free_frames: u64,
}

pub struct BuddyAllocator<'m, M: PhysMapper> {
    mapper: &'m M,
    blocks: NonNull<BuddyBlock>,
    frame_count: u32,
    max_order: u8,
    zones: [Option<BuddyZone>; MAX_ZONES],
    zone_count: usize,
    sealed: bool,
}

// SAFETY: the allocator exclusively owns its block array.
unsafe impl<M: PhysMapper + Sync> Send for BuddyAllocator<'_, M> {}

impl<'m, M: PhysMapper> BuddyAllocator<'m, M> {
    #[inline]
    #[must_use]
    pub const fn metadata_bytes(frame_count: u64) -> u64 {
        frame_count * size_of::<BuddyBlock>() as u64
    }

    /// Create an allocator without zones.
    ///
    /// # Errors
    /// [`MemoryError::InvalidArgument`] if `max_order` exceeds [`MAX_ORDER_LIMIT`].
    ///
    /// # Safety
    /// `blocks` must point at [`metadata_bytes(frame_count)`](Self::metadata_bytes)
    /// bytes of writable, suitably aligned memory owned by the allocator.
    pub unsafe fn new(
        mapper: &'m M,
        blocks: NonNull<BuddyBlock>,
        frame_count: u32,
        max_order: u8,
    ) -> Result<Self, MemoryError> {
        if max_order > MAX_ORDER_LIMIT {
            return Err(MemoryError::InvalidArgument("buddy order limit exceeded"));
        }
        for index in 0..frame_count as usize {
            // SAFETY: within the array per the caller's contract.
            unsafe { blocks.add(index).write(BuddyBlock::UNMANAGED) };
        }
        Ok(Self {
            mapper,
            blocks,
            frame_count,
            max_order,
            zones: [None; MAX_ZONES],
            zone_count: 0,
            sealed: false,
        })
    }

    #[inline]
    #[must_use]
    pub const fn max_order(&self) -> u8 {
        self.max_order
    }

    #[inline]
    fn block(&self, index: u32) -> &BuddyBlock {
        debug_assert!(index < self.frame_count);
        // SAFETY: bounds checked by callers; initialized in `new`.
        unsafe { self.blocks.add(index as usize).as_ref() }
    }

    #[inline]
    fn block_mut(&mut self, index: u32) -> &mut BuddyBlock {
        debug_assert!(index < self.frame_count);
        // SAFETY: as above, exclusive through `&mut self`.
        unsafe { self.blocks.add(index as usize).as_mut() }
    }

    fn zone_mut(&mut self, zone: u8) -> &mut BuddyZone {
        self.zones[zone as usize]
            .as_mut()
            .unwrap_or_else(|| unreachable!("zone {zone} is registered"))
    }

    pub const fn seal(&mut self) {
        self.sealed = true;
    }

    /// Hand frames `[first_frame, first_frame + frames)` to a new zone.
    ///
    /// The range is carved into the largest naturally aligned blocks that fit.
    /// DMA zones must lie entirely below [`DMA_LIMIT`].
    ///
    /// # Errors
    /// [`MemoryError::InvalidArgument`] after [`seal`](Self::seal), for an
    /// empty or untracked range, overlap with another zone, or a misplaced DMA zone.
    pub fn add_zone(&mut self, first_frame: u32, frames: u32, dma: bool) -> Result<u8, MemoryError> {
        if self.sealed {
            return Err(MemoryError::InvalidArgument("zones can only be added during initialization"));
        }
        let end = first_frame
            .checked_add(frames)
            .filter(|end| frames > 0 && *end <= self.frame_count)
            .ok_or(MemoryError::InvalidArgument("zone outside the tracked frames"))?;
        if dma && u64::from(end) * Size4K::SIZE > DMA_LIMIT {
            return Err(MemoryError::InvalidArgument("DMA zone extends past the DMA limit"));
        }
        if self.zones().any(|z| first_frame < z.end() && z.first_frame < end) {
            return Err(MemoryError::InvalidArgument("zone overlaps another zone"));
        }
        if self.zone_count == MAX_ZONES {
            return Err(MemoryError::InvalidArgument("too many zones"));
        }

        #[allow(clippy::cast_possible_truncation)]
        let id = self.zone_count as u8;
        self.zones[self.zone_count] = Some(BuddyZone {
            first_frame,
            frames,
            dma,
            free_heads: [NO_BLOCK; ORDERS],
            free_blocks: [0; ORDERS],
            free_frames: 0,
        });
        self.zone_count += 1;

        for index in first_frame..end {
            let block = self.block_mut(index);
            *block = BuddyBlock::UNMANAGED;
            block.zone = id;
            block.state = BlockState::Split;
        }

        // Append so that each list runs in ascending address order.
        let mut tails = [NO_BLOCK; ORDERS];
        let mut index = first_frame;
        while index < end {
            let mut order = self.max_order;
            while order > 0 && (index % (1 << order) != 0 || index + (1 << order) > end) {
                order -= 1;
            }
            self.insert_free(id, index, order, tails[order as usize]);
            tails[order as usize] = index;
            index += 1 << order;
        }
        debug!(
            "buddy zone {id}: frames {first_frame:#x}..{end:#x}{}",
            if dma { " (DMA)" } else { "" }
        );
        Ok(id)
    }

    fn zones(&self) -> impl Iterator<Item = &BuddyZone> {
        self.zones[..self.zone_count].iter().flatten()
    }

    fn push_free(&mut self, zone: u8, index: u32, order: u8) {
        self.insert_free(zone, index, order, NO_BLOCK);
    }

    /// Link `index` into its free list after `after`, or at the head for `NO_BLOCK`.
    fn insert_free(&mut self, zone: u8, index: u32, order: u8, after: u32) {
        let next = if after == NO_BLOCK {
            self.zone_mut(zone).free_heads[order as usize]
        } else {
            self.block(after).next
        };
        if next != NO_BLOCK {
            self.block_mut(next).prev = index;
        }
        let block = self.block_mut(index);
        block.state = BlockState::Free;
        block.order = order;
        block.next = next;
        block.prev = after;
        if after != NO_BLOCK {
            self.block_mut(after).next = index;
        }

        let z = self.zone_mut(zone);
        if after == NO_BLOCK {
            z.free_heads[order as usize] = index;
        }
        z.free_blocks[order as usize] += 1;
        z.free_frames += 1 << order;
    }

    fn unlink_free(&mut self, zone: u8, index: u32) {
        let BuddyBlock { next, prev, order, .. } = *self.block(index);
        if prev == NO_BLOCK {
            self.zone_mut(zone).free_heads[order as usize] = next;
        } else {
            self.block_mut(prev).next = next;
        }
        if next != NO_BLOCK {
            self.block_mut(next).prev = prev;
        }
        let block = self.block_mut(index);
        block.next = NO_BLOCK;
        block.prev = NO_BLOCK;

        let z = self.zone_mut(zone);
        z.free_blocks[order as usize] -= 1;
        z.free_frames -= 1 << order;
    }

    /// Zone search order for a request: DMA requests only see DMA zones,
    /// everything else prefers normal zones and falls back to DMA zones.
    #[allow(clippy::cast_possible_truncation)]
    fn candidate_zones(&self, request: AllocRequest) -> impl Iterator<Item = u8> + '_ {
        let dma_only = request.purpose == FramePurpose::Dma;
        let normal = (0..self.zone_count).filter(move |z| !dma_only && self.is_dma(*z) == Some(false));
        let dma = (0..self.zone_count).filter(move |z| self.is_dma(*z) == Some(true));
        normal.chain(dma).map(|z| z as u8)
    }

    fn is_dma(&self, zone: usize) -> Option<bool> {
        self.zones[zone].as_ref().map(|z| z.dma)
    }

    /// Pop a free block of at least `order` from `zone` and split it down.
    fn take_from_zone(&mut self, zone: u8, order: u8) -> Option<u32> {
        let z = self.zones[zone as usize].as_ref()?;
        let found = (order..=self.max_order).find(|o| z.free_heads[*o as usize] != NO_BLOCK)?;
        let index = z.free_heads[found as usize];
        self.unlink_free(zone, index);

        let mut current = found;
        while current > order {
            current -= 1;
            self.push_free(zone, index + (1 << current), current);
        }
        let block = self.block_mut(index);
        block.state = BlockState::Allocated;
        block.order = order;
        Some(index)
    }

    /// Allocate `count` contiguous frames as one block of `2^order` frames.
    ///
    /// # Errors
    /// - [`MemoryError::InvalidArgument`] for `count == 0` or more than `2^max_order` frames
    /// - [`MemoryError::OutOfMemory`] when no zone can satisfy the request
    pub fn alloc_pages(&mut self, count: u64, request: AllocRequest) -> Result<PhysicalAddress, MemoryError> {
        if count == 0 {
            return Err(MemoryError::InvalidArgument("zero frames requested"));
        }
        if count > 1 << self.max_order {
            return Err(MemoryError::InvalidArgument("request exceeds the largest buddy block"));
        }
        let order = order_for(count);

        let zones: [Option<u8>; MAX_ZONES] = {
            let mut out = [None; MAX_ZONES];
            for (slot, zone) in out.iter_mut().zip(self.candidate_zones(request)) {
                *slot = Some(zone);
            }
            out
        };
        let index = zones
            .into_iter()
            .flatten()
            .find_map(|zone| self.take_from_zone(zone, order))
            .ok_or(MemoryError::OutOfMemory)?;
        let pa = PhysicalAddress::from_frame_number(u64::from(index));

        if request.wants_zero() {
            for frame in 0..1u64 << order {
                let page = (pa + frame * Size4K::SIZE).page();
                if self.mapper.zero_frame(page).is_err() {
                    warn!("buddy block {pa} cannot be zeroed through the physical mapper");
                    self.release(index);
                    return Err(MemoryError::OutOfMemory);
                }
            }
        }
        Ok(pa)
    }

    /// Return a block obtained from [`alloc_pages`](Self::alloc_pages).
    ///
    /// # Errors
    /// [`MemoryError::InvalidArgument`] for a misaligned address.
    ///
    /// # Panics
    /// Halts if `pa` is not the head of an allocated block.
    pub fn free_pages(&mut self, pa: PhysicalAddress) -> Result<(), MemoryError> {
        if !pa.is_aligned::<Size4K>() {
            return Err(MemoryError::InvalidArgument("block address is not page aligned"));
        }
        let index = u32::try_from(pa.frame_number())
            .ok()
            .filter(|index| *index < self.frame_count && self.block(*index).zone != NO_ZONE)
            .unwrap_or_else(|| halt_on_corruption(Corruption::UntrackedFrame(pa)));
        if self.block(index).state != BlockState::Allocated {
            halt_on_corruption(Corruption::BuddyNotAllocated(pa));
        }
        self.release(index);
        Ok(())
    }

    /// Whether `pa` is the head of an allocated buddy block.
    #[must_use]
    pub fn owns(&self, pa: PhysicalAddress) -> bool {
        u32::try_from(pa.frame_number())
            .ok()
            .filter(|index| *index < self.frame_count)
            .is_some_and(|index| self.block(index).state == BlockState::Allocated)
    }

    /// Put an allocated block back and merge it with free buddies.
    fn release(&mut self, index: u32) {
        let BuddyBlock { zone, order, .. } = *self.block(index);
        let Some(bounds) = self.zones.get(zone as usize).copied().flatten() else {
            return;
        };

        let mut index = index;
        let mut order = order;
        while order < self.max_order {
            let buddy = index ^ (1 << order);
            if !bounds.contains(buddy) {
                break;
            }
            let b = *self.block(buddy);
            if b.state != BlockState::Free || b.order != order || b.zone != zone {
                break;
            }
            self.unlink_free(zone, buddy);
            let (low, high) = if buddy < index { (buddy, index) } else { (index, buddy) };
            self.block_mut(high).state = BlockState::Split;
            index = low;
            order += 1;
        }
        self.push_free(zone, index, order);
    }

    #[must_use]
    pub fn stats(&self) -> BuddyStats {
        let mut stats = BuddyStats::default();
        for (slot, zone) in stats.zones.iter_mut().zip(self.zones()) {
            *slot = Some(ZoneStats {
                start: PhysicalAddress::from_frame_number(u64::from(zone.first_frame)),
                frames: u64::from(zone.frames),
                dma: zone.dma,
                free_frames: zone.free_frames,
                free_blocks: zone.free_blocks,
            });
            stats.total_frames += u64::from(zone.frames);
            stats.free_frames += zone.free_frames;
        }
        stats
    }
}
