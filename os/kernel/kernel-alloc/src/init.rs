//! Bring-up of the memory manager from the boot memory map.
//!
//! ```text
//!  boot map ─► size metadata ─► frame allocator ─► buddy zones ─► kernel root ─► heap ─► VMA pool
//!              (largest usable    (reserve + add    (carved from    (adopt or      (initial
//!               region)            every entry)      frames)         build)         pages)
//! ```

use crate::buddy::{BuddyAllocator, BuddyBlock, MAX_ORDER_LIMIT};
use crate::config::{KernelRoot, MemoryConfig};
use crate::error::MemoryError;
use crate::frame_alloc::{FrameAllocator, FrameDescriptor, NO_FRAME};
use crate::heap::{HEAP_ALIGN, KernelHeap};
use crate::manager::MemoryManager;
use crate::request::AllocRequest;
use crate::vma::VmaPool;
use core::ptr::NonNull;
use kernel_info::boot::{BootMemoryMap, MemoryMapEntry};
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size4K, align_up};
use kernel_vmem::{AddressSpace, Mmu, PhysMapper};
use log::{debug, info, warn};

/// Why the memory manager could not be brought up.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum InitError {
    #[error("the boot memory map reports no usable memory")]
    NoUsableMemory,
    #[error("no usable region can hold {0} bytes of allocator metadata")]
    NoRoomForMetadata(u64),
    #[error("allocator metadata at {0} is not contiguously reachable through the physical mapper")]
    MetadataUnreachable(PhysicalAddress),
    #[error("{0} frames exceed what the allocators can track")]
    TooManyFrames(u64),
    #[error("invalid memory configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("memory initialization failed while setting up the {phase}")]
    Phase {
        phase: &'static str,
        #[source]
        source: MemoryError,
    },
}

fn phase(phase: &'static str) -> impl Fn(MemoryError) -> InitError {
    move |source| InitError::Phase { phase, source }
}

/// Where the descriptor arrays live.
struct MetadataLayout {
    base: PhysicalAddress,
    /// Page-aligned size of both arrays together.
    bytes: u64,
    buddy_offset: u64,
}

impl MetadataLayout {
    fn for_frames(frame_count: u64) -> Self {
        let frame_bytes = frame_count * size_of::<FrameDescriptor>() as u64;
        let buddy_offset = align_up(frame_bytes, HEAP_ALIGN as u64);
        let buddy_bytes = frame_count * size_of::<BuddyBlock>() as u64;
        Self {
            base: PhysicalAddress::zero(),
            bytes: align_up(buddy_offset + buddy_bytes, Size4K::SIZE),
            buddy_offset,
        }
    }
}

/// Page-aligned start inside the largest usable entry that can hold `bytes`.
fn place_metadata(map: &BootMemoryMap<'_>, bytes: u64) -> Option<PhysicalAddress> {
    let fits = |entry: &&MemoryMapEntry| {
        let start = align_up(entry.base, Size4K::SIZE);
        entry.end().as_u64().saturating_sub(start) >= bytes
    };
    map.usable()
        .filter(fits)
        .max_by_key(|entry| entry.length)
        .map(|entry| PhysicalAddress::new(align_up(entry.base, Size4K::SIZE)))
}

/// Host pointer to the metadata, if the mapper reaches all of it contiguously.
fn reach_metadata<M: PhysMapper>(mapper: &M, layout: &MetadataLayout) -> Option<NonNull<u8>> {
    let first = mapper.phys_to_ptr(layout.base)?;
    let last = mapper.phys_to_ptr(layout.base.checked_add(layout.bytes - 1)?)?;
    let span = (last.as_ptr() as usize).checked_sub(first.as_ptr() as usize)?;
    (span as u64 == layout.bytes - 1).then_some(first)
}

/// Move `pages` frames (halving on failure) from the frame allocator into a
/// new buddy zone. Returns the frames handed over.
fn carve_zone<M: PhysMapper>(
    frames: &mut FrameAllocator<'_, M>,
    buddy: &mut BuddyAllocator<'_, M>,
    pages: u64,
    dma: bool,
) -> Result<u64, InitError> {
    let request = if dma { AllocRequest::DMA } else { AllocRequest::KERNEL };
    let mut pages = pages.min(frames.stats().free);
    while pages > 0 {
        match frames.allocate_contiguous(pages, request) {
            Ok(start) => {
                frames
                    .hand_to_buddy(start, pages)
                    .map_err(phase("buddy allocator"))?;
                #[allow(clippy::cast_possible_truncation)]
                let (first, count) = (start.frame_number() as u32, pages as u32);
                buddy.add_zone(first, count, dma).map_err(phase("buddy allocator"))?;
                debug!(
                    "buddy {} zone: {pages} frames at {start}",
                    if dma { "DMA" } else { "normal" }
                );
                return Ok(pages);
            }
            Err(MemoryError::OutOfMemory) => pages /= 2,
            Err(e) => return Err(phase("buddy allocator")(e)),
        }
    }
    warn!("no memory for a {} buddy zone", if dma { "DMA" } else { "normal" });
    Ok(0)
}

impl<'m, M: PhysMapper, T: Mmu> MemoryManager<'m, M, T> {
    /// Bring up every allocator from the boot memory map.
    ///
    /// The allocator metadata is placed at the start of the largest usable
    /// region. Buddy zones are carved out of the frame allocator, the heap
    /// receives its initial pages and the region descriptor pool is allocated
    /// from the heap. Afterwards the physical layout is sealed.
    ///
    /// # Errors
    /// See [`InitError`].
    #[allow(clippy::cast_possible_truncation)]
    pub fn init(
        map: &BootMemoryMap<'_>,
        config: MemoryConfig,
        mapper: &'m M,
        mmu: &'m T,
    ) -> Result<Self, InitError> {
        if config.buddy_max_order > MAX_ORDER_LIMIT {
            return Err(InitError::InvalidConfig("buddy order above the supported limit"));
        }
        if config.heap_limit <= config.heap_base {
            return Err(InitError::InvalidConfig("empty heap window"));
        }
        if VmaPool::storage_align() > HEAP_ALIGN {
            return Err(InitError::InvalidConfig("region descriptors need more than heap alignment"));
        }

        let end = map.highest_usable_end().ok_or(InitError::NoUsableMemory)?;
        let frame_count = end.as_u64() / Size4K::SIZE;
        let tracked = u32::try_from(frame_count)
            .ok()
            .filter(|count| *count < NO_FRAME && *count > 0)
            .ok_or(InitError::TooManyFrames(frame_count))?;
        info!(
            "memory map: {} KiB usable, tracking {frame_count} frames",
            map.usable_bytes() / 1024
        );

        let mut layout = MetadataLayout::for_frames(frame_count);
        layout.base =
            place_metadata(map, layout.bytes).ok_or(InitError::NoRoomForMetadata(layout.bytes))?;
        let metadata =
            reach_metadata(mapper, &layout).ok_or(InitError::MetadataUnreachable(layout.base))?;
        info!("allocator metadata: {} KiB at {}", layout.bytes / 1024, layout.base);

        // SAFETY: the metadata range is reachable, sized for `tracked` descriptors,
        // page aligned, and reserved below before any frame is handed out.
        let mut frames = unsafe { FrameAllocator::new(mapper, metadata.cast(), tracked) };
        frames
            .reserve(layout.base, layout.bytes)
            .map_err(phase("frame allocator"))?;
        for entry in map.entries {
            if let Err(e) = frames.add_region(entry.start(), entry.length, entry.kind) {
                warn!("skipping memory map entry at {} ({:?}): {e}", entry.start(), entry.kind);
            }
        }
        let usable_frames = frames.stats().free;
        if usable_frames == 0 {
            return Err(InitError::NoUsableMemory);
        }
        info!("frame allocator: {usable_frames} free frames");

        // SAFETY: the buddy array follows the frame descriptors inside the
        // reserved metadata range, 16-byte aligned.
        let blocks = unsafe { metadata.add(layout.buddy_offset as usize) }.cast::<BuddyBlock>();
        // SAFETY: as above; the array holds `tracked` blocks.
        let mut buddy = unsafe { BuddyAllocator::new(mapper, blocks, tracked, config.buddy_max_order) }
            .map_err(phase("buddy allocator"))?;
        if config.dma_zone_pages > 0 {
            carve_zone(&mut frames, &mut buddy, config.dma_zone_pages, true)?;
        }
        let pool_frames = config.buddy_pool_frames(usable_frames);
        if pool_frames > 0 {
            carve_zone(&mut frames, &mut buddy, pool_frames, false)?;
        }

        let kernel_root = match config.kernel_root {
            KernelRoot::Active => AddressSpace::from_active(mapper, mmu).root_page(),
            KernelRoot::Fresh => AddressSpace::new_empty(mapper, mmu, &mut frames)
                .map_err(|e| phase("kernel page table")(e.into()))?
                .root_page(),
        };
        info!("kernel page table at {}", kernel_root.base());

        let heap = KernelHeap::new(
            config.heap_base,
            config.heap_limit,
            config.heap_min_expansion_pages,
        )
        .map_err(phase("kernel heap"))?;
        let manager = Self::from_parts(mapper, mmu, kernel_root, heap, buddy, frames);
        if config.heap_initial_pages > 0 {
            manager
                .grow_heap(config.heap_initial_pages)
                .map_err(phase("kernel heap"))?;
        }
        info!(
            "kernel heap: {} pages at {}",
            config.heap_initial_pages, config.heap_base
        );

        if config.max_vmas > 0 {
            let capacity = config.max_vmas.min(VmaPool::MAX_CAPACITY);
            let storage = manager
                .kzalloc(VmaPool::storage_bytes(capacity))
                .map_err(phase("region descriptor pool"))?;
            // SAFETY: heap storage of the requested size, 16-byte aligned,
            // never freed while the manager lives.
            manager.processes.lock().pool = unsafe { VmaPool::new(storage, capacity) };
            debug!("region descriptor pool: {capacity} slots");
        }

        manager.frames.lock().seal();
        manager.buddy.lock().seal();
        info!("memory manager ready");
        Ok(manager)
    }
}
