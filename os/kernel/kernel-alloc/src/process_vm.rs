//! Process address spaces, their regions, and the page-fault path.

use crate::buddy::BuddyAllocator;
use crate::error::MemoryError;
use crate::frame_alloc::FrameAllocator;
use crate::manager::{DirectoryRef, MemoryManager, ProcessSpace, release_frame, release_leaf};
use crate::process::ProcessId;
use crate::request::AllocRequest;
use crate::vma::{FaultPolicy, Vma, VmaFlags, VmaKind};
use kernel_info::memory::{USER_REGION_BASE, USERSPACE_END};
use kernel_memory_addresses::{PageSize, Size2M, Size4K, VirtualAddress, checked_align_up};
use kernel_vmem::{AddressSpace, MappingFlags, Mmu, PhysMapper};
use log::{debug, info, trace, warn};

/// Frames in one 2 MiB page.
const FRAMES_PER_2M: u64 = Size2M::SIZE / Size4K::SIZE;

impl<M: PhysMapper, T: Mmu> MemoryManager<'_, M, T> {
    /// Create an empty user address space sharing the kernel's higher half.
    ///
    /// # Errors
    /// [`MemoryError::OutOfMemory`] if the process table is full or no frame
    /// is left for the PML4.
    pub fn create_process_vm(&self) -> Result<ProcessId, MemoryError> {
        let mut processes = self.processes.lock();
        if !processes.table.has_room() {
            warn!("process table is full");
            return Err(MemoryError::OutOfMemory);
        }

        let _paging = self.paging.lock();
        let mut frames = self.frames.lock();
        let space = AddressSpace::new_empty(self.mapper, self.mmu, &mut *frames)?;
        space.copy_kernel_half_from(self.kernel_root);

        let root = space.root_page();
        let Some(pid) = processes.table.insert(root) else {
            release_frame(&mut frames, root.base());
            return Err(MemoryError::OutOfMemory);
        };
        info!("created address space for {pid} with root {}", root.base());
        Ok(pid)
    }

    /// Share the address space of `pid` with another holder.
    ///
    /// # Errors
    /// [`MemoryError::InvalidArgument`] for an unknown process.
    pub fn retain_process_vm(&self, pid: ProcessId) -> Result<u32, MemoryError> {
        let mut processes = self.processes.lock();
        let directory = processes
            .table
            .get_mut(pid)
            .ok_or(MemoryError::InvalidArgument("unknown process"))?;
        directory.ref_count += 1;
        Ok(directory.ref_count)
    }

    /// Drop one holder of `pid`'s address space; the last one tears it down.
    ///
    /// Tearing down unmaps every region, frees the user-half page tables and
    /// the PML4, and frees the pid for reuse. If the directory is active the
    /// kernel's root is loaded first.
    ///
    /// # Errors
    /// [`MemoryError::InvalidArgument`] for an unknown process.
    pub fn destroy_process_vm(&self, pid: ProcessId) -> Result<(), MemoryError> {
        let mut processes = self.processes.lock();
        let ProcessSpace { table, pool } = &mut *processes;
        let directory = table
            .get_mut(pid)
            .ok_or(MemoryError::InvalidArgument("unknown process"))?;
        if directory.ref_count > 1 {
            directory.ref_count -= 1;
            debug!("{pid} still has {} holders", directory.ref_count);
            return Ok(());
        }
        let root = directory.root;
        let mut regions = directory.regions;

        let mut paging = self.paging.lock();
        if paging.active == DirectoryRef::Process(pid) {
            // SAFETY: the kernel's own root always maps the running kernel.
            unsafe { self.space(self.kernel_root).activate() };
            paging.active = DirectoryRef::Kernel;
        }

        let space = self.space(root);
        let mut buddy = self.buddy.lock();
        let mut frames = self.frames.lock();
        while let Some(index) = regions.pop_front(pool) {
            if let Some(vma) = pool.get(index).copied() {
                unmap_region(&space, &vma, &mut buddy, &mut frames);
            }
            pool.release(index);
        }
        let tables = space.release_user_tables(&mut *frames);
        release_frame(&mut frames, root.base());
        table.remove(pid);
        info!("destroyed address space of {pid}, released {tables} page tables");
        Ok(())
    }

    /// Add a region to `pid`'s address space.
    ///
    /// `start` is rounded down and the end up to whole pages. With `None` the
    /// region goes into the lowest gap at or above [`USER_REGION_BASE`].
    /// [`FaultPolicy::Prefault`] regions are backed by zeroed frames right
    /// away; if that fails, everything mapped so far is undone.
    ///
    /// # Errors
    /// - [`MemoryError::InvalidArgument`] for a zero size, an unknown process or
    ///   a range outside user space
    /// - [`MemoryError::AlreadyMapped`] if the range overlaps an existing region
    /// - [`MemoryError::OutOfMemory`] when no gap, descriptor or frame is left
    pub fn create_region(
        &self,
        pid: ProcessId,
        start: Option<VirtualAddress>,
        size: u64,
        flags: VmaFlags,
        kind: VmaKind,
        policy: FaultPolicy,
    ) -> Result<VirtualAddress, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidArgument("region size must be non-zero"));
        }
        let ceiling = VirtualAddress::new(USERSPACE_END);

        let mut processes = self.processes.lock();
        let ProcessSpace { table, pool } = &mut *processes;
        let directory = table
            .get_mut(pid)
            .ok_or(MemoryError::InvalidArgument("unknown process"))?;

        let (start, end) = match start {
            Some(start) => {
                let end = start
                    .checked_add(size)
                    .and_then(|end| checked_align_up(end.as_u64(), Size4K::SIZE))
                    .map(VirtualAddress::new)
                    .filter(|end| *end <= ceiling)
                    .ok_or(MemoryError::InvalidArgument("region leaves user space"))?;
                let start = start.align_down::<Size4K>();
                if directory.regions.overlaps(pool, start, end) {
                    return Err(MemoryError::AlreadyMapped(start));
                }
                (start, end)
            }
            None => {
                let size = checked_align_up(size, Size4K::SIZE)
                    .ok_or(MemoryError::InvalidArgument("region size overflows"))?;
                let start = directory
                    .regions
                    .first_gap(pool, size, VirtualAddress::new(USER_REGION_BASE), ceiling)
                    .ok_or(MemoryError::OutOfMemory)?;
                (start, start + size)
            }
        };

        let vma = Vma {
            start,
            end,
            flags,
            kind,
            policy,
            owner: pid,
            ref_count: 1,
        };
        let Some(index) = pool.alloc(vma) else {
            warn!("no region descriptor left for {pid}");
            return Err(MemoryError::OutOfMemory);
        };
        if policy == FaultPolicy::Prefault
            && let Err(e) = self.prefault(&vma, &self.space(directory.root))
        {
            pool.release(index);
            return Err(e);
        }
        directory.regions.insert(pool, index);
        debug!("{pid}: region {start}..{end} ({kind:?}, {policy:?})");
        Ok(start)
    }

    /// Back every page of `vma` with a zeroed frame.
    fn prefault(&self, vma: &Vma, space: &AddressSpace<'_, M, T>) -> Result<(), MemoryError> {
        let _paging = self.paging.lock();
        let mut frames = self.frames.lock();
        let flags = vma.flags.mapping_flags();
        let mut va = vma.start;
        while va < vma.end {
            if let Err(e) = map_fresh_page(space, &mut frames, va, AllocRequest::ZEROED, flags) {
                warn!("prefaulting {}..{} failed at {va}: {e}", vma.start, vma.end);
                unmap_pages(space, vma.start, va, &mut frames);
                return Err(e);
            }
            va += Size4K::SIZE;
        }
        Ok(())
    }

    /// Remove the region of `pid` that starts at `start`, releasing its pages.
    ///
    /// # Errors
    /// - [`MemoryError::InvalidArgument`] for an unknown process
    /// - [`MemoryError::NotMapped`] if no region starts at `start`
    pub fn destroy_region(&self, pid: ProcessId, start: VirtualAddress) -> Result<(), MemoryError> {
        let mut processes = self.processes.lock();
        let ProcessSpace { table, pool } = &mut *processes;
        let directory = table
            .get_mut(pid)
            .ok_or(MemoryError::InvalidArgument("unknown process"))?;
        let index = directory
            .regions
            .find_start(pool, start)
            .ok_or(MemoryError::NotMapped(start))?;
        let vma = pool.get(index).copied().ok_or(MemoryError::NotMapped(start))?;

        {
            let _paging = self.paging.lock();
            let mut buddy = self.buddy.lock();
            let mut frames = self.frames.lock();
            unmap_region(&self.space(directory.root), &vma, &mut buddy, &mut frames);
        }
        directory.regions.remove(pool, index);
        pool.release(index);
        debug!("{pid}: dropped region {}..{}", vma.start, vma.end);
        Ok(())
    }

    /// The region of `pid` containing `va`.
    #[must_use]
    pub fn find_region(&self, pid: ProcessId, va: VirtualAddress) -> Option<Vma> {
        let processes = self.processes.lock();
        let directory = processes.table.get(pid)?;
        let index = directory.regions.find(&processes.pool, va)?;
        processes.pool.get(index).copied()
    }

    #[must_use]
    pub fn region_count(&self, pid: ProcessId) -> Option<u16> {
        self.processes.lock().table.get(pid).map(|d| d.regions.len())
    }

    /// Serve a page fault at `va` in `pid`'s address space.
    ///
    /// A 2 MiB page is used when the region spans the whole aligned 2 MiB
    /// window, its page directory already exists and the buddy allocator has
    /// a block; otherwise one 4 KiB frame is mapped. Faults on pages that are
    /// already present succeed without change.
    ///
    /// # Errors
    /// - [`MemoryError::InvalidArgument`] for an unknown process
    /// - [`MemoryError::NotMapped`] if `va` lies in no region
    /// - [`MemoryError::OutOfMemory`] when no frame is available
    pub fn handle_fault(&self, pid: ProcessId, va: VirtualAddress) -> Result<(), MemoryError> {
        let processes = self.processes.lock();
        let directory = processes
            .table
            .get(pid)
            .ok_or(MemoryError::InvalidArgument("unknown process"))?;
        let vma = directory
            .regions
            .find(&processes.pool, va)
            .and_then(|index| processes.pool.get(index))
            .copied()
            .ok_or(MemoryError::NotMapped(va))?;

        let _paging = self.paging.lock();
        let space = self.space(directory.root);
        let page = va.align_down::<Size4K>();
        if space.is_mapped(page) {
            trace!("{pid}: fault at {va} already resolved");
            return Ok(());
        }

        let flags = vma.flags.mapping_flags();
        let request = if vma.policy.zero_fills() {
            AllocRequest::ZEROED
        } else {
            AllocRequest::GENERAL
        };

        let window = va.align_down::<Size2M>();
        if let Some(window_end) = window.checked_add(Size2M::SIZE)
            && vma.covers(window, window_end)
            && space.can_map_2m(window)
        {
            let mut buddy = self.buddy.lock();
            if let Ok(block) = buddy.alloc_pages(FRAMES_PER_2M, request) {
                match space.map_2m(window, block, flags) {
                    Ok(()) => {
                        trace!("{pid}: mapped 2 MiB page {window} -> {block}");
                        return Ok(());
                    }
                    Err(e) => {
                        debug!("{pid}: 2 MiB mapping at {window} failed ({e}), using 4 KiB");
                        if let Err(e) = buddy.free_pages(block) {
                            warn!("cannot return buddy block {block}: {e}");
                        }
                    }
                }
            }
        }

        let mut frames = self.frames.lock();
        map_fresh_page(&space, &mut frames, page, request, flags)?;
        trace!("{pid}: mapped 4 KiB page {page}");
        Ok(())
    }
}

/// Allocate a frame for `request` and map it at `va`, undoing the allocation
/// if the mapping fails.
fn map_fresh_page<M: PhysMapper, T: Mmu>(
    space: &AddressSpace<'_, M, T>,
    frames: &mut FrameAllocator<'_, M>,
    va: VirtualAddress,
    request: AllocRequest,
    flags: MappingFlags,
) -> Result<(), MemoryError> {
    let frame = frames.allocate_frame(request)?;
    if let Err(e) = space.map_4k(&mut *frames, va, frame, flags) {
        release_frame(frames, frame);
        return Err(e.into());
    }
    Ok(())
}

/// Unmap the 4 KiB pages `[start, end)` and free their frames.
fn unmap_pages<M: PhysMapper, T: Mmu>(
    space: &AddressSpace<'_, M, T>,
    start: VirtualAddress,
    end: VirtualAddress,
    frames: &mut FrameAllocator<'_, M>,
) {
    let mut va = start;
    while va < end {
        if let Ok(Some(leaf)) = space.unmap(va) {
            release_frame(frames, leaf.base);
        }
        va += Size4K::SIZE;
    }
}

/// Unmap everything inside `vma`, handing each leaf back to its allocator.
fn unmap_region<M: PhysMapper, T: Mmu>(
    space: &AddressSpace<'_, M, T>,
    vma: &Vma,
    buddy: &mut BuddyAllocator<'_, M>,
    frames: &mut FrameAllocator<'_, M>,
) {
    let mut va = vma.start;
    while va < vma.end {
        let next = match space.unmap(va) {
            Ok(Some(leaf)) => {
                let next = leaf.va + leaf.size.bytes();
                release_leaf(leaf, buddy, frames);
                next
            }
            Ok(None) => va + Size4K::SIZE,
            Err(e) => {
                warn!("cannot unmap {va}: {e}");
                va + Size4K::SIZE
            }
        };
        va = next.max(va + Size4K::SIZE);
    }
}
