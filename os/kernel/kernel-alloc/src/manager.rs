//! The memory manager: every allocator service behind its own lock.
//!
//! ```text
//!                 ┌──────────────── MemoryManager ────────────────┐
//!  page fault ──► │ processes ─► heap ─► paging ─► buddy ─► frames │
//!  kmalloc    ──► │      (locks are always taken left to right)    │
//!                 └───────────────────────────────────────────────┘
//! ```
//!
//! Each lock is an [`IrqSpinLock`], so interrupts are masked while any
//! service is held and an interrupt handler may allocate.

use crate::buddy::BuddyAllocator;
use crate::error::MemoryError;
use crate::frame_alloc::{FrameAllocator, FrameInfo};
use crate::heap::{HeapBacking, KernelHeap};
use crate::process::{ProcessId, ProcessTable};
use crate::request::AllocRequest;
use crate::stats::{MemoryStats, VmaStats};
use crate::vma::VmaPool;
use core::ptr::NonNull;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_sync::IrqSpinLock;
use kernel_vmem::{AddressSpace, Leaf, LeafSize, MappingFlags, Mmu, PhysMapper, RootPage};
use log::warn;

/// Which top-level page table a switch targets.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DirectoryRef {
    Kernel,
    Process(ProcessId),
}

/// Process address spaces and the descriptors of their regions.
pub(crate) struct ProcessSpace {
    pub(crate) table: ProcessTable,
    pub(crate) pool: VmaPool,
}

/// State guarded by the paging lock, which also serializes every change to
/// page tables.
pub(crate) struct Paging {
    pub(crate) active: DirectoryRef,
}

pub struct MemoryManager<'m, M: PhysMapper, T: Mmu> {
    pub(crate) mapper: &'m M,
    pub(crate) mmu: &'m T,
    pub(crate) kernel_root: RootPage,
    pub(crate) processes: IrqSpinLock<ProcessSpace>,
    pub(crate) heap: IrqSpinLock<KernelHeap>,
    pub(crate) paging: IrqSpinLock<Paging>,
    pub(crate) buddy: IrqSpinLock<BuddyAllocator<'m, M>>,
    pub(crate) frames: IrqSpinLock<FrameAllocator<'m, M>>,
}

/// Backs heap growth with kernel pages of a live manager.
struct KernelPages<'a, 'm, M: PhysMapper, T: Mmu> {
    manager: &'a MemoryManager<'m, M, T>,
}

impl<M: PhysMapper, T: Mmu> HeapBacking for KernelPages<'_, '_, M, T> {
    fn map_page(&mut self, va: VirtualAddress) -> Result<(), MemoryError> {
        self.manager.back_kernel_page(va)
    }

    fn unmap_page(&mut self, va: VirtualAddress) {
        self.manager.release_kernel_page(va);
    }
}

impl<'m, M: PhysMapper, T: Mmu> MemoryManager<'m, M, T> {
    /// Assemble a manager from already initialized services.
    pub(crate) fn from_parts(
        mapper: &'m M,
        mmu: &'m T,
        kernel_root: RootPage,
        heap: KernelHeap,
        buddy: BuddyAllocator<'m, M>,
        frames: FrameAllocator<'m, M>,
    ) -> Self {
        Self {
            mapper,
            mmu,
            kernel_root,
            processes: IrqSpinLock::new(ProcessSpace {
                table: ProcessTable::new(),
                pool: VmaPool::empty(),
            }),
            heap: IrqSpinLock::new(heap),
            paging: IrqSpinLock::new(Paging {
                active: DirectoryRef::Kernel,
            }),
            buddy: IrqSpinLock::new(buddy),
            frames: IrqSpinLock::new(frames),
        }
    }

    #[inline]
    #[must_use]
    pub const fn kernel_root(&self) -> RootPage {
        self.kernel_root
    }

    #[inline]
    pub(crate) const fn space(&self, root: RootPage) -> AddressSpace<'m, M, T> {
        AddressSpace::from_root(self.mapper, self.mmu, root)
    }

    /// Allocate one frame.
    ///
    /// # Errors
    /// See [`FrameAllocator::allocate_frame`].
    pub fn allocate_frame(&self, request: AllocRequest) -> Result<PhysicalAddress, MemoryError> {
        self.frames.lock().allocate_frame(request)
    }

    /// Allocate `count` physically contiguous frames.
    ///
    /// # Errors
    /// See [`FrameAllocator::allocate_contiguous`].
    pub fn allocate_contiguous(
        &self,
        count: u64,
        request: AllocRequest,
    ) -> Result<PhysicalAddress, MemoryError> {
        self.frames.lock().allocate_contiguous(count, request)
    }

    /// Drop a reference to a frame.
    ///
    /// # Errors
    /// See [`FrameAllocator::free_frame`].
    pub fn free_frame(&self, pa: PhysicalAddress) -> Result<(), MemoryError> {
        self.frames.lock().free_frame(pa)
    }

    /// # Errors
    /// See [`FrameAllocator::free_contiguous`].
    pub fn free_contiguous(&self, pa: PhysicalAddress, count: u64) -> Result<(), MemoryError> {
        self.frames.lock().free_contiguous(pa, count)
    }

    /// Take another reference to an allocated frame.
    ///
    /// # Errors
    /// See [`FrameAllocator::inc_ref`].
    pub fn retain_frame(&self, pa: PhysicalAddress) -> Result<u32, MemoryError> {
        self.frames.lock().inc_ref(pa)
    }

    #[must_use]
    pub fn frame_info(&self, pa: PhysicalAddress) -> Option<FrameInfo> {
        self.frames.lock().frame_info(pa)
    }

    /// Allocate a naturally aligned power-of-two block from the buddy allocator.
    ///
    /// # Errors
    /// See [`BuddyAllocator::alloc_pages`].
    pub fn alloc_pages(&self, count: u64, request: AllocRequest) -> Result<PhysicalAddress, MemoryError> {
        self.buddy.lock().alloc_pages(count, request)
    }

    /// # Errors
    /// See [`BuddyAllocator::free_pages`].
    pub fn free_pages(&self, pa: PhysicalAddress) -> Result<(), MemoryError> {
        self.buddy.lock().free_pages(pa)
    }

    /// Allocate from the kernel heap.
    ///
    /// # Errors
    /// See [`KernelHeap::allocate`].
    pub fn kmalloc(&self, size: usize) -> Result<NonNull<u8>, MemoryError> {
        let mut heap = self.heap.lock();
        heap.allocate(size, &mut KernelPages { manager: self })
    }

    /// # Errors
    /// See [`KernelHeap::allocate_zeroed`].
    pub fn kzalloc(&self, size: usize) -> Result<NonNull<u8>, MemoryError> {
        let mut heap = self.heap.lock();
        heap.allocate_zeroed(size, &mut KernelPages { manager: self })
    }

    /// # Errors
    /// See [`KernelHeap::reallocate`].
    pub fn krealloc(&self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>, MemoryError> {
        let mut heap = self.heap.lock();
        heap.reallocate(ptr, new_size, &mut KernelPages { manager: self })
    }

    /// # Errors
    /// See [`KernelHeap::free`].
    pub fn kfree(&self, ptr: NonNull<u8>) -> Result<(), MemoryError> {
        self.heap.lock().free(ptr)
    }

    /// Map `pages` more pages into the heap window.
    ///
    /// # Errors
    /// See [`KernelHeap::grow`].
    pub fn grow_heap(&self, pages: u64) -> Result<(), MemoryError> {
        let mut heap = self.heap.lock();
        heap.grow(pages, &mut KernelPages { manager: self })
    }

    /// Check every free heap block.
    ///
    /// # Errors
    /// [`MemoryError::CorruptionDetected`] on the first damaged block.
    pub fn validate_heap(&self) -> Result<(), MemoryError> {
        self.heap.lock().validate()
    }

    /// Allocate a frame and map it at kernel address `va`.
    fn back_kernel_page(&self, va: VirtualAddress) -> Result<(), MemoryError> {
        let _paging = self.paging.lock();
        let mut frames = self.frames.lock();
        let pa = frames.allocate_frame(AllocRequest::KERNEL)?;
        let flags = MappingFlags::KERNEL_DATA | MappingFlags::GLOBAL;
        if let Err(e) = self.space(self.kernel_root).map_4k(&mut *frames, va, pa, flags) {
            release_frame(&mut frames, pa);
            return Err(e.into());
        }
        Ok(())
    }

    /// Undo [`back_kernel_page`](Self::back_kernel_page).
    fn release_kernel_page(&self, va: VirtualAddress) {
        let _paging = self.paging.lock();
        match self.space(self.kernel_root).unmap(va) {
            Ok(Some(leaf)) => release_frame(&mut self.frames.lock(), leaf.base),
            Ok(None) => {}
            Err(e) => warn!("cannot unmap kernel page {va}: {e}"),
        }
    }

    /// Map the 4 KiB page `va → pa` in the kernel's address space.
    ///
    /// The mapping is visible in every process, since process directories
    /// share the kernel half.
    ///
    /// # Errors
    /// Mapping errors converted through `From<MapError>`.
    pub fn map_kernel_page(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: MappingFlags,
    ) -> Result<(), MemoryError> {
        if !va.is_higher_half() {
            return Err(MemoryError::InvalidArgument("kernel mappings live in the higher half"));
        }
        let _paging = self.paging.lock();
        let mut frames = self.frames.lock();
        self.space(self.kernel_root).map_4k(&mut *frames, va, pa, flags)?;
        Ok(())
    }

    /// Remove a kernel mapping. The caller keeps ownership of the frame.
    ///
    /// # Errors
    /// [`MemoryError::NotMapped`] if nothing is mapped at `va`.
    pub fn unmap_kernel_page(&self, va: VirtualAddress) -> Result<Leaf, MemoryError> {
        let _paging = self.paging.lock();
        self.space(self.kernel_root)
            .unmap(va)?
            .ok_or(MemoryError::NotMapped(va))
    }

    /// Physical address `va` maps to in `directory`.
    ///
    /// The process table stays locked for the walk, so the directory cannot be
    /// torn down underneath it.
    #[must_use]
    pub fn translate(&self, directory: DirectoryRef, va: VirtualAddress) -> Option<PhysicalAddress> {
        let processes = self.processes.lock();
        let root = self.root_of(&processes.table, directory).ok()?;
        let _paging = self.paging.lock();
        self.space(root).translate(va)
    }

    fn root_of(&self, table: &ProcessTable, directory: DirectoryRef) -> Result<RootPage, MemoryError> {
        match directory {
            DirectoryRef::Kernel => Ok(self.kernel_root),
            DirectoryRef::Process(pid) => table
                .get(pid)
                .map(|d| d.root)
                .ok_or(MemoryError::InvalidArgument("unknown process")),
        }
    }

    /// Load the page table of `target` into CR3.
    ///
    /// The kernel half of a process directory is refreshed from the kernel's
    /// before the switch, so kernel mappings created after the process was
    /// set up are present. If the refresh changed anything the whole TLB is
    /// flushed, global kernel entries included.
    ///
    /// # Errors
    /// [`MemoryError::InvalidArgument`] for an unknown process.
    pub fn switch_directory(&self, target: DirectoryRef) -> Result<(), MemoryError> {
        let processes = self.processes.lock();
        let root = self.root_of(&processes.table, target)?;
        let mut paging = self.paging.lock();
        let space = self.space(root);
        let resynced = space.copy_kernel_half_from(self.kernel_root);
        // SAFETY: the kernel half was synchronized with the kernel's root above.
        unsafe { space.activate() };
        if resynced {
            self.mmu.flush_all();
        }
        paging.active = target;
        Ok(())
    }

    #[must_use]
    pub fn active_directory(&self) -> DirectoryRef {
        self.paging.lock().active
    }

    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        let vmas = {
            let processes = self.processes.lock();
            VmaStats {
                processes: processes.table.len(),
                regions: processes.pool.in_use(),
                capacity: processes.pool.capacity(),
            }
        };
        let heap = self.heap.lock().stats();
        let buddy = self.buddy.lock().stats();
        let frames = self.frames.lock().stats();
        MemoryStats {
            frames,
            buddy,
            heap,
            vmas,
        }
    }
}

/// Free a frame the manager itself allocated; failure means broken bookkeeping.
pub(crate) fn release_frame<M: PhysMapper>(frames: &mut FrameAllocator<'_, M>, pa: PhysicalAddress) {
    if let Err(e) = frames.free_frame(pa) {
        warn!("cannot release frame {pa}: {e}");
    }
}

/// Give the memory behind a removed leaf back to whichever allocator owns it.
pub(crate) fn release_leaf<M: PhysMapper>(
    leaf: Leaf,
    buddy: &mut BuddyAllocator<'_, M>,
    frames: &mut FrameAllocator<'_, M>,
) {
    match leaf.size {
        LeafSize::Size4K => release_frame(frames, leaf.base),
        LeafSize::Size2M if buddy.owns(leaf.base) => {
            if let Err(e) = buddy.free_pages(leaf.base) {
                warn!("cannot release 2 MiB block {}: {e}", leaf.base);
            }
        }
        LeafSize::Size2M | LeafSize::Size1G => {
            warn!("leaking {:?} leaf at {} with foreign backing", leaf.size, leaf.va);
        }
    }
}
