//! # Kernel heap
//!
//! Variable-size allocations inside a fixed virtual window
//! (`KERNEL_HEAP_BASE`, 256 MiB by default). The window is backed lazily: only
//! `[start, mapped_end)` is mapped, and the heap grows page-wise at its end
//! through a [`HeapBacking`].
//!
//! ## Block layout
//!
//! ```text
//!  ┌──────────── BlockHeader (48 B) ─────────────┐┌── payload ──┐
//!  │ magic │ flags │ size │ checksum │ next │ prev ││  size bytes │
//!  └─────────────────────────────────────────────┘└─────────────┘
//!                                                 ▲
//!                                                 └─ pointer handed out
//! ```
//!
//! `checksum = magic ^ size ^ flags` is verified before a header's links are
//! followed. A mismatch, or freeing a block that is already free, halts.
//!
//! ## Free lists
//!
//! Sixteen segregated, doubly linked lists. Class `i` holds free blocks with
//! a payload of at most `16 << i` bytes (16 B .. 256 KiB); class 15 holds
//! everything larger. Allocation scans the request's class first-fit, then
//! the larger classes. Freed blocks merge with address-adjacent free blocks
//! of any class.

use crate::error::{Corruption, MemoryError, halt_on_corruption};
use core::ptr::{self, NonNull};
use kernel_memory_addresses::{PageSize, Size4K, VirtualAddress};
use log::{debug, trace, warn};

/// Alignment of every payload pointer.
pub const HEAP_ALIGN: usize = 16;

/// Smallest payload a block can carry.
pub const MIN_BLOCK: u64 = 16;

pub const SIZE_CLASSES: usize = 16;

const MAGIC_FREE: u32 = 0x4652_4545;
const MAGIC_USED: u32 = 0x5553_4544;
const FLAG_FREE: u32 = 1;

#[repr(C, align(16))]
struct BlockHeader {
    magic: u32,
    flags: u32,
    size: u64,
    checksum: u64,
    next: *mut BlockHeader,
    prev: *mut BlockHeader,
}

/// Bytes of bookkeeping in front of every payload.
pub const HEADER_SIZE: u64 = size_of::<BlockHeader>() as u64;

const _: () = {
    assert!(HEADER_SIZE == 48);
    assert!(HEADER_SIZE % HEAP_ALIGN as u64 == 0);
};

impl BlockHeader {
    const fn checksum_of(magic: u32, size: u64, flags: u32) -> u64 {
        magic as u64 ^ size ^ flags as u64
    }

    const fn new(free: bool, size: u64) -> Self {
        let (magic, flags) = if free { (MAGIC_FREE, FLAG_FREE) } else { (MAGIC_USED, 0) };
        Self {
            magic,
            flags,
            size,
            checksum: Self::checksum_of(magic, size, flags),
            next: ptr::null_mut(),
            prev: ptr::null_mut(),
        }
    }

    const fn is_intact(&self) -> bool {
        self.checksum == Self::checksum_of(self.magic, self.size, self.flags)
            && (self.magic == MAGIC_FREE || self.magic == MAGIC_USED)
    }

    const fn is_free(&self) -> bool {
        self.magic == MAGIC_FREE && self.flags & FLAG_FREE != 0
    }

    fn set_state(&mut self, free: bool, size: u64) {
        let (next, prev) = (self.next, self.prev);
        *self = Self::new(free, size);
        self.next = next;
        self.prev = prev;
    }
}

/// Provides the pages behind the heap window.
pub trait HeapBacking {
    /// Map one fresh, writable kernel page at `va`.
    ///
    /// # Errors
    /// Whatever prevented the mapping; the heap undoes earlier pages of the
    /// same expansion and forwards the error.
    fn map_page(&mut self, va: VirtualAddress) -> Result<(), MemoryError>;

    /// Unmap the page at `va` and release its frame.
    fn unmap_page(&mut self, va: VirtualAddress);
}

impl<B: HeapBacking + ?Sized> HeapBacking for &mut B {
    fn map_page(&mut self, va: VirtualAddress) -> Result<(), MemoryError> {
        (**self).map_page(va)
    }

    fn unmap_page(&mut self, va: VirtualAddress) {
        (**self).unmap_page(va);
    }
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct HeapStats {
    pub mapped_bytes: u64,
    /// Payload bytes on the free lists.
    pub free_bytes: u64,
    /// Payload bytes of live allocations.
    pub allocated_bytes: u64,
    pub allocations: u64,
    pub frees: u64,
    pub expansions: u64,
    pub free_blocks: u64,
    pub largest_free_block: u64,
    /// `100 - largest * 100 / free`, 0 when nothing is free.
    pub fragmentation_percent: u8,
}

pub struct KernelHeap {
    start: u64,
    mapped_end: u64,
    limit: u64,
    min_expansion_pages: u64,
    classes: [*mut BlockHeader; SIZE_CLASSES],
    allocated_bytes: u64,
    allocations: u64,
    frees: u64,
    expansions: u64,
}

// SAFETY: the heap owns every block in its window; the raw pointers never
// leave it except as payload pointers handed to the caller.
unsafe impl Send for KernelHeap {}

/// Free-list class of a payload size.
#[allow(clippy::cast_possible_truncation)]
const fn size_class(size: u64) -> usize {
    if size <= MIN_BLOCK {
        return 0;
    }
    let class = (u64::BITS - (size - 1).leading_zeros()) as usize - 4;
    if class >= SIZE_CLASSES {
        SIZE_CLASSES - 1
    } else {
        class
    }
}

impl KernelHeap {
    /// An empty heap over `[start, limit)`. Nothing is mapped yet.
    ///
    /// # Errors
    /// [`MemoryError::InvalidArgument`] for an unaligned or empty window or a
    /// zero expansion minimum.
    pub fn new(
        start: VirtualAddress,
        limit: VirtualAddress,
        min_expansion_pages: u64,
    ) -> Result<Self, MemoryError> {
        if !start.is_aligned::<Size4K>() || !limit.is_aligned::<Size4K>() || limit <= start {
            return Err(MemoryError::InvalidArgument("heap window must be page aligned and non-empty"));
        }
        if min_expansion_pages == 0 {
            return Err(MemoryError::InvalidArgument("heap expansion minimum must be non-zero"));
        }
        Ok(Self {
            start: start.as_u64(),
            mapped_end: start.as_u64(),
            limit: limit.as_u64(),
            min_expansion_pages,
            classes: [ptr::null_mut(); SIZE_CLASSES],
            allocated_bytes: 0,
            allocations: 0,
            frees: 0,
            expansions: 0,
        })
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        VirtualAddress::new(self.start)
    }

    #[inline]
    #[must_use]
    pub const fn mapped_end(&self) -> VirtualAddress {
        VirtualAddress::new(self.mapped_end)
    }

    #[inline]
    #[must_use]
    pub const fn limit(&self) -> VirtualAddress {
        VirtualAddress::new(self.limit)
    }

    /// Payload size for a request of `size` bytes.
    fn request_size(&self, size: usize) -> Result<u64, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidArgument("zero-sized heap allocation"));
        }
        let size = size as u64;
        if size > self.limit - self.start {
            return Err(MemoryError::InvalidArgument("allocation larger than the heap"));
        }
        Ok(kernel_memory_addresses::align_up(size.max(MIN_BLOCK), HEAP_ALIGN as u64))
    }

    /// Allocate `size` bytes, 16-byte aligned.
    ///
    /// Grows the heap by at least the configured minimum when no free block fits.
    ///
    /// # Errors
    /// - [`MemoryError::InvalidArgument`] for zero or larger-than-heap sizes
    /// - [`MemoryError::OutOfMemory`] (or the backing's error) if the heap cannot grow
    pub fn allocate<B: HeapBacking + ?Sized>(
        &mut self,
        size: usize,
        backing: &mut B,
    ) -> Result<NonNull<u8>, MemoryError> {
        let request = self.request_size(size)?;
        if let Some(block) = self.find_fit(request) {
            return Ok(self.take(block, request));
        }
        self.expand(request, backing)?;
        let block = self.find_fit(request).ok_or(MemoryError::OutOfMemory)?;
        Ok(self.take(block, request))
    }

    /// As [`allocate`](Self::allocate), with the payload zeroed.
    ///
    /// # Errors
    /// As [`allocate`](Self::allocate).
    pub fn allocate_zeroed<B: HeapBacking + ?Sized>(
        &mut self,
        size: usize,
        backing: &mut B,
    ) -> Result<NonNull<u8>, MemoryError> {
        let ptr = self.allocate(size, backing)?;
        // SAFETY: the block holds at least `size` payload bytes.
        unsafe { ptr.as_ptr().write_bytes(0, size) };
        Ok(ptr)
    }

    /// Resize an allocation, moving it if it cannot stay in place.
    ///
    /// The first `min(old, new)` bytes are preserved. On error the original
    /// allocation is untouched.
    ///
    /// # Errors
    /// As [`allocate`](Self::allocate) and [`free`](Self::free).
    pub fn reallocate<B: HeapBacking + ?Sized>(
        &mut self,
        ptr: NonNull<u8>,
        new_size: usize,
        backing: &mut B,
    ) -> Result<NonNull<u8>, MemoryError> {
        let old = self.usable_size(ptr)?;
        if self.request_size(new_size)? <= old as u64 {
            return Ok(ptr);
        }
        let moved = self.allocate(new_size, backing)?;
        // SAFETY: distinct live blocks, `old < new_size`.
        unsafe { ptr::copy_nonoverlapping(ptr.as_ptr(), moved.as_ptr(), old) };
        self.free(ptr)?;
        Ok(moved)
    }

    /// Return an allocation to the heap.
    ///
    /// # Errors
    /// [`MemoryError::InvalidArgument`] for pointers that are not inside the
    /// mapped heap or not aligned like a payload.
    ///
    /// # Panics
    /// Halts on a damaged header or a double free.
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<(), MemoryError> {
        let block = self.block_of(ptr)?;
        // SAFETY: `block_of` verified the header lies inside the mapped heap.
        let header = unsafe { &mut *block };
        if header.is_free() {
            halt_on_corruption(Corruption::HeapDoubleFree(VirtualAddress::from_ptr(block)));
        }
        let size = header.size;
        header.set_state(true, size);
        self.allocated_bytes -= size;
        self.frees += 1;
        self.insert_coalescing(block);
        Ok(())
    }

    /// Payload capacity of a live allocation.
    ///
    /// # Errors
    /// [`MemoryError::InvalidArgument`] for foreign or already freed pointers.
    #[allow(clippy::cast_possible_truncation)]
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize, MemoryError> {
        let block = self.block_of(ptr)?;
        // SAFETY: verified by `block_of`.
        let header = unsafe { &*block };
        if header.is_free() {
            return Err(MemoryError::InvalidArgument("heap block is not allocated"));
        }
        Ok(header.size as usize)
    }

    /// Header of the allocation at `ptr`, checksum verified.
    fn block_of(&self, ptr: NonNull<u8>) -> Result<*mut BlockHeader, MemoryError> {
        let addr = ptr.as_ptr() as u64;
        if addr < self.start + HEADER_SIZE || addr >= self.mapped_end {
            return Err(MemoryError::InvalidArgument("pointer outside the kernel heap"));
        }
        if addr % HEAP_ALIGN as u64 != 0 {
            return Err(MemoryError::InvalidArgument("pointer is not a heap allocation"));
        }
        let block = VirtualAddress::new(addr - HEADER_SIZE).as_mut_ptr::<BlockHeader>();
        // SAFETY: inside the mapped window and 16-byte aligned.
        if !unsafe { &*block }.is_intact() {
            halt_on_corruption(Corruption::HeapChecksum(VirtualAddress::from_ptr(block)));
        }
        Ok(block)
    }

    /// Verified header of a block found on a free list.
    fn free_header<'a>(block: *mut BlockHeader) -> &'a mut BlockHeader {
        // SAFETY: free-list nodes point into the mapped heap.
        let header = unsafe { &mut *block };
        if !header.is_intact() {
            halt_on_corruption(Corruption::HeapChecksum(VirtualAddress::from_ptr(block)));
        }
        if !header.is_free() {
            halt_on_corruption(Corruption::HeapMisfiled(VirtualAddress::from_ptr(block)));
        }
        header
    }

    fn find_fit(&self, request: u64) -> Option<*mut BlockHeader> {
        for class in size_class(request)..SIZE_CLASSES {
            let mut current = self.classes[class];
            while !current.is_null() {
                let header = Self::free_header(current);
                if header.size >= request {
                    return Some(current);
                }
                current = header.next;
            }
        }
        None
    }

    /// Hand out `block`, splitting off the tail if it is big enough to be useful.
    fn take(&mut self, block: *mut BlockHeader, request: u64) -> NonNull<u8> {
        self.unlink(block);
        let header = Self::free_header(block);
        let mut size = header.size;
        if size > request + MIN_BLOCK + HEADER_SIZE {
            let rest = (block as u64 + HEADER_SIZE + request) as *mut BlockHeader;
            // SAFETY: `rest` lies inside `block`'s payload.
            unsafe { rest.write(BlockHeader::new(true, size - request - HEADER_SIZE)) };
            self.insert(rest);
            size = request;
        }
        header.set_state(false, size);
        header.next = ptr::null_mut();
        header.prev = ptr::null_mut();
        self.allocated_bytes += size;
        self.allocations += 1;
        // SAFETY: the payload directly follows a non-null header.
        unsafe { NonNull::new_unchecked(block.cast::<u8>().add(HEADER_SIZE as usize)) }
    }

    fn insert(&mut self, block: *mut BlockHeader) {
        // SAFETY: `block` is a free header inside the heap.
        let header = unsafe { &mut *block };
        let class = size_class(header.size);
        let head = self.classes[class];
        header.prev = ptr::null_mut();
        header.next = head;
        if !head.is_null() {
            // SAFETY: list nodes are valid headers.
            unsafe { (*head).prev = block };
        }
        self.classes[class] = block;
    }

    fn unlink(&mut self, block: *mut BlockHeader) {
        // SAFETY: `block` is on a free list.
        let header = unsafe { &mut *block };
        if header.prev.is_null() {
            self.classes[size_class(header.size)] = header.next;
        } else {
            // SAFETY: list nodes are valid headers.
            unsafe { (*header.prev).next = header.next };
        }
        if !header.next.is_null() {
            // SAFETY: as above.
            unsafe { (*header.next).prev = header.prev };
        }
        header.next = ptr::null_mut();
        header.prev = ptr::null_mut();
    }

    /// A free block ending where `block` starts, or starting where it ends.
    fn find_adjacent(&self, block: *mut BlockHeader) -> Option<*mut BlockHeader> {
        let start = block as u64;
        // SAFETY: `block` is a valid header.
        let end = start + HEADER_SIZE + unsafe { (*block).size };
        for head in self.classes {
            let mut current = head;
            while !current.is_null() {
                let header = Self::free_header(current);
                let node = current as u64;
                if node + HEADER_SIZE + header.size == start || node == end {
                    return Some(current);
                }
                current = header.next;
            }
        }
        None
    }

    /// Merge `block` with every adjacent free block, then file the result.
    fn insert_coalescing(&mut self, block: *mut BlockHeader) {
        let mut block = block;
        while let Some(neighbor) = self.find_adjacent(block) {
            self.unlink(neighbor);
            let (low, high) = if (neighbor as u64) < block as u64 {
                (neighbor, block)
            } else {
                (block, neighbor)
            };
            // SAFETY: both are valid, distinct headers.
            let (low_header, high_size) = unsafe { (&mut *low, (*high).size) };
            let merged = low_header.size + HEADER_SIZE + high_size;
            low_header.set_state(true, merged);
            // Scrub the absorbed header so stale pointers to it fail validation.
            // SAFETY: `high` is now payload of `low`.
            unsafe { (*high).magic = 0 };
            trace!("heap: merged blocks at {low:p} and {high:p}");
            block = low;
        }
        self.insert(block);
    }

    fn expand<B: HeapBacking + ?Sized>(&mut self, request: u64, backing: &mut B) -> Result<(), MemoryError> {
        let pages = (request + HEADER_SIZE)
            .div_ceil(Size4K::SIZE)
            .max(self.min_expansion_pages);
        self.grow(pages, backing)
    }

    /// Map `pages` more pages at the end of the heap and add them as free space.
    ///
    /// If any page fails, the pages mapped so far are unmapped again and the
    /// heap is left as it was.
    ///
    /// # Errors
    /// [`MemoryError::OutOfMemory`] when the window is exhausted, or the
    /// backing's error.
    pub fn grow<B: HeapBacking + ?Sized>(&mut self, pages: u64, backing: &mut B) -> Result<(), MemoryError> {
        if pages == 0 {
            return Err(MemoryError::InvalidArgument("zero pages requested"));
        }
        let bytes = pages
            .checked_mul(Size4K::SIZE)
            .ok_or(MemoryError::OutOfMemory)?;
        let new_end = self
            .mapped_end
            .checked_add(bytes)
            .filter(|end| *end <= self.limit)
            .ok_or(MemoryError::OutOfMemory)?;

        for page in 0..pages {
            let va = VirtualAddress::new(self.mapped_end + page * Size4K::SIZE);
            if let Err(e) = backing.map_page(va) {
                warn!("heap expansion failed at {va}: {e}");
                for undo in (0..page).rev() {
                    backing.unmap_page(VirtualAddress::new(self.mapped_end + undo * Size4K::SIZE));
                }
                return Err(e);
            }
        }

        let block = VirtualAddress::new(self.mapped_end).as_mut_ptr::<BlockHeader>();
        // SAFETY: freshly mapped, page aligned.
        unsafe { block.write(BlockHeader::new(true, bytes - HEADER_SIZE)) };
        self.mapped_end = new_end;
        self.expansions += 1;
        debug!("heap grown by {pages} pages to {:#x}", self.mapped_end);
        self.insert_coalescing(block);
        Ok(())
    }

    /// Walk every free list and check each header.
    ///
    /// # Errors
    /// [`MemoryError::CorruptionDetected`] describing the first bad block.
    pub fn validate(&self) -> Result<(), MemoryError> {
        for (class, head) in self.classes.into_iter().enumerate() {
            let mut prev: *mut BlockHeader = ptr::null_mut();
            let mut current = head;
            while !current.is_null() {
                let va = VirtualAddress::from_ptr(current);
                let addr = current as u64;
                if addr < self.start || addr + HEADER_SIZE > self.mapped_end {
                    return Err(MemoryError::CorruptionDetected(Corruption::HeapChecksum(va)));
                }
                // SAFETY: inside the mapped heap.
                let header = unsafe { &*current };
                if !header.is_intact() {
                    return Err(MemoryError::CorruptionDetected(Corruption::HeapChecksum(va)));
                }
                if !header.is_free() || size_class(header.size) != class || header.prev != prev {
                    return Err(MemoryError::CorruptionDetected(Corruption::HeapMisfiled(va)));
                }
                prev = current;
                current = header.next;
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            mapped_bytes: self.mapped_end - self.start,
            allocated_bytes: self.allocated_bytes,
            allocations: self.allocations,
            frees: self.frees,
            expansions: self.expansions,
            ..HeapStats::default()
        };
        for head in self.classes {
            let mut current = head;
            while !current.is_null() {
                let header = Self::free_header(current);
                stats.free_blocks += 1;
                stats.free_bytes += header.size;
                stats.largest_free_block = stats.largest_free_block.max(header.size);
                current = header.next;
            }
        }
        if stats.free_bytes > 0 {
            #[allow(clippy::cast_possible_truncation)]
            let fragmentation = (100 - stats.largest_free_block * 100 / stats.free_bytes) as u8;
            stats.fragmentation_percent = fragmentation;
        }
        stats
    }
}
