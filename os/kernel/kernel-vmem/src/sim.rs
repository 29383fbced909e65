//! # Simulated physical memory and MMU
//!
//! Host-side doubles for [`PhysMapper`], [`Mmu`] and [`FrameAlloc`] so that
//! page tables, frame metadata and heap headers can be exercised in ordinary
//! `#[test]`s. Physical addresses are byte offsets into one zeroed,
//! 4 KiB-aligned host allocation.

use crate::{FrameAlloc, Mmu, PhysMapper};
use alloc::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};

/// A block of host memory standing in for physical RAM `[0, size)`.
pub struct SimulatedRam {
    base: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the buffer is plain bytes; synchronization is the user's business
// exactly as with real RAM.
unsafe impl Send for SimulatedRam {}
unsafe impl Sync for SimulatedRam {}

impl SimulatedRam {
    /// Allocate `bytes` (rounded up to 4 KiB) of zeroed RAM.
    ///
    /// # Panics
    /// If `bytes` is zero or the host allocation fails.
    #[must_use]
    pub fn new(bytes: u64) -> Self {
        let size = usize::try_from(kernel_memory_addresses::align_up(bytes, Size4K::SIZE))
            .expect("simulated RAM size fits usize");
        assert!(size > 0, "simulated RAM must not be empty");
        let layout = Layout::from_size_align(size, 4096).expect("valid layout");
        // SAFETY: non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let Some(base) = NonNull::new(ptr) else {
            handle_alloc_error(layout)
        };
        Self { base, layout }
    }

    #[must_use]
    pub fn with_frames(frames: u64) -> Self {
        Self::new(frames * Size4K::SIZE)
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.layout.size() as u64
    }

    fn ptr(&self, pa: PhysicalAddress, len: u64) -> *mut u8 {
        let end = pa.as_u64().checked_add(len).expect("range overflow");
        assert!(end <= self.size(), "{pa:?}+{len:#x} outside simulated RAM");
        // SAFETY: bounds checked above.
        unsafe { self.base.as_ptr().add(pa.as_u64() as usize) }
    }

    #[must_use]
    pub fn read_u64(&self, pa: PhysicalAddress) -> u64 {
        // SAFETY: in bounds; unaligned reads are fine on the host.
        unsafe { self.ptr(pa, 8).cast::<u64>().read_unaligned() }
    }

    pub fn write_u64(&self, pa: PhysicalAddress, value: u64) {
        // SAFETY: in bounds.
        unsafe { self.ptr(pa, 8).cast::<u64>().write_unaligned(value) }
    }

    /// Fill `len` bytes at `pa` with `byte`.
    pub fn fill(&self, pa: PhysicalAddress, len: u64, byte: u8) {
        // SAFETY: in bounds.
        unsafe { self.ptr(pa, len).write_bytes(byte, len as usize) }
    }

    /// Whether every byte of the 4 KiB frame at `pa` is zero.
    #[must_use]
    pub fn frame_is_zero(&self, pa: PhysicalAddress) -> bool {
        let p = self.ptr(pa.align_down::<Size4K>(), Size4K::SIZE);
        // SAFETY: in bounds, u8 has no invalid values.
        let bytes = unsafe { core::slice::from_raw_parts(p, Size4K::SIZE as usize) };
        bytes.iter().all(|b| *b == 0)
    }
}

impl Drop for SimulatedRam {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { dealloc(self.base.as_ptr(), self.layout) }
    }
}

impl PhysMapper for SimulatedRam {
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> Option<NonNull<u8>> {
        if pa.as_u64() >= self.size() {
            return None;
        }
        // SAFETY: in bounds of the allocation.
        NonNull::new(unsafe { self.base.as_ptr().add(pa.as_u64() as usize) })
    }
}

/// MMU double that records what would have hit the hardware.
#[derive(Debug, Default)]
pub struct SimMmu {
    root: AtomicU64,
    switches: AtomicUsize,
    invalidations: AtomicUsize,
    last_invalidated: AtomicU64,
    flushes: AtomicUsize,
}

impl SimMmu {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            root: AtomicU64::new(0),
            switches: AtomicUsize::new(0),
            invalidations: AtomicUsize::new(0),
            last_invalidated: AtomicU64::new(0),
            flushes: AtomicUsize::new(0),
        }
    }

    /// Pretend the bootloader left `root` in CR3.
    #[must_use]
    pub fn with_root(root: PhysicalPage<Size4K>) -> Self {
        let mmu = Self::new();
        mmu.root.store(root.base().as_u64(), Ordering::Relaxed);
        mmu
    }

    pub fn switches(&self) -> usize {
        self.switches.load(Ordering::Relaxed)
    }

    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::Relaxed)
    }

    pub fn last_invalidated(&self) -> VirtualAddress {
        VirtualAddress::new(self.last_invalidated.load(Ordering::Relaxed))
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::Relaxed)
    }
}

impl Mmu for SimMmu {
    fn active_root(&self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_addr(PhysicalAddress::new(self.root.load(Ordering::Relaxed)))
    }

    unsafe fn switch_root(&self, root: PhysicalPage<Size4K>) {
        self.root.store(root.base().as_u64(), Ordering::Relaxed);
        self.switches.fetch_add(1, Ordering::Relaxed);
    }

    fn invalidate_page(&self, va: VirtualAddress) {
        self.last_invalidated
            .store(va.align_down::<Size4K>().as_u64(), Ordering::Relaxed);
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    fn flush_all(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }
}

/// A bump frame source over `[start, end)` that reuses freed frames first.
///
/// Good enough for page-table tests; the real allocator lives in `kernel-alloc`.
#[derive(Debug)]
pub struct BumpFrames {
    next: u64,
    end: u64,
    freed: Vec<PhysicalPage<Size4K>>,
    allocated: usize,
}

impl BumpFrames {
    #[must_use]
    pub const fn new(start: PhysicalAddress, end: PhysicalAddress) -> Self {
        Self {
            next: start.as_u64(),
            end: end.as_u64(),
            freed: Vec::new(),
            allocated: 0,
        }
    }

    /// Frames currently handed out.
    #[must_use]
    pub const fn outstanding(&self) -> usize {
        self.allocated
    }
}

impl FrameAlloc for BumpFrames {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        let page = if let Some(page) = self.freed.pop() {
            page
        } else {
            if self.next + Size4K::SIZE > self.end {
                return None;
            }
            let page = PhysicalPage::from_addr(PhysicalAddress::new(self.next));
            self.next += Size4K::SIZE;
            page
        };
        self.allocated += 1;
        Some(page)
    }

    fn free_4k(&mut self, page: PhysicalPage<Size4K>) {
        self.allocated -= 1;
        self.freed.push(page);
    }
}
