//! `GlobalAlloc` on top of the kernel heap.
//!
//! ```ignore
//! #[global_allocator]
//! static ALLOCATOR: KernelHeapAllocator = KernelHeapAllocator::new();
//!
//! // once the memory manager lives in a static:
//! ALLOCATOR.install(manager)?;
//! ```

use crate::error::MemoryError;
use crate::heap::HEAP_ALIGN;
use crate::manager::MemoryManager;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use kernel_sync::SyncOnceCell;
use kernel_vmem::{Mmu, PhysMapper};
use log::warn;

/// A heap that can serve Rust allocations from any CPU.
pub trait HeapService: Sync {
    fn heap_allocate(&self, size: usize) -> Option<NonNull<u8>>;
    fn heap_free(&self, ptr: NonNull<u8>);
}

impl<M: PhysMapper + Sync, T: Mmu + Sync> HeapService for MemoryManager<'_, M, T> {
    fn heap_allocate(&self, size: usize) -> Option<NonNull<u8>> {
        self.kmalloc(size).ok()
    }

    fn heap_free(&self, ptr: NonNull<u8>) {
        if let Err(e) = self.kfree(ptr) {
            warn!("global allocator: rejected free of {ptr:p}: {e}");
        }
    }
}

/// Usable as `#[global_allocator]`. Every allocation fails until a
/// [`HeapService`] is installed; alignments above 16 bytes always fail.
pub struct KernelHeapAllocator {
    service: SyncOnceCell<&'static dyn HeapService>,
}

impl Default for KernelHeapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelHeapAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            service: SyncOnceCell::new(),
        }
    }

    /// Route allocations to `service`.
    ///
    /// # Errors
    /// [`MemoryError::InvalidArgument`] if a service is already installed.
    pub fn install(&self, service: &'static dyn HeapService) -> Result<(), MemoryError> {
        self.service
            .set(service)
            .map_err(|_| MemoryError::InvalidArgument("heap service already installed"))
    }

    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.service.get().is_some()
    }
}

// SAFETY: heap blocks are 16-byte aligned, disjoint, and stay valid until freed.
unsafe impl GlobalAlloc for KernelHeapAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > HEAP_ALIGN {
            return ptr::null_mut();
        }
        self.service
            .get()
            .and_then(|service| service.heap_allocate(layout.size().max(1)))
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let (Some(service), Some(ptr)) = (self.service.get(), NonNull::new(ptr)) {
            service.heap_free(ptr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Hands out slices of a static arena and records frees.
    struct Arena {
        next: Mutex<usize>,
        freed: Mutex<Vec<usize>>,
        base: usize,
    }

    impl HeapService for Arena {
        fn heap_allocate(&self, size: usize) -> Option<NonNull<u8>> {
            let mut next = self.next.lock().unwrap();
            let ptr = self.base + *next;
            *next += size.next_multiple_of(16);
            NonNull::new(ptr as *mut u8)
        }

        fn heap_free(&self, ptr: NonNull<u8>) {
            self.freed.lock().unwrap().push(ptr.as_ptr() as usize);
        }
    }

    fn arena() -> &'static Arena {
        let storage: &'static mut [u128] = Box::leak(vec![0u128; 64].into_boxed_slice());
        Box::leak(Box::new(Arena {
            next: Mutex::new(0),
            freed: Mutex::new(Vec::new()),
            base: storage.as_mut_ptr() as usize,
        }))
    }

    #[test]
    fn nothing_is_served_before_install() {
        let allocator = KernelHeapAllocator::new();
        // SAFETY: valid non-zero layout.
        let ptr = unsafe { allocator.alloc(Layout::from_size_align(32, 8).unwrap()) };
        assert!(ptr.is_null());
        assert!(!allocator.is_installed());
    }

    #[test]
    fn installed_service_serves_and_frees() {
        let allocator = KernelHeapAllocator::new();
        let arena = arena();
        allocator.install(arena).unwrap();
        assert!(allocator.install(arena).is_err());

        let layout = Layout::from_size_align(24, 16).unwrap();
        // SAFETY: valid layout; the pointer is freed with the same layout.
        unsafe {
            let a = allocator.alloc(layout);
            let b = allocator.alloc(layout);
            assert!(!a.is_null() && !b.is_null());
            assert_eq!(b as usize - a as usize, 32);
            allocator.dealloc(a, layout);
        }
        assert_eq!(arena.freed.lock().unwrap().len(), 1);
    }

    #[test]
    fn over_aligned_requests_fail() {
        let allocator = KernelHeapAllocator::new();
        allocator.install(arena()).unwrap();
        // SAFETY: valid layout.
        let ptr = unsafe { allocator.alloc(Layout::from_size_align(64, 64).unwrap()) };
        assert!(ptr.is_null());
    }
}
