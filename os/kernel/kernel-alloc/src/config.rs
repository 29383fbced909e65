//! Runtime knobs for [`MemoryManager::init`](crate::MemoryManager::init).

use kernel_info::memory::{
    BUDDY_MAX_ORDER, HEAP_MIN_EXPANSION_PAGES, KERNEL_HEAP_BASE, KERNEL_HEAP_SIZE,
};
use kernel_memory_addresses::VirtualAddress;

/// Where the kernel's top-level page table comes from.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum KernelRoot {
    /// Adopt whatever the bootloader left in CR3.
    Active,
    /// Build an empty PML4. The caller populates and activates it.
    Fresh,
}

/// How many frames the buddy allocator's normal zone receives.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BuddyPoolSize {
    /// One eighth of usable memory, rounded down to whole largest blocks.
    Auto,
    Pages(u64),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryConfig {
    pub heap_base: VirtualAddress,
    /// Exclusive end of the heap window.
    pub heap_limit: VirtualAddress,
    /// Pages mapped into the heap during init.
    pub heap_initial_pages: u64,
    pub heap_min_expansion_pages: u64,
    pub buddy_max_order: u8,
    pub buddy_pool: BuddyPoolSize,
    /// Frames below the DMA limit handed to a buddy DMA zone; 0 disables it.
    pub dma_zone_pages: u64,
    /// Capacity of the region descriptor pool.
    pub max_vmas: u16,
    pub kernel_root: KernelRoot,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            heap_base: VirtualAddress::new(KERNEL_HEAP_BASE),
            heap_limit: VirtualAddress::new(KERNEL_HEAP_BASE + KERNEL_HEAP_SIZE),
            heap_initial_pages: 16,
            heap_min_expansion_pages: HEAP_MIN_EXPANSION_PAGES,
            buddy_max_order: BUDDY_MAX_ORDER,
            buddy_pool: BuddyPoolSize::Auto,
            dma_zone_pages: 1024,
            max_vmas: 1024,
            kernel_root: KernelRoot::Active,
        }
    }

    /// Place the heap window at `[base, base + size)`.
    #[must_use]
    pub const fn with_heap_window(mut self, base: VirtualAddress, size: u64) -> Self {
        self.heap_base = base;
        self.heap_limit = VirtualAddress::new(base.as_u64() + size);
        self
    }

    #[must_use]
    pub const fn with_heap_initial_pages(mut self, pages: u64) -> Self {
        self.heap_initial_pages = pages;
        self
    }

    #[must_use]
    pub const fn with_heap_min_expansion_pages(mut self, pages: u64) -> Self {
        self.heap_min_expansion_pages = pages;
        self
    }

    #[must_use]
    pub const fn with_buddy_max_order(mut self, order: u8) -> Self {
        self.buddy_max_order = order;
        self
    }

    #[must_use]
    pub const fn with_buddy_pool(mut self, pool: BuddyPoolSize) -> Self {
        self.buddy_pool = pool;
        self
    }

    #[must_use]
    pub const fn with_dma_zone_pages(mut self, pages: u64) -> Self {
        self.dma_zone_pages = pages;
        self
    }

    #[must_use]
    pub const fn with_max_vmas(mut self, count: u16) -> Self {
        self.max_vmas = count;
        self
    }

    #[must_use]
    pub const fn with_kernel_root(mut self, root: KernelRoot) -> Self {
        self.kernel_root = root;
        self
    }

    /// Frames for the buddy normal zone given `usable_frames` of free memory.
    #[must_use]
    pub const fn buddy_pool_frames(&self, usable_frames: u64) -> u64 {
        match self.buddy_pool {
            BuddyPoolSize::Pages(pages) => pages,
            BuddyPoolSize::Auto => {
                let block = 1u64 << self.buddy_max_order;
                usable_frames / 8 / block * block
            }
        }
    }
}
