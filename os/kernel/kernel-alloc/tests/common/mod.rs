//! A simulated 64 MiB machine for exercising the memory manager end to end.

#![allow(dead_code)]

use kernel_alloc::{KernelRoot, MemoryConfig, MemoryManager};
use kernel_info::boot::{BootMemoryMap, MemoryMapEntry, MemoryRegionKind};
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::sim::{SimMmu, SimulatedRam};

pub const RAM_BYTES: u64 = 64 * 1024 * 1024;
pub const HEAP_WINDOW: u64 = 1024 * 1024;

/// Low megabyte reserved, the rest usable.
pub const ENTRIES: [MemoryMapEntry; 2] = [
    MemoryMapEntry::new(0, 0x10_0000, MemoryRegionKind::Reserved),
    MemoryMapEntry::usable(0x10_0000, RAM_BYTES - 0x10_0000),
];

pub struct Machine {
    pub ram: SimulatedRam,
    pub mmu: SimMmu,
    /// Host memory standing in for the kernel heap's virtual window.
    heap_window: Vec<u8>,
}

impl Machine {
    pub fn new() -> Self {
        Self {
            ram: SimulatedRam::new(RAM_BYTES),
            mmu: SimMmu::new(),
            heap_window: vec![0; (HEAP_WINDOW + 4096) as usize],
        }
    }

    pub fn heap_base(&self) -> VirtualAddress {
        let addr = self.heap_window.as_ptr() as u64;
        VirtualAddress::new(addr.next_multiple_of(4096))
    }

    pub fn config(&self) -> MemoryConfig {
        MemoryConfig::new()
            .with_heap_window(self.heap_base(), HEAP_WINDOW)
            .with_kernel_root(KernelRoot::Fresh)
            .with_max_vmas(64)
    }

    pub fn boot(&self) -> MemoryManager<'_, SimulatedRam, SimMmu> {
        let map = BootMemoryMap::new(&ENTRIES, 0);
        MemoryManager::init(&map, self.config(), &self.ram, &self.mmu).expect("memory manager boots")
    }
}
