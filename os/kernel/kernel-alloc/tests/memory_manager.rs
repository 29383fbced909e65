mod common;

use common::{ENTRIES, Machine};
use kernel_alloc::{
    AllocRequest, DirectoryRef, FaultPolicy, InitError, KernelRoot, MemoryConfig, MemoryError,
    MemoryManager, VmaFlags, VmaKind,
};
use kernel_info::boot::{BootMemoryMap, MemoryMapEntry};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::{MappingFlags, Mmu};

const USER_RW: VmaFlags = VmaFlags::READ.union(VmaFlags::WRITE).union(VmaFlags::USER);

fn va(addr: u64) -> VirtualAddress {
    VirtualAddress::new(addr)
}

#[test]
fn init_sets_up_every_service() {
    let machine = Machine::new();
    let mm = machine.boot();
    let stats = mm.stats();

    assert_eq!(stats.frames.total, 16384);
    assert!(stats.frames.allocated > 0);
    assert_eq!(stats.frames.free + stats.frames.allocated + stats.frames.reserved, 16384);

    let zones: Vec<_> = stats.buddy.zones.iter().flatten().collect();
    assert_eq!(zones.len(), 2);
    assert!(zones[0].dma);
    assert!(!zones[1].dma);
    assert_eq!(stats.buddy.total_frames, 2048);
    assert_eq!(stats.buddy.free_frames, 2048);

    assert_eq!(stats.heap.mapped_bytes, 16 * 4096);
    assert_eq!(stats.vmas.capacity, 64);
    assert_eq!(stats.vmas.processes, 0);
    assert_eq!(mm.active_directory(), DirectoryRef::Kernel);
    mm.validate_heap().unwrap();
}

#[test]
fn init_rejects_bad_memory_maps() {
    let machine = Machine::new();

    let empty = BootMemoryMap::new(&[], 0);
    let err = MemoryManager::init(&empty, machine.config(), &machine.ram, &machine.mmu).err();
    assert_eq!(err, Some(InitError::NoUsableMemory));

    let scattered = [
        MemoryMapEntry::usable(0, 0x2000),
        MemoryMapEntry::usable(0x3C0_0000, 0x2000),
    ];
    let map = BootMemoryMap::new(&scattered, 0);
    let err = MemoryManager::init(&map, machine.config(), &machine.ram, &machine.mmu).err();
    assert!(matches!(err, Some(InitError::NoRoomForMetadata(_))));

    let config = machine.config().with_buddy_max_order(40);
    let map = BootMemoryMap::new(&ENTRIES, 0);
    let err = MemoryManager::init(&map, config, &machine.ram, &machine.mmu).err();
    assert!(matches!(err, Some(InitError::InvalidConfig(_))));
}

#[test]
fn init_adopts_the_active_root() {
    let machine = Machine::new();
    let root = PhysicalAddress::new(0x8000).page();
    let mmu = kernel_vmem::sim::SimMmu::with_root(root);
    let map = BootMemoryMap::new(&ENTRIES, 0);
    let config = machine.config().with_kernel_root(KernelRoot::Active);
    let mm = MemoryManager::init(&map, config, &machine.ram, &mmu).unwrap();
    assert_eq!(mm.kernel_root(), root);
}

#[test]
fn frames_and_blocks_through_the_manager() {
    let machine = Machine::new();
    let mm = machine.boot();
    let before = mm.stats();

    let frame = mm.allocate_frame(AllocRequest::ZEROED).unwrap();
    assert!(machine.ram.frame_is_zero(frame));
    assert_eq!(mm.retain_frame(frame), Ok(2));
    mm.free_frame(frame).unwrap();
    assert_eq!(mm.frame_info(frame).map(|i| i.ref_count), Some(1));
    mm.free_frame(frame).unwrap();

    let run = mm.allocate_contiguous(8, AllocRequest::GENERAL).unwrap();
    mm.free_contiguous(run, 8).unwrap();

    let block = mm.alloc_pages(4, AllocRequest::GENERAL).unwrap();
    assert_eq!(block.as_u64() % (4 * 4096), 0);
    mm.free_pages(block).unwrap();

    let after = mm.stats();
    assert_eq!(after.frames, before.frames);
    assert_eq!(after.buddy, before.buddy);
}

#[test]
fn buddy_blocks_are_refused_by_the_frame_interface() {
    let machine = Machine::new();
    let mm = machine.boot();
    let block = mm.alloc_pages(1, AllocRequest::GENERAL).unwrap();
    let before = mm.stats();

    assert_eq!(
        mm.free_frame(block),
        Err(MemoryError::InvalidArgument("frame belongs to the buddy allocator"))
    );
    assert!(mm.free_contiguous(block, 1).is_err());
    assert!(mm.retain_frame(block).is_err());
    assert_eq!(mm.stats().frames, before.frames);

    let frame = mm.allocate_frame(AllocRequest::GENERAL).unwrap();
    assert_ne!(frame, block);
    mm.free_frame(frame).unwrap();
    mm.free_pages(block).unwrap();
    assert_eq!(mm.stats().buddy.free_frames, before.buddy.free_frames + 1);
}

#[test]
fn kernel_mappings_translate_and_unmap() {
    let machine = Machine::new();
    let mm = machine.boot();
    let page = va(0xffff_c000_0000_0000);
    let frame = mm.allocate_frame(AllocRequest::KERNEL).unwrap();

    mm.map_kernel_page(page, frame, MappingFlags::KERNEL_DATA).unwrap();
    assert_eq!(
        mm.translate(DirectoryRef::Kernel, page + 0x123),
        Some(frame + 0x123)
    );
    assert_eq!(
        mm.map_kernel_page(page, frame, MappingFlags::KERNEL_DATA),
        Err(MemoryError::AlreadyMapped(page))
    );

    let leaf = mm.unmap_kernel_page(page).unwrap();
    assert_eq!(leaf.base, frame);
    assert_eq!(mm.translate(DirectoryRef::Kernel, page), None);
    assert_eq!(mm.unmap_kernel_page(page), Err(MemoryError::NotMapped(page)));
    assert!(matches!(
        mm.map_kernel_page(va(0x1000), frame, MappingFlags::KERNEL_DATA),
        Err(MemoryError::InvalidArgument(_))
    ));
    mm.free_frame(frame).unwrap();
}

#[test]
fn regions_fault_in_on_demand() {
    let machine = Machine::new();
    let mm = machine.boot();
    let pid = mm.create_process_vm().unwrap();
    assert_eq!(pid.as_u16(), 0);

    let start = mm
        .create_region(pid, Some(va(0x40_0000)), 0x3000, USER_RW, VmaKind::Data, FaultPolicy::Demand)
        .unwrap();
    assert_eq!(start, va(0x40_0000));
    assert_eq!(mm.translate(DirectoryRef::Process(pid), va(0x40_1000)), None);

    mm.handle_fault(pid, va(0x40_1234)).unwrap();
    let pa = mm.translate(DirectoryRef::Process(pid), va(0x40_1234)).unwrap();
    assert_eq!(pa.as_u64() & 0xfff, 0x234);

    // A second fault on the same page changes nothing.
    mm.handle_fault(pid, va(0x40_1000)).unwrap();
    assert_eq!(mm.translate(DirectoryRef::Process(pid), va(0x40_1234)), Some(pa));

    assert_eq!(
        mm.handle_fault(pid, va(0x50_0000)),
        Err(MemoryError::NotMapped(va(0x50_0000)))
    );

    let placed = mm
        .create_region(pid, None, 0x1800, USER_RW, VmaKind::Heap, FaultPolicy::Demand)
        .unwrap();
    assert_eq!(placed, va(0x40_3000));
    assert_eq!(mm.find_region(pid, va(0x40_4fff)).map(|v| v.end), Some(va(0x40_5000)));
    assert_eq!(mm.region_count(pid), Some(2));

    mm.destroy_region(pid, va(0x40_0000)).unwrap();
    assert_eq!(mm.translate(DirectoryRef::Process(pid), va(0x40_1234)), None);
    assert_eq!(mm.region_count(pid), Some(1));
    assert_eq!(
        mm.destroy_region(pid, va(0x40_0000)),
        Err(MemoryError::NotMapped(va(0x40_0000)))
    );
}

#[test]
fn destroying_a_region_returns_its_pages_and_descriptor() {
    let machine = Machine::new();
    let mm = machine.boot();
    let pid = mm.create_process_vm().unwrap();
    // The first region leaves its page tables behind for the rest of the test.
    mm.create_region(pid, Some(va(0x40_0000)), 0x1000, USER_RW, VmaKind::Data, FaultPolicy::Prefault)
        .unwrap();
    mm.destroy_region(pid, va(0x40_0000)).unwrap();
    let before = mm.stats();

    mm.create_region(pid, Some(va(0x40_0000)), 0x4000, USER_RW, VmaKind::Data, FaultPolicy::Prefault)
        .unwrap();
    assert_eq!(mm.stats().frames.allocated, before.frames.allocated + 4);
    assert_eq!(mm.stats().vmas.regions, before.vmas.regions + 1);

    mm.destroy_region(pid, va(0x40_0000)).unwrap();
    let after = mm.stats();
    assert_eq!(after.frames, before.frames);
    assert_eq!(after.vmas, before.vmas);
    assert_eq!(mm.find_region(pid, va(0x40_0000)), None);
    assert_eq!(mm.translate(DirectoryRef::Process(pid), va(0x40_3000)), None);
}

#[test]
fn overlapping_regions_are_rejected_without_side_effects() {
    let machine = Machine::new();
    let mm = machine.boot();
    let pid = mm.create_process_vm().unwrap();
    mm.create_region(pid, Some(va(0x40_0000)), 0x4000, USER_RW, VmaKind::Data, FaultPolicy::Demand)
        .unwrap();
    let before = mm.stats();

    let err = mm.create_region(
        pid,
        Some(va(0x40_2000)),
        0x4000,
        USER_RW,
        VmaKind::Data,
        FaultPolicy::Prefault,
    );
    assert_eq!(err, Err(MemoryError::AlreadyMapped(va(0x40_2000))));
    assert_eq!(mm.region_count(pid), Some(1));
    assert_eq!(mm.find_region(pid, va(0x40_3000)).map(|v| v.start), Some(va(0x40_0000)));
    assert_eq!(mm.stats(), before);

    assert!(matches!(
        mm.create_region(pid, Some(va(0x40_0000)), 0, USER_RW, VmaKind::Data, FaultPolicy::Demand),
        Err(MemoryError::InvalidArgument(_))
    ));
}

#[test]
fn zero_fill_and_prefault_hand_out_zeroed_pages() {
    let machine = Machine::new();
    let mm = machine.boot();
    let pid = mm.create_process_vm().unwrap();

    // Dirty the frames at the head of the free list so zeroing is observable.
    let dirty: Vec<_> = (0..8)
        .map(|_| mm.allocate_frame(AllocRequest::GENERAL).unwrap())
        .collect();
    for frame in &dirty {
        machine.ram.fill(*frame, 4096, 0xAA);
        mm.free_frame(*frame).unwrap();
    }

    mm.create_region(pid, Some(va(0x40_0000)), 0x1000, USER_RW, VmaKind::Stack, FaultPolicy::ZeroFill)
        .unwrap();
    mm.handle_fault(pid, va(0x40_0010)).unwrap();
    let pa = mm.translate(DirectoryRef::Process(pid), va(0x40_0000)).unwrap();
    assert!(machine.ram.frame_is_zero(pa));

    mm.create_region(pid, Some(va(0x80_0000)), 0x4000, USER_RW, VmaKind::Data, FaultPolicy::Prefault)
        .unwrap();
    for page in 0..4 {
        let pa = mm
            .translate(DirectoryRef::Process(pid), va(0x80_0000 + page * 0x1000))
            .unwrap();
        assert!(machine.ram.frame_is_zero(pa));
    }
}

#[test]
fn failed_prefault_leaves_no_pages_behind() {
    let machine = Machine::new();
    let mm = machine.boot();
    let pid = mm.create_process_vm().unwrap();
    let free_before = mm.stats().frames.free;

    let err = mm.create_region(
        pid,
        Some(va(0x40_0000)),
        128 * 1024 * 1024,
        USER_RW,
        VmaKind::Data,
        FaultPolicy::Prefault,
    );
    assert_eq!(err, Err(MemoryError::OutOfMemory));
    assert_eq!(mm.region_count(pid), Some(0));
    assert_eq!(mm.translate(DirectoryRef::Process(pid), va(0x40_0000)), None);

    // Only page tables created on the way remain.
    let free_after = mm.stats().frames.free;
    assert!(free_after <= free_before);
    assert!(free_before - free_after < 64);
}

#[test]
fn aligned_windows_fault_in_as_2mib_pages() {
    let machine = Machine::new();
    let mm = machine.boot();
    let pid = mm.create_process_vm().unwrap();

    // The first fault builds the page directory covering the low gigabyte.
    mm.create_region(pid, Some(va(0x40_0000)), 0x1000, USER_RW, VmaKind::Data, FaultPolicy::Demand)
        .unwrap();
    mm.handle_fault(pid, va(0x40_0000)).unwrap();

    mm.create_region(pid, Some(va(0x60_0000)), 0x20_0000, USER_RW, VmaKind::Heap, FaultPolicy::ZeroFill)
        .unwrap();
    let buddy_before = mm.stats().buddy.free_frames;
    mm.handle_fault(pid, va(0x60_1234)).unwrap();
    assert_eq!(mm.stats().buddy.free_frames, buddy_before - 512);

    let base = mm.translate(DirectoryRef::Process(pid), va(0x60_0000)).unwrap();
    assert_eq!(base.as_u64() % 0x20_0000, 0);
    assert_eq!(
        mm.translate(DirectoryRef::Process(pid), va(0x7f_f000)),
        Some(base + 0x1f_f000)
    );

    mm.destroy_region(pid, va(0x60_0000)).unwrap();
    assert_eq!(mm.stats().buddy.free_frames, buddy_before);
}

#[test]
fn unaligned_windows_fall_back_to_4kib_pages() {
    let machine = Machine::new();
    let mm = machine.boot();
    let pid = mm.create_process_vm().unwrap();
    mm.create_region(pid, Some(va(0x40_0000)), 0x1000, USER_RW, VmaKind::Data, FaultPolicy::Demand)
        .unwrap();
    mm.handle_fault(pid, va(0x40_0000)).unwrap();

    // Covers a 2 MiB span, but not an aligned one.
    mm.create_region(pid, Some(va(0x61_0000)), 0x20_0000, USER_RW, VmaKind::Heap, FaultPolicy::Demand)
        .unwrap();
    let buddy_before = mm.stats().buddy.free_frames;
    mm.handle_fault(pid, va(0x70_0000)).unwrap();
    assert_eq!(mm.stats().buddy.free_frames, buddy_before);
    assert!(mm.translate(DirectoryRef::Process(pid), va(0x70_0000)).is_some());
    assert_eq!(mm.translate(DirectoryRef::Process(pid), va(0x70_1000)), None);
}

#[test]
fn kernel_mappings_reach_processes_after_a_switch() {
    let machine = Machine::new();
    let mm = machine.boot();
    let early = va(0xffff_c000_0000_0000);
    let late = va(0xffff_d000_0000_0000);
    let early_frame = mm.allocate_frame(AllocRequest::KERNEL).unwrap();
    let late_frame = mm.allocate_frame(AllocRequest::KERNEL).unwrap();

    mm.map_kernel_page(early, early_frame, MappingFlags::KERNEL_DATA).unwrap();
    let pid = mm.create_process_vm().unwrap();
    assert_eq!(mm.translate(DirectoryRef::Process(pid), early), Some(early_frame));

    // A new top-level slot is only picked up when the directory is loaded.
    mm.map_kernel_page(late, late_frame, MappingFlags::KERNEL_DATA).unwrap();
    assert_eq!(mm.translate(DirectoryRef::Process(pid), late), None);

    let switches = machine.mmu.switches();
    let flushes = machine.mmu.flushes();
    mm.switch_directory(DirectoryRef::Process(pid)).unwrap();
    assert_eq!(mm.active_directory(), DirectoryRef::Process(pid));
    assert_eq!(machine.mmu.switches(), switches + 1);
    assert_eq!(machine.mmu.flushes(), flushes + 1, "resynced kernel half");
    assert_eq!(mm.translate(DirectoryRef::Process(pid), late), Some(late_frame));

    mm.switch_directory(DirectoryRef::Kernel).unwrap();
    mm.switch_directory(DirectoryRef::Process(pid)).unwrap();
    assert_eq!(machine.mmu.flushes(), flushes + 1, "nothing to resync");
    mm.switch_directory(DirectoryRef::Kernel).unwrap();
    assert_eq!(mm.active_directory(), DirectoryRef::Kernel);
    assert!(matches!(
        mm.switch_directory(DirectoryRef::Process(kernel_alloc::ProcessId::new(9))),
        Err(MemoryError::InvalidArgument(_))
    ));
}

#[test]
fn destroying_a_process_returns_all_of_its_memory() {
    let machine = Machine::new();
    let mm = machine.boot();
    let before = mm.stats();

    let pid = mm.create_process_vm().unwrap();
    mm.create_region(pid, Some(va(0x40_0000)), 0x3000, USER_RW, VmaKind::Data, FaultPolicy::Prefault)
        .unwrap();
    mm.create_region(pid, Some(va(0x60_0000)), 0x20_0000, USER_RW, VmaKind::Heap, FaultPolicy::Demand)
        .unwrap();
    mm.create_region(pid, Some(va(0x4000_0000)), 0x1000, USER_RW, VmaKind::Stack, FaultPolicy::Demand)
        .unwrap();
    mm.handle_fault(pid, va(0x60_0000)).unwrap();
    mm.handle_fault(pid, va(0x4000_0000)).unwrap();
    mm.switch_directory(DirectoryRef::Process(pid)).unwrap();
    assert_eq!(mm.stats().vmas.regions, 3);

    mm.destroy_process_vm(pid).unwrap();
    assert_eq!(mm.active_directory(), DirectoryRef::Kernel);
    assert_eq!(machine.mmu.active_root(), mm.kernel_root());
    assert_eq!(mm.region_count(pid), None);

    let after = mm.stats();
    assert_eq!(after.frames, before.frames);
    assert_eq!(after.buddy, before.buddy);
    assert_eq!(after.vmas, before.vmas);

    assert_eq!(mm.create_process_vm(), Ok(pid));
}

#[test]
fn translate_only_walks_live_directories() {
    let machine = Machine::new();
    let mm = machine.boot();
    let pid = mm.create_process_vm().unwrap();
    mm.create_region(pid, Some(va(0x40_0000)), 0x1000, USER_RW, VmaKind::Data, FaultPolicy::Prefault)
        .unwrap();
    assert!(mm.translate(DirectoryRef::Process(pid), va(0x40_0000)).is_some());

    mm.destroy_process_vm(pid).unwrap();
    assert_eq!(mm.translate(DirectoryRef::Process(pid), va(0x40_0000)), None);

    // The slot comes back with an empty directory.
    assert_eq!(mm.create_process_vm(), Ok(pid));
    assert_eq!(mm.translate(DirectoryRef::Process(pid), va(0x40_0000)), None);
}

#[test]
fn shared_directories_survive_until_the_last_holder_leaves() {
    let machine = Machine::new();
    let mm = machine.boot();
    let pid = mm.create_process_vm().unwrap();
    mm.create_region(pid, Some(va(0x40_0000)), 0x1000, USER_RW, VmaKind::Data, FaultPolicy::Demand)
        .unwrap();

    assert_eq!(mm.retain_process_vm(pid), Ok(2));
    mm.destroy_process_vm(pid).unwrap();
    assert_eq!(mm.region_count(pid), Some(1));
    mm.destroy_process_vm(pid).unwrap();
    assert_eq!(mm.region_count(pid), None);
    assert!(matches!(
        mm.destroy_process_vm(pid),
        Err(MemoryError::InvalidArgument(_))
    ));
}

#[test]
fn heap_serves_kernel_allocations() {
    let machine = Machine::new();
    let mm = machine.boot();

    let a = mm.kmalloc(100).unwrap();
    // SAFETY: 100 bytes were just allocated.
    unsafe { a.as_ptr().write_bytes(0x5A, 100) };
    let z = mm.kzalloc(64).unwrap();
    // SAFETY: 64 zeroed bytes.
    assert!(unsafe { core::slice::from_raw_parts(z.as_ptr(), 64) }.iter().all(|b| *b == 0));

    let a = mm.krealloc(a, 400).unwrap();
    // SAFETY: the first 100 bytes carry over.
    assert_eq!(unsafe { *a.as_ptr().add(99) }, 0x5A);

    let mapped = mm.stats().heap.mapped_bytes;
    let big = mm.kmalloc(128 * 1024).unwrap();
    let grown = mm.stats().heap;
    assert!(grown.mapped_bytes > mapped);
    assert!(
        mm.translate(DirectoryRef::Kernel, VirtualAddress::from_nonnull(big))
            .is_some()
    );

    mm.kfree(big).unwrap();
    mm.kfree(a).unwrap();
    mm.kfree(z).unwrap();
    mm.validate_heap().unwrap();

    let mut outside = [0u8; 64];
    let foreign = core::ptr::NonNull::new(outside.as_mut_ptr().wrapping_add(48)).unwrap();
    assert!(matches!(mm.kfree(foreign), Err(MemoryError::InvalidArgument(_))));
}

#[test]
fn stats_render_as_text() {
    let machine = Machine::new();
    let mm = machine.boot();
    let text = mm.stats().to_string();
    assert!(text.contains("frames: 16384 total"));
    assert!(text.contains("(dma)"));
}

#[test]
fn config_defaults_follow_the_layout_constants() {
    let config = MemoryConfig::default();
    assert_eq!(config.heap_base, va(kernel_info::memory::KERNEL_HEAP_BASE));
    assert_eq!(config.heap_min_expansion_pages, 4);
    assert_eq!(config.buddy_max_order, 10);
    assert_eq!(config.kernel_root, KernelRoot::Active);
}
