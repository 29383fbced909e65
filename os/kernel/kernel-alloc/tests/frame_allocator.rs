use core::ptr::NonNull;
use kernel_alloc::{AllocRequest, FrameAllocator, FrameDescriptor, FrameState};
use kernel_info::boot::MemoryRegionKind;
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::sim::SimulatedRam;

const RAM_BYTES: u64 = 64 * 1024 * 1024;
const FRAMES: u32 = (RAM_BYTES / 4096) as u32;

#[test]
fn sixty_four_mib_scenario() {
    let ram = SimulatedRam::new(RAM_BYTES);
    let mut descriptors = vec![FrameDescriptor::RESERVED; FRAMES as usize];
    let storage = NonNull::new(descriptors.as_mut_ptr()).unwrap();
    // SAFETY: the vector holds one descriptor per frame and outlives the allocator.
    let mut frames = unsafe { FrameAllocator::new(&ram, storage, FRAMES) };
    assert_eq!(
        frames.add_region(PhysicalAddress::zero(), RAM_BYTES, MemoryRegionKind::Usable),
        Ok(u64::from(FRAMES))
    );
    frames.seal();

    let allocated: Vec<_> = (0..10)
        .map(|_| frames.allocate_frame(AllocRequest::GENERAL).unwrap())
        .collect();
    let expected: Vec<_> = (0..10).map(PhysicalAddress::from_frame_number).collect();
    assert_eq!(allocated, expected);

    for pa in allocated.iter().step_by(2) {
        frames.free_frame(*pa).unwrap();
    }
    let reused: Vec<_> = (0..3)
        .map(|_| frames.allocate_frame(AllocRequest::GENERAL).unwrap())
        .collect();
    for pa in &reused {
        assert!(allocated.iter().step_by(2).any(|freed| freed == pa));
        assert_eq!(
            frames.frame_info(*pa).map(|info| info.state),
            Some(FrameState::Allocated)
        );
    }

    let stats = frames.stats();
    assert_eq!(stats.allocated, 8);
    assert_eq!(stats.free, u64::from(FRAMES) - 8);
    assert_eq!(stats.total, u64::from(FRAMES));
}

#[test]
fn regions_cannot_be_added_after_sealing() {
    let ram = SimulatedRam::with_frames(64);
    let mut descriptors = vec![FrameDescriptor::RESERVED; 64];
    let storage = NonNull::new(descriptors.as_mut_ptr()).unwrap();
    // SAFETY: sized for 64 frames, outlives the allocator.
    let mut frames = unsafe { FrameAllocator::new(&ram, storage, 64) };
    frames.add_region(PhysicalAddress::zero(), 32 * 4096, MemoryRegionKind::Usable).unwrap();
    frames.seal();
    assert!(frames.is_sealed());
    assert!(
        frames
            .add_region(PhysicalAddress::new(32 * 4096), 32 * 4096, MemoryRegionKind::Usable)
            .is_err()
    );
    assert_eq!(frames.stats().free, 32);
}
