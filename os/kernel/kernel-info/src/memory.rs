//! # Memory Layout

/// Size of one physical frame / base page.
pub const PAGE_SIZE: u64 = 4096;

/// One past the last canonical lower-half address; user mappings live below.
pub const USERSPACE_END: u64 = 0x0000_8000_0000_0000;

/// Lowest address handed out when a process region is placed automatically.
///
/// Keeps the first 4 MiB unmapped so null-pointer dereferences fault.
pub const USER_REGION_BASE: u64 = 0x0000_0000_0040_0000;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything mapped at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Where the kernel image executes.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Start of the kernel heap window.
pub const KERNEL_HEAP_BASE: u64 = 0xffff_ffff_9000_0000;

/// Size of the kernel heap window. The heap never grows past
/// [`KERNEL_HEAP_BASE`] + [`KERNEL_HEAP_SIZE`].
pub const KERNEL_HEAP_SIZE: u64 = 256 * 1024 * 1024;

/// First PML4 slot of the kernel-owned higher half.
pub const KERNEL_PML4_FIRST_SLOT: usize = 256;

/// Frames usable for legacy DMA must end at or below this physical address.
pub const DMA_LIMIT: u64 = 0x0100_0000; // 16 MiB

/// Largest buddy order; `2^10` frames is a 4 MiB block.
pub const BUDDY_MAX_ORDER: u8 = 10;

/// Smallest heap expansion step in frames.
pub const HEAP_MIN_EXPANSION_PAGES: u64 = 4;

const _: () = {
    assert!(PAGE_SIZE.is_power_of_two());
    assert!(USER_REGION_BASE < USERSPACE_END);
    assert!(HHDM_BASE >= USERSPACE_END);
    assert!(KERNEL_BASE > HHDM_BASE);
    assert!(KERNEL_HEAP_BASE > KERNEL_BASE);
    assert!(KERNEL_HEAP_BASE.is_multiple_of(PAGE_SIZE));
    assert!(KERNEL_HEAP_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(KERNEL_HEAP_BASE.checked_add(KERNEL_HEAP_SIZE).is_some());
    assert!(DMA_LIMIT.is_multiple_of(PAGE_SIZE));
};
