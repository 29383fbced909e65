//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses and page bases used by the
//! paging and allocation code.
//!
//! | Wrapper | Meaning |
//! |----------|----------|
//! | [`VirtualAddress`] / [`VirtualPage<S>`] | Addresses translated by the page tables. |
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | RAM or MMIO addresses as seen by the memory controller. |
//!
//! ## Page Sizes
//!
//! - [`Size4K`]: 4 KiB pages (base granularity, one "frame")
//! - [`Size2M`]: 2 MiB huge pages
//! - [`Size1G`]: 1 GiB giant pages
//!
//! ## Frames
//!
//! Physical memory is tracked in 4 KiB frames. A frame number is the physical
//! address shifted right by 12; it is the index used by every per-frame
//! metadata array in the allocators.
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let pa = PhysicalAddress::from_frame_number(10);
//! assert_eq!(pa.as_u64(), 0xA000);
//! assert_eq!(pa.page::<Size4K>().frame_number(), 10);
//! assert_eq!(align_up(0x1001, Size4K::SIZE), 0x2000);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

mod page_size;
mod physical_address;
mod physical_page;
mod virtual_address;
mod virtual_page;

pub use page_size::{PageSize, Size1G, Size2M, Size4K};
pub use physical_address::PhysicalAddress;
pub use physical_page::PhysicalPage;
pub use virtual_address::VirtualAddress;
pub use virtual_page::VirtualPage;

/// Rounds `x` down to a multiple of the power of two `align`.
#[inline]
#[must_use]
pub const fn align_down(x: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    x & !(align - 1)
}

/// Rounds `x` up to a multiple of the power of two `align`.
///
/// Saturates to the last aligned value below `u64::MAX` on overflow; use
/// [`checked_align_up`] where that matters.
#[inline]
#[must_use]
pub const fn align_up(x: u64, align: u64) -> u64 {
    match checked_align_up(x, align) {
        Some(v) => v,
        None => align_down(u64::MAX, align),
    }
}

/// Rounds `x` up to a multiple of the power of two `align`, `None` on overflow.
#[inline]
#[must_use]
pub const fn checked_align_up(x: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    match x.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_and_join_4k() {
        let pa = PhysicalAddress::new(0x1234_5678_9ABC_DEF0);
        let (p, o) = pa.split::<Size4K>();
        assert_eq!(p.base().as_u64() & 0xFFF, 0);
        assert_eq!(o, 0xEF0);
        assert_eq!(p.join(o), pa);
    }

    #[test]
    fn split_and_join_2m() {
        let va = VirtualAddress::new(0x0000_0008_1234_5678);
        let (p, o) = va.split::<Size2M>();
        assert_eq!(p.base().as_u64() & (Size2M::SIZE - 1), 0);
        assert_eq!(o, va.as_u64() & (Size2M::SIZE - 1));
        assert_eq!(p.join(o), va);
    }

    #[test]
    fn frame_numbers_round_trip() {
        let pa = PhysicalAddress::new(0x0000_0000_0123_4000);
        assert_eq!(pa.frame_number(), 0x1234);
        assert_eq!(PhysicalAddress::from_frame_number(0x1234), pa);
        assert_eq!(PhysicalPage::<Size2M>::from_addr(pa).frame_number(), 0x1200);
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_down(0x12345, 0x1000), 0x12000);
        assert_eq!(align_up(0x12345, 0x1000), 0x13000);
        assert_eq!(align_up(0x13000, 0x1000), 0x13000);
        assert_eq!(checked_align_up(u64::MAX, 0x1000), None);
        assert_eq!(
            PhysicalAddress::new(0x1FF_FFFF).align_up::<Size2M>(),
            Some(PhysicalAddress::new(0x200_0000))
        );
        assert!(VirtualAddress::new(0x20_0000).is_aligned::<Size2M>());
        assert!(!VirtualAddress::new(0x20_1000).is_aligned::<Size2M>());
    }

    #[test]
    fn canonical_addresses() {
        assert!(VirtualAddress::new(0x0000_7FFF_FFFF_F000).is_canonical());
        assert!(VirtualAddress::new(0xFFFF_8000_0000_0000).is_canonical());
        assert!(!VirtualAddress::new(0x0000_8000_0000_0000).is_canonical());
        assert!(!VirtualAddress::new(0xFFFF_7FFF_FFFF_FFFF).is_canonical());
    }

    #[test]
    fn table_indices() {
        let va = VirtualAddress::new(0xFFFF_8880_0020_3000);
        assert_eq!(va.table_index(39), 273);
        assert_eq!(va.table_index(30), 0);
        assert_eq!(va.table_index(21), 1);
        assert_eq!(va.table_index(12), 3);
    }

    #[test]
    fn aligned_page_conversion() {
        assert!(VirtualPage::<Size4K>::try_from(VirtualAddress::new(0x1000)).is_ok());
        assert_eq!(
            VirtualPage::<Size4K>::try_from(VirtualAddress::new(0x1001)),
            Err(VirtualAddress::new(0x1001))
        );
        let next = VirtualPage::<Size4K>::from_addr(VirtualAddress::new(0x1234)).next();
        assert_eq!(next.map(VirtualPage::base), Some(VirtualAddress::new(0x2000)));
    }
}
