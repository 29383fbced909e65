//! # Virtual Memory Support
//!
//! x86-64 4-level paging for the kernel's memory manager.
//!
//! ## What you get
//! - An [`AddressSpace`] handle over one PML4-rooted tree: map, unmap,
//!   translate, switch.
//! - A typed [`PageTableEntry`] / [`PageTable`] built with `bitfield-struct`.
//! - [`MappingFlags`] for leaf permissions.
//! - The seams the rest of the kernel plugs into:
//!   [`PhysMapper`] (reach a physical frame), [`FrameAlloc`] (get a frame for
//!   a page table) and [`Mmu`] (CR3 and TLB maintenance).
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//!   │        │        │        │
//!   │        │        │        └───► PTE   → maps 4 KiB page
//!   │        │        └────────────► PDE   → PS=1 → 2 MiB page
//!   │        └─────────────────────► PDPTE → PS=1 → 1 GiB page
//!   └──────────────────────────────► PML4E → always a link
//! ```
//!
//! Each level holds 512 entries of 8 bytes. A walk stops at the first entry
//! that is absent (unmapped) or a leaf (PTE, or PS=1 at PD/PDPT).
//!
//! ## Features
//! - `asm`: enables [`X86Mmu`], which issues `mov cr3` and `invlpg`.
//! - `sim`: enables the [`sim`] module (simulated RAM and MMU for host tests).

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(any(test, feature = "sim"))]
extern crate alloc;

pub mod address_space;
mod flags;
mod hhdm;
mod mmu;
pub mod page_table;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use crate::address_space::{AddressSpace, Leaf, RootPage};
pub use crate::flags::MappingFlags;
pub use crate::hhdm::HhdmPhysMapper;
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
pub use crate::mmu::X86Mmu;
pub use crate::mmu::Mmu;
pub use crate::page_table::{LeafSize, PageTable, PageTableEntry};

use core::ptr::NonNull;
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};

/// Errors from installing a mapping.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("virtual address {0} is not aligned to the page size")]
    UnalignedVirtual(VirtualAddress),
    #[error("physical address {0} is not aligned to the page size")]
    UnalignedPhysical(PhysicalAddress),
    #[error("virtual address {0} is not canonical")]
    NonCanonical(VirtualAddress),
    #[error("virtual address {0} is already mapped")]
    AlreadyMapped(VirtualAddress),
    #[error("no parent table exists for a large page at {0}")]
    ParentMissing(VirtualAddress),
    #[error("out of memory while allocating a page table")]
    OutOfMemory,
}

/// Source of 4 KiB frames for page tables.
///
/// The implementation decides where frames come from (boot pool, frame
/// allocator, test bump allocator). Frames need not be zeroed; callers zero
/// them through the [`PhysMapper`].
pub trait FrameAlloc {
    /// Allocate one 4 KiB frame, or `None` when exhausted.
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>>;

    /// Return a frame obtained from [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&mut self, page: PhysicalPage<Size4K>);
}

impl<A: FrameAlloc + ?Sized> FrameAlloc for &mut A {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        (**self).alloc_4k()
    }

    fn free_4k(&mut self, page: PhysicalPage<Size4K>) {
        (**self).free_4k(page);
    }
}

/// Makes physical memory reachable from the running kernel.
///
/// Typically a higher-half direct map ([`HhdmPhysMapper`]).
pub trait PhysMapper {
    /// Pointer through which the byte at `pa` can be accessed, or `None` if
    /// `pa` is not covered by the mapping. A returned pointer stays valid up
    /// to the end of the 4 KiB frame containing `pa`.
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> Option<NonNull<u8>>;

    /// Borrow the object at `pa` as `T`.
    ///
    /// # Safety
    /// `pa` must be mapped, suitably aligned for `T`, hold a valid `T`, and
    /// not be aliased mutably elsewhere for `'a`.
    ///
    /// # Panics
    /// If `pa` is not covered by the mapping.
    #[allow(clippy::mut_from_ref)]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let Some(ptr) = self.phys_to_ptr(pa) else {
            panic!("physical address {pa:?} is outside the direct map");
        };
        // SAFETY: upheld by the caller.
        unsafe { &mut *ptr.as_ptr().cast::<T>() }
    }

    /// Fill the 4 KiB frame with zeros.
    ///
    /// # Errors
    /// Returns the frame's address if it is not reachable.
    fn zero_frame(&self, frame: PhysicalPage<Size4K>) -> Result<(), PhysicalAddress> {
        let ptr = self.phys_to_ptr(frame.base()).ok_or(frame.base())?;
        // SAFETY: the pointer covers the whole frame per the trait contract.
        unsafe { ptr.as_ptr().write_bytes(0, Size4K::SIZE as usize) };
        Ok(())
    }
}

impl<M: PhysMapper + ?Sized> PhysMapper for &M {
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> Option<NonNull<u8>> {
        (**self).phys_to_ptr(pa)
    }
}
