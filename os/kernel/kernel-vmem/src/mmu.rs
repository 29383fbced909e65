//! # MMU control
//!
//! The address-space code never issues privileged instructions itself; it
//! goes through an [`Mmu`] so the same code runs against real hardware
//! ([`X86Mmu`], feature `asm`) and against the simulator used in tests.

use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};

/// Root-pointer loading and translation-cache maintenance.
pub trait Mmu {
    /// PML4 frame currently loaded in CR3.
    fn active_root(&self) -> PhysicalPage<Size4K>;

    /// Load `root` into CR3. This also drops every non-global TLB entry.
    ///
    /// # Safety
    /// `root` must be a valid PML4 whose higher half maps the running kernel
    /// (code, stack and the direct map).
    unsafe fn switch_root(&self, root: PhysicalPage<Size4K>);

    /// Drop the cached translation for the page containing `va`.
    fn invalidate_page(&self, va: VirtualAddress);

    /// Drop every cached translation, global ones included.
    fn flush_all(&self);
}

impl<T: Mmu + ?Sized> Mmu for &T {
    fn active_root(&self) -> PhysicalPage<Size4K> {
        (**self).active_root()
    }

    unsafe fn switch_root(&self, root: PhysicalPage<Size4K>) {
        // SAFETY: forwarded contract.
        unsafe { (**self).switch_root(root) }
    }

    fn invalidate_page(&self, va: VirtualAddress) {
        (**self).invalidate_page(va);
    }

    fn flush_all(&self) {
        (**self).flush_all();
    }
}

/// The running CPU's MMU.
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
#[derive(Debug, Default, Copy, Clone)]
pub struct X86Mmu;

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl X86Mmu {
    /// CR3 bits 51:12 hold the PML4 frame; the rest are PCID/PWT/PCD.
    const CR3_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    #[inline]
    fn read_cr3() -> u64 {
        let v: u64;
        // SAFETY: reading CR3 has no side effects at CPL0.
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) v, options(nomem, nostack, preserves_flags));
        }
        v
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl Mmu for X86Mmu {
    fn active_root(&self) -> PhysicalPage<Size4K> {
        let cr3 = Self::read_cr3() & Self::CR3_ADDR_MASK;
        PhysicalPage::from_addr(kernel_memory_addresses::PhysicalAddress::new(cr3))
    }

    unsafe fn switch_root(&self, root: PhysicalPage<Size4K>) {
        let cr3 = root.base().as_u64();
        // SAFETY: caller guarantees `root` maps the running kernel.
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }

    fn invalidate_page(&self, va: VirtualAddress) {
        // SAFETY: invlpg only affects the TLB.
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
        }
    }

    fn flush_all(&self) {
        const CR4_PGE: u64 = 1 << 7;
        let cr4: u64;
        // SAFETY: toggling CR4.PGE off and on again only flushes the TLB,
        // global entries included.
        unsafe {
            core::arch::asm!("mov {}, cr4", out(reg) cr4, options(nomem, nostack, preserves_flags));
            core::arch::asm!("mov cr4, {}", in(reg) cr4 & !CR4_PGE, options(nostack, preserves_flags));
            core::arch::asm!("mov cr4, {}", in(reg) cr4, options(nostack, preserves_flags));
        }
    }
}
