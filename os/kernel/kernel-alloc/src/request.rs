//! Typed allocation requests.
//!
//! Every allocator entry point takes an [`AllocRequest`] instead of a flag
//! word: the *purpose* decides placement and the state recorded for the
//! frame, the *fill* decides whether memory is zeroed before it is returned.

use crate::frame_alloc::FrameState;
use kernel_info::memory::DMA_LIMIT;
use kernel_memory_addresses::{PageSize, PhysicalAddress, Size4K};

/// Who the memory is for.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FramePurpose {
    /// Any frame will do.
    General,
    /// Kernel-internal data (page tables, heap, metadata). Never mapped to user space.
    KernelOnly,
    /// Device DMA: every byte must lie below [`DMA_LIMIT`].
    Dma,
}

/// Contents of the returned memory.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FrameFill {
    Uninitialized,
    Zeroed,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AllocRequest {
    pub purpose: FramePurpose,
    pub fill: FrameFill,
}

impl AllocRequest {
    pub const GENERAL: Self = Self::new(FramePurpose::General, FrameFill::Uninitialized);
    pub const ZEROED: Self = Self::new(FramePurpose::General, FrameFill::Zeroed);
    pub const KERNEL: Self = Self::new(FramePurpose::KernelOnly, FrameFill::Uninitialized);
    pub const KERNEL_ZEROED: Self = Self::new(FramePurpose::KernelOnly, FrameFill::Zeroed);
    pub const DMA: Self = Self::new(FramePurpose::Dma, FrameFill::Uninitialized);
    pub const DMA_ZEROED: Self = Self::new(FramePurpose::Dma, FrameFill::Zeroed);

    #[inline]
    #[must_use]
    pub const fn new(purpose: FramePurpose, fill: FrameFill) -> Self {
        Self { purpose, fill }
    }

    #[inline]
    #[must_use]
    pub const fn zeroed(self) -> Self {
        Self::new(self.purpose, FrameFill::Zeroed)
    }

    #[inline]
    #[must_use]
    pub const fn wants_zero(self) -> bool {
        matches!(self.fill, FrameFill::Zeroed)
    }

    /// Whether `frames` frames starting at `start` satisfy the placement rule.
    #[inline]
    #[must_use]
    pub const fn fits(self, start: PhysicalAddress, frames: u64) -> bool {
        match self.purpose {
            FramePurpose::Dma => match start.as_u64().checked_add(frames * Size4K::SIZE) {
                Some(end) => end <= DMA_LIMIT,
                None => false,
            },
            FramePurpose::General | FramePurpose::KernelOnly => true,
        }
    }

    /// Descriptor state recorded for frames handed out for this request.
    #[inline]
    #[must_use]
    pub(crate) const fn allocated_state(self) -> FrameState {
        match self.purpose {
            FramePurpose::General => FrameState::Allocated,
            FramePurpose::KernelOnly => FrameState::KernelOnly,
            FramePurpose::Dma => FrameState::Dma,
        }
    }
}

impl Default for AllocRequest {
    fn default() -> Self {
        Self::GENERAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dma_requests_must_end_below_the_limit() {
        let below = PhysicalAddress::new(DMA_LIMIT - 2 * Size4K::SIZE);
        assert!(AllocRequest::DMA.fits(below, 2));
        assert!(!AllocRequest::DMA.fits(below, 3));
        assert!(AllocRequest::GENERAL.fits(below, 3));
    }

    #[test]
    fn zeroed_keeps_purpose() {
        let r = AllocRequest::DMA.zeroed();
        assert_eq!(r, AllocRequest::DMA_ZEROED);
        assert!(r.wants_zero());
        assert!(!AllocRequest::KERNEL.wants_zero());
    }
}
