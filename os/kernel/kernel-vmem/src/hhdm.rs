use crate::PhysMapper;
use core::ptr::NonNull;
use kernel_memory_addresses::PhysicalAddress;

/// [`PhysMapper`] for a higher-half direct map: `va = offset + pa`.
///
/// Only physical addresses below `limit` are considered mapped; anything
/// above is reported as unreachable instead of producing a wild pointer.
#[derive(Debug, Copy, Clone)]
pub struct HhdmPhysMapper {
    offset: u64,
    limit: u64,
}

impl HhdmPhysMapper {
    #[inline]
    #[must_use]
    pub const fn new(offset: u64, limit: PhysicalAddress) -> Self {
        Self {
            offset,
            limit: limit.as_u64(),
        }
    }
}

impl PhysMapper for HhdmPhysMapper {
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> Option<NonNull<u8>> {
        if pa.as_u64() >= self.limit {
            return None;
        }
        let va = self.offset.checked_add(pa.as_u64())?;
        NonNull::new(va as *mut u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_below_limit_only() {
        let m = HhdmPhysMapper::new(0xFFFF_8000_0000_0000, PhysicalAddress::new(0x1000_0000));
        let p = m.phys_to_ptr(PhysicalAddress::new(0x2000)).map(|p| p.as_ptr() as u64);
        assert_eq!(p, Some(0xFFFF_8000_0000_2000));
        assert!(m.phys_to_ptr(PhysicalAddress::new(0x1000_0000)).is_none());
    }
}
