use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::MapError;
use log::error;

/// What kind of metadata damage was found.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum Corruption {
    #[error("heap block header at {0} fails its checksum")]
    HeapChecksum(VirtualAddress),
    #[error("heap block at {0} freed twice")]
    HeapDoubleFree(VirtualAddress),
    #[error("free heap block at {0} sits in the wrong size class")]
    HeapMisfiled(VirtualAddress),
    #[error("frame {0} is not tracked by the allocator")]
    UntrackedFrame(PhysicalAddress),
    #[error("frame {0} freed while already free")]
    FrameDoubleFree(PhysicalAddress),
    #[error("{0} is not the head of an allocated buddy block")]
    BuddyNotAllocated(PhysicalAddress),
}

/// Failure of a memory-management operation.
///
/// Allocation failures are always returned to the caller, never retried. A
/// failed operation leaves no partial effects behind.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MemoryError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Reported by validation walks. Corruption found on a hot path halts
    /// through [`halt_on_corruption`] instead.
    #[error("memory corruption detected: {0}")]
    CorruptionDetected(Corruption),
    #[error("address {0} is already mapped")]
    AlreadyMapped(VirtualAddress),
    #[error("address {0} is not mapped")]
    NotMapped(VirtualAddress),
}

impl From<MapError> for MemoryError {
    fn from(value: MapError) -> Self {
        match value {
            MapError::UnalignedVirtual(_) | MapError::UnalignedPhysical(_) => {
                Self::InvalidArgument("address is not page aligned")
            }
            MapError::NonCanonical(_) => Self::InvalidArgument("address is not canonical"),
            MapError::AlreadyMapped(va) => Self::AlreadyMapped(va),
            MapError::ParentMissing(va) => Self::NotMapped(va),
            MapError::OutOfMemory => Self::OutOfMemory,
        }
    }
}

/// Stop the kernel after allocator metadata was found damaged.
///
/// Continuing would hand out memory based on lies, so there is no recovery
/// path. The panic handler halts the CPU.
#[cold]
#[inline(never)]
pub fn halt_on_corruption(what: Corruption) -> ! {
    error!("memory corruption detected: {what}");
    panic!("memory corruption detected: {what}");
}
