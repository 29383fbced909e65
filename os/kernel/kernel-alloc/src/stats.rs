//! Read-only snapshots of every allocator.

use crate::buddy::BuddyStats;
use crate::frame_alloc::FrameStats;
use crate::heap::HeapStats;
use core::fmt;

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct VmaStats {
    /// Live process address spaces.
    pub processes: usize,
    /// Region descriptors in use across all processes.
    pub regions: u16,
    pub capacity: u16,
}

/// Point-in-time view of the memory manager.
///
/// Each part is sampled under its own lock, so the parts may disagree
/// slightly while other CPUs allocate.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct MemoryStats {
    pub frames: FrameStats,
    pub buddy: BuddyStats,
    pub heap: HeapStats,
    pub vmas: VmaStats,
}

const KIB: u64 = 1024;

impl fmt::Display for MemoryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let FrameStats {
            total,
            free,
            allocated,
            reserved,
        } = self.frames;
        writeln!(
            f,
            "frames: {total} total, {free} free, {allocated} allocated, {reserved} reserved"
        )?;
        writeln!(
            f,
            "buddy:  {} of {} frames free",
            self.buddy.free_frames, self.buddy.total_frames
        )?;
        for zone in self.buddy.zones.iter().flatten() {
            writeln!(
                f,
                "  zone {} +{} frames{}: {} free",
                zone.start,
                zone.frames,
                if zone.dma { " (dma)" } else { "" },
                zone.free_frames
            )?;
        }
        writeln!(
            f,
            "heap:   {} KiB mapped, {} KiB free in {} blocks, {} KiB used, {}% fragmented",
            self.heap.mapped_bytes / KIB,
            self.heap.free_bytes / KIB,
            self.heap.free_blocks,
            self.heap.allocated_bytes / KIB,
            self.heap.fragmentation_percent
        )?;
        write!(
            f,
            "vmas:   {} processes, {}/{} regions",
            self.vmas.processes, self.vmas.regions, self.vmas.capacity
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_lists_every_service() {
        let stats = MemoryStats {
            frames: FrameStats {
                total: 16,
                free: 10,
                allocated: 4,
                reserved: 2,
            },
            vmas: VmaStats {
                processes: 1,
                regions: 3,
                capacity: 8,
            },
            ..MemoryStats::default()
        };
        let text = format!("{stats}");
        assert!(text.starts_with("frames: 16 total, 10 free, 4 allocated, 2 reserved"));
        assert!(text.contains("heap:"));
        assert!(text.ends_with("vmas:   1 processes, 3/8 regions"));
    }
}
