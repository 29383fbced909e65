//! # Kernel Memory Allocation and Virtual Memory Management
//!
//! Physical frame allocation, a buddy allocator for power-of-two blocks, the
//! kernel heap and per-process virtual memory areas, wired together by a
//! [`MemoryManager`] that brings everything up from the boot memory map.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────── MemoryManager ────────────────────────┐
//! │                                                               │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐   │
//! │  │ VMA manager  │   │ Kernel heap  │   │ Kernel page table│   │
//! │  │ (regions,    │   │ (size classes│   │ (kernel-vmem)    │   │
//! │  │  faults)     │   │  + expansion)│   │                  │   │
//! │  └──────┬───────┘   └──────┬───────┘   └────────┬─────────┘   │
//! │         │ 2 MiB            │ 4 KiB pages        │ tables      │
//! │  ┌──────▼────────┐         │                    │             │
//! │  │ Buddy         │         │                    │             │
//! │  │ allocator     │         │                    │             │
//! │  └──────┬────────┘         │                    │             │
//! │         │ zones carved     │                    │             │
//! │  ┌──────▼──────────────────▼────────────────────▼─────────┐   │
//! │  │               Physical frame allocator                 │   │
//! │  │   descriptor per frame · free list · reference counts  │   │
//! │  └────────────────────────────────────────────────────────┘   │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Components
//!
//! ### Physical Frame Allocator ([`frame_alloc`])
//! * One 12-byte [`FrameDescriptor`] per 4 KiB frame, stored in memory the
//!   allocator reserves for itself at boot.
//! * Free frames form a singly linked list threaded through the descriptors,
//!   lowest address first.
//! * Reference counts, DMA and kernel-only requests, all-or-nothing
//!   contiguous runs.
//!
//! ### Buddy Allocator ([`buddy`])
//! Naturally aligned blocks of `2^order` frames inside zones that were carved
//! out of the frame allocator. Freed blocks merge with their buddies back up
//! to the zone's largest order.
//!
//! ### Kernel Heap ([`heap`])
//! Sixteen size-segregated free lists over a growable virtual window. Every
//! block carries a checksummed header; double frees and damaged headers halt
//! the kernel.
//!
//! ### Virtual Memory Areas ([`vma`], [`process`])
//! Per-process sorted region lists, demand and prefaulted paging, and 2 MiB
//! pages where a region allows them.
//!
//! ## Locking
//!
//! Every service sits behind its own [`IrqSpinLock`](kernel_sync::IrqSpinLock).
//! Locks are always taken in the order
//! `processes → heap → paging → buddy → frames`.
//!
//! ## Features
//! - `asm`: real CR3 and `invlpg` through `kernel-vmem`.
//! - `irq`: mask interrupts while a lock is held.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod buddy;
pub mod config;
mod error;
pub mod frame_alloc;
mod global;
pub mod heap;
mod init;
mod manager;
pub mod process;
mod process_vm;
pub mod request;
mod stats;
pub mod vma;

pub use crate::buddy::{BuddyAllocator, BuddyBlock, BuddyStats, ZoneStats};
pub use crate::config::{BuddyPoolSize, KernelRoot, MemoryConfig};
pub use crate::error::{Corruption, MemoryError, halt_on_corruption};
pub use crate::frame_alloc::{
    FrameAllocator, FrameDescriptor, FrameInfo, FrameState, FrameStats, PhysicalRegion,
};
pub use crate::global::{HeapService, KernelHeapAllocator};
pub use crate::heap::{HeapBacking, HeapStats, KernelHeap};
pub use crate::init::InitError;
pub use crate::manager::{DirectoryRef, MemoryManager};
pub use crate::process::{MAX_PROCESSES, ProcessDirectory, ProcessId};
pub use crate::request::{AllocRequest, FrameFill, FramePurpose};
pub use crate::stats::{MemoryStats, VmaStats};
pub use crate::vma::{FaultPolicy, Vma, VmaFlags, VmaKind};
