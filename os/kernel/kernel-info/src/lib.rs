//! # Kernel Memory Layout and Boot Memory Map
//!
//! The authoritative source for the constants that every memory subsystem
//! crate agrees on, and for the shape of the physical memory map handed over
//! by the bootloader.
//!
//! ## Modules
//!
//! ### Memory Layout ([`memory`])
//! * **Address Space Layout**: user/kernel boundary, automatic region placement base
//! * **Higher Half**: HHDM offset, kernel image base, kernel heap window
//! * **Allocator Tuning**: DMA limit, largest buddy order, minimum heap expansion
//!
//! ### Boot Memory Map ([`boot`])
//! * **Entries**: `(base, length, kind)` triples, any order
//! * **Direct Map**: the linear physical-to-virtual offset in force at handoff
//!
//! ## Virtual Memory Architecture
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │        (unmapped, 4 MiB)        │
//! USER_REGION_BASE      ├─────────────────────────────────┤ 0x0000_0000_0040_0000
//!                       │      Process regions (VMAs)     │
//! USERSPACE_END         ├─────────────────────────────────┤ 0x0000_8000_0000_0000
//!                       │     non-canonical hole          │
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │   Higher Half Direct Mapping    │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │       Kernel Text & Data        │
//! KERNEL_HEAP_BASE      ├─────────────────────────────────┤ 0xffff_ffff_9000_0000
//!                       │   Kernel heap (grows upward)    │
//!                       ├─────────────────────────────────┤ + KERNEL_HEAP_SIZE
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! PML4 slots from [`memory::KERNEL_PML4_FIRST_SLOT`] upward belong to the
//! kernel and are shared by every process directory.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
