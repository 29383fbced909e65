//! # Kernel synchronization primitives
//!
//! Spin-based only: nothing here sleeps, yields or allocates, so every type
//! is usable from interrupt context and before the heap exists.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;
mod sync_once_cell;

pub use irq::{IrqGuard, IrqSpinLock, IrqSpinLockGuard};
pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
