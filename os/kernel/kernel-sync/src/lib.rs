//! # Kernel synchronization primitives
//!
//! - [`SpinLock`]: test-and-test-and-set lock with RAII guards. Use
//!   [`SpinLock::lock_irq`] for state that an interrupt handler may also touch.
//! - [`IrqGuard`]: saves and masks the local interrupt flag for a scope.
//! - [`SyncOnceCell`]: write-once cell for boot-time singletons.
//!
//! Interrupt masking is only real on freestanding x86-64 builds; on hosted
//! targets (unit tests) it degrades to a no-op so the same locks can be
//! exercised from `std` threads.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;
mod sync_once_cell;

pub use irq::IrqGuard;
pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
