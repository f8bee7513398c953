//! # Physical Memory Management
//!
//! Everything that hands out physical frames lives here, leaves first:
//!
//! ```text
//!  boot memory map ──► ZoneRegistry ──► BootstrapPool ──► BuddyAllocator
//!                      (≤ 15 ranges)    (one-shot bump)   (orders 0..=10)
//! ```
//!
//! * [`zones`]: turns the loader's memory map into at most
//!   [`MAX_ZONES`](kernel_info::memory::MAX_ZONES) page-aligned, address-ascending
//!   zones.
//! * [`bootstrap`]: bump allocator carved from the head of a zone, used to
//!   place the buddy metadata before any allocator exists. Sealed at hand-off.
//! * [`buddy`]: the frame allocator proper. Block records live in a
//!   preallocated arena and are linked by index, both in the per-order free
//!   lists and in the address hash table used to find a block's buddy.
//!
//! None of these types lock. The owner (see `kernel-alloc`) wraps the
//! allocator in a `SpinLock` and holds it for a whole split or coalesce chain.

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod bootstrap;
pub mod buddy;
pub mod zones;

pub use bootstrap::{BootstrapError, BootstrapPool, PoolPlacement};
pub use buddy::{
    BlockId, BlockInfo, BuddyAllocator, BuddyBlock, BuddyError, InvariantViolation,
    MetadataLayout, ZoneStats,
};
pub use zones::{ContiguousRange, Zone, ZoneError, ZoneId, ZoneRegistry};
