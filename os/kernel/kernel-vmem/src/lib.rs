//! # Virtual Memory Support
//!
//! x86-64 address spaces for the kernel: page-table nodes, region
//! bookkeeping, and the walker that installs and removes translations.
//!
//! ## What you get
//! - [`PageEntryBits`] and the 4 KiB-aligned [`PageTable`] node.
//! - [`VirtualRegion`] descriptors built by [`create_region`].
//! - [`VirtualMap`]: one address space (root table plus its regions), with
//!   [`attach_region`](VirtualMap::attach_region),
//!   [`detach_region`](VirtualMap::detach_region) and
//!   [`translate`](VirtualMap::translate).
//! - TLB maintenance through the [`TlbShootdown`] trait.
//! - The two seams to the rest of the kernel: [`FrameAlloc`] (where frames
//!   come from) and [`PhysMapper`] (how a frame is reached from the CPU).
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! Each 48-bit virtual address is divided into five fields:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! The CPU uses these fields as **indices** into four levels of page tables,
//! each level containing 512 (2⁹) entries of 8 bytes each.
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//!   │        │        │        │
//!   │        │        │        └───► PTE   → maps one 4 KiB page
//!   │        │        └────────────► PDE   → points to a PT
//!   │        └─────────────────────► PDPTE → points to a PD
//!   └──────────────────────────────► PML4E → points to a PDPT
//! ```
//!
//! Only 4 KiB leaves are created here; `PS` is never set.
//!
//! ## Address space layout
//!
//! ```text
//!  0x0000_0000_0000_0000 ┌──────────────────────┐ PML4[0]
//!                        │ private to each map  │ stacks, heaps, code
//!  0x0000_7FFF_FFFF_FFFF ├──────────────────────┤ PML4[255]
//!                        │  non-canonical hole  │
//!  0xFFFF_8000_0000_0000 ├──────────────────────┤ PML4[256]
//!                        │ kernel half, shared  │ same PDPTs in every map
//!  0xFFFF_FFFF_FFFF_FFFF └──────────────────────┘ PML4[511]
//! ```
//!
//! The kernel map allocates one PDPT for each of the 256 upper PML4 slots
//! when it is created. Every other map copies those 256 entries, so a
//! mapping added to the kernel half later is visible everywhere without
//! touching any other root.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::cast_possible_truncation)]

extern crate alloc;

mod entry;
mod map;
mod page_table;
mod region;
pub mod tlb;

pub use crate::entry::PageEntryBits;
pub use crate::map::{MapError, MapKind, VirtualMap};
pub use crate::page_table::{Level, PageTable, split_indices};
pub use crate::region::{RegionKind, RegionPermissions, VirtualRegion, create_region};
pub use crate::tlb::{BroadcastShootdown, LocalTlb, ShootdownSender, TlbShootdown};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Source of **physical** 4 KiB frames for page-table nodes and anonymous
/// region backing.
///
/// Frames must be page aligned. Their content is unspecified; the map zeroes
/// every frame it takes.
pub trait FrameAlloc {
    /// Allocate one frame, `None` on out-of-memory.
    fn alloc_4k(&mut self) -> Option<PhysicalAddress>;

    /// Return a frame previously handed out by [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&mut self, pa: PhysicalAddress);
}

/// Converts physical addresses to usable pointers in the current address
/// space (identity map in a loader, HHDM in the kernel).
pub trait PhysMapper {
    /// Virtual address at which `pa` is currently reachable.
    fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress;

    /// Borrow the object at physical address `pa`.
    ///
    /// # Safety
    /// - `pa` must be mapped writable through [`phys_to_virt`](Self::phys_to_virt)
    ///   for all of `'a`, and suitably aligned for `T`.
    /// - The bytes at `pa` must be a valid `T`, and no other reference to
    ///   them may be alive while the returned one is.
    #[inline]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        // SAFETY: upheld by the caller.
        unsafe { &mut *self.phys_to_virt(pa).as_mut_ptr::<T>() }
    }
}

/// Borrow the page-table node stored in frame `pa`.
///
/// # Safety
/// `pa` must be a frame this crate allocated for a table (or the root), and
/// the caller must hold the owning map's lock.
#[inline]
pub(crate) unsafe fn table_at<'a, M: PhysMapper>(m: &M, pa: PhysicalAddress) -> &'a mut PageTable {
    unsafe { m.phys_to_mut::<PageTable>(pa) }
}
