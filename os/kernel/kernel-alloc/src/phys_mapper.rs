//! # HHDM-based PhysMapper for Kernel Virtual Memory
//!
//! The loader maps all of physical memory at one fixed offset, the higher
//! half direct map (HHDM). Physical address `pa` is then reachable at
//! `offset + pa`, and a pointer into that window converts back by
//! subtracting the offset.
//!
//! The offset comes from the boot handoff
//! ([`MemoryHandoff::hhdm_offset`](kernel_info::boot::MemoryHandoff)); it is
//! usually [`DEFAULT_HHDM_BASE`](kernel_info::memory::DEFAULT_HHDM_BASE).
//!
//! ## Example
//! ```rust
//! use kernel_alloc::phys_mapper::HhdmPhysMapper;
//! use kernel_memory_addresses::PhysicalAddress;
//! use kernel_vmem::PhysMapper;
//!
//! let mapper = HhdmPhysMapper::new(0xffff_8880_0000_0000);
//! let va = mapper.phys_to_virt(PhysicalAddress::new(0x1234_0000));
//! assert_eq!(va.as_u64(), 0xffff_8880_1234_0000);
//! assert_eq!(mapper.virt_to_phys(va), PhysicalAddress::new(0x1234_0000));
//! ```

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] for kernels with a higher-half direct map.
///
/// Arithmetic wraps, so host tests can use `host_ptr - fake_phys_base` as the
/// offset.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HhdmPhysMapper {
    offset: u64,
}

impl HhdmPhysMapper {
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    #[inline]
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Physical address behind a pointer into the direct map.
    #[inline]
    #[must_use]
    pub const fn virt_to_phys(&self, va: VirtualAddress) -> PhysicalAddress {
        PhysicalAddress::new(va.as_u64().wrapping_sub(self.offset))
    }
}

impl PhysMapper for HhdmPhysMapper {
    #[inline]
    fn phys_to_virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(pa.as_u64().wrapping_add(self.offset))
    }
}
