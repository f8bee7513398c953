//! # Page Table Entry
//!
//! One 64-bit x86-64 paging entry, the same layout at every level of the
//! walk. Only the bits this kernel uses get accessors of their own.
//!
//! | Bits   | Field                | Meaning                                  |
//! |--------|----------------------|------------------------------------------|
//! | 0      | `present`            | entry is valid                           |
//! | 1      | `writable`           | writes allowed                           |
//! | 2      | `user_access`        | ring 3 may access                        |
//! | 3      | `write_through`      | PWT                                      |
//! | 4      | `cache_disabled`     | PCD, set for device windows              |
//! | 5      | `accessed`           | set by the CPU                           |
//! | 6      | `dirty`              | set by the CPU on write (leaf only)      |
//! | 7      | `large_page`         | PS, always clear here: 4 KiB leaves only |
//! | 8      | `global`             | survives CR3 reloads (leaf only)         |
//! | 12..52 | physical frame       | next table or mapped frame               |
//! | 63     | `no_execute`         | NX                                       |
//!
//! Permissions intersect along the walk, so intermediate links are created
//! permissive (present, writable, user for the lower half) and the leaf
//! carries the real policy.

use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    pub present: bool,
    pub writable: bool,
    pub user_access: bool,
    pub write_through: bool,
    pub cache_disabled: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub large_page: bool,
    pub global: bool,
    /// Ignored by hardware; unused here.
    #[bits(3)]
    __: u8,
    /// Physical address bits `[51:12]`.
    #[bits(40)]
    frame_bits: u64,
    #[bits(11)]
    __: u16,
    pub no_execute: bool,
}

impl PageEntryBits {
    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame_bits() << 12)
    }

    #[inline]
    pub const fn set_physical_address(&mut self, pa: PhysicalAddress) {
        self.set_frame_bits(pa.as_u64() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn with_physical_address(mut self, pa: PhysicalAddress) -> Self {
        self.set_physical_address(pa);
        self
    }

    /// Link to a next-level table at `table`.
    #[inline]
    #[must_use]
    pub const fn table_link(table: PhysicalAddress, user: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(user)
            .with_physical_address(table)
    }

    /// Whether the entry is all zeroes (never used, or fully cleared).
    #[inline]
    #[must_use]
    pub const fn is_unused(&self) -> bool {
        self.into_bits() == 0
    }
}
