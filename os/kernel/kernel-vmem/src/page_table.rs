//! # Page Table Node
//!
//! A 4 KiB-aligned array of 512 [`PageEntryBits`], identical in shape at all
//! four levels. Which level a node is depends only on where the walk found it.

use crate::entry::PageEntryBits;
use kernel_info::memory::ENTRIES_PER_TABLE;
use kernel_memory_addresses::VirtualAddress;

/// Paging level, top (`Pml4`) to bottom (`Pt`).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Level {
    Pml4,
    Pdpt,
    Pd,
    Pt,
}

impl Level {
    /// Bit position of this level's 9-bit index in a virtual address.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Pml4 => 39,
            Self::Pdpt => 30,
            Self::Pd => 21,
            Self::Pt => 12,
        }
    }

    /// Index of `va` into a table of this level.
    #[inline]
    #[must_use]
    pub const fn index_of(self, va: VirtualAddress) -> usize {
        ((va.as_u64() >> self.shift()) & 0x1FF) as usize
    }
}

/// `[pml4, pdpt, pd, pt]` indices of `va`.
#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> [usize; 4] {
    [
        Level::Pml4.index_of(va),
        Level::Pdpt.index_of(va),
        Level::Pd.index_of(va),
        Level::Pt.index_of(va),
    ]
}

#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntryBits; ENTRIES_PER_TABLE],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageEntryBits::new(); ENTRIES_PER_TABLE],
        }
    }

    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageEntryBits::new());
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: usize) -> PageEntryBits {
        self.entries[i]
    }

    /// Plain store; TLB maintenance is the caller's business.
    #[inline]
    pub const fn set(&mut self, i: usize, e: PageEntryBits) {
        self.entries[i] = e;
    }

    /// No entry is in use, present or parked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(PageEntryBits::is_unused)
    }
}
