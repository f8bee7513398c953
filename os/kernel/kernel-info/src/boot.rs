//! # Boot Handoff
//!
//! What the boot loader tells the memory core, once, before any other
//! subsystem runs.

/// One entry of the boot-time physical memory map.
///
/// Entries may be unsorted, unaligned and overlapping; the zone registry
/// normalizes them.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BootMemoryRegion {
    /// Physical base address in bytes.
    pub base: u64,
    /// Length in bytes.
    pub length: u64,
    /// Whether the range is free RAM the kernel may hand out.
    pub usable: bool,
}

impl BootMemoryRegion {
    #[must_use]
    pub const fn usable(base: u64, length: u64) -> Self {
        Self {
            base,
            length,
            usable: true,
        }
    }

    #[must_use]
    pub const fn reserved(base: u64, length: u64) -> Self {
        Self {
            base,
            length,
            usable: false,
        }
    }

    /// Exclusive end address, saturating at `u64::MAX`.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }
}

/// Everything the memory core consumes from the loader.
#[derive(Copy, Clone, Debug)]
pub struct MemoryHandoff<'a> {
    /// Physical memory map as reported by firmware.
    pub memory_map: &'a [BootMemoryRegion],
    /// Virtual address at which physical address 0 is mapped (HHDM base).
    pub hhdm_offset: u64,
}
