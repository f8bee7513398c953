//! # Memory Layout

pub use kernel_memory_addresses::PAGE_SIZE;

/// Highest buddy order; an order-`k` block spans `2^k` pages.
pub const MAX_ORDER: usize = 10;

/// Number of distinct buddy orders (`0..=MAX_ORDER`).
pub const ORDER_COUNT: usize = MAX_ORDER + 1;

/// Pages in a top-order block.
pub const MAX_ORDER_PAGES: u64 = 1 << MAX_ORDER;

/// Upper bound on the number of physical memory zones.
pub const MAX_ZONES: usize = 15;

/// Start of the kernel half of every address space.
pub const KERNEL_HALF_BASE: u64 = 0xffff_8000_0000_0000;

/// First PML4 slot belonging to the kernel half.
pub const KERNEL_PML4_START: usize = 256;

/// Entries per page-table node at every level.
pub const ENTRIES_PER_TABLE: usize = 512;

/// End (exclusive) of the private, per-map half.
pub const USER_HALF_END: u64 = 0x0000_8000_0000_0000;

/// Default Higher Half Direct Map base; the loader may report another one.
pub const DEFAULT_HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Where the kernel executes (VMA).
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Minimum object size handed out by the kernel heap.
pub const SLAB_GRANULARITY: usize = 16;

/// Bytes reserved at the start of every slab page for its header.
pub const SLAB_HEADER_SIZE: usize = 64;

/// Default size of a thread stack region, in pages.
pub const DEFAULT_STACK_PAGES: u64 = 8;

const _: () = {
    assert!(MAX_ORDER < u8::MAX as usize);
    assert!((KERNEL_HALF_BASE >> 39) & 0x1FF == KERNEL_PML4_START as u64);
    assert!(DEFAULT_HHDM_BASE >= KERNEL_HALF_BASE);
    assert!(KERNEL_BASE > DEFAULT_HHDM_BASE);
    assert!(SLAB_HEADER_SIZE.is_power_of_two());
    assert!(SLAB_GRANULARITY.is_power_of_two());
    assert!((PAGE_SIZE as usize).is_multiple_of(SLAB_HEADER_SIZE));
};
