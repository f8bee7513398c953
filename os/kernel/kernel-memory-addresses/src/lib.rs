//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses used by the frame
//! allocator, the kernel heap and the page-table mapper.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A physical (RAM / MMIO) byte address. |
//! | [`VirtualAddress`] | A virtual (page-table translated) byte address. |
//!
//! Both are `#[repr(transparent)]` wrappers around `u64` so mixing the two
//! kinds is a compile error while the representation stays zero-cost.
//!
//! All paging in this kernel happens at the base granularity of
//! [`PAGE_SIZE`] bytes; larger runs are expressed as page counts.
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x0010_2042);
//! assert_eq!(pa.align_down().as_u64(), 0x0010_2000);
//! assert_eq!(pa.page_offset(), 0x42);
//! assert!(!pa.is_page_aligned());
//!
//! let va = VirtualAddress::new(0xFFFF_8000_0000_1000);
//! assert!(va.is_canonical());
//! assert_eq!(va.page_number(), 0xFFFF_8000_0000_1);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

mod physical_address;
mod virtual_address;

pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

/// Size of a base page / physical frame in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: u32 = 12;

const _: () = assert!(1 << PAGE_SHIFT == PAGE_SIZE);

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(8191, 4096), 4096);
/// ```
#[inline]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    debug_assert!(a.is_power_of_two());
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`, or `None` on overflow.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(1, 4096), Some(4096));
/// assert_eq!(align_up(4096, 4096), Some(4096));
/// assert_eq!(align_up(u64::MAX, 4096), None);
/// ```
#[inline]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> Option<u64> {
    debug_assert!(a.is_power_of_two());
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}

/// Number of pages needed to hold `bytes` bytes.
#[inline]
#[must_use]
pub const fn pages_for(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_for_rounds_up() {
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(PAGE_SIZE), 1);
        assert_eq!(pages_for(PAGE_SIZE + 1), 2);
    }

    #[test]
    fn align_helpers_agree() {
        for x in [0u64, 1, 4095, 4096, 4097, 0x1234_5678] {
            let down = align_down(x, PAGE_SIZE);
            let up = align_up(x, PAGE_SIZE).unwrap();
            assert!(down <= x && x <= up);
            assert_eq!(down % PAGE_SIZE, 0);
            assert_eq!(up % PAGE_SIZE, 0);
        }
    }
}
