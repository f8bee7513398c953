//! # Bootstrap Pool
//!
//! A one-shot bump allocator that exists only between zone registration and
//! the moment the buddy allocator is live. It places the buddy's own block
//! arena and hash buckets, plus any other object that must exist before a
//! general allocator does.
//!
//! The backing memory is the head of the first zone large enough to hold it
//! (see [`BootstrapPool::place`]). Those frames are later registered with the
//! buddy allocator as permanently used `STATIC_POOL` blocks.
//!
//! Nothing is ever reclaimed. After [`BootstrapPool::seal`] every request is
//! rejected with [`BootstrapError::Sealed`].

use crate::zones::{ContiguousRange, ZoneId, ZoneRegistry};
use core::mem::{align_of, size_of};
use kernel_memory_addresses::{PhysicalAddress, pages_for};
use log::{error, info, trace};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BootstrapError {
    #[error("bootstrap pool exhausted: requested {requested} bytes, {remaining} left")]
    Exhausted { requested: usize, remaining: usize },
    #[error("bootstrap pool used after hand-off to the buddy allocator")]
    Sealed,
    #[error("no zone can hold a bootstrap pool of {pages} pages")]
    NoZoneFits { pages: u64 },
    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(usize),
}

/// Where the pool lives in physical memory.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PoolPlacement {
    pub zone: ZoneId,
    pub range: ContiguousRange,
}

pub struct BootstrapPool<'a> {
    phys: PhysicalAddress,
    capacity: usize,
    remaining: &'a mut [u8],
    allocations: usize,
    sealed: bool,
}

impl<'a> BootstrapPool<'a> {
    /// Choose the head of the first zone (registration order) with room for
    /// `bytes`, rounded up to whole pages.
    ///
    /// # Errors
    /// [`BootstrapError::NoZoneFits`] if every zone is too small.
    pub fn place(zones: &ZoneRegistry, bytes: usize) -> Result<PoolPlacement, BootstrapError> {
        let pages = pages_for(bytes as u64);
        zones
            .iter()
            .find(|z| z.page_count() >= pages)
            .and_then(|z| {
                ContiguousRange::from_pages(z.start(), pages).map(|range| PoolPlacement {
                    zone: z.id(),
                    range,
                })
            })
            .ok_or(BootstrapError::NoZoneFits { pages })
    }

    /// Pool over caller-provided memory (e.g. a `.bss` array or a test buffer).
    ///
    /// `phys` is the physical address of `buf[0]`, reported back through
    /// [`BootstrapPool::phys_base`].
    pub fn from_slice(phys: PhysicalAddress, buf: &'a mut [u8]) -> Self {
        Self {
            phys,
            capacity: buf.len(),
            remaining: buf,
            allocations: 0,
            sealed: false,
        }
    }

    /// Pool over the placement's frames, accessed through `virt`.
    ///
    /// # Safety
    /// `virt` must map `placement.range` writable for `'a`, and nothing else
    /// may access those frames while the pool or its allocations are alive.
    pub unsafe fn from_placement(placement: &PoolPlacement, virt: *mut u8) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let len = (placement.range.end() - placement.range.start()) as usize;
        // SAFETY: upheld by the caller.
        let buf = unsafe { core::slice::from_raw_parts_mut(virt, len) };
        Self::from_slice(placement.range.start(), buf)
    }

    /// Bump-allocate `size` zeroed bytes aligned to `align`.
    ///
    /// # Errors
    /// * [`BootstrapError::Sealed`] once the pool was handed off.
    /// * [`BootstrapError::InvalidAlignment`] if `align` is not a power of two.
    /// * [`BootstrapError::Exhausted`] if the request does not fit.
    pub fn bootstrap_alloc(
        &mut self,
        size: usize,
        align: usize,
    ) -> Result<&'a mut [u8], BootstrapError> {
        if self.sealed {
            error!("bootstrap: allocation of {size} bytes after hand-off");
            return Err(BootstrapError::Sealed);
        }
        if !align.is_power_of_two() {
            return Err(BootstrapError::InvalidAlignment(align));
        }

        let buf = core::mem::take(&mut self.remaining);
        let misalign = (buf.as_ptr() as usize) & (align - 1);
        let pad = if misalign == 0 { 0 } else { align - misalign };
        let total = match pad.checked_add(size) {
            Some(total) if total <= buf.len() => total,
            _ => {
                let remaining = buf.len();
                self.remaining = buf;
                return Err(BootstrapError::Exhausted {
                    requested: size,
                    remaining,
                });
            }
        };

        let (head, tail) = buf.split_at_mut(total);
        self.remaining = tail;
        self.allocations += 1;

        let out = &mut head[pad..];
        out.fill(0);
        trace!(
            "bootstrap: {size} bytes @ +{:#x}",
            self.capacity - self.remaining.len() - size
        );
        Ok(out)
    }

    /// Allocate `len` copies of `init`.
    ///
    /// # Errors
    /// See [`BootstrapPool::bootstrap_alloc`].
    pub fn alloc_slice<T: Copy>(
        &mut self,
        len: usize,
        init: T,
    ) -> Result<&'a mut [T], BootstrapError> {
        let Some(bytes) = size_of::<T>().checked_mul(len) else {
            return Err(BootstrapError::Exhausted {
                requested: usize::MAX,
                remaining: self.remaining(),
            });
        };
        let raw = self.bootstrap_alloc(bytes, align_of::<T>())?;

        // `bootstrap_alloc` aligned the start for `T`.
        #[allow(clippy::cast_ptr_alignment)]
        let ptr = raw.as_mut_ptr().cast::<T>();
        for i in 0..len {
            // SAFETY: in bounds of `raw`, aligned, exclusively ours.
            unsafe { ptr.add(i).write(init) };
        }
        // SAFETY: all `len` elements were initialized above.
        Ok(unsafe { core::slice::from_raw_parts_mut(ptr, len) })
    }

    /// Move `value` into the pool. It is never dropped.
    ///
    /// # Errors
    /// See [`BootstrapPool::bootstrap_alloc`].
    pub fn alloc_value<T: 'a>(&mut self, value: T) -> Result<&'a mut T, BootstrapError> {
        let raw = self.bootstrap_alloc(size_of::<T>(), align_of::<T>())?;
        #[allow(clippy::cast_ptr_alignment)]
        let ptr = raw.as_mut_ptr().cast::<T>();
        // SAFETY: aligned, sized for `T`, exclusively ours for `'a`.
        unsafe {
            ptr.write(value);
            Ok(&mut *ptr)
        }
    }

    /// Hand-off point: the buddy allocator owns physical memory from now on.
    pub fn seal(&mut self) {
        if !self.sealed {
            self.sealed = true;
            info!(
                "bootstrap: sealed after {} allocation(s), {} of {} bytes used",
                self.allocations,
                self.used(),
                self.capacity
            );
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_sealed(&self) -> bool {
        self.sealed
    }

    #[inline]
    #[must_use]
    pub const fn phys_base(&self) -> PhysicalAddress {
        self.phys
    }

    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    #[must_use]
    pub const fn used(&self) -> usize {
        self.capacity - self.remaining.len()
    }

    #[inline]
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.remaining.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::boot::BootMemoryRegion;
    use kernel_memory_addresses::PAGE_SIZE;

    #[repr(C, align(4096))]
    struct Arena([u8; 8192]);

    #[test]
    fn bumps_with_alignment_and_zeroes() {
        let mut arena = Arena([0xAA; 8192]);
        let mut pool = BootstrapPool::from_slice(PhysicalAddress::new(0x20_0000), &mut arena.0);

        let a = pool.bootstrap_alloc(3, 1).unwrap();
        assert_eq!(a, &[0, 0, 0]);
        let b = pool.bootstrap_alloc(16, 64).unwrap();
        assert_eq!(b.as_ptr() as usize % 64, 0);
        assert_eq!(pool.used(), 64 + 16);

        let s = pool.alloc_slice(10, 7u32).unwrap();
        assert!(s.iter().all(|&v| v == 7));
        assert_eq!(s.as_ptr() as usize % align_of::<u32>(), 0);

        let v = pool.alloc_value((1u64, 2u16)).unwrap();
        v.0 += 1;
        assert_eq!(*v, (2, 2));
    }

    #[test]
    fn exhaustion_leaves_pool_usable() {
        let mut arena = Arena([0; 8192]);
        let mut pool = BootstrapPool::from_slice(PhysicalAddress::new(0x1000), &mut arena.0);
        pool.bootstrap_alloc(8000, 8).unwrap();
        assert_eq!(
            pool.bootstrap_alloc(500, 8).unwrap_err(),
            BootstrapError::Exhausted {
                requested: 500,
                remaining: 192
            }
        );
        assert!(pool.bootstrap_alloc(192, 8).is_ok());
        assert_eq!(pool.remaining(), 0);
    }

    #[test]
    fn sealed_pool_rejects_requests() {
        let mut arena = Arena([0; 8192]);
        let mut pool = BootstrapPool::from_slice(PhysicalAddress::new(0x1000), &mut arena.0);
        pool.bootstrap_alloc(8, 8).unwrap();
        pool.seal();
        assert!(pool.is_sealed());
        assert_eq!(pool.bootstrap_alloc(8, 8).unwrap_err(), BootstrapError::Sealed);
        assert_eq!(pool.alloc_value(1u8).unwrap_err(), BootstrapError::Sealed);
    }

    #[test]
    fn bad_alignment_is_rejected() {
        let mut arena = Arena([0; 8192]);
        let mut pool = BootstrapPool::from_slice(PhysicalAddress::new(0x1000), &mut arena.0);
        assert_eq!(
            pool.bootstrap_alloc(8, 3).unwrap_err(),
            BootstrapError::InvalidAlignment(3)
        );
    }

    #[test]
    fn placement_uses_first_zone_that_fits() {
        let map = [
            BootMemoryRegion::usable(0x1000, 2 * PAGE_SIZE),
            BootMemoryRegion::usable(0x10_0000, 64 * PAGE_SIZE),
        ];
        let zones = ZoneRegistry::initialize(&map).unwrap();

        let small = BootstrapPool::place(&zones, 100).unwrap();
        assert_eq!(small.zone, ZoneId::new(0));
        assert_eq!(small.range.page_count(), 1);

        let big = BootstrapPool::place(&zones, 5 * PAGE_SIZE as usize + 1).unwrap();
        assert_eq!(big.zone, ZoneId::new(1));
        assert_eq!(big.range.start().as_u64(), 0x10_0000);
        assert_eq!(big.range.page_count(), 6);

        assert_eq!(
            BootstrapPool::place(&zones, 65 * PAGE_SIZE as usize).unwrap_err(),
            BootstrapError::NoZoneFits { pages: 65 }
        );
    }
}
