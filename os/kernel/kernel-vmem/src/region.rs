//! # Virtual Regions
//!
//! A region is a named, permission-tagged span of one address space. It is
//! only a descriptor: [`create_region`] validates and builds it, and
//! [`VirtualMap::attach_region`](crate::VirtualMap::attach_region) populates
//! the page tables.
//!
//! ```text
//!   reserved_start      start                         end
//!        │ guard pages   │ mapped pages                │
//!        ├───────────────┼─────────────────────────────┤
//!        │  never mapped │  page_count × PAGE_SIZE     │
//! ```

use crate::MapError;
use bitfield_struct::bitfield;
use core::fmt;
use kernel_info::memory::{KERNEL_HALF_BASE, USER_HALF_END};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};

/// What backs a region.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegionKind {
    /// Anonymous, zero-filled frames; usually below a guard page.
    Stack,
    /// Anonymous, zero-filled frames.
    Heap,
    /// Anonymous, zero-filled frames the loader fills in.
    Code,
    /// A physically contiguous MMIO window starting at `phys`, mapped
    /// uncached. Its frames are never returned to the allocator.
    Device { phys: PhysicalAddress },
}

impl RegionKind {
    /// Backed by frames the map allocates (and frees) itself.
    #[inline]
    #[must_use]
    pub const fn is_anonymous(self) -> bool {
        !matches!(self, Self::Device { .. })
    }
}

/// Access rights of a region's leaf entries. Readability is implied.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct RegionPermissions {
    pub writable: bool,
    pub executable: bool,
    /// Accessible from ring 3; only valid in the lower half.
    pub user: bool,
    #[bits(5)]
    __: u8,
}

impl RegionPermissions {
    /// Kernel read/write data.
    #[must_use]
    pub const fn kernel_rw() -> Self {
        Self::new().with_writable(true)
    }

    /// Kernel code.
    #[must_use]
    pub const fn kernel_rx() -> Self {
        Self::new().with_executable(true)
    }

    /// User read/write data.
    #[must_use]
    pub const fn user_rw() -> Self {
        Self::new().with_writable(true).with_user(true)
    }

    /// User code.
    #[must_use]
    pub const fn user_rx() -> Self {
        Self::new().with_executable(true).with_user(true)
    }
}

#[derive(Copy, Clone, Eq, PartialEq)]
pub struct VirtualRegion {
    start: VirtualAddress,
    end: VirtualAddress,
    page_count: u64,
    guard_pages: u64,
    ref_count: u32,
    kind: RegionKind,
    permissions: RegionPermissions,
}

/// Build a region descriptor with `ref_count = 1`. No page table is touched.
///
/// # Errors
/// * [`MapError::InvalidArgument`] for a zero-page or unaligned region, an
///   unaligned device base, or user permissions in the kernel half.
/// * [`MapError::NotCanonical`] if the range leaves its canonical half.
pub fn create_region(
    start: VirtualAddress,
    page_count: u64,
    kind: RegionKind,
    permissions: RegionPermissions,
) -> Result<VirtualRegion, MapError> {
    if page_count == 0 {
        return Err(MapError::InvalidArgument("region without pages"));
    }
    if !start.is_page_aligned() {
        return Err(MapError::InvalidArgument("region start not page aligned"));
    }
    if let RegionKind::Device { phys } = kind
        && !phys.is_page_aligned()
    {
        return Err(MapError::InvalidArgument("device window not page aligned"));
    }

    let end = page_count
        .checked_mul(PAGE_SIZE)
        .and_then(|len| start.checked_add(len))
        .ok_or(MapError::NotCanonical(start))?;
    let region = VirtualRegion {
        start,
        end,
        page_count,
        guard_pages: 0,
        ref_count: 1,
        kind,
        permissions,
    };
    region.check_half()?;
    if permissions.user() && region.is_kernel_half() {
        return Err(MapError::InvalidArgument(
            "user permissions on a kernel-half region",
        ));
    }
    Ok(region)
}

impl VirtualRegion {
    /// Reserve `pages` unmapped guard pages directly below [`start`](Self::start).
    ///
    /// # Errors
    /// [`MapError::NotCanonical`] if the guard would leave the region's half.
    pub fn with_guard_pages(mut self, pages: u64) -> Result<Self, MapError> {
        self.guard_pages = pages;
        self.check_half()?;
        Ok(self)
    }

    /// First mapped byte.
    #[inline]
    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    /// One past the last mapped byte.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        self.end
    }

    /// Mapped pages, guard excluded.
    #[inline]
    #[must_use]
    pub const fn page_count(&self) -> u64 {
        self.page_count
    }

    #[inline]
    #[must_use]
    pub const fn guard_pages(&self) -> u64 {
        self.guard_pages
    }

    /// Lowest address this region keeps other regions away from.
    #[inline]
    #[must_use]
    pub const fn reserved_start(&self) -> VirtualAddress {
        VirtualAddress::new(self.start.as_u64().wrapping_sub(self.guard_pages * PAGE_SIZE))
    }

    #[inline]
    #[must_use]
    pub const fn ref_count(&self) -> u32 {
        self.ref_count
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> RegionKind {
        self.kind
    }

    #[inline]
    #[must_use]
    pub const fn permissions(&self) -> RegionPermissions {
        self.permissions
    }

    #[inline]
    #[must_use]
    pub const fn is_kernel_half(&self) -> bool {
        self.start.as_u64() >= KERNEL_HALF_BASE
    }

    /// Whether `va` lies in the mapped part.
    #[inline]
    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        va.as_u64() >= self.start.as_u64() && va.as_u64() < self.end.as_u64()
    }

    /// Whether the reserved ranges (guards included) intersect.
    #[inline]
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.reserved_start().as_u64() < other.end.as_u64()
            && other.reserved_start().as_u64() < self.end.as_u64()
    }

    /// Virtual address of mapped page `i`.
    #[inline]
    #[must_use]
    pub const fn page(&self, i: u64) -> VirtualAddress {
        VirtualAddress::new(self.start.as_u64() + i * PAGE_SIZE)
    }

    pub(crate) const fn retain(&mut self) -> u32 {
        self.ref_count += 1;
        self.ref_count
    }

    pub(crate) const fn release(&mut self) -> u32 {
        self.ref_count = self.ref_count.saturating_sub(1);
        self.ref_count
    }

    /// The whole reserved range sits inside one canonical half.
    fn check_half(&self) -> Result<(), MapError> {
        let lo = self
            .guard_pages
            .checked_mul(PAGE_SIZE)
            .and_then(|guard| self.start.as_u64().checked_sub(guard))
            .ok_or(MapError::NotCanonical(self.start))?;
        let hi = self.end.as_u64() - 1;
        let lower = hi < USER_HALF_END;
        let upper = lo >= KERNEL_HALF_BASE;
        if lower || upper {
            Ok(())
        } else {
            Err(MapError::NotCanonical(VirtualAddress::new(lo)))
        }
    }
}

impl fmt::Debug for VirtualRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualRegion")
            .field("range", &format_args!("{}..{}", self.start, self.end))
            .field("pages", &self.page_count)
            .field("guard", &self.guard_pages)
            .field("refs", &self.ref_count)
            .field("kind", &self.kind)
            .field("perm", &self.permissions)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_starts_with_one_reference() {
        let r = create_region(
            VirtualAddress::new(0x40_0000),
            4,
            RegionKind::Heap,
            RegionPermissions::user_rw(),
        )
        .unwrap();
        assert_eq!(r.ref_count(), 1);
        assert_eq!(r.end().as_u64(), 0x40_4000);
        assert!(r.contains(VirtualAddress::new(0x40_3fff)));
        assert!(!r.contains(VirtualAddress::new(0x40_4000)));
        assert!(!r.is_kernel_half());
    }

    #[test]
    fn invalid_descriptors_are_rejected() {
        let va = VirtualAddress::new(0x40_0000);
        let rw = RegionPermissions::user_rw();
        assert!(matches!(
            create_region(va, 0, RegionKind::Heap, rw),
            Err(MapError::InvalidArgument(_))
        ));
        assert!(matches!(
            create_region(va + 1, 1, RegionKind::Heap, rw),
            Err(MapError::InvalidArgument(_))
        ));
        assert!(matches!(
            create_region(
                va,
                1,
                RegionKind::Device {
                    phys: PhysicalAddress::new(0xFEE0_0010)
                },
                RegionPermissions::kernel_rw()
            ),
            Err(MapError::InvalidArgument(_))
        ));
        // Crosses into the non-canonical hole.
        assert!(matches!(
            create_region(VirtualAddress::new(USER_HALF_END - PAGE_SIZE), 2, RegionKind::Heap, rw),
            Err(MapError::NotCanonical(_))
        ));
        // User access is a lower-half thing.
        assert!(matches!(
            create_region(VirtualAddress::new(KERNEL_HALF_BASE), 1, RegionKind::Heap, rw),
            Err(MapError::InvalidArgument(_))
        ));
    }

    #[test]
    fn guards_widen_the_reserved_range() {
        let stack = create_region(
            VirtualAddress::new(0x7000_0000),
            2,
            RegionKind::Stack,
            RegionPermissions::user_rw(),
        )
        .unwrap()
        .with_guard_pages(1)
        .unwrap();
        assert_eq!(stack.reserved_start().as_u64(), 0x7000_0000 - PAGE_SIZE);

        let below = create_region(
            VirtualAddress::new(0x7000_0000 - 2 * PAGE_SIZE),
            1,
            RegionKind::Heap,
            RegionPermissions::user_rw(),
        )
        .unwrap();
        assert!(!stack.overlaps(&below));

        let touching = create_region(
            VirtualAddress::new(0x7000_0000 - PAGE_SIZE),
            1,
            RegionKind::Heap,
            RegionPermissions::user_rw(),
        )
        .unwrap();
        assert!(stack.overlaps(&touching));
        assert!(touching.overlaps(&stack));
    }

    #[test]
    fn guard_below_address_zero_is_rejected() {
        let r = create_region(
            VirtualAddress::new(0),
            1,
            RegionKind::Stack,
            RegionPermissions::user_rw(),
        )
        .unwrap();
        assert!(matches!(r.with_guard_pages(1), Err(MapError::NotCanonical(_))));
    }

    #[test]
    fn guard_sizes_past_the_address_space_are_rejected() {
        let r = create_region(
            VirtualAddress::new(0x7FFF_F000_0000),
            4,
            RegionKind::Stack,
            RegionPermissions::user_rw(),
        )
        .unwrap();
        let start = r.start();
        assert_eq!(r.with_guard_pages(u64::MAX / 2), Err(MapError::NotCanonical(start)));
        assert_eq!(r.with_guard_pages(1 << 52), Err(MapError::NotCanonical(start)));
        assert_eq!(r.with_guard_pages(16).map(|g| g.guard_pages()), Ok(16));
    }
}
