//! # Zone Registry
//!
//! Normalizes the boot memory map into at most [`MAX_ZONES`] zones.
//!
//! Policy, applied deterministically:
//!
//! 1. Usable entries are clipped *inward* to page boundaries. Physical page 0
//!    is never registered, so a null frame address can never be handed out.
//!    Entries that shrink below one page are dropped.
//! 2. Overlapping or touching usable entries are merged.
//! 3. Reserved entries win over usable ones: every page a reserved entry
//!    touches is cut out of the merged ranges, which may split them.
//! 4. Zones are numbered in ascending address order. Ranges beyond the
//!    fifteenth are not registered.
//!
//! The normalization runs without a heap: it rescans the map for each zone,
//! which is quadratic in the number of entries but runs once.

use core::fmt;
use kernel_info::boot::BootMemoryRegion;
use kernel_info::memory::MAX_ZONES;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, align_down, align_up};
use log::{debug, error, info, warn};

/// Index of a zone in registration (address-ascending) order.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ZoneId(u8);

impl ZoneId {
    #[inline]
    #[must_use]
    pub const fn new(index: u8) -> Self {
        Self(index)
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "zone{}", self.0)
    }
}

/// A physically contiguous, page-aligned span `[start, end)`.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct ContiguousRange {
    start: PhysicalAddress,
    end: PhysicalAddress,
    page_count: u64,
}

impl ContiguousRange {
    /// Range covering `page_count` pages starting at `start`.
    ///
    /// Returns `None` if `start` is not page aligned or the end overflows.
    #[must_use]
    pub const fn from_pages(start: PhysicalAddress, page_count: u64) -> Option<Self> {
        if !start.is_page_aligned() {
            return None;
        }
        let Some(len) = page_count.checked_mul(PAGE_SIZE) else {
            return None;
        };
        let Some(end) = start.as_u64().checked_add(len) else {
            return None;
        };
        Some(Self {
            start,
            end: PhysicalAddress::new(end),
            page_count,
        })
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> PhysicalAddress {
        self.start
    }

    /// Exclusive end.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        self.end
    }

    #[inline]
    #[must_use]
    pub const fn page_count(&self) -> u64 {
        self.page_count
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, pa: PhysicalAddress) -> bool {
        pa.as_u64() >= self.start.as_u64() && pa.as_u64() < self.end.as_u64()
    }

    /// Whether `other` lies entirely inside `self`.
    #[inline]
    #[must_use]
    pub const fn covers(&self, other: &Self) -> bool {
        other.start.as_u64() >= self.start.as_u64() && other.end.as_u64() <= self.end.as_u64()
    }
}

impl fmt::Debug for ContiguousRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:#x}..{:#x}) ({} pages)",
            self.start.as_u64(),
            self.end.as_u64(),
            self.page_count
        )
    }
}

/// One registered zone.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Zone {
    id: ZoneId,
    range: ContiguousRange,
}

impl Zone {
    #[inline]
    #[must_use]
    pub const fn id(&self) -> ZoneId {
        self.id
    }

    #[inline]
    #[must_use]
    pub const fn range(&self) -> ContiguousRange {
        self.range
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> PhysicalAddress {
        self.range.start
    }

    #[inline]
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        self.range.end
    }

    #[inline]
    #[must_use]
    pub const fn page_count(&self) -> u64 {
        self.range.page_count
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, pa: PhysicalAddress) -> bool {
        self.range.contains(pa)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ZoneError {
    #[error("boot memory map contains no usable page")]
    NoUsableMemory,
}

/// Fixed-capacity table of zones, immutable after [`ZoneRegistry::initialize`].
#[derive(Copy, Clone, Debug)]
pub struct ZoneRegistry {
    zones: [Zone; MAX_ZONES],
    len: usize,
    dropped_pages: u64,
}

impl ZoneRegistry {
    const EMPTY_ZONE: Zone = Zone {
        id: ZoneId(0),
        range: ContiguousRange {
            start: PhysicalAddress::zero(),
            end: PhysicalAddress::zero(),
            page_count: 0,
        },
    };

    /// Build the zone table from the loader's memory map.
    ///
    /// # Errors
    /// [`ZoneError::NoUsableMemory`] if no usable page survives clipping.
    pub fn initialize(memory_map: &[BootMemoryRegion]) -> Result<Self, ZoneError> {
        let mut registry = Self {
            zones: [Self::EMPTY_ZONE; MAX_ZONES],
            len: 0,
            dropped_pages: 0,
        };

        for region in memory_map.iter().filter(|r| r.usable) {
            if clip(region).is_none() && region.length > 0 {
                warn!(
                    "zones: discarding usable entry {:#x}+{:#x}: no whole page inside",
                    region.base, region.length
                );
            }
        }

        let mut cursor = 0_u64;
        while let Some((start, end)) = next_usable_span(memory_map, cursor) {
            cursor = end;
            let page_count = (end - start) / PAGE_SIZE;
            if registry.len == MAX_ZONES {
                registry.dropped_pages += page_count;
                warn!(
                    "zones: limit of {MAX_ZONES} reached, not registering [{start:#x}..{end:#x})"
                );
                continue;
            }

            // Both ends are page aligned and `end > start`.
            let Some(range) = ContiguousRange::from_pages(PhysicalAddress::new(start), page_count)
            else {
                continue;
            };
            #[allow(clippy::cast_possible_truncation)]
            let id = ZoneId(registry.len as u8);
            debug!("zones: {id} = {range:?}");
            registry.zones[registry.len] = Zone { id, range };
            registry.len += 1;
        }

        if registry.len == 0 {
            error!("zones: no usable memory in a map of {} entries", memory_map.len());
            return Err(ZoneError::NoUsableMemory);
        }

        info!(
            "zones: registered {} zone(s), {} pages ({} KiB)",
            registry.len,
            registry.total_pages(),
            registry.total_pages() * PAGE_SIZE / 1024
        );
        Ok(registry)
    }

    /// Registered zones in ascending address order.
    #[inline]
    #[must_use]
    pub fn zones(&self) -> &[Zone] {
        &self.zones[..self.len]
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &Zone> {
        self.zones().iter()
    }

    #[inline]
    #[must_use]
    pub fn get(&self, id: ZoneId) -> Option<&Zone> {
        self.zones().get(id.index())
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Zone containing `pa`, if any.
    #[must_use]
    pub fn zone_of(&self, pa: PhysicalAddress) -> Option<ZoneId> {
        self.iter().find(|z| z.contains(pa)).map(Zone::id)
    }

    /// Sum of all registered zone sizes.
    #[must_use]
    pub fn total_pages(&self) -> u64 {
        self.iter().map(Zone::page_count).sum()
    }

    /// Usable pages that were not registered because the table was full.
    #[inline]
    #[must_use]
    pub const fn dropped_pages(&self) -> u64 {
        self.dropped_pages
    }
}

/// Usable entry clipped inward to whole pages, never including page 0.
fn clip(region: &BootMemoryRegion) -> Option<(u64, u64)> {
    if !region.usable {
        return None;
    }
    let start = align_up(region.base.max(PAGE_SIZE), PAGE_SIZE)?;
    let end = align_down(region.end(), PAGE_SIZE);
    (end > start).then_some((start, end))
}

/// Reserved entry widened outward to whole pages.
fn reserved_pages(region: &BootMemoryRegion) -> Option<(u64, u64)> {
    if region.usable || region.length == 0 {
        return None;
    }
    let start = align_down(region.base, PAGE_SIZE);
    let end = align_up(region.end(), PAGE_SIZE).unwrap_or(align_down(u64::MAX, PAGE_SIZE));
    (end > start).then_some((start, end))
}

/// Lowest span at or above `cursor` that is usable and not reserved.
fn next_usable_span(map: &[BootMemoryRegion], mut cursor: u64) -> Option<(u64, u64)> {
    loop {
        let (mut start, end) = next_merged_range(map, cursor)?;

        // Step over reserved entries covering the start.
        let mut moved = true;
        while moved && start < end {
            moved = false;
            for (rs, re) in map.iter().filter_map(reserved_pages) {
                if rs <= start && start < re {
                    start = re;
                    moved = true;
                }
            }
        }
        if start >= end {
            cursor = end;
            continue;
        }

        // Stop at the first reserved entry inside.
        let end = map
            .iter()
            .filter_map(reserved_pages)
            .filter(|&(rs, _)| start < rs && rs < end)
            .map(|(rs, _)| rs)
            .fold(end, u64::min);
        return Some((start, end));
    }
}

/// Lowest usable span at or above `cursor`, grown over every entry that
/// overlaps or touches it.
fn next_merged_range(map: &[BootMemoryRegion], cursor: u64) -> Option<(u64, u64)> {
    let mut next: Option<(u64, u64)> = None;
    for (start, end) in map.iter().filter_map(clip) {
        if end <= cursor {
            continue;
        }
        let start = start.max(cursor);
        match next {
            Some((best, _)) if best <= start => {}
            _ => next = Some((start, end)),
        }
    }

    let (start, mut end) = next?;
    loop {
        let mut grown = false;
        for (s, e) in map.iter().filter_map(clip) {
            if s <= end && e > end {
                end = e;
                grown = true;
            }
        }
        if !grown {
            return Some((start, end));
        }
    }
}
