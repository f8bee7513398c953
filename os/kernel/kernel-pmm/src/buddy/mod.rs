//! # Buddy Allocator
//!
//! Physical frames are handed out in order-aligned runs of `2^order` pages,
//! `order ∈ 0..=MAX_ORDER`. Every run that is currently free *or* handed out
//! is described by one [`BuddyBlock`] record in a preallocated arena; records
//! are linked by [`BlockId`] index, never by pointer.
//!
//! ```text
//!   free_lists[zone][order] ──► id ◄──► id ◄──► id        (next / prev)
//!   buckets[hash(start)]    ──► id ──► id                  (hash_next)
//!   spare                   ──► id ──► id                  (parked records)
//! ```
//!
//! * **allocate**: round up to an order, take an exact-order block or split
//!   the smallest larger one. Upper halves go to the front of the
//!   lower free lists. Zones are tried in registration order.
//! * **deallocate**: find the record through the hash table, then merge with
//!   the buddy at `start ^ (PAGE_SIZE << order)` while it is free, of the same
//!   order and zone, and the pair may merge. At most `MAX_ORDER` steps.
//!
//! `STATIC_POOL` blocks (the bootstrap pool's frames, permanently used) never
//! change order. The `FIRST_BLOCK` record sits at the head of a zone whose
//! base is not aligned to its seed order. It is split like any other block,
//! its halves merge back into it, but it never merges with a buddy below
//! it, so it never grows past its seed order.

mod block;


pub use block::{BlockFlags, BlockId, BlockInfo, BuddyBlock};

use crate::zones::{ContiguousRange, Zone, ZoneId, ZoneRegistry};
use core::mem::{align_of, size_of};
use kernel_info::memory::{MAX_ORDER, MAX_ORDER_PAGES, MAX_ZONES, ORDER_COUNT};
use kernel_memory_addresses::{PAGE_SHIFT, PAGE_SIZE, PhysicalAddress};
use log::{debug, error, info, trace, warn};

/// Fibonacci hashing multiplier (`2^64 / φ`).
const HASH_MULTIPLIER: u64 = 0x9E37_79B9_7F4A_7C15;

/// Smallest hash table the allocator accepts a layout for.
const MIN_BUCKETS: usize = 16;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BuddyError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("{0} is not the start of a tracked block")]
    UnknownAddress(PhysicalAddress),
    #[error("double free of {0}")]
    DoubleFree(PhysicalAddress),
    #[error("{0} belongs to the bootstrap pool and cannot be freed")]
    StaticPool(PhysicalAddress),
    #[error("{0} is tagged differently from how it is being freed")]
    TagMismatch(PhysicalAddress),
    #[error("buddy block metadata exhausted")]
    MetadataExhausted,
}

/// A broken bookkeeping invariant, reported by [`BuddyAllocator::verify`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum InvariantViolation {
    #[error("free block {0} is filed under the wrong zone or order")]
    Misfiled(PhysicalAddress),
    #[error("block {0} is not aligned to its order or leaves its zone")]
    Misaligned(PhysicalAddress),
    #[error("free block {0} cannot be found through the hash table")]
    NotHashed(PhysicalAddress),
    #[error("free list links around {0} are inconsistent")]
    BrokenLinks(PhysicalAddress),
    #[error("block {0} and its buddy are both free")]
    UnmergedBuddies(PhysicalAddress),
    #[error("{zone}: free lists hold {listed} pages, counters say {recorded}")]
    FreeCount {
        zone: ZoneId,
        listed: u64,
        recorded: u64,
    },
    #[error("{0}: free + allocated + reserved pages differ from the zone size")]
    Conservation(ZoneId),
    #[error("{zone}: tracked blocks cover {covered} of {total} pages")]
    Coverage { zone: ZoneId, covered: u64, total: u64 },
}

/// Page accounting of one zone. `free + allocated + reserved == total` always.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ZoneStats {
    pub total_pages: u64,
    pub free_pages: u64,
    pub allocated_pages: u64,
    /// Bootstrap pool pages, never available.
    pub reserved_pages: u64,
}

/// How much arena and hash table a set of zones needs.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MetadataLayout {
    /// Block records: one per page covers every frame being its own block.
    pub records: usize,
    /// Hash buckets, a power of two.
    pub buckets: usize,
}

impl MetadataLayout {
    #[must_use]
    pub fn for_zones(zones: &ZoneRegistry) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let pages = zones.total_pages() as usize;
        Self {
            records: pages,
            buckets: (pages / 2).next_power_of_two().max(MIN_BUCKETS),
        }
    }

    /// Bytes to reserve for both arrays, alignment padding included.
    #[must_use]
    pub const fn bytes(&self) -> usize {
        self.records * size_of::<BuddyBlock>()
            + align_of::<BuddyBlock>()
            + self.buckets * size_of::<Option<BlockId>>()
            + align_of::<Option<BlockId>>()
    }
}

#[derive(Copy, Clone, Debug, Default)]
struct FreeList {
    head: Option<BlockId>,
    tail: Option<BlockId>,
    len: usize,
}

impl FreeList {
    const EMPTY: Self = Self {
        head: None,
        tail: None,
        len: 0,
    };
}

#[derive(Copy, Clone, Eq, PartialEq)]
enum Seed {
    Free,
    StaticPool,
}

pub struct BuddyAllocator<'a> {
    zones: ZoneRegistry,
    blocks: &'a mut [BuddyBlock],
    buckets: &'a mut [Option<BlockId>],
    bucket_shift: u32,
    /// Records below this index have been handed out at least once.
    next_unused: usize,
    /// Parked records, linked through `next`.
    spare: Option<BlockId>,
    free_lists: [[FreeList; ORDER_COUNT]; MAX_ZONES],
    stats: [ZoneStats; MAX_ZONES],
}

impl<'a> BuddyAllocator<'a> {
    /// Seed every zone with maximal order-aligned free blocks.
    ///
    /// `static_pool`, if given, must lie inside one zone; its frames are
    /// recorded as permanently used `STATIC_POOL` blocks.
    ///
    /// # Errors
    /// * [`BuddyError::InvalidArgument`] for a bucket count that is not a power
    ///   of two or a static pool outside every zone.
    /// * [`BuddyError::MetadataExhausted`] if `blocks` cannot describe the zones.
    pub fn new(
        zones: ZoneRegistry,
        blocks: &'a mut [BuddyBlock],
        buckets: &'a mut [Option<BlockId>],
        static_pool: Option<ContiguousRange>,
    ) -> Result<Self, BuddyError> {
        if !buckets.len().is_power_of_two() {
            return Err(BuddyError::InvalidArgument(
                "hash bucket count must be a power of two",
            ));
        }
        if let Some(pool) = static_pool {
            let inside = zones
                .zone_of(pool.start())
                .and_then(|id| zones.get(id))
                .is_some_and(|z| z.range().covers(&pool));
            if !inside {
                return Err(BuddyError::InvalidArgument(
                    "static pool does not lie inside a single zone",
                ));
            }
        }

        buckets.fill(None);
        let mut this = Self {
            zones,
            bucket_shift: 64 - buckets.len().trailing_zeros(),
            blocks,
            buckets,
            next_unused: 0,
            spare: None,
            free_lists: [[FreeList::EMPTY; ORDER_COUNT]; MAX_ZONES],
            stats: [ZoneStats::default(); MAX_ZONES],
        };

        for zone in zones.iter() {
            this.stats[zone.id().index()].total_pages = zone.page_count();
            match static_pool.filter(|p| zone.contains(p.start())) {
                Some(pool) => {
                    this.seed(zone, zone.start(), pool.start(), Seed::Free)?;
                    this.seed(zone, pool.start(), pool.end(), Seed::StaticPool)?;
                    this.seed(zone, pool.end(), zone.end(), Seed::Free)?;
                }
                None => this.seed(zone, zone.start(), zone.end(), Seed::Free)?,
            }
        }

        info!(
            "buddy: online, {} free pages in {} zone(s), {} of {} records used",
            this.free_pages(),
            zones.len(),
            this.next_unused,
            this.blocks.len()
        );
        Ok(this)
    }

    /// Smallest order whose blocks hold `page_count` pages.
    ///
    /// # Errors
    /// [`BuddyError::InvalidArgument`] for zero pages or more than
    /// `2^MAX_ORDER` pages. Larger runs are never assembled from several
    /// top-order blocks.
    #[allow(clippy::cast_possible_truncation)]
    pub const fn order_for(page_count: u64) -> Result<u8, BuddyError> {
        if page_count == 0 {
            return Err(BuddyError::InvalidArgument("zero-page request"));
        }
        if page_count > MAX_ORDER_PAGES {
            return Err(BuddyError::InvalidArgument(
                "request exceeds the largest block",
            ));
        }
        Ok(page_count.next_power_of_two().trailing_zeros() as u8)
    }

    /// Allocate at least `page_count` contiguous pages.
    ///
    /// # Errors
    /// See [`BuddyAllocator::order_for`] and [`BuddyAllocator::allocate_order`].
    pub fn allocate(&mut self, page_count: u64) -> Result<PhysicalAddress, BuddyError> {
        self.allocate_order(Self::order_for(page_count)?)
    }

    /// [`allocate`](Self::allocate), marking the block as tagged. A tagged
    /// block is only released by [`deallocate_tagged`](Self::deallocate_tagged),
    /// which lets an owner tell its own runs from any other page.
    ///
    /// # Errors
    /// As [`allocate`](Self::allocate).
    pub fn allocate_tagged(&mut self, page_count: u64) -> Result<PhysicalAddress, BuddyError> {
        let pa = self.allocate(page_count)?;
        if let Some(id) = self.lookup(pa) {
            self.blocks[id.index()].flags.set_tagged(true);
        }
        Ok(pa)
    }

    /// Allocate one block of exactly `2^order` pages.
    ///
    /// # Errors
    /// * [`BuddyError::InvalidArgument`] if `order > MAX_ORDER`.
    /// * [`BuddyError::OutOfMemory`] once every zone failed.
    /// * [`BuddyError::MetadataExhausted`] if a split found no spare record.
    pub fn allocate_order(&mut self, order: u8) -> Result<PhysicalAddress, BuddyError> {
        if usize::from(order) > MAX_ORDER {
            return Err(BuddyError::InvalidArgument("order above MAX_ORDER"));
        }
        for z in 0..self.zones.len() {
            #[allow(clippy::cast_possible_truncation)]
            let zone = ZoneId::new(z as u8);
            if let Some(pa) = self.allocate_in_zone(zone, order)? {
                return Ok(pa);
            }
            trace!("buddy: {zone} has no order-{order} block, trying next zone");
        }
        debug!("buddy: out of memory for order {order}");
        Err(BuddyError::OutOfMemory)
    }

    /// Return a block handed out by [`allocate`](Self::allocate).
    ///
    /// Returns the number of pages released.
    ///
    /// # Errors
    /// * [`BuddyError::InvalidArgument`] for an unaligned address.
    /// * [`BuddyError::UnknownAddress`] if no block starts at `pa`.
    /// * [`BuddyError::StaticPool`] for bootstrap pool frames.
    /// * [`BuddyError::DoubleFree`] if the block is already free, including
    ///   when it has since merged into a larger free block.
    /// * [`BuddyError::TagMismatch`] for a block from
    ///   [`allocate_tagged`](Self::allocate_tagged).
    pub fn deallocate(&mut self, pa: PhysicalAddress) -> Result<u64, BuddyError> {
        self.release(pa, false)
    }

    /// Return a block handed out by [`allocate_tagged`](Self::allocate_tagged).
    ///
    /// # Errors
    /// As [`deallocate`](Self::deallocate); an untagged block is
    /// [`BuddyError::TagMismatch`].
    pub fn deallocate_tagged(&mut self, pa: PhysicalAddress) -> Result<u64, BuddyError> {
        self.release(pa, true)
    }

    fn release(&mut self, pa: PhysicalAddress, tagged: bool) -> Result<u64, BuddyError> {
        if !pa.is_page_aligned() {
            return Err(BuddyError::InvalidArgument("unaligned frame address"));
        }
        let Some(id) = self.lookup(pa) else {
            // Freed once already and merged into a block below it.
            if self.free_block_covering(pa) {
                error!("buddy: double free of {pa} (merged)");
                return Err(BuddyError::DoubleFree(pa));
            }
            return Err(BuddyError::UnknownAddress(pa));
        };
        let block = self.blocks[id.index()];
        if block.flags.static_pool() {
            return Err(BuddyError::StaticPool(pa));
        }
        if block.is_free() {
            error!("buddy: double free of {pa}");
            return Err(BuddyError::DoubleFree(pa));
        }
        if block.flags.tagged() != tagged {
            warn!("buddy: {pa} freed with the wrong tag");
            return Err(BuddyError::TagMismatch(pa));
        }
        self.blocks[id.index()].flags.set_tagged(false);

        let pages = block.pages();
        let stats = &mut self.stats[block.zone.index()];
        stats.allocated_pages -= pages;
        stats.free_pages += pages;

        let merged = self.coalesce(id);
        self.push_front(merged);
        Ok(pages)
    }

    /// Order of the block starting at `pa`, free or allocated.
    #[must_use]
    pub fn block_order(&self, pa: PhysicalAddress) -> Option<u8> {
        self.lookup(pa).map(|id| self.blocks[id.index()].order)
    }

    #[must_use]
    pub fn block_info(&self, pa: PhysicalAddress) -> Option<BlockInfo> {
        self.lookup(pa).map(|id| BlockInfo::from(&self.blocks[id.index()]))
    }

    #[inline]
    #[must_use]
    pub const fn zones(&self) -> &ZoneRegistry {
        &self.zones
    }

    #[must_use]
    pub fn zone_stats(&self, zone: ZoneId) -> Option<ZoneStats> {
        self.zones.get(zone).map(|z| self.stats[z.id().index()])
    }

    #[must_use]
    pub fn free_pages(&self) -> u64 {
        self.stats[..self.zones.len()].iter().map(|s| s.free_pages).sum()
    }

    #[must_use]
    pub fn total_pages(&self) -> u64 {
        self.zones.total_pages()
    }

    /// Number of free blocks of `order` in `zone`.
    #[must_use]
    pub fn free_list_len(&self, zone: ZoneId, order: u8) -> usize {
        self.free_lists
            .get(zone.index())
            .and_then(|lists| lists.get(usize::from(order)))
            .map_or(0, |l| l.len)
    }

    /// Walk every free list and hash bucket and check the bookkeeping.
    ///
    /// # Errors
    /// The first [`InvariantViolation`] found.
    pub fn verify(&self) -> Result<(), InvariantViolation> {
        for zone in self.zones.iter() {
            let z = zone.id().index();
            let mut listed = 0;
            for order in 0..ORDER_COUNT {
                listed += self.verify_free_list(zone, order)?;
            }

            let stats = self.stats[z];
            if listed != stats.free_pages {
                return Err(InvariantViolation::FreeCount {
                    zone: zone.id(),
                    listed,
                    recorded: stats.free_pages,
                });
            }
            if stats.free_pages + stats.allocated_pages + stats.reserved_pages != stats.total_pages
            {
                return Err(InvariantViolation::Conservation(zone.id()));
            }
        }

        let mut covered = [0_u64; MAX_ZONES];
        for bucket in self.buckets.iter() {
            let mut cursor = *bucket;
            while let Some(id) = cursor {
                let b = &self.blocks[id.index()];
                covered[b.zone.index()] += b.pages();
                cursor = b.hash_next;
            }
        }
        for zone in self.zones.iter() {
            let covered = covered[zone.id().index()];
            if covered != zone.page_count() {
                return Err(InvariantViolation::Coverage {
                    zone: zone.id(),
                    covered,
                    total: zone.page_count(),
                });
            }
        }
        Ok(())
    }

    fn verify_free_list(&self, zone: &Zone, order: usize) -> Result<u64, InvariantViolation> {
        let list = self.free_lists[zone.id().index()][order];
        let mut pages = 0;
        let mut count = 0;
        let mut prev = None;
        let mut cursor = list.head;
        while let Some(id) = cursor {
            let b = &self.blocks[id.index()];
            if b.zone != zone.id()
                || usize::from(b.order) != order
                || !b.is_free()
                || b.flags.tagged()
            {
                return Err(InvariantViolation::Misfiled(b.start));
            }
            if b.prev != prev {
                return Err(InvariantViolation::BrokenLinks(b.start));
            }
            let fits = b
                .start
                .checked_add(b.bytes())
                .is_some_and(|end| end.as_u64() <= zone.end().as_u64());
            if !b.start.is_aligned_to(b.bytes()) || !zone.contains(b.start) || !fits {
                return Err(InvariantViolation::Misaligned(b.start));
            }
            if self.lookup(b.start) != Some(id) {
                return Err(InvariantViolation::NotHashed(b.start));
            }
            if order < MAX_ORDER
                && let Some(other) = self.lookup(b.buddy_address()).map(|i| &self.blocks[i.index()])
                && other.is_free()
                && other.order == b.order
                && other.zone == b.zone
                && b.may_merge_with(other)
            {
                return Err(InvariantViolation::UnmergedBuddies(b.start));
            }
            pages += b.pages();
            count += 1;
            prev = cursor;
            cursor = b.next;
        }
        if count != list.len || prev != list.tail {
            let start = list.head.map_or(zone.start(), |h| self.blocks[h.index()].start);
            return Err(InvariantViolation::BrokenLinks(start));
        }
        Ok(pages)
    }

    /// Cover `[start, end)` of `zone` with maximal order-aligned blocks.
    fn seed(
        &mut self,
        zone: &Zone,
        start: PhysicalAddress,
        end: PhysicalAddress,
        kind: Seed,
    ) -> Result<(), BuddyError> {
        let mut cursor = start.as_u64();
        let end = end.as_u64();
        while cursor < end {
            let aligned = cursor.trailing_zeros().saturating_sub(PAGE_SHIFT) as usize;
            let mut order = aligned.min(MAX_ORDER);
            while PAGE_SIZE << order > end - cursor {
                order -= 1;
            }

            let id = self.take_record()?;
            #[allow(clippy::cast_possible_truncation)]
            let mut block = BuddyBlock {
                start: PhysicalAddress::new(cursor),
                zone: zone.id(),
                order: order as u8,
                ..BuddyBlock::EMPTY
            };
            let stats = &mut self.stats[zone.id().index()];
            match kind {
                Seed::StaticPool => {
                    block.flags.set_static_pool(true);
                    stats.reserved_pages += block.pages();
                }
                Seed::Free => {
                    let head = cursor == zone.start().as_u64();
                    let below_base = block.buddy_address().as_u64() < zone.start().as_u64();
                    block.flags.set_first_block(head && order < MAX_ORDER && below_base);
                    stats.free_pages += block.pages();
                }
            }
            self.blocks[id.index()] = block;
            self.hash_insert(id);
            if kind == Seed::Free {
                self.push_back(id);
            }
            trace!("buddy: seeded {} order {order} in {}", block.start, zone.id());
            cursor += PAGE_SIZE << order;
        }
        Ok(())
    }

    fn allocate_in_zone(
        &mut self,
        zone: ZoneId,
        order: u8,
    ) -> Result<Option<PhysicalAddress>, BuddyError> {
        let z = zone.index();

        // Exact fit.
        if let Some(id) = self.free_lists[z][usize::from(order)].head {
            self.unlink(id);
            return Ok(Some(self.hand_out(id)));
        }

        for higher in usize::from(order) + 1..=MAX_ORDER {
            let Some(id) = self.free_lists[z][higher].head else {
                continue;
            };
            self.unlink(id);
            self.split_down(id, order)?;
            return Ok(Some(self.hand_out(id)));
        }
        Ok(None)
    }

    /// Halve the (unlinked) block `id` until it has `target` order, filing
    /// every upper half as free.
    fn split_down(&mut self, id: BlockId, target: u8) -> Result<(), BuddyError> {
        while self.blocks[id.index()].order > target {
            let upper = match self.take_record() {
                Ok(upper) => upper,
                Err(e) => {
                    let id = self.coalesce(id);
                    self.push_front(id);
                    return Err(e);
                }
            };

            let block = &mut self.blocks[id.index()];
            block.order -= 1;
            block.buddy_chain_length = 0;
            let half = BuddyBlock {
                start: block.start + block.bytes(),
                zone: block.zone,
                order: block.order,
                ..BuddyBlock::EMPTY
            };
            trace!("buddy: split {} -> 2 x order {}", block.start, block.order);

            self.blocks[upper.index()] = half;
            self.hash_insert(upper);
            self.push_front(upper);
        }
        Ok(())
    }

    /// Merge the (unlinked) block `id` upward as far as possible. Returns the
    /// surviving record, still unlinked.
    fn coalesce(&mut self, mut id: BlockId) -> BlockId {
        let mut chain = 0_u8;
        loop {
            let block = self.blocks[id.index()];
            if usize::from(block.order) >= MAX_ORDER {
                break;
            }
            let Some(buddy_id) = self.lookup(block.buddy_address()) else {
                break;
            };
            let buddy = self.blocks[buddy_id.index()];
            if buddy.zone != block.zone
                || buddy.order != block.order
                || !buddy.is_free()
                || !block.may_merge_with(&buddy)
            {
                break;
            }

            self.unlink(buddy_id);
            let (lower, upper) = if buddy.start.as_u64() < block.start.as_u64() {
                (buddy_id, id)
            } else {
                (id, buddy_id)
            };
            self.hash_remove(upper);
            self.park_record(upper);
            self.blocks[lower.index()].order += 1;
            chain += 1;
            trace!(
                "buddy: merged {} + {} -> order {}",
                block.start,
                buddy.start,
                block.order + 1
            );
            id = lower;
        }
        debug_assert!(usize::from(chain) <= MAX_ORDER);
        self.blocks[id.index()].buddy_chain_length = chain;
        id
    }

    fn hand_out(&mut self, id: BlockId) -> PhysicalAddress {
        let block = &self.blocks[id.index()];
        let stats = &mut self.stats[block.zone.index()];
        stats.free_pages -= block.pages();
        stats.allocated_pages += block.pages();
        block.start
    }

    fn take_record(&mut self) -> Result<BlockId, BuddyError> {
        if let Some(id) = self.spare {
            self.spare = self.blocks[id.index()].next;
            return Ok(id);
        }
        if self.next_unused < self.blocks.len() {
            let id = BlockId::new(self.next_unused);
            self.next_unused += 1;
            return Ok(id);
        }
        warn!("buddy: all {} block records in use", self.blocks.len());
        Err(BuddyError::MetadataExhausted)
    }

    fn park_record(&mut self, id: BlockId) {
        self.blocks[id.index()] = BuddyBlock {
            next: self.spare,
            ..BuddyBlock::EMPTY
        };
        self.spare = Some(id);
    }

    fn bucket_of(&self, pa: PhysicalAddress) -> usize {
        let h = pa.page_number().wrapping_mul(HASH_MULTIPLIER);
        #[allow(clippy::cast_possible_truncation)]
        let index = h.checked_shr(self.bucket_shift).unwrap_or(0) as usize;
        index
    }

    fn lookup(&self, pa: PhysicalAddress) -> Option<BlockId> {
        let mut cursor = self.buckets[self.bucket_of(pa)];
        while let Some(id) = cursor {
            let b = &self.blocks[id.index()];
            if b.start == pa {
                return Some(id);
            }
            cursor = b.hash_next;
        }
        None
    }

    /// Whether a free block strictly larger than one page contains `pa`.
    fn free_block_covering(&self, pa: PhysicalAddress) -> bool {
        (1..=MAX_ORDER).any(|order| {
            let start = PhysicalAddress::new(pa.as_u64() & !((PAGE_SIZE << order) - 1));
            self.lookup(start).is_some_and(|id| {
                let b = &self.blocks[id.index()];
                b.is_free() && usize::from(b.order) >= order
            })
        })
    }

    fn hash_insert(&mut self, id: BlockId) {
        let bucket = self.bucket_of(self.blocks[id.index()].start);
        let block = &mut self.blocks[id.index()];
        debug_assert!(!block.flags.hashed());
        block.hash_next = self.buckets[bucket];
        block.flags.set_hashed(true);
        self.buckets[bucket] = Some(id);
    }

    fn hash_remove(&mut self, id: BlockId) {
        let bucket = self.bucket_of(self.blocks[id.index()].start);
        let next = self.blocks[id.index()].hash_next;
        if self.buckets[bucket] == Some(id) {
            self.buckets[bucket] = next;
        } else {
            let mut cursor = self.buckets[bucket];
            while let Some(c) = cursor {
                if self.blocks[c.index()].hash_next == Some(id) {
                    self.blocks[c.index()].hash_next = next;
                    break;
                }
                cursor = self.blocks[c.index()].hash_next;
            }
        }
        let block = &mut self.blocks[id.index()];
        block.hash_next = None;
        block.flags.set_hashed(false);
    }

    fn push_front(&mut self, id: BlockId) {
        let (z, o) = self.list_of(id);
        let list = &mut self.free_lists[z][o];
        let old = list.head.replace(id);
        if list.tail.is_none() {
            list.tail = Some(id);
        }
        list.len += 1;

        let block = &mut self.blocks[id.index()];
        block.prev = None;
        block.next = old;
        block.flags.set_free(true);
        if let Some(old) = old {
            self.blocks[old.index()].prev = Some(id);
        }
    }

    fn push_back(&mut self, id: BlockId) {
        let (z, o) = self.list_of(id);
        let list = &mut self.free_lists[z][o];
        let old = list.tail.replace(id);
        if list.head.is_none() {
            list.head = Some(id);
        }
        list.len += 1;

        let block = &mut self.blocks[id.index()];
        block.next = None;
        block.prev = old;
        block.flags.set_free(true);
        if let Some(old) = old {
            self.blocks[old.index()].next = Some(id);
        }
    }

    fn unlink(&mut self, id: BlockId) {
        let (z, o) = self.list_of(id);
        let block = &mut self.blocks[id.index()];
        debug_assert!(block.is_free());
        let (prev, next) = (block.prev.take(), block.next.take());
        block.flags.set_free(false);

        let list = &mut self.free_lists[z][o];
        match prev {
            Some(p) => self.blocks[p.index()].next = next,
            None => list.head = next,
        }
        match next {
            Some(n) => self.blocks[n.index()].prev = prev,
            None => list.tail = prev,
        }
        list.len -= 1;
    }

    fn list_of(&self, id: BlockId) -> (usize, usize) {
        let b = &self.blocks[id.index()];
        (b.zone.index(), usize::from(b.order))
    }
}
