use crate::zones::ZoneId;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};

/// Index of a [`BuddyBlock`] record in the allocator's arena.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BlockId(u32);

impl BlockId {
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) const fn new(index: usize) -> Self {
        debug_assert!(index <= u32::MAX as usize);
        Self(index as u32)
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Per-block state bits.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct BlockFlags {
    /// Block sits on its zone's free list for its order.
    pub free: bool,
    /// Frames back the bootstrap pool: never freed, split or merged.
    pub static_pool: bool,
    /// Head of a zone whose buddy would lie below the zone base: never
    /// merges downward, so it never grows past its seed order.
    pub first_block: bool,
    /// Record is linked into the address hash table.
    pub hashed: bool,
    /// Handed out by `allocate_tagged`; only `deallocate_tagged` frees it.
    pub tagged: bool,
    #[bits(3)]
    __: u8,
}

/// Metadata for one order-aligned run of `2^order` frames.
///
/// Records are permanent: a merge parks the upper half's record on the spare
/// list and a later split reuses it. `next`/`prev` link the free list of
/// `(zone, order)`, `hash_next` chains the hash bucket of `start`.
#[derive(Copy, Clone, Debug)]
pub struct BuddyBlock {
    pub(crate) start: PhysicalAddress,
    pub(crate) zone: ZoneId,
    pub(crate) order: u8,
    pub(crate) flags: BlockFlags,
    /// Merges folded into this block by its most recent coalesce chain.
    pub(crate) buddy_chain_length: u8,
    pub(crate) next: Option<BlockId>,
    pub(crate) prev: Option<BlockId>,
    pub(crate) hash_next: Option<BlockId>,
}

impl BuddyBlock {
    /// Unused arena slot; what the arena is filled with before seeding.
    pub const EMPTY: Self = Self {
        start: PhysicalAddress::zero(),
        zone: ZoneId::new(0),
        order: 0,
        flags: BlockFlags::new(),
        buddy_chain_length: 0,
        next: None,
        prev: None,
        hash_next: None,
    };

    #[inline]
    #[must_use]
    pub const fn start(&self) -> PhysicalAddress {
        self.start
    }

    #[inline]
    #[must_use]
    pub const fn order(&self) -> u8 {
        self.order
    }

    #[inline]
    #[must_use]
    pub const fn zone(&self) -> ZoneId {
        self.zone
    }

    #[inline]
    #[must_use]
    pub const fn flags(&self) -> BlockFlags {
        self.flags
    }

    #[inline]
    #[must_use]
    pub const fn is_free(&self) -> bool {
        self.flags.free()
    }

    #[inline]
    #[must_use]
    pub const fn pages(&self) -> u64 {
        1 << self.order
    }

    #[inline]
    #[must_use]
    pub const fn bytes(&self) -> u64 {
        PAGE_SIZE << self.order
    }

    /// Start of the same-order block this one merges with.
    #[inline]
    #[must_use]
    pub const fn buddy_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.start.as_u64() ^ self.bytes())
    }

    /// Whether `self` and its buddy `other` may become one block. Pool frames
    /// never merge, and a zone head never takes a buddy from below it.
    #[inline]
    #[must_use]
    pub(crate) const fn may_merge_with(&self, other: &Self) -> bool {
        if self.flags.static_pool() || other.flags.static_pool() {
            return false;
        }
        let other_below = other.start.as_u64() < self.start.as_u64();
        !(self.flags.first_block() && other_below) && !(other.flags.first_block() && !other_below)
    }
}

/// Read-only view of a block, as returned by
/// [`BuddyAllocator::block_info`](super::BuddyAllocator::block_info).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BlockInfo {
    pub start: PhysicalAddress,
    pub zone: ZoneId,
    pub order: u8,
    pub free: bool,
    pub static_pool: bool,
    pub first_block: bool,
    pub tagged: bool,
    pub buddy_chain_length: u8,
}

impl From<&BuddyBlock> for BlockInfo {
    fn from(b: &BuddyBlock) -> Self {
        Self {
            start: b.start,
            zone: b.zone,
            order: b.order,
            free: b.flags.free(),
            static_pool: b.flags.static_pool(),
            first_block: b.flags.first_block(),
            tagged: b.flags.tagged(),
            buddy_chain_length: b.buddy_chain_length,
        }
    }
}
