//! # Slab pages
//!
//! A slab is one page cut into equally sized slots of one size class. The
//! first [`SLAB_HEADER_SIZE`] bytes hold the header, so no slot pointer is
//! ever page aligned; that is how the heap tells slots from page runs.
//!
//! ```text
//!  page ┌────────┬────────┬────────┬─────┬────────┬──────┐
//!       │ header │ slot 0 │ slot 1 │ ... │ slot n │ tail │
//!       └────────┴────────┴────────┴─────┴────────┴──────┘
//!        64 B     class    class          class    < class
//! ```

use core::ptr::NonNull;
use kernel_info::memory::{PAGE_SIZE, SLAB_GRANULARITY, SLAB_HEADER_SIZE};

/// Bytes of a slab page available to slots.
const SLAB_PAYLOAD: usize = PAGE_SIZE as usize - SLAB_HEADER_SIZE;

/// Slot sizes. The last two split the payload in two and one.
pub const SIZE_CLASSES: [usize; CLASS_COUNT] = [
    SLAB_GRANULARITY,
    32,
    64,
    128,
    256,
    512,
    1024,
    SLAB_PAYLOAD / 2 / SLAB_GRANULARITY * SLAB_GRANULARITY,
    SLAB_PAYLOAD,
];

pub const CLASS_COUNT: usize = 9;

/// Largest request served from a slab.
pub const MAX_SLAB_OBJECT: usize = SIZE_CLASSES[CLASS_COUNT - 1];

/// Marks a page as a live slab.
const SLAB_MAGIC: u32 = 0x51AB_C1A5;

/// Bitmap words; enough for the smallest class.
const BITMAP_WORDS: usize = SLAB_PAYLOAD / SLAB_GRANULARITY / 64 + 1;

const _: () = {
    assert!(size_of::<SlabHeader>() == SLAB_HEADER_SIZE);
    assert!(SIZE_CLASSES[CLASS_COUNT - 2] == 2016);
    assert!(BITMAP_WORDS * 64 >= SLAB_PAYLOAD / SLAB_GRANULARITY);
};

/// Alignment every slot of `class` is guaranteed to have.
#[inline]
#[must_use]
pub const fn class_align(class: usize) -> usize {
    let tz = SIZE_CLASSES[class].trailing_zeros();
    let max = SLAB_HEADER_SIZE.trailing_zeros();
    1 << if tz < max { tz } else { max }
}

/// Smallest class whose slots hold `size` bytes at `align`.
#[must_use]
pub fn class_for(size: usize, align: usize) -> Option<usize> {
    (0..CLASS_COUNT).find(|&c| SIZE_CLASSES[c] >= size && class_align(c) >= align)
}

#[repr(C, align(64))]
pub struct SlabHeader {
    magic: u32,
    class: u8,
    /// On its class's partial list.
    pub(crate) listed: bool,
    in_use: u16,
    capacity: u16,
    pub(crate) next: Option<NonNull<SlabHeader>>,
    pub(crate) prev: Option<NonNull<SlabHeader>>,
    bitmap: [u64; BITMAP_WORDS],
}

impl SlabHeader {
    /// Write a fresh header for `class` at the start of `page`.
    ///
    /// # Safety
    /// `page` must be a page-aligned, writable page the caller owns.
    #[allow(clippy::cast_possible_truncation, clippy::cast_ptr_alignment)]
    pub unsafe fn format(page: NonNull<u8>, class: usize) -> NonNull<Self> {
        let slab = page.cast::<Self>();
        let header = Self {
            magic: SLAB_MAGIC,
            class: class as u8,
            listed: false,
            in_use: 0,
            capacity: (SLAB_PAYLOAD / SIZE_CLASSES[class]) as u16,
            next: None,
            prev: None,
            bitmap: [0; BITMAP_WORDS],
        };
        // SAFETY: upheld by the caller; page alignment covers the header's.
        unsafe { slab.write(header) };
        slab
    }

    /// The slab page holding `ptr`, if `ptr` could be a slot pointer.
    #[must_use]
    pub fn containing(ptr: NonNull<u8>) -> Option<NonNull<Self>> {
        let addr = ptr.as_ptr() as usize;
        let page = addr & !(PAGE_SIZE as usize - 1);
        if addr - page < SLAB_HEADER_SIZE {
            return None;
        }
        NonNull::new(ptr.as_ptr().wrapping_sub(addr - page).cast::<Self>())
    }

    #[inline]
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.magic == SLAB_MAGIC && (self.class as usize) < CLASS_COUNT
    }

    /// Forget the page was a slab, before it goes back to the allocator.
    pub const fn retire(&mut self) {
        self.magic = 0;
    }

    #[inline]
    #[must_use]
    pub const fn class(&self) -> usize {
        self.class as usize
    }

    #[inline]
    #[must_use]
    pub const fn in_use(&self) -> u16 {
        self.in_use
    }

    #[inline]
    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.in_use == self.capacity
    }

    /// Claim the lowest free slot.
    pub fn claim(&mut self) -> Option<usize> {
        let (word, bits) = self
            .bitmap
            .iter()
            .enumerate()
            .find(|&(_, &bits)| bits != u64::MAX)?;
        let slot = word * 64 + bits.trailing_ones() as usize;
        if slot >= usize::from(self.capacity) {
            return None;
        }
        self.bitmap[word] |= 1 << (slot % 64);
        self.in_use += 1;
        Some(slot)
    }

    /// Release `slot`; `false` if it was not in use.
    pub const fn release(&mut self, slot: usize) -> bool {
        let (word, bit) = (slot / 64, 1 << (slot % 64));
        if self.bitmap[word] & bit == 0 {
            return false;
        }
        self.bitmap[word] &= !bit;
        self.in_use -= 1;
        true
    }

    #[must_use]
    pub const fn is_claimed(&self, slot: usize) -> bool {
        self.bitmap[slot / 64] & (1 << (slot % 64)) != 0
    }

    /// Slot index of `ptr` inside the slab at `this`, if it is a slot start.
    #[must_use]
    pub fn slot_of(this: NonNull<Self>, ptr: NonNull<u8>) -> Option<usize> {
        // SAFETY: only reads the header, which the caller vouched for.
        let header = unsafe { this.as_ref() };
        let size = SIZE_CLASSES[header.class()];
        let off = (ptr.as_ptr() as usize) - (this.as_ptr() as usize) - SLAB_HEADER_SIZE;
        (off % size == 0 && off / size < usize::from(header.capacity)).then_some(off / size)
    }

    /// Address of `slot` in the slab at `this`.
    #[must_use]
    pub fn slot_ptr(this: NonNull<Self>, slot: usize) -> NonNull<u8> {
        // SAFETY: header and slots share one page.
        let size = SIZE_CLASSES[unsafe { this.as_ref() }.class()];
        // SAFETY: `slot < capacity` keeps the result inside the page.
        unsafe { this.cast::<u8>().add(SLAB_HEADER_SIZE + slot * size) }
    }
}
