//! # Kernel heap
//!
//! Small requests are served from slab pages, one size class per page; large
//! requests get a whole run of pages straight from the page source.
//!
//! ```text
//!  kmalloc(n)
//!     │  n ≤ 4032 (alignment permitting)      n larger
//!     ▼                                        ▼
//!  partial[class] ─► slab ─► slab         PageSource::alloc_pages
//!     │ empty list: new slab page              (page aligned)
//!     ▼
//!  PageSource::alloc_pages(1)
//! ```
//!
//! Each class keeps a list of slabs that still have a free slot. A slab that
//! fills up leaves the list and comes back on its next free. An empty slab
//! goes back to the page source unless it is the last one of its class.
//!
//! The heap lock is never held while the page source is called, so the page
//! source may take its own lock.

use crate::slab::{CLASS_COUNT, SIZE_CLASSES, SlabHeader, class_for};
use core::ptr::NonNull;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::pages_for;
use kernel_sync::SpinLock;
use log::{debug, error};

/// What the heap takes a run of pages for.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PageUse {
    /// One page carved into slots of a size class.
    Slab,
    /// A large allocation handed to the caller as a whole.
    Run,
}

/// Where the heap gets its pages.
pub trait PageSource {
    /// A run of at least `pages` contiguous, page-aligned, writable pages.
    fn alloc_pages(&self, pages: u64, usage: PageUse) -> Result<NonNull<u8>, HeapError>;

    /// Return a run taken for `usage`; yields the number of pages released.
    /// Anything that is not a live run of that use is
    /// [`HeapError::InvalidPointer`] and stays where it is.
    fn free_pages(&self, ptr: NonNull<u8>, usage: PageUse) -> Result<u64, HeapError>;

    /// Pages in the live [`PageUse::Run`] starting at `ptr`.
    fn run_pages(&self, ptr: NonNull<u8>) -> Option<u64>;
}

impl<T: PageSource + ?Sized> PageSource for &T {
    fn alloc_pages(&self, pages: u64, usage: PageUse) -> Result<NonNull<u8>, HeapError> {
        (**self).alloc_pages(pages, usage)
    }

    fn free_pages(&self, ptr: NonNull<u8>, usage: PageUse) -> Result<u64, HeapError> {
        (**self).free_pages(ptr, usage)
    }

    fn run_pages(&self, ptr: NonNull<u8>) -> Option<u64> {
        (**self).run_pages(ptr)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("pointer {0:#x} was not handed out by the heap")]
    InvalidPointer(usize),
    #[error("double free of {0:#x}")]
    DoubleFree(usize),
    #[error("slab page of {0:#x} is corrupted")]
    Corrupted(usize),
}

/// Snapshot of the heap's bookkeeping.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct HeapStats {
    /// Slab pages per size class.
    pub slabs: [usize; CLASS_COUNT],
    /// Slots handed out across all classes.
    pub live_objects: usize,
    /// Live large allocations.
    pub page_runs: usize,
    /// Pages currently taken from the page source.
    pub pages_held: u64,
}

struct Slabs {
    partial: [Option<NonNull<SlabHeader>>; CLASS_COUNT],
    slabs: [usize; CLASS_COUNT],
    live: [usize; CLASS_COUNT],
    page_runs: usize,
    run_pages: u64,
}

// Slab pages are only reached through the heap lock.
unsafe impl Send for Slabs {}

impl Slabs {
    const fn new() -> Self {
        Self {
            partial: [None; CLASS_COUNT],
            slabs: [0; CLASS_COUNT],
            live: [0; CLASS_COUNT],
            page_runs: 0,
            run_pages: 0,
        }
    }

    /// Hand out a slot from the first partial slab of `class`.
    fn take(&mut self, class: usize) -> Option<NonNull<u8>> {
        let mut slab = self.partial[class]?;
        // SAFETY: listed slabs are live slab pages owned by the heap.
        let header = unsafe { slab.as_mut() };
        let slot = header.claim()?;
        let full = header.is_full();
        if full {
            self.unlink(class, slab);
        }
        self.live[class] += 1;
        Some(SlabHeader::slot_ptr(slab, slot))
    }

    fn push(&mut self, class: usize, mut slab: NonNull<SlabHeader>) {
        let head = self.partial[class];
        {
            // SAFETY: `slab` is a live slab page owned by the heap.
            let header = unsafe { slab.as_mut() };
            header.next = head;
            header.prev = None;
            header.listed = true;
        }
        if let Some(mut next) = head {
            // SAFETY: as above.
            unsafe { next.as_mut() }.prev = Some(slab);
        }
        self.partial[class] = Some(slab);
    }

    fn unlink(&mut self, class: usize, mut slab: NonNull<SlabHeader>) {
        // SAFETY: `slab` and its neighbours are live slab pages on this list.
        let (prev, next) = {
            let header = unsafe { slab.as_mut() };
            let links = (header.prev, header.next);
            header.prev = None;
            header.next = None;
            header.listed = false;
            links
        };
        match prev {
            Some(mut p) => unsafe { p.as_mut() }.next = next,
            None => self.partial[class] = next,
        }
        if let Some(mut n) = next {
            unsafe { n.as_mut() }.prev = prev;
        }
    }
}

/// Slab and page-run heap. All methods take the page source explicitly.
pub struct KernelHeap {
    slabs: SpinLock<Slabs>,
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelHeap {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slabs: SpinLock::new(Slabs::new()),
        }
    }

    /// Allocate `size` bytes, aligned to at least 16 bytes.
    ///
    /// # Errors
    /// [`HeapError::InvalidArgument`] for `size == 0`,
    /// [`HeapError::OutOfMemory`] when the page source is exhausted.
    pub fn kmalloc(&self, pages: &impl PageSource, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.kmalloc_aligned(pages, size, 1)
    }

    /// Allocate `size` bytes at `align` (a power of two up to one page).
    ///
    /// Alignments the slabs cannot guarantee fall through to a page run.
    ///
    /// # Errors
    /// See [`kmalloc`](Self::kmalloc); unsupported alignments are
    /// [`HeapError::InvalidArgument`].
    pub fn kmalloc_aligned(
        &self,
        pages: &impl PageSource,
        size: usize,
        align: usize,
    ) -> Result<NonNull<u8>, HeapError> {
        if size == 0 {
            return Err(HeapError::InvalidArgument("zero-sized allocation"));
        }
        if !align.is_power_of_two() || align as u64 > PAGE_SIZE {
            return Err(HeapError::InvalidArgument("alignment beyond one page"));
        }

        match class_for(size, align) {
            Some(class) => self.alloc_slot(pages, class),
            None => self.alloc_run(pages, size),
        }
    }

    /// [`kmalloc`](Self::kmalloc), then zero the block.
    ///
    /// # Errors
    /// As [`kmalloc`](Self::kmalloc).
    pub fn kzmalloc(&self, pages: &impl PageSource, size: usize) -> Result<NonNull<u8>, HeapError> {
        let ptr = self.kmalloc(pages, size)?;
        // SAFETY: the block holds at least `size` bytes.
        unsafe { ptr.write_bytes(0, size) };
        Ok(ptr)
    }

    /// Move `ptr` into a block of `size` bytes.
    ///
    /// A `None` pointer behaves like [`kmalloc`](Self::kmalloc). Otherwise a
    /// new block is allocated, `min(old, size)` bytes are copied and the old
    /// block is freed. On error the old block is untouched.
    ///
    /// # Errors
    /// [`HeapError::InvalidArgument`] for `size == 0`, plus the errors of
    /// [`kmalloc`](Self::kmalloc) and [`kfree`](Self::kfree).
    pub fn krealloc(
        &self,
        pages: &impl PageSource,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Result<NonNull<u8>, HeapError> {
        let Some(old) = ptr else {
            return self.kmalloc(pages, size);
        };
        if size == 0 {
            return Err(HeapError::InvalidArgument("reallocation to zero bytes"));
        }

        let old_size = self.usable_size(pages, old)?;
        let new = self.kmalloc(pages, size)?;
        // SAFETY: both blocks are live and distinct; the copy fits both.
        unsafe { new.copy_from_nonoverlapping(old, old_size.min(size)) };
        if let Err(e) = self.kfree(pages, old) {
            let _ = self.kfree(pages, new);
            return Err(e);
        }
        Ok(new)
    }

    /// Release a block from [`kmalloc`](Self::kmalloc).
    ///
    /// # Errors
    /// [`HeapError::DoubleFree`] for a slot that is already free,
    /// [`HeapError::InvalidPointer`] for pointers the heap never returned and
    /// [`HeapError::Corrupted`] if the slab header was overwritten.
    pub fn kfree(&self, pages: &impl PageSource, ptr: NonNull<u8>) -> Result<(), HeapError> {
        let Some(mut slab) = SlabHeader::containing(ptr) else {
            return self.free_run(pages, ptr);
        };
        let addr = ptr.as_ptr() as usize;

        let release = {
            let mut lists = self.slabs.lock_irq();
            let slot = Self::slot_in(slab, ptr)?;
            // SAFETY: `slot_in` validated the header.
            let header = unsafe { slab.as_mut() };
            let class = header.class();
            if !header.release(slot) {
                error!("heap: double free of {addr:#x} (class {})", SIZE_CLASSES[class]);
                return Err(HeapError::DoubleFree(addr));
            }
            let (listed, idle) = (header.listed, header.in_use() == 0);
            lists.live[class] -= 1;
            if !listed {
                lists.push(class, slab);
            }

            let release = idle && lists.slabs[class] > 1;
            if release {
                lists.unlink(class, slab);
                lists.slabs[class] -= 1;
                // SAFETY: as above; the page is off every list now.
                unsafe { slab.as_mut() }.retire();
            }
            release
        };

        if release {
            pages.free_pages(slab.cast(), PageUse::Slab)?;
            debug!("heap: released empty slab at {:p}", slab.as_ptr());
        }
        Ok(())
    }

    /// Bytes actually usable at `ptr`.
    ///
    /// # Errors
    /// As [`kfree`](Self::kfree), for pointers that are not live blocks.
    pub fn usable_size(
        &self,
        pages: &impl PageSource,
        ptr: NonNull<u8>,
    ) -> Result<usize, HeapError> {
        let addr = ptr.as_ptr() as usize;
        let Some(slab) = SlabHeader::containing(ptr) else {
            let run = pages.run_pages(ptr).ok_or(HeapError::InvalidPointer(addr))?;
            return Ok(usize::try_from(run * PAGE_SIZE).unwrap_or(usize::MAX));
        };

        let _lists = self.slabs.lock_irq();
        let slot = Self::slot_in(slab, ptr)?;
        // SAFETY: `slot_in` validated the header.
        let header = unsafe { slab.as_ref() };
        if !header.is_claimed(slot) {
            return Err(HeapError::InvalidPointer(addr));
        }
        Ok(SIZE_CLASSES[header.class()])
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let lists = self.slabs.lock_irq();
        let slab_pages: usize = lists.slabs.iter().sum();
        HeapStats {
            slabs: lists.slabs,
            live_objects: lists.live.iter().sum(),
            page_runs: lists.page_runs,
            pages_held: slab_pages as u64 + lists.run_pages,
        }
    }

    fn alloc_slot(&self, pages: &impl PageSource, class: usize) -> Result<NonNull<u8>, HeapError> {
        if let Some(ptr) = self.slabs.lock_irq().take(class) {
            return Ok(ptr);
        }

        let page = pages.alloc_pages(1, PageUse::Slab)?;
        // SAFETY: a fresh page from the page source belongs to the heap.
        let slab = unsafe { SlabHeader::format(page, class) };
        debug!("heap: new {}-byte slab at {page:p}", SIZE_CLASSES[class]);

        let mut lists = self.slabs.lock_irq();
        lists.slabs[class] += 1;
        lists.push(class, slab);
        lists.take(class).ok_or(HeapError::OutOfMemory)
    }

    fn alloc_run(&self, pages: &impl PageSource, size: usize) -> Result<NonNull<u8>, HeapError> {
        let count = pages_for(size as u64);
        let ptr = pages.alloc_pages(count, PageUse::Run)?;
        let mut lists = self.slabs.lock_irq();
        lists.page_runs += 1;
        lists.run_pages += count.next_power_of_two();
        Ok(ptr)
    }

    fn free_run(&self, pages: &impl PageSource, ptr: NonNull<u8>) -> Result<(), HeapError> {
        let addr = ptr.as_ptr() as usize;
        if addr as u64 % PAGE_SIZE != 0 {
            return Err(HeapError::InvalidPointer(addr));
        }
        let released = pages.free_pages(ptr, PageUse::Run)?;
        let mut lists = self.slabs.lock_irq();
        let (Some(runs), Some(held)) = (
            lists.page_runs.checked_sub(1),
            lists.run_pages.checked_sub(released),
        ) else {
            error!("heap: run at {addr:#x} freed but never counted");
            return Err(HeapError::Corrupted(addr));
        };
        lists.page_runs = runs;
        lists.run_pages = held;
        Ok(())
    }

    /// Validate the slab at `slab` and find the slot `ptr` names.
    fn slot_in(slab: NonNull<SlabHeader>, ptr: NonNull<u8>) -> Result<usize, HeapError> {
        let addr = ptr.as_ptr() as usize;
        // SAFETY: every non-page-aligned heap pointer lies in a slab page;
        // foreign pointers are caught by the magic in the common case.
        if !unsafe { slab.as_ref() }.is_valid() {
            error!("heap: {addr:#x} is not in a slab page");
            return Err(HeapError::Corrupted(addr));
        }
        SlabHeader::slot_of(slab, ptr).ok_or(HeapError::InvalidPointer(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{Layout, alloc, dealloc};
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;

    /// Page runs from the host allocator, rounded to powers of two like the
    /// buddy allocator rounds them.
    #[derive(Default)]
    struct HostPages {
        runs: RefCell<HashMap<usize, (u64, PageUse)>>,
        limit: Option<u64>,
        /// A run that refuses to go back.
        refuse: Cell<Option<usize>>,
    }

    impl HostPages {
        fn limited(pages: u64) -> Self {
            Self {
                runs: RefCell::default(),
                limit: Some(pages),
                refuse: Cell::default(),
            }
        }

        fn held(&self) -> u64 {
            self.runs.borrow().values().map(|&(pages, _)| pages).sum()
        }

        fn layout(pages: u64) -> Layout {
            Layout::from_size_align((pages * PAGE_SIZE) as usize, PAGE_SIZE as usize).unwrap()
        }
    }

    impl PageSource for HostPages {
        fn alloc_pages(&self, pages: u64, usage: PageUse) -> Result<NonNull<u8>, HeapError> {
            let pages = pages.next_power_of_two();
            if self.limit.is_some_and(|l| self.held() + pages > l) {
                return Err(HeapError::OutOfMemory);
            }
            let ptr = NonNull::new(unsafe { alloc(Self::layout(pages)) }).unwrap();
            unsafe { ptr.write_bytes(0xA5, (pages * PAGE_SIZE) as usize) };
            self.runs.borrow_mut().insert(ptr.as_ptr() as usize, (pages, usage));
            Ok(ptr)
        }

        fn free_pages(&self, ptr: NonNull<u8>, usage: PageUse) -> Result<u64, HeapError> {
            let addr = ptr.as_ptr() as usize;
            let mut runs = self.runs.borrow_mut();
            match runs.get(&addr) {
                Some(&(pages, used)) if used == usage && self.refuse.get() != Some(addr) => {
                    runs.remove(&addr);
                    unsafe { dealloc(ptr.as_ptr(), Self::layout(pages)) };
                    Ok(pages)
                }
                _ => Err(HeapError::InvalidPointer(addr)),
            }
        }

        fn run_pages(&self, ptr: NonNull<u8>) -> Option<u64> {
            match self.runs.borrow().get(&(ptr.as_ptr() as usize)) {
                Some(&(pages, PageUse::Run)) => Some(pages),
                _ => None,
            }
        }
    }

    impl Drop for HostPages {
        fn drop(&mut self) {
            for (addr, (pages, _)) in self.runs.get_mut().drain() {
                unsafe { dealloc(addr as *mut u8, Self::layout(pages)) };
            }
        }
    }

    #[test]
    fn small_requests_share_a_slab() {
        let pages = HostPages::default();
        let heap = KernelHeap::new();

        let a = heap.kmalloc(&pages, 24).unwrap();
        let b = heap.kmalloc(&pages, 30).unwrap();
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 32);
        assert_eq!(a.as_ptr() as usize % 16, 0);
        assert_eq!(heap.usable_size(&pages, a), Ok(32));

        let stats = heap.stats();
        assert_eq!(stats.slabs[1], 1);
        assert_eq!(stats.live_objects, 2);
        assert_eq!(stats.pages_held, 1);

        heap.kfree(&pages, a).unwrap();
        heap.kfree(&pages, b).unwrap();
        // The last slab of a class is kept.
        assert_eq!(heap.stats().slabs[1], 1);
        assert_eq!(heap.stats().live_objects, 0);
    }

    #[test]
    fn zero_sized_and_overaligned_requests_are_refused() {
        let pages = HostPages::default();
        let heap = KernelHeap::new();
        assert_eq!(
            heap.kmalloc(&pages, 0),
            Err(HeapError::InvalidArgument("zero-sized allocation"))
        );
        assert!(matches!(
            heap.kmalloc_aligned(&pages, 8, 8192),
            Err(HeapError::InvalidArgument(_))
        ));
        assert!(matches!(
            heap.kmalloc_aligned(&pages, 8, 3),
            Err(HeapError::InvalidArgument(_))
        ));
        assert_eq!(pages.held(), 0);
    }

    #[test]
    fn large_requests_take_page_runs() {
        let pages = HostPages::default();
        let heap = KernelHeap::new();

        let p = heap.kmalloc(&pages, 3 * 4096 + 1).unwrap();
        assert_eq!(p.as_ptr() as usize % 4096, 0);
        assert_eq!(heap.usable_size(&pages, p), Ok(4 * 4096));
        assert_eq!(heap.stats().page_runs, 1);
        assert_eq!(heap.stats().pages_held, 4);

        // Alignment past what slabs guarantee also goes to pages.
        let q = heap.kmalloc_aligned(&pages, 100, 128).unwrap();
        assert_eq!(q.as_ptr() as usize % 4096, 0);

        heap.kfree(&pages, p).unwrap();
        heap.kfree(&pages, q).unwrap();
        assert_eq!(heap.stats(), HeapStats::default());
        assert_eq!(pages.held(), 0);
    }

    #[test]
    fn full_slabs_leave_and_rejoin_the_partial_list() {
        let pages = HostPages::default();
        let heap = KernelHeap::new();

        // 4032-byte class: one slot per slab.
        let a = heap.kmalloc(&pages, 4000).unwrap();
        let b = heap.kmalloc(&pages, 4000).unwrap();
        assert_eq!(heap.stats().slabs[8], 2);
        assert_ne!(a.as_ptr() as usize & !4095, b.as_ptr() as usize & !4095);

        // `a`'s slab is idle but `b`'s still counts, so `a`'s goes back.
        heap.kfree(&pages, a).unwrap();
        assert_eq!(heap.stats().slabs[8], 1);
        assert_eq!(pages.held(), 1);

        // The last one stays and is reused.
        heap.kfree(&pages, b).unwrap();
        let c = heap.kmalloc(&pages, 4000).unwrap();
        assert_eq!(c, b);
        assert_eq!(pages.held(), 1);
    }

    #[test]
    fn every_slot_of_a_class_is_handed_out_once() {
        let pages = HostPages::default();
        let heap = KernelHeap::new();
        let mut seen = std::collections::HashSet::new();
        let ptrs: Vec<_> = (0..600).map(|_| heap.kmalloc(&pages, 16).unwrap()).collect();
        for p in &ptrs {
            assert!(seen.insert(p.as_ptr() as usize));
        }
        // 252 slots per 16-byte slab.
        assert_eq!(heap.stats().slabs[0], 3);

        for p in ptrs {
            heap.kfree(&pages, p).unwrap();
        }
        assert_eq!(heap.stats().slabs[0], 1);
        assert_eq!(pages.held(), 1);
    }

    #[test]
    fn bad_frees_are_reported() {
        let pages = HostPages::default();
        let heap = KernelHeap::new();

        let a = heap.kmalloc(&pages, 64).unwrap();
        let keep = heap.kmalloc(&pages, 64).unwrap();
        heap.kfree(&pages, a).unwrap();
        let addr = a.as_ptr() as usize;
        assert_eq!(heap.kfree(&pages, a), Err(HeapError::DoubleFree(addr)));

        let inside = unsafe { keep.add(8) };
        assert_eq!(
            heap.kfree(&pages, inside),
            Err(HeapError::InvalidPointer(inside.as_ptr() as usize))
        );
        assert_eq!(heap.usable_size(&pages, a), Err(HeapError::InvalidPointer(addr)));

        // A foreign page-aligned pointer is not a run the page source knows.
        let run = heap.kmalloc(&pages, 8192).unwrap();
        heap.kfree(&pages, run).unwrap();
        assert!(matches!(
            heap.kfree(&pages, run),
            Err(HeapError::InvalidPointer(_))
        ));

        // A slab whose header was overwritten.
        let slab = keep.as_ptr() as usize & !4095;
        let saved = unsafe { (slab as *const u32).read() };
        unsafe { (slab as *mut u32).write(0) };
        assert_eq!(
            heap.kfree(&pages, keep),
            Err(HeapError::Corrupted(keep.as_ptr() as usize))
        );
        unsafe { (slab as *mut u32).write(saved) };
        heap.kfree(&pages, keep).unwrap();
    }

    #[test]
    fn only_live_runs_are_freed_as_runs() {
        let pages = HostPages::default();
        let heap = KernelHeap::new();

        // The base of a live slab page is page aligned but not a run.
        let obj = heap.kmalloc(&pages, 64).unwrap();
        let slab_base = NonNull::new((obj.as_ptr() as usize & !4095) as *mut u8).unwrap();
        assert_eq!(
            heap.kfree(&pages, slab_base),
            Err(HeapError::InvalidPointer(slab_base.as_ptr() as usize))
        );
        assert_eq!(heap.usable_size(&pages, slab_base).ok(), None);
        assert_eq!(pages.held(), 1);

        // Neither is a page the heap never saw.
        let foreign = pages.alloc_pages(1, PageUse::Slab).unwrap();
        assert_eq!(
            heap.kfree(&pages, foreign),
            Err(HeapError::InvalidPointer(foreign.as_ptr() as usize))
        );
        assert_eq!(pages.free_pages(foreign, PageUse::Slab), Ok(1));

        // A freed run no longer has a size.
        let run = heap.kmalloc(&pages, 3 * 4096).unwrap();
        assert_eq!(heap.usable_size(&pages, run), Ok(4 * 4096));
        heap.kfree(&pages, run).unwrap();
        assert_eq!(heap.usable_size(&pages, run).ok(), None);

        let stats = heap.stats();
        assert_eq!(stats.page_runs, 0);
        assert_eq!(stats.live_objects, 1);
        heap.kfree(&pages, obj).unwrap();
    }

    #[test]
    fn failed_krealloc_keeps_nothing_new() {
        let pages = HostPages::default();
        let heap = KernelHeap::new();
        let old = heap.kmalloc(&pages, 8192).unwrap();
        pages.refuse.set(Some(old.as_ptr() as usize));

        let held = pages.held();
        assert_eq!(
            heap.krealloc(&pages, Some(old), 20_000),
            Err(HeapError::InvalidPointer(old.as_ptr() as usize))
        );
        assert_eq!(pages.held(), held);
        assert_eq!(heap.stats().page_runs, 1);

        pages.refuse.set(None);
        heap.kfree(&pages, old).unwrap();
        assert_eq!(heap.stats(), HeapStats::default());
    }

    #[test]
    fn krealloc_moves_and_preserves_contents() {
        let pages = HostPages::default();
        let heap = KernelHeap::new();

        let p = heap.krealloc(&pages, None, 40).unwrap();
        for i in 0..40u8 {
            unsafe { p.add(i as usize).write(i) };
        }
        let q = heap.krealloc(&pages, Some(p), 5000).unwrap();
        assert_ne!(p, q);
        for i in 0..40u8 {
            assert_eq!(unsafe { q.add(i as usize).read() }, i);
        }
        // Shrinking copies only what fits.
        let r = heap.krealloc(&pages, Some(q), 16).unwrap();
        for i in 0..16u8 {
            assert_eq!(unsafe { r.add(i as usize).read() }, i);
        }
        assert_eq!(heap.stats().page_runs, 0);
        assert_eq!(heap.stats().live_objects, 1);

        assert!(matches!(
            heap.krealloc(&pages, Some(r), 0),
            Err(HeapError::InvalidArgument(_))
        ));
        assert_eq!(heap.usable_size(&pages, r), Ok(16));
    }

    #[test]
    fn kzmalloc_zeroes_recycled_slots() {
        let pages = HostPages::default();
        let heap = KernelHeap::new();
        let p = heap.kmalloc(&pages, 100).unwrap();
        unsafe { p.write_bytes(0xFF, 100) };
        heap.kfree(&pages, p).unwrap();

        let z = heap.kzmalloc(&pages, 100).unwrap();
        assert_eq!(z, p);
        assert!((0..100).all(|i| unsafe { z.add(i).read() } == 0));
    }

    #[test]
    fn exhaustion_is_out_of_memory() {
        let pages = HostPages::limited(2);
        let heap = KernelHeap::new();
        let _a = heap.kmalloc(&pages, 5000).unwrap();
        assert_eq!(heap.kmalloc(&pages, 16), Err(HeapError::OutOfMemory));
        assert_eq!(heap.kmalloc(&pages, 5000), Err(HeapError::OutOfMemory));
        assert_eq!(heap.stats().slabs, [0; CLASS_COUNT]);
    }
}
