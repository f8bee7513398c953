//! # Memory manager
//!
//! One explicitly constructed context owns the whole memory core: the HHDM
//! mapper, the buddy allocator behind its lock, the kernel heap and the kernel
//! address space. Nothing in here is global; [`crate::global`] publishes one
//! instance for the running kernel, tests build as many as they like.
//!
//! ## Bring-up
//!
//! ```text
//!  MemoryHandoff ─► ZoneRegistry ─► BootstrapPool::place
//!                                        │ head of the first zone that fits
//!                                        ▼
//!                   pool: mapper │ block arena │ buckets │ SpinLock<buddy>
//!                                        │ seal
//!                                        ▼
//!                   VirtualMap::new_kernel ─► KernelHeap ─► ready
//! ```
//!
//! ## Lock order
//!
//! `map → heap → buddy`. A map may allocate on the heap (region list) and
//! take frames; the heap takes pages but never holds its own lock while it
//! does; the buddy lock is innermost and masks interrupts.

use crate::frames::BuddyFrames;
use crate::heap::{HeapError, HeapStats, KernelHeap};
use crate::phys_mapper::HhdmPhysMapper;
use core::ptr::NonNull;
use kernel_info::boot::MemoryHandoff;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_pmm::{
    BlockId, BootstrapError, BootstrapPool, BuddyAllocator, BuddyBlock, BuddyError,
    InvariantViolation, MetadataLayout, PoolPlacement, ZoneError, ZoneId, ZoneRegistry,
    ZoneStats,
};
use kernel_sync::SpinLock;
use kernel_vmem::{
    LocalTlb, MapError, MapKind, PhysMapper, RegionKind, RegionPermissions, TlbShootdown,
    VirtualMap, VirtualRegion, create_region,
};
use log::info;

/// Why the memory core could not come up. Always fatal for a kernel.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum InitError {
    #[error(transparent)]
    Zones(#[from] ZoneError),
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    #[error(transparent)]
    Buddy(#[from] BuddyError),
    #[error(transparent)]
    Map(#[from] MapError),
}

/// An address space whose frames come from the manager's buddy allocator.
pub type KernelVirtualMap<'a> = VirtualMap<'a, HhdmPhysMapper>;

pub struct MemoryManager<'a> {
    mapper: &'a HhdmPhysMapper,
    buddy: &'a SpinLock<BuddyAllocator<'a>>,
    heap: KernelHeap,
    kernel_map: KernelVirtualMap<'a>,
    tlb: &'a (dyn TlbShootdown + Sync),
    pool: PoolPlacement,
}

impl<'a> MemoryManager<'a> {
    /// Bring the memory core up from the loader's handoff.
    ///
    /// TLB invalidation starts out core-local ([`LocalTlb`]); install a
    /// cross-core shootdown with [`with_shootdown`](Self::with_shootdown)
    /// before secondary cores start.
    ///
    /// # Safety
    /// `handoff.hhdm_offset` must map every usable range of
    /// `handoff.memory_map` writable for `'a`, and nothing else may use those
    /// frames for as long as the manager lives.
    ///
    /// # Errors
    /// Any [`InitError`]; none of them is recoverable.
    pub unsafe fn initialize(handoff: &MemoryHandoff<'_>) -> Result<Self, InitError> {
        let zones = ZoneRegistry::initialize(handoff.memory_map)?;
        let layout = MetadataLayout::for_zones(&zones);
        let placement = BootstrapPool::place(&zones, Self::pool_bytes(&layout))?;

        let staging = HhdmPhysMapper::new(handoff.hhdm_offset);
        let virt = staging.phys_to_virt(placement.range.start()).as_mut_ptr::<u8>();
        // SAFETY: the placement lies in a usable zone the caller handed over.
        let mut pool = unsafe { BootstrapPool::from_placement(&placement, virt) };

        let mapper: &'a HhdmPhysMapper = pool.alloc_value(staging)?;
        let blocks = pool.alloc_slice(layout.records, BuddyBlock::EMPTY)?;
        let buckets = pool.alloc_slice::<Option<BlockId>>(layout.buckets, None)?;
        let buddy = BuddyAllocator::new(zones, blocks, buckets, Some(placement.range))?;
        let buddy: &'a SpinLock<BuddyAllocator<'a>> = pool.alloc_value(SpinLock::new(buddy))?;
        pool.seal();

        let kernel_map = VirtualMap::new_kernel(mapper, &mut BuddyFrames::new(buddy, mapper))?;
        info!(
            "memory: online, {} of {} pages free, pool {}..{}",
            buddy.lock_irq().free_pages(),
            zones.total_pages(),
            placement.range.start(),
            placement.range.end()
        );

        Ok(Self {
            mapper,
            buddy,
            heap: KernelHeap::new(),
            kernel_map,
            tlb: &LocalTlb,
            pool: placement,
        })
    }

    /// Route every later detach through `tlb`.
    #[must_use]
    pub fn with_shootdown(mut self, tlb: &'a (dyn TlbShootdown + Sync)) -> Self {
        self.tlb = tlb;
        self
    }

    /// Pool bytes: buddy metadata plus the two objects that live beside it.
    fn pool_bytes(layout: &MetadataLayout) -> usize {
        layout.bytes()
            + size_of::<HhdmPhysMapper>()
            + align_of::<HhdmPhysMapper>()
            + size_of::<SpinLock<BuddyAllocator<'static>>>()
            + align_of::<SpinLock<BuddyAllocator<'static>>>()
    }

    fn frames(&self) -> BuddyFrames<'a> {
        BuddyFrames::new(self.buddy, self.mapper)
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &'a HhdmPhysMapper {
        self.mapper
    }

    /// Frames carved for the bootstrap pool; reserved for good.
    #[inline]
    #[must_use]
    pub const fn bootstrap_pool(&self) -> PoolPlacement {
        self.pool
    }

    /// Allocate `pages` contiguous frames (rounded up to a power of two).
    ///
    /// # Errors
    /// [`BuddyError::OutOfMemory`] once every zone is exhausted,
    /// [`BuddyError::InvalidArgument`] for 0 or more than 1024 pages.
    pub fn phys_alloc(&self, pages: u64) -> Result<PhysicalAddress, BuddyError> {
        self.buddy.lock_irq().allocate(pages)
    }

    /// Return frames from [`phys_alloc`](Self::phys_alloc); yields the pages
    /// released.
    ///
    /// # Errors
    /// [`BuddyError::DoubleFree`], [`BuddyError::UnknownAddress`],
    /// [`BuddyError::StaticPool`], or [`BuddyError::TagMismatch`] for pages
    /// the heap holds as a run.
    pub fn phys_dealloc(&self, pa: PhysicalAddress) -> Result<u64, BuddyError> {
        self.buddy.lock_irq().deallocate(pa)
    }

    #[must_use]
    pub fn free_pages(&self) -> u64 {
        self.buddy.lock_irq().free_pages()
    }

    #[must_use]
    pub fn zone_stats(&self, zone: ZoneId) -> Option<ZoneStats> {
        self.buddy.lock_irq().zone_stats(zone)
    }

    /// Walk the buddy bookkeeping and report the first broken invariant.
    ///
    /// # Errors
    /// The [`InvariantViolation`] found.
    pub fn verify(&self) -> Result<(), InvariantViolation> {
        self.buddy.lock_irq().verify()
    }

    /// # Errors
    /// See [`KernelHeap::kmalloc`].
    pub fn kmalloc(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.heap.kmalloc(&self.frames(), size)
    }

    /// # Errors
    /// See [`KernelHeap::kmalloc_aligned`].
    pub fn kmalloc_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>, HeapError> {
        self.heap.kmalloc_aligned(&self.frames(), size, align)
    }

    /// # Errors
    /// See [`KernelHeap::kzmalloc`].
    pub fn kzmalloc(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.heap.kzmalloc(&self.frames(), size)
    }

    /// # Errors
    /// See [`KernelHeap::krealloc`].
    pub fn krealloc(
        &self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Result<NonNull<u8>, HeapError> {
        self.heap.krealloc(&self.frames(), ptr, size)
    }

    /// # Errors
    /// See [`KernelHeap::kfree`].
    pub fn kfree(&self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        self.heap.kfree(&self.frames(), ptr)
    }

    /// # Errors
    /// See [`KernelHeap::usable_size`].
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize, HeapError> {
        self.heap.usable_size(&self.frames(), ptr)
    }

    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    /// The boot-time template every other map aliases its kernel half from.
    #[inline]
    #[must_use]
    pub const fn kernel_map(&self) -> &KernelVirtualMap<'a> {
        &self.kernel_map
    }

    /// A fresh map with the kernel half pre-populated.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if no frame is left for its root.
    pub fn new_address_space(&self) -> Result<KernelVirtualMap<'a>, MapError> {
        VirtualMap::new_user(&self.kernel_map, &mut self.frames())
    }

    /// Tear down a map from [`new_address_space`](Self::new_address_space).
    ///
    /// # Errors
    /// [`MapError::InvalidArgument`] for the kernel map.
    pub fn destroy_address_space(&self, map: KernelVirtualMap<'a>) -> Result<(), MapError> {
        map.destroy(&mut self.frames(), &self.tlb)
    }

    /// Map `region` into `map`, backing anonymous pages with fresh frames.
    ///
    /// # Errors
    /// See [`VirtualMap::attach_region`].
    pub fn attach_region(
        &self,
        map: &KernelVirtualMap<'a>,
        region: VirtualRegion,
    ) -> Result<(), MapError> {
        map.attach_region(&mut self.frames(), region)
    }

    /// Drop a reference to the region at `start`; returns the references left.
    ///
    /// # Errors
    /// See [`VirtualMap::detach_region`].
    pub fn detach_region(
        &self,
        map: &KernelVirtualMap<'a>,
        start: VirtualAddress,
    ) -> Result<u32, MapError> {
        map.detach_region(&mut self.frames(), &self.tlb, start)
    }

    /// Map a stack of `pages` pages ending at `top`, with one unmapped guard
    /// page below it. Kernel map stacks are kernel-only, all others user.
    ///
    /// # Errors
    /// [`MapError::InvalidArgument`] for an unaligned `top` or zero pages,
    /// otherwise as [`attach_region`](Self::attach_region).
    pub fn create_stack(
        &self,
        map: &KernelVirtualMap<'a>,
        top: VirtualAddress,
        pages: u64,
    ) -> Result<VirtualRegion, MapError> {
        if !top.is_page_aligned() {
            return Err(MapError::InvalidArgument("stack top not page aligned"));
        }
        let start = pages
            .checked_mul(PAGE_SIZE)
            .and_then(|len| top.as_u64().checked_sub(len))
            .map(VirtualAddress::new)
            .ok_or(MapError::NotCanonical(top))?;
        let permissions = match map.kind() {
            MapKind::Kernel => RegionPermissions::kernel_rw(),
            MapKind::User => RegionPermissions::user_rw(),
        };

        let region =
            create_region(start, pages, RegionKind::Stack, permissions)?.with_guard_pages(1)?;
        self.attach_region(map, region)?;
        Ok(region)
    }
}
