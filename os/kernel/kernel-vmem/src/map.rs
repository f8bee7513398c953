//! # Virtual Map
//!
//! One address space: a PML4 root plus the list of regions attached to it.
//! All page-table mutation of a map happens under its lock, so two cores
//! can never build the same intermediate node twice.
//!
//! ## Walk
//!
//! [`VirtualMap::attach_region`] walks PML4 → PDPT → PD → PT for every page
//! of the region and allocates missing nodes zero-filled from the
//! [`FrameAlloc`]. Only then is the leaf written, with the region's
//! permissions and the present bit.
//!
//! [`VirtualMap::detach_region`] works in two passes:
//!
//! ```text
//!   pass 1   leaf.present = 0        (address kept, frame still owned)
//!   ───────  TlbShootdown::shootdown(range)
//!   pass 2   free backing frame, zero leaf, free nodes left empty
//! ```
//!
//! so no core can reach a frame through a stale translation after it went
//! back to the allocator. The kernel half's PDPTs are never freed: every map
//! aliases them.

use crate::page_table::{Level, split_indices};
use crate::region::{RegionKind, VirtualRegion};
use crate::tlb::{self, TlbShootdown};
use crate::{FrameAlloc, PageEntryBits, PhysMapper, table_at};
use alloc::vec::Vec;
use kernel_info::memory::{ENTRIES_PER_TABLE, KERNEL_PML4_START};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_sync::SpinLock;
use log::{debug, info, trace, warn};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("region overlaps the region at {start}")]
    Overlap { start: VirtualAddress },
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("no region starts at {0}")]
    NoSuchRegion(VirtualAddress),
    #[error("{0} leaves its canonical half")]
    NotCanonical(VirtualAddress),
    #[error("{0} lies in the shared kernel half")]
    KernelHalf(VirtualAddress),
}

/// Which half of the address space a map owns.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MapKind {
    /// The boot-time template; owns the kernel half.
    Kernel,
    /// A process/thread map; owns the lower half, aliases the kernel half.
    User,
}

/// Nodes below the root on the way to a leaf: `[pdpt, pd, pt]`.
type Path = [Option<PhysicalAddress>; 3];

pub struct VirtualMap<'m, M: PhysMapper> {
    root: PhysicalAddress,
    mapper: &'m M,
    kind: MapKind,
    /// Attached regions, sorted by start address.
    regions: SpinLock<Vec<VirtualRegion>>,
}

impl<'m, M: PhysMapper> VirtualMap<'m, M> {
    /// Build the kernel map: a root with one (empty) PDPT behind every
    /// kernel-half slot, so later maps can alias the whole half.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`]; every frame taken so far is returned.
    pub fn new_kernel(mapper: &'m M, frames: &mut impl FrameAlloc) -> Result<Self, MapError> {
        let root = alloc_table(mapper, frames)?;
        // SAFETY: freshly allocated, not yet shared.
        let pml4 = unsafe { table_at(mapper, root) };
        for i in KERNEL_PML4_START..ENTRIES_PER_TABLE {
            match alloc_table(mapper, frames) {
                Ok(pdpt) => pml4.set(i, PageEntryBits::table_link(pdpt, false)),
                Err(e) => {
                    for j in KERNEL_PML4_START..i {
                        frames.free_4k(pml4.get(j).physical_address());
                    }
                    frames.free_4k(root);
                    let needed = ENTRIES_PER_TABLE - KERNEL_PML4_START + 1;
                    warn!("vmem: kernel map needs {needed} frames");
                    return Err(e);
                }
            }
        }
        info!("vmem: kernel map root at {root}");
        Ok(Self {
            root,
            mapper,
            kind: MapKind::Kernel,
            regions: SpinLock::new(Vec::new()),
        })
    }

    /// A fresh, empty lower half with the kernel half copied from `kernel`.
    ///
    /// # Errors
    /// * [`MapError::InvalidArgument`] if `kernel` is not the kernel map.
    /// * [`MapError::OutOfMemory`] if no frame is left for the root.
    pub fn new_user(kernel: &Self, frames: &mut impl FrameAlloc) -> Result<Self, MapError> {
        if kernel.kind != MapKind::Kernel {
            return Err(MapError::InvalidArgument("template is not the kernel map"));
        }
        let root = alloc_table(kernel.mapper, frames)?;
        // SAFETY: `root` is ours; the kernel root's upper entries are only
        // written while the kernel map is built.
        let (dst, src) = unsafe {
            (
                table_at(kernel.mapper, root),
                table_at(kernel.mapper, kernel.root),
            )
        };
        for i in KERNEL_PML4_START..ENTRIES_PER_TABLE {
            dst.set(i, src.get(i));
        }
        debug!("vmem: new address space, root at {root}");
        Ok(Self {
            root,
            mapper: kernel.mapper,
            kind: MapKind::User,
            regions: SpinLock::new(Vec::new()),
        })
    }

    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> MapKind {
        self.kind
    }

    /// Map every page of `region` and add it to the region list.
    ///
    /// # Errors
    /// * [`MapError::KernelHalf`] for a kernel-half region on a user map,
    ///   [`MapError::InvalidArgument`] for a lower-half one on the kernel map.
    /// * [`MapError::Overlap`] if the region (guard pages included) intersects
    ///   an attached one.
    /// * [`MapError::OutOfMemory`]; nothing stays mapped and every frame
    ///   taken is returned.
    pub fn attach_region(
        &self,
        frames: &mut impl FrameAlloc,
        region: VirtualRegion,
    ) -> Result<(), MapError> {
        self.check_half(&region)?;

        let mut regions = self.regions.lock();
        if let Some(other) = regions.iter().find(|r| r.overlaps(&region)) {
            debug!("vmem: {region:?} overlaps {other:?}");
            return Err(MapError::Overlap { start: other.start() });
        }
        regions.try_reserve(1).map_err(|_| MapError::OutOfMemory)?;

        for i in 0..region.page_count() {
            if let Err(e) = self.map_page(frames, &region, i) {
                self.teardown(frames, &region, i + 1);
                tlb::flush_local(region.start(), i);
                debug!("vmem: attach of {region:?} failed after {i} page(s): {e}");
                return Err(e);
            }
        }

        let pos = regions.partition_point(|r| r.start() < region.start());
        regions.insert(pos, region);
        debug!("vmem: attached {region:?}");
        Ok(())
    }

    /// Drop one reference to the region starting at `start`. When none is
    /// left the region is unmapped, shot down through `tlb`, its anonymous
    /// frames and emptied nodes are freed, and it leaves the list.
    ///
    /// Returns the number of references still held (0 once removed).
    ///
    /// # Errors
    /// [`MapError::NoSuchRegion`] if no region starts at `start`.
    pub fn detach_region(
        &self,
        frames: &mut impl FrameAlloc,
        tlb: &impl TlbShootdown,
        start: VirtualAddress,
    ) -> Result<u32, MapError> {
        let mut regions = self.regions.lock();
        let idx = regions
            .iter()
            .position(|r| r.start() == start)
            .ok_or(MapError::NoSuchRegion(start))?;

        let remaining = regions[idx].release();
        if remaining > 0 {
            debug!("vmem: {start} still has {remaining} reference(s)");
            return Ok(remaining);
        }
        let region = regions.remove(idx);
        self.unmap(frames, tlb, &region);
        debug!("vmem: detached {region:?}");
        Ok(0)
    }

    /// Add a reference to the region starting at `start`.
    ///
    /// # Errors
    /// [`MapError::NoSuchRegion`] if no region starts at `start`.
    pub fn retain_region(&self, start: VirtualAddress) -> Result<u32, MapError> {
        let mut regions = self.regions.lock();
        regions
            .iter_mut()
            .find(|r| r.start() == start)
            .map(VirtualRegion::retain)
            .ok_or(MapError::NoSuchRegion(start))
    }

    /// Physical address `va` translates to, or `None` where an access would
    /// fault with not-present.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let leaf = self.leaf_entry(va)?;
        leaf.present()
            .then(|| leaf.physical_address() + va.page_offset())
    }

    /// The leaf entry for `va`, present or not, if one is in use.
    #[must_use]
    pub fn leaf_entry(&self, va: VirtualAddress) -> Option<PageEntryBits> {
        let _guard = self.regions.lock();
        let pt = self.path_to(va)[2]?;
        // SAFETY: table of this map, lock held.
        let e = unsafe { table_at(self.mapper, pt) }.get(Level::Pt.index_of(va));
        (!e.is_unused()).then_some(e)
    }

    /// Snapshot of the attached regions, in address order.
    #[must_use]
    pub fn regions(&self) -> Vec<VirtualRegion> {
        self.regions.lock().clone()
    }

    /// The region whose mapped pages contain `va`.
    #[must_use]
    pub fn region_at(&self, va: VirtualAddress) -> Option<VirtualRegion> {
        self.regions.lock().iter().find(|r| r.contains(va)).copied()
    }

    /// Tear down a user map: every region regardless of its reference
    /// count, every private node, and the root.
    ///
    /// # Errors
    /// [`MapError::InvalidArgument`] for the kernel map, which lives forever.
    pub fn destroy(
        self,
        frames: &mut impl FrameAlloc,
        tlb: &impl TlbShootdown,
    ) -> Result<(), MapError> {
        if self.kind == MapKind::Kernel {
            return Err(MapError::InvalidArgument("the kernel map is never destroyed"));
        }
        let regions = core::mem::take(&mut *self.regions.lock());
        for region in &regions {
            self.unmap(frames, tlb, region);
        }

        // SAFETY: the map is consumed; nobody else walks these tables.
        let pml4 = unsafe { table_at(self.mapper, self.root) };
        for i in 0..KERNEL_PML4_START {
            let e = pml4.get(i);
            if e.present() {
                warn!("vmem: unowned subtree under PML4[{i}]");
                self.free_tree(frames, e.physical_address(), Level::Pdpt);
            }
        }
        frames.free_4k(self.root);
        debug!("vmem: destroyed address space at {} ({} region(s))", self.root, regions.len());
        Ok(())
    }

    /// Load this map into CR3.
    ///
    /// # Safety
    /// The kernel half must map the currently executing code and stack, and
    /// the map must stay alive while it is active.
    pub unsafe fn activate(&self) {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        unsafe {
            core::arch::asm!(
                "mov cr3, {}",
                in(reg) self.root.as_u64(),
                options(nostack, preserves_flags)
            );
        }
    }

    fn check_half(&self, region: &VirtualRegion) -> Result<(), MapError> {
        match (self.kind, region.is_kernel_half()) {
            (MapKind::User, true) => Err(MapError::KernelHalf(region.start())),
            (MapKind::Kernel, false) => Err(MapError::InvalidArgument(
                "lower-half region on the kernel map",
            )),
            _ => Ok(()),
        }
    }

    /// Install page `i` of `region`, building missing nodes on the way down.
    fn map_page(
        &self,
        frames: &mut impl FrameAlloc,
        region: &VirtualRegion,
        i: u64,
    ) -> Result<(), MapError> {
        let va = region.page(i);
        let user = !region.is_kernel_half();
        let [i4, i3, i2, i1] = split_indices(va);
        let pdpt = self.ensure_next(frames, self.root, i4, user)?;
        let pd = self.ensure_next(frames, pdpt, i3, user)?;
        let pt = self.ensure_next(frames, pd, i2, user)?;

        let frame = match region.kind() {
            RegionKind::Device { phys } => phys + i * PAGE_SIZE,
            _ => {
                let f = frames.alloc_4k().ok_or(MapError::OutOfMemory)?;
                // SAFETY: freshly allocated frame, reachable through the mapper.
                unsafe {
                    let page = self.mapper.phys_to_virt(f).as_mut_ptr::<u8>();
                    core::ptr::write_bytes(page, 0, PAGE_SIZE as usize);
                }
                f
            }
        };

        // SAFETY: table of this map, lock held.
        let table = unsafe { table_at(self.mapper, pt) };
        debug_assert!(table.get(i1).is_unused(), "{va} already mapped");
        table.set(i1, leaf_for(frame, region));
        Ok(())
    }

    /// Follow entry `idx` of `table`, allocating the next node if absent.
    fn ensure_next(
        &self,
        frames: &mut impl FrameAlloc,
        table: PhysicalAddress,
        idx: usize,
        user: bool,
    ) -> Result<PhysicalAddress, MapError> {
        // SAFETY: table of this map, lock held.
        let t = unsafe { table_at(self.mapper, table) };
        let e = t.get(idx);
        if e.present() {
            return Ok(e.physical_address());
        }
        let next = alloc_table(self.mapper, frames)?;
        t.set(idx, PageEntryBits::table_link(next, user));
        trace!("vmem: node {next} under {table}[{idx}]");
        Ok(next)
    }

    fn next_table(&self, table: PhysicalAddress, idx: usize) -> Option<PhysicalAddress> {
        // SAFETY: table of this map, lock held.
        let e = unsafe { table_at(self.mapper, table) }.get(idx);
        e.present().then(|| e.physical_address())
    }

    fn path_to(&self, va: VirtualAddress) -> Path {
        let [i4, i3, i2, _] = split_indices(va);
        let pdpt = self.next_table(self.root, i4);
        let pd = pdpt.and_then(|t| self.next_table(t, i3));
        let pt = pd.and_then(|t| self.next_table(t, i2));
        [pdpt, pd, pt]
    }

    /// Unmap a region that already left the list.
    fn unmap(&self, frames: &mut impl FrameAlloc, tlb: &impl TlbShootdown, region: &VirtualRegion) {
        for i in 0..region.page_count() {
            let va = region.page(i);
            if let Some(pt) = self.path_to(va)[2] {
                // SAFETY: table of this map, lock held.
                let table = unsafe { table_at(self.mapper, pt) };
                let idx = Level::Pt.index_of(va);
                table.set(idx, table.get(idx).with_present(false));
            }
        }
        tlb.shootdown(region.start(), region.page_count());
        self.teardown(frames, region, region.page_count());
    }

    /// Release the first `pages` pages of `region`: backing frames of
    /// anonymous regions, the leaves, and nodes that end up empty.
    fn teardown(&self, frames: &mut impl FrameAlloc, region: &VirtualRegion, pages: u64) {
        let anonymous = region.kind().is_anonymous();
        for i in 0..pages {
            let va = region.page(i);
            let path = self.path_to(va);
            let idx = Level::Pt.index_of(va);
            if let Some(pt) = path[2] {
                // SAFETY: table of this map, lock held.
                let table = unsafe { table_at(self.mapper, pt) };
                let leaf = table.get(idx);
                if !leaf.is_unused() {
                    if anonymous {
                        frames.free_4k(leaf.physical_address());
                    }
                    table.set(idx, PageEntryBits::new());
                }
            }
            if idx == ENTRIES_PER_TABLE - 1 || i + 1 == pages {
                self.prune(frames, va, path);
            }
        }
    }

    /// Free the nodes on `va`'s path that hold no entry any more, bottom up.
    fn prune(&self, frames: &mut impl FrameAlloc, va: VirtualAddress, path: Path) {
        let idx = split_indices(va);
        let parents = [Some(self.root), path[0], path[1]];
        for level in (0..3).rev() {
            let Some(node) = path[level] else { continue };
            if level == 0 && idx[0] >= KERNEL_PML4_START {
                break;
            }
            // SAFETY: table of this map, lock held.
            if !unsafe { table_at(self.mapper, node) }.is_empty() {
                break;
            }
            let Some(parent) = parents[level] else { break };
            // SAFETY: as above; `parent` and `node` are distinct frames.
            unsafe { table_at(self.mapper, parent) }.set(idx[level], PageEntryBits::new());
            frames.free_4k(node);
            trace!("vmem: freed empty node {node}");
        }
    }

    /// Free a node and the nodes below it; leaf frames are not touched.
    fn free_tree(&self, frames: &mut impl FrameAlloc, node: PhysicalAddress, level: Level) {
        let below = match level {
            Level::Pdpt => Some(Level::Pd),
            Level::Pd => Some(Level::Pt),
            Level::Pml4 | Level::Pt => None,
        };
        if let Some(below) = below {
            for i in 0..ENTRIES_PER_TABLE {
                if let Some(child) = self.next_table(node, i) {
                    self.free_tree(frames, child, below);
                }
            }
        }
        frames.free_4k(node);
    }
}

/// Take a frame and zero it for use as a page-table node.
fn alloc_table<M: PhysMapper>(
    mapper: &M,
    frames: &mut impl FrameAlloc,
) -> Result<PhysicalAddress, MapError> {
    let pa = frames.alloc_4k().ok_or(MapError::OutOfMemory)?;
    // SAFETY: freshly allocated; any bit pattern is a valid `PageTable`.
    unsafe { table_at::<M>(mapper, pa) }.zero();
    Ok(pa)
}

/// Leaf entry mapping `frame` with `region`'s policy.
fn leaf_for(frame: PhysicalAddress, region: &VirtualRegion) -> PageEntryBits {
    let perm = region.permissions();
    let device = matches!(region.kind(), RegionKind::Device { .. });
    PageEntryBits::new()
        .with_present(true)
        .with_writable(perm.writable())
        .with_user_access(perm.user())
        .with_no_execute(!perm.executable())
        .with_cache_disabled(device)
        .with_write_through(device)
        .with_global(region.is_kernel_half())
        .with_physical_address(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::{RegionPermissions, create_region};
    use crate::testing::{PHYS_BASE, RecordingTlb, TestFrames, TestPhys};
    use kernel_info::memory::KERNEL_HALF_BASE;

    const KERNEL_TABLES: usize = ENTRIES_PER_TABLE - KERNEL_PML4_START + 1;

    fn user_heap(start: u64, pages: u64) -> VirtualRegion {
        create_region(
            VirtualAddress::new(start),
            pages,
            RegionKind::Heap,
            RegionPermissions::user_rw(),
        )
        .unwrap()
    }

    #[test]
    fn kernel_map_preallocates_the_shared_half() {
        let phys = TestPhys::with_frames(300);
        let mut frames = TestFrames::new(&phys);
        let kernel = VirtualMap::new_kernel(&phys, &mut frames).unwrap();
        assert_eq!(frames.allocated, KERNEL_TABLES);
        assert_eq!(kernel.kind(), MapKind::Kernel);

        let user = VirtualMap::new_user(&kernel, &mut frames).unwrap();
        assert_eq!(frames.allocated, KERNEL_TABLES + 1);
        // SAFETY: test tables.
        let (k, u) = unsafe { (table_at(&phys, kernel.root()), table_at(&phys, user.root())) };
        for i in 0..ENTRIES_PER_TABLE {
            if i < KERNEL_PML4_START {
                assert!(u.get(i).is_unused());
            } else {
                assert_eq!(u.get(i), k.get(i));
                assert!(!u.get(i).user_access());
            }
        }
        assert!(matches!(
            VirtualMap::new_user(&user, &mut frames),
            Err(MapError::InvalidArgument(_))
        ));
    }

    #[test]
    fn kernel_map_creation_rolls_back() {
        let phys = TestPhys::with_frames(300);
        let mut frames = TestFrames::limited(&phys, 100);
        assert_eq!(
            VirtualMap::new_kernel(&phys, &mut frames).err(),
            Some(MapError::OutOfMemory)
        );
        assert_eq!(frames.allocated, 0);
        assert_eq!(frames.available(), 100);
    }

    #[test]
    fn attach_maps_zeroed_frames_with_region_policy() {
        let phys = TestPhys::with_frames(300);
        let mut frames = TestFrames::new(&phys);
        let kernel = VirtualMap::new_kernel(&phys, &mut frames).unwrap();
        let map = VirtualMap::new_user(&kernel, &mut frames).unwrap();
        let before = frames.allocated;

        map.attach_region(&mut frames, user_heap(0x40_0000, 3)).unwrap();
        // PDPT + PD + PT + 3 frames.
        assert_eq!(frames.allocated, before + 6);

        for i in 0..3 {
            let va = VirtualAddress::new(0x40_0000 + i * PAGE_SIZE + 0x10);
            let pa = map.translate(va).unwrap();
            assert_eq!(pa.page_offset(), 0x10);
            assert!(pa.as_u64() >= PHYS_BASE);
            let bytes = unsafe { phys.phys_to_mut::<[u8; 4096]>(pa.align_down()) };
            assert!(bytes.iter().all(|&b| b == 0));

            let leaf = map.leaf_entry(va).unwrap();
            assert!(leaf.writable() && leaf.user_access() && leaf.no_execute());
            assert!(!leaf.global() && !leaf.cache_disabled());
        }
        assert!(map.translate(VirtualAddress::new(0x40_3000)).is_none());
        let last = map.region_at(VirtualAddress::new(0x40_2fff)).unwrap();
        assert_eq!(last.start().as_u64(), 0x40_0000);
        assert_eq!(map.regions().len(), 1);
    }

    #[test]
    fn overlapping_regions_are_rejected() {
        let phys = TestPhys::with_frames(300);
        let mut frames = TestFrames::new(&phys);
        let kernel = VirtualMap::new_kernel(&phys, &mut frames).unwrap();
        let map = VirtualMap::new_user(&kernel, &mut frames).unwrap();

        map.attach_region(&mut frames, user_heap(0x40_0000, 4)).unwrap();
        let allocated = frames.allocated;
        assert_eq!(
            map.attach_region(&mut frames, user_heap(0x40_3000, 1)),
            Err(MapError::Overlap {
                start: VirtualAddress::new(0x40_0000)
            })
        );
        // The guard page of a stack counts as taken.
        let stack = create_region(
            VirtualAddress::new(0x40_5000),
            1,
            RegionKind::Stack,
            RegionPermissions::user_rw(),
        )
        .unwrap()
        .with_guard_pages(1)
        .unwrap();
        assert!(matches!(
            map.attach_region(&mut frames, stack),
            Err(MapError::Overlap { .. })
        ));
        assert_eq!(frames.allocated, allocated);

        map.attach_region(&mut frames, user_heap(0x40_4000, 1)).unwrap();
        assert_eq!(map.regions().len(), 2);
    }

    #[test]
    fn detach_unmaps_frees_and_shoots_down() {
        let phys = TestPhys::with_frames(300);
        let mut frames = TestFrames::new(&phys);
        let kernel = VirtualMap::new_kernel(&phys, &mut frames).unwrap();
        let map = VirtualMap::new_user(&kernel, &mut frames).unwrap();
        let before = frames.allocated;
        let tlb = RecordingTlb::default();

        // Crosses a PT boundary, so two PTs get built and pruned.
        let start = 0x20_0000 - 2 * PAGE_SIZE;
        map.attach_region(&mut frames, user_heap(start, 4)).unwrap();
        assert_eq!(frames.allocated, before + 1 + 1 + 2 + 4);

        assert_eq!(map.detach_region(&mut frames, &tlb, VirtualAddress::new(start)), Ok(0));
        for i in 0..4 {
            assert!(map.translate(VirtualAddress::new(start + i * PAGE_SIZE)).is_none());
        }
        assert_eq!(frames.allocated, before);
        assert_eq!(*tlb.flushed.borrow(), [(VirtualAddress::new(start), 4)]);
        assert!(map.regions().is_empty());
        // SAFETY: test table.
        assert!(unsafe { table_at(&phys, map.root()) }.get(0).is_unused());

        assert_eq!(
            map.detach_region(&mut frames, &tlb, VirtualAddress::new(start)),
            Err(MapError::NoSuchRegion(VirtualAddress::new(start)))
        );
    }

    #[test]
    fn shared_nodes_survive_a_neighbour_detach() {
        let phys = TestPhys::with_frames(300);
        let mut frames = TestFrames::new(&phys);
        let kernel = VirtualMap::new_kernel(&phys, &mut frames).unwrap();
        let map = VirtualMap::new_user(&kernel, &mut frames).unwrap();
        let tlb = RecordingTlb::default();

        map.attach_region(&mut frames, user_heap(0x40_0000, 1)).unwrap();
        map.attach_region(&mut frames, user_heap(0x40_1000, 1)).unwrap();
        map.detach_region(&mut frames, &tlb, VirtualAddress::new(0x40_0000)).unwrap();
        assert!(map.translate(VirtualAddress::new(0x40_0000)).is_none());
        assert!(map.translate(VirtualAddress::new(0x40_1000)).is_some());
    }

    #[test]
    fn referenced_regions_stay_mapped() {
        let phys = TestPhys::with_frames(300);
        let mut frames = TestFrames::new(&phys);
        let kernel = VirtualMap::new_kernel(&phys, &mut frames).unwrap();
        let map = VirtualMap::new_user(&kernel, &mut frames).unwrap();
        let tlb = RecordingTlb::default();
        let va = VirtualAddress::new(0x40_0000);

        map.attach_region(&mut frames, user_heap(va.as_u64(), 2)).unwrap();
        assert_eq!(map.retain_region(va), Ok(2));
        assert_eq!(map.detach_region(&mut frames, &tlb, va), Ok(1));
        assert!(map.translate(va).is_some());
        assert!(tlb.flushed.borrow().is_empty());

        assert_eq!(map.detach_region(&mut frames, &tlb, va), Ok(0));
        assert!(map.translate(va).is_none());
        assert_eq!(map.retain_region(va), Err(MapError::NoSuchRegion(va)));
    }

    #[test]
    fn out_of_memory_during_attach_leaves_nothing_behind() {
        let phys = TestPhys::with_frames(300);
        let mut frames = TestFrames::new(&phys);
        let kernel = VirtualMap::new_kernel(&phys, &mut frames).unwrap();
        let map = VirtualMap::new_user(&kernel, &mut frames).unwrap();

        // Room for the three nodes and two of the five frames.
        let mut scarce = frames.split_off(5);
        let region = user_heap(0x40_0000, 5);

        assert_eq!(map.attach_region(&mut scarce, region), Err(MapError::OutOfMemory));
        assert_eq!(scarce.allocated, 0);
        assert_eq!(scarce.available(), 5);
        assert!(map.regions().is_empty());
        assert!(map.translate(region.start()).is_none());
        // SAFETY: test table.
        assert!(unsafe { table_at(&phys, map.root()) }.get(0).is_unused());
    }

    #[test]
    fn device_windows_are_uncached_and_keep_their_frames() {
        let phys = TestPhys::with_frames(300);
        let mut frames = TestFrames::new(&phys);
        let kernel = VirtualMap::new_kernel(&phys, &mut frames).unwrap();
        let before = frames.allocated;
        let tlb = RecordingTlb::default();

        let mmio = PhysicalAddress::new(0xFEE0_0000);
        let va = VirtualAddress::new(KERNEL_HALF_BASE + 0x4000_0000);
        let device = RegionKind::Device { phys: mmio };
        let dev = create_region(va, 2, device, RegionPermissions::kernel_rw()).unwrap();
        kernel.attach_region(&mut frames, dev).unwrap();
        // PD + PT only; the PDPT came with the kernel map.
        assert_eq!(frames.allocated, before + 2);

        assert_eq!(kernel.translate(va + PAGE_SIZE + 8), Some(mmio + PAGE_SIZE + 8));
        let leaf = kernel.leaf_entry(va).unwrap();
        assert!(leaf.cache_disabled() && leaf.global() && !leaf.user_access());

        // Visible through every map without touching its root.
        let user = VirtualMap::new_user(&kernel, &mut frames).unwrap();
        assert_eq!(user.translate(va), Some(mmio));

        kernel.detach_region(&mut frames, &tlb, va).unwrap();
        assert!(user.translate(va).is_none());
        // The frame of `user`'s root is the only one left besides the kernel tables.
        assert_eq!(frames.allocated, before + 1);
    }

    #[test]
    fn halves_belong_to_their_maps() {
        let phys = TestPhys::with_frames(300);
        let mut frames = TestFrames::new(&phys);
        let kernel = VirtualMap::new_kernel(&phys, &mut frames).unwrap();
        let user = VirtualMap::new_user(&kernel, &mut frames).unwrap();

        let high = create_region(
            VirtualAddress::new(KERNEL_HALF_BASE),
            1,
            RegionKind::Heap,
            RegionPermissions::kernel_rw(),
        )
        .unwrap();
        assert_eq!(
            user.attach_region(&mut frames, high),
            Err(MapError::KernelHalf(high.start()))
        );
        assert!(matches!(
            kernel.attach_region(&mut frames, user_heap(0x40_0000, 1)),
            Err(MapError::InvalidArgument(_))
        ));
    }

    #[test]
    fn destroy_returns_every_private_frame() {
        let phys = TestPhys::with_frames(300);
        let mut frames = TestFrames::new(&phys);
        let kernel = VirtualMap::new_kernel(&phys, &mut frames).unwrap();
        let baseline = frames.allocated;
        let tlb = RecordingTlb::default();

        let map = VirtualMap::new_user(&kernel, &mut frames).unwrap();
        map.attach_region(&mut frames, user_heap(0x40_0000, 3)).unwrap();
        map.attach_region(&mut frames, user_heap(0x7000_0000, 2)).unwrap();
        map.retain_region(VirtualAddress::new(0x7000_0000)).unwrap();
        map.destroy(&mut frames, &tlb).unwrap();

        assert_eq!(frames.allocated, baseline);
        assert_eq!(tlb.flushed.borrow().len(), 2);
        assert_eq!(
            kernel.destroy(&mut frames, &tlb),
            Err(MapError::InvalidArgument("the kernel map is never destroyed"))
        );
    }
}
