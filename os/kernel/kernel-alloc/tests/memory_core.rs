//! The whole memory core on simulated RAM, hammered from several threads.

use kernel_alloc::{HeapError, MemoryManager};
use kernel_pmm::BuddyError;
use kernel_info::boot::{BootMemoryRegion, MemoryHandoff};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use kernel_vmem::{PhysMapper, RegionKind, RegionPermissions, create_region};
use std::cell::UnsafeCell;
use std::sync::Barrier;

const PHYS_BASE: u64 = 0x0100_0000;
const MIB: u64 = 1024 * 1024;

#[repr(C, align(4096))]
struct Frame([u8; 4096]);

struct Ram(Box<[UnsafeCell<Frame>]>);

impl Ram {
    fn new(bytes: u64) -> Self {
        Self((0..bytes / PAGE_SIZE).map(|_| UnsafeCell::new(Frame([0xA5; 4096]))).collect())
    }

    fn boot<'a>(&self, map: &[BootMemoryRegion]) -> MemoryManager<'a> {
        let handoff = MemoryHandoff {
            memory_map: map,
            hhdm_offset: (self.0.as_ptr() as u64).wrapping_sub(PHYS_BASE),
        };
        unsafe { MemoryManager::initialize(&handoff) }.unwrap()
    }
}

struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}

#[test]
fn concurrent_heap_traffic_leaves_no_trace() {
    const THREADS: u64 = 4;
    let ram = Ram::new(16 * MIB);
    let mm = ram.boot(&[BootMemoryRegion::usable(PHYS_BASE, 16 * MIB)]);
    let before = mm.free_pages();
    let barrier = Barrier::new(THREADS as usize);

    std::thread::scope(|s| {
        for t in 0..THREADS {
            let (mm, barrier) = (&mm, &barrier);
            s.spawn(move || {
                let mut rng = XorShift(0x2545_F491_4F6C_DD1D ^ (t + 1));
                let mut live: Vec<(std::ptr::NonNull<u8>, usize, u8)> = Vec::new();
                barrier.wait();
                for round in 0..3_000u32 {
                    if live.len() < 64 && rng.below(3) != 0 {
                        let size = if rng.below(16) == 0 {
                            4_100 + rng.below(12_000) as usize
                        } else {
                            1 + rng.below(2_000) as usize
                        };
                        let tag = (round % 251) as u8;
                        let p = mm.kmalloc(size).unwrap();
                        unsafe { p.write_bytes(tag, size) };
                        live.push((p, size, tag));
                    } else if !live.is_empty() {
                        let victim = rng.below(live.len() as u64) as usize;
                        let (p, size, tag) = live.swap_remove(victim);
                        // Nobody else wrote into our block.
                        assert!((0..size).all(|i| unsafe { p.add(i).read() } == tag));
                        mm.kfree(p).unwrap();
                    }
                }
                for (p, _, _) in live {
                    mm.kfree(p).unwrap();
                }
            });
        }
    });

    let stats = mm.heap_stats();
    assert_eq!(stats.live_objects, 0);
    assert_eq!(stats.page_runs, 0);
    // Only the last slab of each class is kept.
    assert!(stats.slabs.iter().all(|&n| n <= 1));
    assert_eq!(mm.free_pages() + stats.pages_held, before);
    mm.verify().unwrap();
}

#[test]
fn concurrent_frame_allocations_are_disjoint() {
    const THREADS: u64 = 4;
    let ram = Ram::new(16 * MIB);
    let mm = ram.boot(&[
        BootMemoryRegion::usable(PHYS_BASE, 5 * MIB),
        BootMemoryRegion::reserved(PHYS_BASE + 5 * MIB, MIB),
        BootMemoryRegion::usable(PHYS_BASE + 6 * MIB, 10 * MIB),
    ]);
    let barrier = Barrier::new(THREADS as usize);

    let mut runs: Vec<(u64, u64)> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let (mm, barrier) = (&mm, &barrier);
                s.spawn(move || {
                    let mut rng = XorShift(0x9E37_79B9 + t);
                    let mut mine = Vec::new();
                    barrier.wait();
                    for _ in 0..200 {
                        let pages = 1 + rng.below(8);
                        let pa = mm.phys_alloc(pages).unwrap();
                        let len = pages.next_power_of_two();
                        assert_eq!(pa.as_u64() % (len * PAGE_SIZE), 0);
                        mine.push((pa.as_u64(), len));
                        if rng.below(4) == 0 {
                            let (pa, len) = mine.swap_remove(0);
                            assert_eq!(mm.phys_dealloc(PhysicalAddress::new(pa)), Ok(len));
                        }
                    }
                    mine
                })
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });

    runs.sort_unstable();
    for w in runs.windows(2) {
        assert!(w[0].0 + w[0].1 * PAGE_SIZE <= w[1].0, "{w:x?} overlap");
    }
    let reserved = PHYS_BASE + 5 * MIB..PHYS_BASE + 6 * MIB;
    assert!(runs.iter().all(|&(pa, _)| !reserved.contains(&pa)));
    mm.verify().unwrap();
}

#[test]
fn heap_exhaustion_is_reported_and_recoverable() {
    let ram = Ram::new(4 * MIB);
    let mm = ram.boot(&[BootMemoryRegion::usable(PHYS_BASE, 4 * MIB)]);

    let mut held = Vec::new();
    let err = loop {
        match mm.kmalloc(64 * 1024) {
            Ok(p) => held.push(p),
            Err(e) => break e,
        }
    };
    assert_eq!(err, HeapError::OutOfMemory);
    assert!(!held.is_empty());

    // Region attach fails cleanly too, then works once memory is back.
    let region = create_region(
        VirtualAddress::new(0xFFFF_C000_0000_0000),
        64,
        RegionKind::Heap,
        RegionPermissions::kernel_rw(),
    )
    .unwrap();
    let free = mm.free_pages();
    assert!(mm.attach_region(mm.kernel_map(), region).is_err());
    assert_eq!(mm.free_pages(), free);

    for p in held {
        mm.kfree(p).unwrap();
    }
    mm.attach_region(mm.kernel_map(), region).unwrap();
    mm.verify().unwrap();
}

#[test]
fn heap_and_frame_owners_cannot_free_each_others_pages() {
    let ram = Ram::new(4 * MIB);
    let mm = ram.boot(&[BootMemoryRegion::usable(PHYS_BASE, 4 * MIB)]);
    let phys_of = |p: std::ptr::NonNull<u8>| {
        mm.mapper().virt_to_phys(VirtualAddress::from_ptr(p.as_ptr()))
    };

    let obj = mm.kmalloc(64).unwrap();
    let slab_base = std::ptr::NonNull::new((obj.as_ptr() as usize & !4095) as *mut u8).unwrap();
    assert_eq!(
        mm.kfree(slab_base),
        Err(HeapError::InvalidPointer(slab_base.as_ptr() as usize))
    );

    // The slab page is still in use, so the buddy never hands it out again.
    let frame = mm.phys_alloc(1).unwrap();
    assert_ne!(frame, phys_of(slab_base));
    let frame_va = mm.mapper().phys_to_virt(frame);
    let frame_ptr = std::ptr::NonNull::new(frame_va.as_mut_ptr::<u8>()).unwrap();
    assert_eq!(
        mm.kfree(frame_ptr),
        Err(HeapError::InvalidPointer(frame_ptr.as_ptr() as usize))
    );
    assert_eq!(mm.phys_dealloc(frame), Ok(1));

    let run = mm.kmalloc(3 * 4096).unwrap();
    let run_pa = phys_of(run);
    assert_eq!(mm.phys_dealloc(run_pa), Err(BuddyError::TagMismatch(run_pa)));
    assert_eq!(mm.usable_size(run), Ok(4 * 4096));
    mm.kfree(run).unwrap();
    assert!(mm.usable_size(run).is_err());

    mm.kfree(obj).unwrap();
    assert_eq!(mm.heap_stats().page_runs, 0);
    mm.verify().unwrap();
}
