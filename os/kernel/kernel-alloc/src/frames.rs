//! # Buddy-backed page sources
//!
//! [`BuddyFrames`] is the one place where the rest of the kernel reaches the
//! buddy allocator: the virtual memory mapper takes single frames through
//! [`FrameAlloc`], the heap takes page runs through [`PageSource`]. Both
//! hold the buddy lock (interrupts masked) for exactly one call.

use crate::heap::{HeapError, PageSource, PageUse};
use crate::phys_mapper::HhdmPhysMapper;
use core::ptr::NonNull;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_pmm::{BuddyAllocator, BuddyError};
use kernel_sync::SpinLock;
use kernel_vmem::{FrameAlloc, PhysMapper};
use log::error;

#[derive(Copy, Clone)]
pub struct BuddyFrames<'a> {
    buddy: &'a SpinLock<BuddyAllocator<'a>>,
    mapper: &'a HhdmPhysMapper,
}

impl<'a> BuddyFrames<'a> {
    pub const fn new(buddy: &'a SpinLock<BuddyAllocator<'a>>, mapper: &'a HhdmPhysMapper) -> Self {
        Self { buddy, mapper }
    }

    fn phys_of(&self, ptr: NonNull<u8>) -> PhysicalAddress {
        self.mapper.virt_to_phys(VirtualAddress::from_ptr(ptr.as_ptr()))
    }
}

impl FrameAlloc for BuddyFrames<'_> {
    fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
        self.buddy.lock_irq().allocate(1).ok()
    }

    /// A frame the mapper owned must go back cleanly; anything else means the
    /// page tables and the allocator disagree.
    fn free_4k(&mut self, pa: PhysicalAddress) {
        let result = self.buddy.lock_irq().deallocate(pa);
        if let Err(e) = result {
            error!("frames: returning {pa} failed: {e}");
            panic!("page-table frame {pa} could not be freed: {e}");
        }
    }
}

impl PageSource for BuddyFrames<'_> {
    /// Page runs are tagged in the buddy allocator, slab pages are not.
    fn alloc_pages(&self, pages: u64, usage: PageUse) -> Result<NonNull<u8>, HeapError> {
        let result = {
            let mut buddy = self.buddy.lock_irq();
            match usage {
                PageUse::Slab => buddy.allocate(pages),
                PageUse::Run => buddy.allocate_tagged(pages),
            }
        };
        let pa = result.map_err(|e| match e {
            BuddyError::InvalidArgument(why) => HeapError::InvalidArgument(why),
            _ => HeapError::OutOfMemory,
        })?;
        NonNull::new(self.mapper.phys_to_virt(pa).as_mut_ptr::<u8>()).ok_or(HeapError::OutOfMemory)
    }

    fn free_pages(&self, ptr: NonNull<u8>, usage: PageUse) -> Result<u64, HeapError> {
        let addr = ptr.as_ptr() as usize;
        let pa = self.phys_of(ptr);
        let result = {
            let mut buddy = self.buddy.lock_irq();
            match usage {
                PageUse::Slab => buddy.deallocate(pa),
                PageUse::Run => buddy.deallocate_tagged(pa),
            }
        };
        result.map_err(|e| match e {
            BuddyError::DoubleFree(_) => HeapError::DoubleFree(addr),
            _ => HeapError::InvalidPointer(addr),
        })
    }

    fn run_pages(&self, ptr: NonNull<u8>) -> Option<u64> {
        let info = self.buddy.lock_irq().block_info(self.phys_of(ptr))?;
        (info.tagged && !info.free).then(|| 1 << info.order)
    }
}
