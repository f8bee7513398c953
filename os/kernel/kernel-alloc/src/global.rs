//! # Kernel-wide memory services
//!
//! The one [`MemoryManager`] the running kernel uses, published once by
//! [`init`] and reachable from every core afterwards. The functions here are
//! what the scheduler, drivers and the process loader call.
//!
//! Failures come back as values, except the two classes after which the
//! bookkeeping can no longer be trusted: a failed [`init`] and a double free.
//! Those log at `error!` and panic; the kernel's panic handler halts.

use crate::heap::HeapError;
use crate::manager::{KernelVirtualMap, MemoryManager};
use core::ptr::NonNull;
use kernel_info::boot::MemoryHandoff;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_pmm::BuddyError;
use kernel_sync::SyncOnceCell;
use kernel_vmem::{MapError, RegionKind, RegionPermissions, VirtualRegion};
use log::error;

static MEMORY: SyncOnceCell<MemoryManager<'static>> = SyncOnceCell::new();

/// Bring up the memory core and publish it.
///
/// # Safety
/// See [`MemoryManager::initialize`]: the handoff's HHDM must cover all
/// usable RAM for the rest of the kernel's life.
///
/// # Panics
/// If initialization fails or already happened.
pub unsafe fn init(handoff: &MemoryHandoff<'_>) -> &'static MemoryManager<'static> {
    if MEMORY.is_initialized() {
        error!("memory: init called twice");
        panic!("memory core is already initialized");
    }
    // SAFETY: forwarded to the caller.
    let mm = match unsafe { MemoryManager::initialize(handoff) } {
        Ok(mm) => mm,
        Err(e) => {
            error!("memory: unrecoverable initialization failure: {e}");
            panic!("memory core initialization failed: {e}");
        }
    };
    MEMORY.set(mm).unwrap_or_else(|_| panic!("memory core initialized concurrently"))
}

/// The published manager, if [`init`] ran.
#[inline]
#[must_use]
pub fn try_memory() -> Option<&'static MemoryManager<'static>> {
    MEMORY.get()
}

/// The published manager.
///
/// # Panics
/// Before [`init`].
#[inline]
#[must_use]
pub fn memory() -> &'static MemoryManager<'static> {
    try_memory().unwrap_or_else(|| panic!("memory core used before init"))
}

/// # Errors
/// See [`MemoryManager::phys_alloc`].
pub fn phys_alloc(pages: u64) -> Result<PhysicalAddress, BuddyError> {
    memory().phys_alloc(pages)
}

/// Return frames; yields the pages released.
///
/// # Errors
/// [`BuddyError::UnknownAddress`], [`BuddyError::StaticPool`] or
/// [`BuddyError::TagMismatch`].
///
/// # Panics
/// On a double free.
pub fn phys_dealloc(pa: PhysicalAddress) -> Result<u64, BuddyError> {
    match memory().phys_dealloc(pa) {
        Err(BuddyError::DoubleFree(pa)) => {
            error!("memory: double free of frame {pa}");
            panic!("double free of physical frame {pa}");
        }
        other => other,
    }
}

/// `None` when out of memory or for a zero size.
#[must_use]
pub fn kmalloc(size: usize) -> Option<NonNull<u8>> {
    memory().kmalloc(size).ok()
}

/// Zero-filled [`kmalloc`].
#[must_use]
pub fn kzmalloc(size: usize) -> Option<NonNull<u8>> {
    memory().kzmalloc(size).ok()
}

/// Move `ptr` to a block of `size` bytes. On `None` the old block is
/// untouched.
///
/// # Panics
/// If freeing the old block reveals a double free or corruption.
pub fn krealloc(ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
    memory().krealloc(ptr, size).map_err(fatal_heap_error).ok()
}

/// Release a block from [`kmalloc`].
///
/// # Errors
/// [`HeapError::InvalidPointer`] for pointers the heap never returned.
///
/// # Panics
/// On a double free or a corrupted slab.
pub fn kfree(ptr: NonNull<u8>) -> Result<(), HeapError> {
    memory().kfree(ptr).map_err(fatal_heap_error)
}

fn fatal_heap_error(e: HeapError) -> HeapError {
    if let HeapError::DoubleFree(addr) | HeapError::Corrupted(addr) = e {
        error!("memory: heap bookkeeping broken at {addr:#x}: {e}");
        panic!("kernel heap: {e}");
    }
    e
}

/// # Errors
/// See [`kernel_vmem::create_region`].
pub fn create_region(
    start: VirtualAddress,
    pages: u64,
    kind: RegionKind,
    permissions: RegionPermissions,
) -> Result<VirtualRegion, MapError> {
    kernel_vmem::create_region(start, pages, kind, permissions)
}

/// # Errors
/// See [`MemoryManager::attach_region`].
pub fn attach_region(
    map: &KernelVirtualMap<'static>,
    region: VirtualRegion,
) -> Result<(), MapError> {
    memory().attach_region(map, region)
}

/// # Errors
/// See [`MemoryManager::detach_region`].
pub fn detach_region(
    map: &KernelVirtualMap<'static>,
    start: VirtualAddress,
) -> Result<u32, MapError> {
    memory().detach_region(map, start)
}

/// # Errors
/// See [`MemoryManager::new_address_space`].
pub fn new_address_space() -> Result<KernelVirtualMap<'static>, MapError> {
    memory().new_address_space()
}

/// # Errors
/// See [`MemoryManager::create_stack`].
pub fn create_stack(
    map: &KernelVirtualMap<'static>,
    top: VirtualAddress,
    pages: u64,
) -> Result<VirtualRegion, MapError> {
    memory().create_stack(map, top, pages)
}

/// # Panics
/// Before [`init`].
#[must_use]
pub fn kernel_map() -> &'static KernelVirtualMap<'static> {
    memory().kernel_map()
}
