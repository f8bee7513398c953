//! # Global allocator adapter
//!
//! [`KernelAllocator`] forwards Rust's `alloc` machinery (`Box`, `Vec`, the
//! region lists of every address space) to the kernel heap of the published
//! [`MemoryManager`](crate::manager::MemoryManager).
//!
//! - Alignments up to a page are honoured; larger ones fail with null.
//! - Before [`global::init`](crate::global::init) every allocation fails.
//! - `dealloc` ignores the layout: the heap finds the size class from the
//!   pointer itself.
//!
//! With the `global-allocator` feature the adapter is installed as the
//! `#[global_allocator]`.

use crate::global;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull, null_mut};
use log::error;

/// `GlobalAlloc` over the kernel heap.
#[derive(Copy, Clone, Debug, Default)]
pub struct KernelAllocator;

#[cfg(feature = "global-allocator")]
#[global_allocator]
static GLOBAL_ALLOCATOR: KernelAllocator = KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    /// # Safety
    /// The `GlobalAlloc` contract applies. Caller must handle a null return (OOM).
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let Some(mm) = global::try_memory() else {
            return null_mut();
        };
        mm.kmalloc_aligned(layout.size().max(1), layout.align())
            .map_or(null_mut(), NonNull::as_ptr)
    }

    /// # Safety
    /// The `GlobalAlloc` contract applies. `ptr` must come from `alloc`.
    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let (Some(ptr), Some(mm)) = (NonNull::new(ptr), global::try_memory()) else {
            return;
        };
        if let Err(e) = mm.kfree(ptr) {
            error!("memory: dealloc of {ptr:p} failed: {e}");
            panic!("kernel heap: {e}");
        }
    }

    /// # Safety
    /// The `GlobalAlloc` contract applies.
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let p = unsafe { self.alloc(layout) };
        if !p.is_null() {
            unsafe { ptr::write_bytes(p, 0, layout.size()) };
        }
        p
    }
}
