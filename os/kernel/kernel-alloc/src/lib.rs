//! # Kernel Memory Allocation
//!
//! The top of the memory core: the kernel heap, the HHDM physical mapper,
//! and the [`MemoryManager`] context that wires zones, buddy allocator, heap
//! and the kernel address space together.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │   global facade / KernelAllocator (GlobalAlloc)     │
//! │    • kmalloc, kfree, phys_alloc, attach_region ...  │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │                 MemoryManager                       │
//! │    • KernelHeap: slabs of 16..4032 B, page runs     │
//! │    • kernel VirtualMap, new address spaces, stacks  │
//! └────────┬───────────────────────────────┬────────────┘
//!          │ PageSource                    │ FrameAlloc
//! ┌────────▼───────────────────────────────▼────────────┐
//! │        BuddyFrames (SpinLock<BuddyAllocator>)       │
//! │    • HhdmPhysMapper: frame ↔ direct-map pointer     │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Components
//!
//! * [`heap`]: size-class slabs carved from single pages, whole page runs for
//!   anything larger. Slot pointers are never page aligned, page runs always
//!   are; `kfree` needs nothing else to tell them apart.
//! * [`phys_mapper`]: physical address `pa` lives at `hhdm_offset + pa`.
//! * [`frames`]: the buddy allocator seen as a [`FrameAlloc`](kernel_vmem::FrameAlloc)
//!   by page tables and as a [`PageSource`](heap::PageSource) by the heap.
//! * [`manager`]: bring-up from the loader's
//!   [`MemoryHandoff`](kernel_info::boot::MemoryHandoff) and every service
//!   on top of it.
//! * [`global`]: the published instance, for code that has no context to
//!   pass around.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use kernel_alloc::global;
//! use kernel_info::boot::{BootMemoryRegion, MemoryHandoff};
//! use kernel_info::memory::DEFAULT_HHDM_BASE;
//!
//! let map = [BootMemoryRegion::usable(0x10_0000, 0x3ff0_0000)];
//! let handoff = MemoryHandoff { memory_map: &map, hhdm_offset: DEFAULT_HHDM_BASE };
//! let mm = unsafe { global::init(&handoff) };
//!
//! let buf = global::kzmalloc(256).expect("heap online");
//! global::kfree(buf).unwrap();
//! # let _ = mm;
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod allocator;
pub mod frames;
pub mod global;
pub mod heap;
pub mod manager;
pub mod phys_mapper;
mod slab;

pub use allocator::KernelAllocator;
pub use heap::{HeapError, HeapStats, KernelHeap, PageSource, PageUse};
pub use manager::{InitError, KernelVirtualMap, MemoryManager};
pub use phys_mapper::HhdmPhysMapper;
pub use slab::{CLASS_COUNT, MAX_SLAB_OBJECT, SIZE_CLASSES};
