//! # Kernel Memory Configuration and Boot Handoff
//!
//! This crate is the single source of truth for the constants that shape the
//! kernel's memory core and for the data the boot loader hands to it.
//!
//! ## Modules
//!
//! ### Memory Layout ([`memory`])
//! * **Page and order geometry**: page size, buddy orders, zone limit
//! * **Address space split**: where the shared kernel half begins
//! * **Heap geometry**: slab granularity and in-page header size
//!
//! ### Boot Information ([`boot`])
//! * **Physical memory map**: `{base, length, usable}` entries
//! * **HHDM offset**: where the loader mapped all of physical memory
//!
//! ## Virtual Address Space Layout
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │   Private half (per map)        │
//!                       │   user stacks, heaps, code      │
//! 0x0000_7FFF_FFFF_FFFF ├─────────────────────────────────┤
//!                       │   non-canonical hole            │
//! KERNEL_HALF_BASE      ├─────────────────────────────────┤ 0xffff_8000_0000_0000
//!                       │   Shared kernel half            │
//!                       │   (PML4 slots 256..512 aliased  │
//!                       │    into every address space)    │
//! DEFAULT_HHDM_BASE     │   Higher Half Direct Map        │ 0xffff_8880_0000_0000
//! KERNEL_BASE           │   Kernel text & data            │ 0xffff_ffff_8000_0000
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! All values are `const` and validated at compile time.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
