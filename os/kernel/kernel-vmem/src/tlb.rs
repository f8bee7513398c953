//! # TLB Maintenance
//!
//! Removing a translation is not finished until no core can still use a
//! cached copy of it. [`VirtualMap::detach_region`](crate::VirtualMap::detach_region)
//! clears the present bits of a range, calls [`TlbShootdown::shootdown`] once
//! for it, and only then hands the frames back. An implementation must not
//! return before every core that may hold a stale entry has dropped it.
//!
//! - [`LocalTlb`]: `invlpg` on the calling core only. Correct before the
//!   application processors are started, or on a uniprocessor.
//! - [`BroadcastShootdown`]: local flush, then an IPI round through a
//!   [`ShootdownSender`] the interrupt layer provides.

use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use log::trace;

/// Ranges with more pages than this are flushed by reloading CR3 instead of
/// page by page.
pub const FULL_FLUSH_THRESHOLD: u64 = 64;

pub trait TlbShootdown {
    /// Drop cached translations for `pages` pages starting at `start` on every
    /// core that may hold them; returns once that is done.
    fn shootdown(&self, start: VirtualAddress, pages: u64);
}

/// Invalidate the TLB entry for the page containing `va` on this core.
#[inline]
pub fn invlpg(va: VirtualAddress) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let _ = va;
}

/// Drop every non-global TLB entry on this core by rewriting CR3.
#[inline]
pub fn flush_all_local() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        core::arch::asm!(
            "mov {tmp}, cr3",
            "mov cr3, {tmp}",
            tmp = out(reg) _,
            options(nostack, preserves_flags)
        );
    }
}

/// Flush `pages` pages from `start` on the calling core.
///
/// Global (kernel half) entries survive a CR3 reload, so ranges in the
/// kernel half are always flushed page by page.
pub fn flush_local(start: VirtualAddress, pages: u64) {
    let kernel_half = start.as_u64() >= kernel_info::memory::KERNEL_HALF_BASE;
    if pages > FULL_FLUSH_THRESHOLD && !kernel_half {
        flush_all_local();
        return;
    }
    for i in 0..pages {
        invlpg(start + i * PAGE_SIZE);
    }
}

/// Calling-core-only invalidation.
#[derive(Copy, Clone, Debug, Default)]
pub struct LocalTlb;

impl TlbShootdown for LocalTlb {
    fn shootdown(&self, start: VirtualAddress, pages: u64) {
        trace!("tlb: local flush {start} +{pages} pages");
        flush_local(start, pages);
    }
}

/// Cross-core delivery of an invalidation request.
pub trait ShootdownSender {
    /// Ask every other online core to flush `pages` pages from `start`, and
    /// wait until all of them acknowledged.
    fn broadcast_and_wait(&self, start: VirtualAddress, pages: u64);
}

/// Local flush followed by a broadcast to the other cores.
pub struct BroadcastShootdown<S> {
    sender: S,
}

impl<S: ShootdownSender> BroadcastShootdown<S> {
    pub const fn new(sender: S) -> Self {
        Self { sender }
    }

    pub const fn sender(&self) -> &S {
        &self.sender
    }
}

impl<S: ShootdownSender> TlbShootdown for BroadcastShootdown<S> {
    fn shootdown(&self, start: VirtualAddress, pages: u64) {
        trace!("tlb: shootdown {start} +{pages} pages");
        flush_local(start, pages);
        self.sender.broadcast_and_wait(start, pages);
    }
}

impl<T: TlbShootdown + ?Sized> TlbShootdown for &T {
    fn shootdown(&self, start: VirtualAddress, pages: u64) {
        (**self).shootdown(start, pages);
    }
}
