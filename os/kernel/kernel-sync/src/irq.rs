//! Local interrupt masking.
//!
//! On freestanding x86-64 (`target_os = "none"`) this issues `cli`/`sti` and
//! reads `RFLAGS.IF`. Everywhere else the functions are no-ops that report
//! interrupts as disabled, which keeps host-side tests free of privileged
//! instructions.

/// `RFLAGS` interrupt-enable bit.
const RFLAGS_IF: u64 = 1 << 9;

/// Disables hardware interrupts (`cli`).
///
/// # Safety & Privilege
///
/// Must only be called in contexts where `cli` is permitted.
#[inline]
pub fn cli_stop_interrupts() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack, preserves_flags));
    }
}

/// Enables hardware interrupts (`sti`).
///
/// # Safety & Privilege
///
/// Must only be called in contexts where `sti` is permitted. Typically used
/// to restore a previously disabled interrupt state.
#[inline]
pub fn sti_enable_interrupts() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
    }
}

/// Returns whether interrupts are enabled on this core (`RFLAGS.IF`).
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let r: u64;
        unsafe {
            core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags));
        }
        r & RFLAGS_IF != 0
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        let _ = RFLAGS_IF;
        false
    }
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// `IrqGuard::new()` snapshots the `IF` bit. If interrupts were enabled, it
/// executes `cli`. On drop, it executes `sti` **only** if they were
/// previously enabled, so guards nest correctly.
///
/// # Examples
///
/// ```
/// use kernel_sync::IrqGuard;
///
/// {
///     let _g = IrqGuard::new(); // interrupts disabled here if previously enabled
///     // critical section
/// }
/// ```
pub struct IrqGuard {
    /// Whether interrupts were enabled (IF=1) when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    /// Disables interrupts if they are currently enabled and remembers the state.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = interrupts_enabled();
        if enabled {
            cli_stop_interrupts();
        }
        Self {
            were_enabled: enabled,
        }
    }

    /// Whether this guard will re-enable interrupts when dropped.
    #[inline]
    #[must_use]
    pub const fn restores_interrupts(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for IrqGuard {
    /// Restores interrupts (`sti`) only if they were previously enabled.
    fn drop(&mut self) {
        if self.were_enabled {
            sti_enable_interrupts();
        }
    }
}
