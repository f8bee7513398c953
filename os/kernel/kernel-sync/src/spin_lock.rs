use crate::irq::IrqGuard;
use core::{
    cell::UnsafeCell,
    hint::spin_loop,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

pub struct SpinLock<T> {
    /// lock state
    /// * `false`: unlocked
    /// * `true`: locked
    locked: AtomicBool,
    inner: UnsafeCell<T>,
}

// Safety: mutual exclusion; only T: Send may cross threads.
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(inner: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            inner: UnsafeCell::new(inner),
        }
    }

    /// Try once; returns immediately.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self.try_acquire() {
            Some(SpinLockGuard {
                lock: self,
                _irq: None,
            })
        } else {
            None
        }
    }

    /// Spin until acquired (TATAS), then return a guard.
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire();
        SpinLockGuard {
            lock: self,
            _irq: None,
        }
    }

    /// Mask local interrupts, then spin until acquired.
    ///
    /// The interrupt state is restored after the lock is released, so a
    /// handler on this core can never spin on a lock its own core holds.
    #[inline]
    pub fn lock_irq(&self) -> SpinLockGuard<'_, T> {
        let irq = IrqGuard::new();
        self.acquire();
        SpinLockGuard {
            lock: self,
            _irq: Some(irq),
        }
    }

    /// Closure convenience, built on the guard.
    #[inline]
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut g = self.lock();
        f(&mut g)
    }

    /// Closure convenience with interrupts masked.
    #[inline]
    pub fn with_lock_irq<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut g = self.lock_irq();
        f(&mut g)
    }

    /// Whether some guard currently holds the lock.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Mutable access when you have `&mut self` (no contention possible).
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }

    #[inline]
    fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    fn acquire(&self) {
        // Fast path: take the lock if it looks free.
        while !self.try_acquire() {
            // Contended path: spin on a read (cheap), then retry CAS.
            while self.locked.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// RAII guard; releases the lock (and then restores interrupts) on drop.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    // Field order matters only in `Drop::drop` below, which unlocks first.
    _irq: Option<IrqGuard>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // Release publishes the critical section. `_irq` is dropped after
        // this body runs, so interrupts come back only once we are unlocked.
        self.lock.locked.store(false, Ordering::Release);
    }
}
