use kernel_sync::{IrqGuard, SpinLock};
use std::panic;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn guard_unlocks_on_drop() {
    let l = SpinLock::new(0_u64);
    {
        let mut g = l.lock();
        *g = 0x1000;
        assert!(l.is_locked());
    }
    assert!(!l.is_locked());
    assert_eq!(*l.lock(), 0x1000);
}

#[test]
fn try_lock_fails_while_held() {
    let l = SpinLock::new([0u8; 4]);
    let held = l.try_lock().expect("uncontended");
    assert!(l.try_lock().is_none());
    drop(held);
    assert!(l.try_lock().is_some());
}

#[test]
fn lock_irq_behaves_like_lock_on_host() {
    let l = SpinLock::new(Vec::<u64>::new());
    {
        let mut g = l.lock_irq();
        g.push(7);
        assert!(l.try_lock().is_none());
    }
    let n = l.with_lock_irq(|v| {
        v.push(8);
        v.len()
    });
    assert_eq!(n, 2);
    assert!(!l.is_locked());
}

#[test]
fn irq_guard_is_inert_on_hosted_targets() {
    let g = IrqGuard::new();
    assert!(!g.restores_interrupts());
    assert!(!kernel_sync::irq::interrupts_enabled());
}

#[test]
fn get_mut_and_into_inner_bypass_locking() {
    let mut l = SpinLock::new(vec![1, 2]);
    l.get_mut().push(3);
    assert_eq!(l.into_inner(), vec![1, 2, 3]);
}

#[test]
fn contended_counters_stay_exact() {
    let threads = 8;
    let iters = 4_000;

    // Simulates two counters that must move together, like free/used pages.
    let lock = Arc::new(SpinLock::new((0usize, 100_000usize)));
    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let in_cs = Arc::clone(&in_cs);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..iters {
                    lock.with_lock_irq(|(used, free)| {
                        assert_eq!(in_cs.fetch_add(1, Ordering::SeqCst), 0);
                        *used += 1;
                        *free -= 1;
                        in_cs.fetch_sub(1, Ordering::SeqCst);
                    });
                    thread::yield_now();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    let (used, free) = lock.with_lock(|v| *v);
    assert_eq!(used, threads * iters);
    assert_eq!(used + free, 100_000);
}

#[test]
fn panic_inside_critical_section_releases_lock() {
    let l = SpinLock::new(0u32);
    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        l.with_lock(|v| {
            *v = 5;
            panic!("boom");
        });
    }));
    assert!(res.is_err());
    assert_eq!(l.with_lock(|v| *v), 5);
}

#[test]
fn spinlock_is_sync_for_send_payload() {
    fn takes_sync<S: Sync>(_s: &S) {}
    takes_sync(&SpinLock::new(0u8));
}
