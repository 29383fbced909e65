use kernel_sync::{IrqGuard, IrqSpinLock, SyncOnceCell, irq};
use std::sync::Arc;
use std::thread;

#[test]
fn irq_guard_is_inert_on_host() {
    assert!(!irq::interrupts_enabled());
    {
        let _outer = IrqGuard::new();
        let _inner = IrqGuard::new();
        assert!(!irq::interrupts_enabled());
    }
    assert!(!irq::interrupts_enabled());
}

#[test]
fn irq_lock_excludes_second_holder() {
    let l = IrqSpinLock::new(5_u32);
    let mut g = l.lock();
    *g += 1;
    assert!(l.try_lock().is_none());
    drop(g);
    assert_eq!(l.with_lock(|v| *v), 6);
}

#[test]
fn irq_lock_counts_across_threads() {
    let lock = Arc::new(IrqSpinLock::new(0_usize));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                for _ in 0..1_000 {
                    lock.with_lock(|v| *v += 1);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(lock.with_lock(|v| *v), 4_000);
}

#[test]
fn once_cell_set_only_once() {
    let cell = SyncOnceCell::new();
    assert!(cell.get().is_none());
    assert_eq!(cell.set(1_u32), Ok(()));
    assert_eq!(cell.set(2), Err(2));
    assert_eq!(cell.get(), Some(&1));
    assert_eq!(*cell.get_or_init(|| 3), 1);
}

#[test]
fn once_cell_get_or_init_runs_initializer_once() {
    let cell = SyncOnceCell::new();
    let mut calls = 0;
    let first = cell
        .get_or_init(|| {
            calls += 1;
            String::from("memory")
        })
        .clone();
    let second = cell.get_or_init(|| String::from("other")).clone();
    assert_eq!(first, "memory");
    assert_eq!(second, "memory");
    assert_eq!(calls, 1);
}
