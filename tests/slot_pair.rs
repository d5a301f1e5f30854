//! Integration tests for the slot-pair engine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use tsvar::{SlotPairVar, Variable};

/// A value that counts its drops, for exactly-once destruction checks.
#[derive(Debug)]
struct DropCounter {
    id: u64,
    counter: Arc<AtomicUsize>,
}

impl DropCounter {
    fn new(id: u64, counter: &Arc<AtomicUsize>) -> Self {
        Self {
            id,
            counter: Arc::clone(counter),
        }
    }
}

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.counter.fetch_add(1, Ordering::SeqCst);
    }
}

fn counting_var(counter: &Arc<AtomicUsize>) -> SlotPairVar<u64> {
    let counter = Arc::clone(counter);
    SlotPairVar::with_destructor(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    })
}

// ============================================================================
// Basic reads and writes
// ============================================================================

#[test]
fn empty_var_reads_none() {
    let var: SlotPairVar<u64> = SlotPairVar::new();
    assert!(var.get().is_none());
    assert_eq!(var.version(), 0);
}

#[test]
fn quiescent_read_cycle() {
    // init → get None → set → get (value, 1) → release → destroy,
    // destructor invoked exactly once.
    let destroyed = Arc::new(AtomicUsize::new(0));
    let var = counting_var(&destroyed);

    assert!(var.get().is_none());
    assert_eq!(var.set(11), 1);

    let snapshot = var.get().expect("value was published");
    assert_eq!(*snapshot, 11);
    assert_eq!(snapshot.version(), 1);
    drop(snapshot);

    var.release();
    assert_eq!(destroyed.load(Ordering::SeqCst), 0, "value still in slots");
    drop(var);
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
}

#[test]
fn versions_increase_per_set() {
    let var = SlotPairVar::new();
    for expected in 1..=50u64 {
        assert_eq!(var.set(expected * 10), expected);
        assert_eq!(var.version(), expected);
        let snapshot = var.get().unwrap();
        assert_eq!(*snapshot, expected * 10);
        assert_eq!(snapshot.version(), expected);
    }
}

#[test]
fn repeated_get_hits_the_cached_wrapper() {
    let var = SlotPairVar::new();
    var.set(String::from("stable"));

    let first = var.get().unwrap();
    let second = var.get().unwrap();
    assert_eq!(*first, *second);
    assert_eq!(first.version(), second.version());
    // Same wrapper: the fast path must hand out the identical allocation.
    assert!(std::ptr::eq(&*first, &*second));
}

#[test]
fn snapshot_survives_overwrite() {
    let var = SlotPairVar::new();
    var.set(String::from("original"));
    let snapshot = var.get().unwrap();

    var.set(String::from("updated"));

    // The old snapshot still reads the old value.
    assert_eq!(&*snapshot, "original");
    assert_eq!(snapshot.version(), 1);
    // A fresh read sees the new one.
    let fresh = var.get().unwrap();
    assert_eq!(&*fresh, "updated");
    assert_eq!(fresh.version(), 2);
}

#[test]
fn values_drop_without_custom_destructor() {
    let drops = Arc::new(AtomicUsize::new(0));
    let var = SlotPairVar::new();
    var.set(DropCounter::new(1, &drops));
    var.set(DropCounter::new(2, &drops));
    var.set(DropCounter::new(3, &drops));
    // Values 1 and 2 were superseded; 2 still occupies the previous slot.
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(var.get().unwrap().id, 3);
    drop(var);
    assert_eq!(drops.load(Ordering::SeqCst), 3);
}

#[test]
fn var_ref_clone_and_formatting() {
    let var = SlotPairVar::new();
    var.set(42u64);

    let snapshot = var.get().unwrap();
    let copy = snapshot.clone();
    drop(snapshot);
    assert_eq!(*copy, 42);
    assert_eq!(format!("{copy}"), "42");
    assert_eq!(format!("{copy:?}"), "42");

    let debug = format!("{var:?}");
    assert!(debug.contains("SlotPairVar"));
    assert!(debug.contains("version"));
}

#[test]
fn default_is_empty() {
    let var: SlotPairVar<String> = SlotPairVar::default();
    assert!(var.get().is_none());
}

// ============================================================================
// Release semantics
// ============================================================================

#[test]
fn release_is_idempotent() {
    let destroyed = Arc::new(AtomicUsize::new(0));
    let var = counting_var(&destroyed);
    var.set(5);
    drop(var.get().unwrap());

    var.release();
    var.release();
    var.release();
    assert_eq!(destroyed.load(Ordering::SeqCst), 0);

    // A release with no prior get is a no-op too.
    var.set(6);
    var.release();
    drop(var);
    assert_eq!(destroyed.load(Ordering::SeqCst), 2);
}

#[test]
fn release_lets_a_superseded_value_die() {
    let destroyed = Arc::new(AtomicUsize::new(0));
    let var = counting_var(&destroyed);

    var.set(1);
    drop(var.get().unwrap()); // thread now holds version 1
    var.set(2);
    var.set(3); // version 1 leaves both slots; only the hold pins it
    assert_eq!(destroyed.load(Ordering::SeqCst), 0);

    var.release();
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Destroy with outstanding references
// ============================================================================

#[test]
fn snapshot_outlives_the_variable() {
    let destroyed = Arc::new(AtomicUsize::new(0));
    let var = counting_var(&destroyed);
    var.set(7);

    let snapshot = var.get().unwrap();
    drop(var);
    assert_eq!(destroyed.load(Ordering::SeqCst), 0, "snapshot still pins it");
    assert_eq!(*snapshot, 7);
    drop(snapshot);
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
}

#[test]
fn snapshot_taken_on_another_thread_outlives_the_variable() {
    let destroyed = Arc::new(AtomicUsize::new(0));
    let var = counting_var(&destroyed);
    var.set(7);

    let (tx, rx) = mpsc::channel();
    thread::scope(|s| {
        s.spawn(|| {
            let snapshot = var.get().unwrap();
            tx.send(snapshot).unwrap();
            // The thread's cached hold is dropped when it exits here.
        });
    });

    let snapshot = rx.recv().unwrap();
    drop(var);
    assert_eq!(destroyed.load(Ordering::SeqCst), 0);
    assert_eq!(*snapshot, 7);
    drop(snapshot);
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Waiting
// ============================================================================

#[test]
fn wait_returns_immediately_when_set() {
    let var = SlotPairVar::new();
    var.set(1u64);
    let snapshot = var.wait();
    assert_eq!(*snapshot, 1);
    assert_eq!(snapshot.version(), 1);
}

#[test]
#[cfg_attr(miri, ignore)]
fn two_readers_one_writer() {
    let var = Arc::new(SlotPairVar::<u64>::new());
    let (ready_tx, ready_rx) = mpsc::channel();

    let reader = {
        let var = Arc::clone(&var);
        thread::spawn(move || {
            let first = var.wait();
            assert_eq!(*first, 100u64);
            assert_eq!(first.version(), 1);
            ready_tx.send(()).unwrap();

            // Poll until the second publish lands.
            loop {
                let snapshot = var.get().unwrap();
                if snapshot.version() == 2 {
                    assert_eq!(*snapshot, 200);
                    break;
                }
                thread::yield_now();
            }
        })
    };

    thread::sleep(Duration::from_millis(20));
    assert_eq!(var.set(100), 1);
    ready_rx.recv().unwrap();
    assert_eq!(var.set(200), 2);
    reader.join().unwrap();
}

// ============================================================================
// Rapid overwrite (single writer, no readers)
// ============================================================================

#[test]
#[cfg_attr(miri, ignore)]
fn rapid_overwrite_destroys_every_value_once() {
    const SETS: u64 = 10_000;

    let destroyed = Arc::new(AtomicUsize::new(0));
    let var = counting_var(&destroyed);
    for i in 1..=SETS {
        assert_eq!(var.set(i), i);
    }
    assert_eq!(var.version(), SETS);
    // Everything but the two slot residents is gone already.
    assert_eq!(destroyed.load(Ordering::SeqCst), (SETS - 2) as usize);
    drop(var);
    assert_eq!(destroyed.load(Ordering::SeqCst), SETS as usize);
}

// ============================================================================
// Trait surface
// ============================================================================

#[test]
fn usable_through_the_variable_trait() {
    fn exercise(var: &dyn Variable<u64>) {
        assert!(var.get().is_none());
        assert_eq!(var.set(9), 1);
        assert_eq!(*var.wait(), 9);
        assert_eq!(var.version(), 1);
        var.release();
    }
    exercise(&SlotPairVar::new());
}

#[test]
fn var_is_send_and_sync() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    assert_send::<SlotPairVar<String>>();
    assert_sync::<SlotPairVar<String>>();
    assert_send::<tsvar::VarRef<String>>();
    assert_sync::<tsvar::VarRef<String>>();
}
