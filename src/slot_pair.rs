//! Slot-pair engine.
//!
//! Two fixed slots hold the current and the previous (or next) wrapper; a
//! monotonic counter names the current slot. Readers pin a slot with a
//! per-slot active-reader count, verify they did not race a writer, and take
//! a reference off the pinned wrapper. Writers stage the new wrapper in the
//! non-current slot, wait for that slot to go quiescent, then republish by
//! bumping the counter. Writes are O(1), reads never allocate, and
//! readers never wait on writers.
//!
//! The slots refer to each other by index (`idx ^ 1`) into the fixed pair,
//! never by pointer.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

use crossbeam_utils::CachePadded;

use crate::cache::{self, VarId};
use crate::waiter::{lock_mutex, Waiter};
use crate::wrapper::{
    add_ref, release_ref, set_refs, set_version, version_of, Destructor, VarRef, Wrapper,
    WrapperHeader,
};
use crate::{Variable, Version};

struct Slot {
    /// The wrapper published in this slot; mutated only by writers.
    wrapper: AtomicPtr<WrapperHeader>,
    /// Readers currently relying on this slot's wrapper. A writer may not
    /// mutate the slot until this is zero.
    active_readers: AtomicU32,
    /// Version of the wrapper residing here.
    version: AtomicU64,
}

impl Slot {
    fn new() -> Self {
        Self {
            wrapper: AtomicPtr::new(std::ptr::null_mut()),
            active_readers: AtomicU32::new(0),
            version: AtomicU64::new(0),
        }
    }
}

/// Writer-side gate: a writer parks here until the slot it is about to
/// overwrite goes quiescent. `waiting` is announced under the gate mutex so
/// the last reader of a slot knows whether a signal is worth taking the lock
/// for; the reader signals under the same mutex, so the wakeup cannot fall
/// between the writer's check and its wait.
struct Gate {
    lock: Mutex<()>,
    cv: Condvar,
    waiting: AtomicBool,
}

/// A thread-safe variable backed by the slot-pair engine.
///
/// Readers obtain the current value at the cost of a handful of atomic
/// operations and never block behind a writer (the only lock a reader ever
/// touches is the momentary writer-gate signal). Writes are serialized,
/// allocate one wrapper, and complete in O(1), independent of how many
/// values were ever published.
///
/// # Examples
///
/// ```rust
/// use tsvar::SlotPairVar;
///
/// let var = SlotPairVar::new();
/// assert!(var.get().is_none());
///
/// assert_eq!(var.set("first".to_string()), 1);
/// let snapshot = var.get().unwrap();
/// assert_eq!(&*snapshot, "first");
/// assert_eq!(snapshot.version(), 1);
/// ```
pub struct SlotPairVar<T: Send + Sync + 'static> {
    slots: [CachePadded<Slot>; 2],
    /// Count of completed `set` calls == the latest published version.
    /// Zero means no value yet; the current slot is `(next_version - 1) & 1`.
    next_version: AtomicU64,
    /// One writer at a time.
    write_lock: Mutex<()>,
    gate: Gate,
    waiter: Waiter,
    dtor: Option<Destructor<T>>,
    id: VarId,
    _marker: PhantomData<T>,
}

impl<T: Send + Sync + 'static> SlotPairVar<T> {
    /// Create an empty variable. Values are destroyed by `T`'s own `Drop`.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create an empty variable whose values are handed to `dtor` instead of
    /// being dropped. `dtor` is invoked exactly once per published value,
    /// when its last reference goes away.
    pub fn with_destructor(dtor: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self::build(Some(std::sync::Arc::new(dtor)))
    }

    fn build(dtor: Option<Destructor<T>>) -> Self {
        Self {
            slots: [CachePadded::new(Slot::new()), CachePadded::new(Slot::new())],
            next_version: AtomicU64::new(0),
            write_lock: Mutex::new(()),
            gate: Gate {
                lock: Mutex::new(()),
                cv: Condvar::new(),
                waiting: AtomicBool::new(false),
            },
            waiter: Waiter::new(),
            dtor,
            id: cache::alloc_var_id(),
            _marker: PhantomData,
        }
    }

    /// The latest published version, 0 if no value has ever been set.
    #[inline]
    pub fn version(&self) -> Version {
        self.next_version.load(Ordering::SeqCst)
    }

    /// Current value and version, or `None` if nothing was ever published.
    ///
    /// Also transfers the calling thread's cached hold to the returned
    /// wrapper, so the thread keeps the value alive until its next read of
    /// this variable, an explicit [`release`](SlotPairVar::release), or
    /// thread exit.
    pub fn get(&self) -> Option<VarRef<T>> {
        let current = self.next_version.load(Ordering::SeqCst);
        if current == 0 {
            return None;
        }
        // Fast path: the thread already holds the freshest wrapper. One
        // shared load, one refcount bump on memory this thread owns a
        // reference to. No slot traffic at all.
        if let Some(cached) = cache::cached(self.id) {
            // SAFETY: the hold owns a reference, so `cached` is live.
            if unsafe { version_of(cached) } == current {
                unsafe { add_ref(cached) };
                return Some(unsafe { VarRef::from_owned(cached) });
            }
        }
        self.get_slow(current)
    }

    #[cold]
    fn get_slow(&self, mut observed: Version) -> Option<VarRef<T>> {
        // Pin the slot the observed version points at.
        let first = ((observed - 1) & 1) as usize;
        self.slots[first].active_readers.fetch_add(1, Ordering::SeqCst);

        let mut both = false;
        if self.next_version.load(Ordering::SeqCst) != observed {
            // A writer raced past the first pin. Pin the sibling before
            // giving anything up, then re-select: with both slots pinned no
            // further writer can overtake either, and at most the one racing
            // writer got through, so a single re-selection lands on a slot
            // that now stays put.
            self.slots[first ^ 1]
                .active_readers
                .fetch_add(1, Ordering::SeqCst);
            both = true;
            observed = self.next_version.load(Ordering::SeqCst);
        }

        let idx = ((observed - 1) & 1) as usize;
        let hdr = self.slots[idx].wrapper.load(Ordering::SeqCst);
        let taken = if hdr.is_null() {
            // Unreachable once a version was observed (the first set fills
            // both slots before bumping the counter); tolerated as "empty".
            None
        } else {
            // SAFETY: the pin keeps the wrapper in the slot, and the slot's
            // reference keeps it alive until ours is counted.
            unsafe { add_ref(hdr) };
            Some(hdr)
        };

        self.unpin(first);
        if both {
            self.unpin(first ^ 1);
        }

        let hdr = taken?;
        // Separate reference for the per-thread hold.
        unsafe { add_ref(hdr) };
        cache::store_hold(self.id, hdr);
        // SAFETY: ownership of the reference taken above.
        Some(unsafe { VarRef::from_owned(hdr) })
    }

    /// Drop a slot pin; the last reader out signals a parked writer.
    fn unpin(&self, idx: usize) {
        let prev = self.slots[idx]
            .active_readers
            .fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev != 0, "slot reader count underflow");
        if prev == 1 && self.gate.waiting.load(Ordering::SeqCst) {
            let _gate = lock_mutex(&self.gate.lock);
            self.gate.cv.notify_one();
        }
    }

    /// Publish `value`, returning its version (≥ 1).
    ///
    /// Writers are serialized against each other; readers are never blocked.
    /// The superseded value is destroyed once its last reference (slot,
    /// snapshot, or per-thread hold) goes away.
    pub fn set(&self, value: T) -> Version {
        let hdr = Wrapper::alloc(value, self.dtor.clone()) as *mut WrapperHeader;
        let writer = lock_mutex(&self.write_lock);
        let observed = self.next_version.load(Ordering::SeqCst);
        let version = observed + 1;
        // SAFETY: the wrapper is still private to this writer.
        unsafe { set_version(hdr, version) };

        if observed == 0 {
            // First publish: both slots start out holding the same wrapper,
            // one slot reference each.
            unsafe { set_refs(hdr, 2) };
            for slot in &self.slots {
                slot.wrapper.store(hdr, Ordering::SeqCst);
                slot.version.store(version, Ordering::SeqCst);
            }
            self.next_version.store(version, Ordering::SeqCst);
            drop(writer);
            self.waiter.notify_first();
            return version;
        }

        unsafe { set_refs(hdr, 1) };
        let target = &self.slots[(observed & 1) as usize];
        self.await_quiescent(target);

        let old = target.wrapper.swap(hdr, Ordering::SeqCst);
        target.version.store(version, Ordering::SeqCst);
        // Republishes: the target slot is the current slot from here on.
        self.next_version.store(version, Ordering::SeqCst);
        drop(writer);

        debug_assert!(!old.is_null());
        // The slot's reference to the superseded wrapper, released outside
        // every lock so a user destructor can run freely.
        unsafe { release_ref(old) };
        version
    }

    /// Park until the slot has no active readers. New readers cannot arrive:
    /// the version counter no longer points at this slot.
    fn await_quiescent(&self, slot: &Slot) {
        let mut gate = lock_mutex(&self.gate.lock);
        self.gate.waiting.store(true, Ordering::SeqCst);
        while slot.active_readers.load(Ordering::SeqCst) > 0 {
            gate = match self.gate.cv.wait(gate) {
                Ok(g) => g,
                Err(_) => panic!("writer gate mutex poisoned"),
            };
        }
        self.gate.waiting.store(false, Ordering::SeqCst);
    }

    /// Block until the variable holds a value, then return it. Returns
    /// immediately if one was already published.
    pub fn wait(&self) -> VarRef<T> {
        if let Some(snapshot) = self.get() {
            return snapshot;
        }
        self.waiter.wait_until(|| self.get())
    }

    /// Drop the calling thread's cached hold, if any. Idempotent.
    pub fn release(&self) {
        cache::release_hold(self.id);
    }
}

impl<T: Send + Sync + 'static> Default for SlotPairVar<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> Drop for SlotPairVar<T> {
    fn drop(&mut self) {
        // The dropping thread gives up its own hold; other threads' holds
        // keep their wrappers alive past the variable (released when those
        // threads exit or read elsewhere).
        cache::drop_entry(self.id);
        for slot in &self.slots {
            let hdr = slot.wrapper.swap(std::ptr::null_mut(), Ordering::SeqCst);
            if !hdr.is_null() {
                // SAFETY: each occupied slot owns one reference; after the
                // first set both slots may name the same wrapper, which then
                // carries two.
                unsafe { release_ref(hdr) };
            }
        }
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for SlotPairVar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotPairVar")
            .field("version", &self.next_version.load(Ordering::SeqCst))
            .field(
                "slot_versions",
                &[
                    self.slots[0].version.load(Ordering::SeqCst),
                    self.slots[1].version.load(Ordering::SeqCst),
                ],
            )
            .field(
                "active_readers",
                &[
                    self.slots[0].active_readers.load(Ordering::SeqCst),
                    self.slots[1].active_readers.load(Ordering::SeqCst),
                ],
            )
            .finish()
    }
}

impl<T: Send + Sync + 'static> Variable<T> for SlotPairVar<T> {
    fn get(&self) -> Option<VarRef<T>> {
        SlotPairVar::get(self)
    }

    fn set(&self, value: T) -> Version {
        SlotPairVar::set(self, value)
    }

    fn wait(&self) -> VarRef<T> {
        SlotPairVar::wait(self)
    }

    fn release(&self) {
        SlotPairVar::release(self)
    }

    fn version(&self) -> Version {
        SlotPairVar::version(self)
    }
}

// SAFETY: all shared mutation goes through atomics or the internal mutexes;
// values cross threads only as &T or by refcounted handoff.
unsafe impl<T: Send + Sync + 'static> Send for SlotPairVar<T> {}
unsafe impl<T: Send + Sync + 'static> Sync for SlotPairVar<T> {}
