//! Subscription-slots engine.
//!
//! Published wrappers form a singly-linked list, newest at the head. Every
//! reader thread owns one subscription cell; a read publishes the observed
//! head into the cell and re-checks the head until the two agree, at which
//! point the cell protects the wrapper: the hazard-pointer discipline with
//! exactly one protected pointer per thread. Readers never block and never
//! allocate; writers pay for it by garbage-collecting the list on every
//! publish, scanning all cells for each candidate.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::cache::{self, VarId};
use crate::cells::CellTable;
use crate::waiter::{lock_mutex, Waiter};
use crate::wrapper::{
    add_ref, next_of, release_ref, set_next, set_refs, set_version, version_of, Destructor,
    VarRef, Wrapper, WrapperHeader,
};
use crate::{Variable, Version};

/// A thread-safe variable backed by the subscription-slots engine.
///
/// Readers are lock-free: a read is a couple of loads plus a store into the
/// thread's own subscription cell, looped only while a writer is actively
/// churning the head. Writers are serialized and sweep the value list on
/// every publish, destroying wrappers no cell protects anymore.
///
/// # Examples
///
/// ```rust
/// use tsvar::SubscriptionVar;
///
/// let var = SubscriptionVar::new();
/// assert_eq!(var.set(7u64), 1);
/// assert_eq!(*var.get().unwrap(), 7);
/// ```
pub struct SubscriptionVar<T: Send + Sync + 'static> {
    /// Most recently published wrapper; older wrappers hang off `next`.
    head: AtomicPtr<WrapperHeader>,
    /// Latest published version, mirrored out of the writer critical section
    /// (stored after the head) so readers can check staleness without
    /// touching the list.
    published: AtomicU64,
    /// One hazard cell per subscribed reader thread; shared with those
    /// threads' registries so cells can be cleared after the variable dies.
    cells: Arc<CellTable>,
    write_lock: Mutex<()>,
    waiter: Waiter,
    dtor: Option<Destructor<T>>,
    id: VarId,
    _marker: PhantomData<T>,
}

impl<T: Send + Sync + 'static> SubscriptionVar<T> {
    /// Create an empty variable. Values are destroyed by `T`'s own `Drop`.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create an empty variable whose values are handed to `dtor` instead of
    /// being dropped. Invoked exactly once per published value.
    pub fn with_destructor(dtor: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self::build(Some(Arc::new(dtor)))
    }

    fn build(dtor: Option<Destructor<T>>) -> Self {
        Self {
            head: AtomicPtr::new(std::ptr::null_mut()),
            published: AtomicU64::new(0),
            cells: Arc::new(CellTable::new()),
            write_lock: Mutex::new(()),
            waiter: Waiter::new(),
            dtor,
            id: cache::alloc_var_id(),
            _marker: PhantomData,
        }
    }

    /// The latest published version, 0 if no value has ever been set.
    #[inline]
    pub fn version(&self) -> Version {
        self.published.load(Ordering::SeqCst)
    }

    /// Current value and version, or `None` if nothing was ever published.
    ///
    /// Transfers the calling thread's cached hold to the returned wrapper;
    /// the thread's subscription cell keeps naming it until the next read or
    /// an explicit [`release`](SubscriptionVar::release).
    pub fn get(&self) -> Option<VarRef<T>> {
        let current = self.published.load(Ordering::SeqCst);
        if current == 0 {
            return None;
        }
        // Fast path: the hold already owns the freshest wrapper.
        if let Some(cached) = cache::cached(self.id) {
            // SAFETY: the hold owns a reference, so `cached` is live.
            if unsafe { version_of(cached) } == current {
                unsafe { add_ref(cached) };
                return Some(unsafe { VarRef::from_owned(cached) });
            }
        }
        self.get_slow()
    }

    #[cold]
    fn get_slow(&self) -> Option<VarRef<T>> {
        let lease = cache::lease_cell(self.id, &self.cells);

        let mut hdr = self.head.load(Ordering::SeqCst);
        loop {
            if hdr.is_null() {
                // Raced the very first publish; report "empty" rather than
                // spin for it.
                self.cells.clear(lease.index);
                if lease.ephemeral {
                    self.cells.retire(lease.index);
                }
                return None;
            }
            self.cells.publish(lease.index, hdr);
            let again = self.head.load(Ordering::SeqCst);
            if std::ptr::eq(again, hdr) {
                // The cell visibly named `hdr` while it was still the head,
                // so no collector can have freed it: it is protected now.
                break;
            }
            hdr = again;
        }

        // SAFETY: protected by the cell; count references before the cell
        // stops protecting it.
        unsafe { add_ref(hdr) }; // the snapshot
        unsafe { add_ref(hdr) }; // the per-thread hold
        if lease.ephemeral {
            // Thread is tearing down: no registry to park the cell or the
            // hold in. Give both back.
            self.cells.retire(lease.index);
        }
        cache::store_hold(self.id, hdr);
        // SAFETY: ownership of the snapshot reference taken above.
        Some(unsafe { VarRef::from_owned(hdr) })
    }

    /// Publish `value`, returning its version (≥ 1).
    ///
    /// Links the new wrapper at the head of the value list, then collects
    /// every older wrapper that no subscription cell protects. Yields once
    /// before returning so a storm of writers cannot monopolize readers'
    /// head-check loop.
    pub fn set(&self, value: T) -> Version {
        let hdr = Wrapper::alloc(value, self.dtor.clone()) as *mut WrapperHeader;
        let writer = lock_mutex(&self.write_lock);

        let version = self.published.load(Ordering::SeqCst) + 1;
        // SAFETY: the wrapper is still private to this writer.
        unsafe { set_version(hdr, version) };
        unsafe { set_refs(hdr, 1) }; // the list's reference
        unsafe { set_next(hdr, self.head.load(Ordering::SeqCst)) };
        self.head.store(hdr, Ordering::SeqCst);
        self.published.store(version, Ordering::SeqCst);

        let collected = self.collect(hdr);
        drop(writer);

        // Release outside the lock: dropping the list reference may run the
        // user destructor, which is allowed to block or allocate.
        for old in collected {
            // SAFETY: unlinked under the writer lock, never released twice.
            unsafe { release_ref(old) };
        }

        if version == 1 {
            self.waiter.notify_first();
        }
        std::thread::yield_now();
        version
    }

    /// Unlink every non-head wrapper that no cell protects. List links are
    /// only ever touched under the writer lock. Returns the unlinked
    /// wrappers so their list references can be released after unlocking.
    fn collect(&self, head: *mut WrapperHeader) -> Vec<*mut WrapperHeader> {
        let mut collected = Vec::new();
        let mut prev = head;
        // SAFETY: list nodes are live while linked; traversal is
        // writer-locked.
        let mut cur = unsafe { next_of(head) };
        while !cur.is_null() {
            let next = unsafe { next_of(cur) };
            if self.cells.protects(cur) {
                prev = cur;
            } else {
                unsafe { set_next(prev, next) };
                collected.push(cur);
            }
            cur = next;
        }
        collected
    }

    /// Block until the variable holds a value, then return it. Returns
    /// immediately if one was already published.
    pub fn wait(&self) -> VarRef<T> {
        if let Some(snapshot) = self.get() {
            return snapshot;
        }
        self.waiter.wait_until(|| self.get())
    }

    /// Drop the calling thread's cached hold and clear its subscription
    /// cell, if any. Idempotent.
    pub fn release(&self) {
        cache::release_hold(self.id);
    }
}

impl<T: Send + Sync + 'static> Default for SubscriptionVar<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> Drop for SubscriptionVar<T> {
    fn drop(&mut self) {
        cache::drop_entry(self.id);
        // Release the list's references. Wrappers other threads still hold
        // survive this; their list links are never followed again.
        let mut cur = self.head.swap(std::ptr::null_mut(), Ordering::SeqCst);
        while !cur.is_null() {
            // SAFETY: read the link before the release can free the node.
            let next = unsafe { next_of(cur) };
            unsafe { release_ref(cur) };
            cur = next;
        }
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for SubscriptionVar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionVar")
            .field("version", &self.published.load(Ordering::SeqCst))
            .finish()
    }
}

impl<T: Send + Sync + 'static> Variable<T> for SubscriptionVar<T> {
    fn get(&self) -> Option<VarRef<T>> {
        SubscriptionVar::get(self)
    }

    fn set(&self, value: T) -> Version {
        SubscriptionVar::set(self, value)
    }

    fn wait(&self) -> VarRef<T> {
        SubscriptionVar::wait(self)
    }

    fn release(&self) {
        SubscriptionVar::release(self)
    }

    fn version(&self) -> Version {
        SubscriptionVar::version(self)
    }
}

// SAFETY: list mutation is writer-locked, cells and refcounts are atomic;
// values cross threads only as &T or by refcounted handoff.
unsafe impl<T: Send + Sync + 'static> Send for SubscriptionVar<T> {}
unsafe impl<T: Send + Sync + 'static> Sync for SubscriptionVar<T> {}
