//! Per-thread cached holds.
//!
//! Each thread keeps at most one strong reference per variable it has read:
//! the thread's *hold*. A successful `get` transfers the hold from the
//! previously read wrapper to the new one, `release` drops it, and thread
//! exit drops every hold the thread still has, including holds on wrappers
//! whose variable has already been destroyed. For subscription variables the
//! registry entry also keeps the thread's cell lease alive so the cell can be
//! cleared and recycled when the thread goes away.
//!
//! The registry is a single `thread_local!` map keyed by a process-unique
//! variable id, rather than one TLS key per variable.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use foldhash::fast::FixedState;

use crate::cells::CellTable;
use crate::wrapper::{release_ref, WrapperHeader};

/// Process-unique variable identity. Never recycled, so a stale registry
/// entry for a destroyed variable can never be confused with a new one.
pub(crate) type VarId = u64;

static NEXT_VAR_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn alloc_var_id() -> VarId {
    NEXT_VAR_ID.fetch_add(1, Ordering::Relaxed)
}

/// A thread's lease on one subscription cell. Dropping the lease clears the
/// cell and returns it to the free pool.
struct CellLease {
    table: Arc<CellTable>,
    index: usize,
}

impl Drop for CellLease {
    fn drop(&mut self) {
        self.table.retire(self.index);
    }
}

/// Registry entry for one (variable, thread) pair.
#[derive(Default)]
struct Hold {
    /// Owns one strong reference when set.
    wrapper: Option<NonNull<WrapperHeader>>,
    /// Subscription cell, allocated on first slow-path read. Persists until
    /// thread exit or variable drop even while `wrapper` is empty.
    lease: Option<CellLease>,
}

impl Drop for Hold {
    fn drop(&mut self) {
        // The cell must stop naming the wrapper before the reference goes
        // away; a scannable cell may never hold a dangling pointer.
        if let Some(lease) = &self.lease {
            lease.table.clear(lease.index);
        }
        if let Some(w) = self.wrapper.take() {
            // SAFETY: the hold owned this reference.
            unsafe { release_ref(w.as_ptr()) };
        }
    }
}

type Registry = RefCell<HashMap<VarId, Hold, FixedState>>;

thread_local! {
    static REGISTRY: Registry = RefCell::new(HashMap::with_hasher(FixedState::default()));
}

/// The wrapper this thread last read from the given variable, if any.
/// Peeks without transferring anything; the hold keeps the pointer live.
pub(crate) fn cached(id: VarId) -> Option<*mut WrapperHeader> {
    REGISTRY
        .try_with(|r| r.borrow().get(&id).and_then(|h| h.wrapper).map(NonNull::as_ptr))
        .unwrap_or(None)
}

/// Transfer the thread's hold to `hdr`, consuming one strong reference the
/// caller already owns. The previous hold (if any) is released after the
/// registry borrow ends, so a user destructor may re-enter the library.
///
/// On a thread whose TLS is already tearing down the hold cannot be stored;
/// the reference is released immediately and the cache is simply bypassed.
pub(crate) fn store_hold(id: VarId, hdr: *mut WrapperHeader) {
    let prev = REGISTRY.try_with(|r| {
        let mut map = r.borrow_mut();
        let hold = map.entry(id).or_default();
        hold.wrapper.replace(NonNull::new(hdr).expect("null hold"))
    });
    match prev {
        // Releasing the displaced hold also covers the same-wrapper case:
        // the entry keeps exactly one reference either way.
        Ok(Some(old)) => unsafe { release_ref(old.as_ptr()) },
        Ok(None) => {}
        Err(_) => unsafe { release_ref(hdr) },
    }
}

/// Drop the thread's hold on the variable, if any. Idempotent. The cell
/// lease is kept (subscription cells persist until thread exit), but its
/// content is cleared so writers can collect the wrapper.
pub(crate) fn release_hold(id: VarId) {
    let taken = REGISTRY.try_with(|r| {
        let mut map = r.borrow_mut();
        match map.get_mut(&id) {
            Some(hold) => {
                if let Some(lease) = &hold.lease {
                    lease.table.clear(lease.index);
                }
                hold.wrapper.take()
            }
            None => None,
        }
    });
    if let Ok(Some(w)) = taken {
        // SAFETY: ownership taken out of the hold above.
        unsafe { release_ref(w.as_ptr()) };
    }
}

/// Remove the thread's entry for a variable entirely: hold released, cell
/// cleared and recycled. Called by the variable's destructor for the calling
/// thread; other threads' entries linger until those threads exit.
pub(crate) fn drop_entry(id: VarId) {
    let entry = REGISTRY.try_with(|r| r.borrow_mut().remove(&id));
    // Hold::drop and CellLease::drop run here, outside the borrow.
    drop(entry);
}

/// This thread's subscription cell for the given variable.
///
/// `ephemeral == true` means TLS was unavailable (thread teardown) and the
/// caller must `retire` the cell itself once done.
pub(crate) struct LeasedCell {
    pub(crate) index: usize,
    pub(crate) ephemeral: bool,
}

pub(crate) fn lease_cell(id: VarId, table: &Arc<CellTable>) -> LeasedCell {
    let leased = REGISTRY.try_with(|r| {
        let mut map = r.borrow_mut();
        let hold = map.entry(id).or_default();
        match &hold.lease {
            Some(lease) => lease.index,
            None => {
                let index = table.acquire();
                hold.lease = Some(CellLease {
                    table: Arc::clone(table),
                    index,
                });
                index
            }
        }
    });
    match leased {
        Ok(index) => LeasedCell {
            index,
            ephemeral: false,
        },
        Err(_) => LeasedCell {
            index: table.acquire(),
            ephemeral: true,
        },
    }
}
