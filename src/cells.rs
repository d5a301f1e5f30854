//! Growable table of subscription cells.
//!
//! One cell per subscribed reader thread, holding the wrapper that thread is
//! currently protecting. The table never moves cells: capacity grows by
//! installing progressively larger buckets with a pointer CAS, so readers
//! publish into their cell and writers scan the table without any locking.
//!
//! Cell ownership is claimed with an `inuse` CAS and returned on thread exit,
//! so short-lived threads recycle cells instead of growing the table forever.

use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::wrapper::WrapperHeader;

/// Bucket `b` holds `FIRST_BUCKET << b` cells; capacity doubles per bucket.
const FIRST_BUCKET: usize = 32;
const BUCKETS: usize = 16;

pub(crate) struct Cell {
    /// The wrapper the owning thread currently protects; null when idle.
    value: AtomicPtr<WrapperHeader>,
    /// 1 while a thread owns this cell.
    inuse: AtomicU32,
}

impl Cell {
    fn new() -> Self {
        Self {
            value: AtomicPtr::new(std::ptr::null_mut()),
            inuse: AtomicU32::new(0),
        }
    }
}

pub(crate) struct CellTable {
    buckets: [AtomicPtr<CachePadded<Cell>>; BUCKETS],
    /// Next never-assigned cell index. Ownership is still decided by the
    /// `inuse` CAS; this only drives growth.
    next_index: AtomicUsize,
}

/// Map a flat index to (bucket, offset, bucket length).
#[inline]
fn locate(index: usize) -> (usize, usize, usize) {
    let n = index / FIRST_BUCKET + 1;
    let bucket = (usize::BITS - 1 - n.leading_zeros()) as usize;
    let offset = index - FIRST_BUCKET * ((1 << bucket) - 1);
    (bucket, offset, FIRST_BUCKET << bucket)
}

impl CellTable {
    pub(crate) fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicPtr::new(std::ptr::null_mut())),
            next_index: AtomicUsize::new(0),
        }
    }

    /// Claim a cell for the calling thread.
    pub(crate) fn acquire(&self) -> usize {
        loop {
            // Recycle a retired cell if one exists.
            if let Some(index) = self.scan_free() {
                return index;
            }
            // Extend: take a fresh index and claim it. The claim can lose to
            // a concurrent recycler that scanned past `next_index`; the cell
            // is theirs then and we go around again.
            let index = self.next_index.fetch_add(1, Ordering::SeqCst);
            assert!(
                index < FIRST_BUCKET * ((1 << BUCKETS) - 1),
                "subscription cell table exhausted"
            );
            let cell = self.ensure(index);
            if cell
                .inuse
                .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                cell.value.store(std::ptr::null_mut(), Ordering::SeqCst);
                return index;
            }
        }
    }

    /// Look for a retired cell below the allocation high-water mark. Cells
    /// past the mark belong to threads mid-claim and are left alone.
    fn scan_free(&self) -> Option<usize> {
        let mark = self.next_index.load(Ordering::SeqCst);
        for (b, bucket) in self.buckets.iter().enumerate() {
            let base = FIRST_BUCKET * ((1 << b) - 1);
            if base >= mark {
                break;
            }
            let ptr = bucket.load(Ordering::SeqCst);
            if ptr.is_null() {
                continue;
            }
            let len = (FIRST_BUCKET << b).min(mark - base);
            // SAFETY: installed buckets are live for the table's lifetime.
            let cells = unsafe { std::slice::from_raw_parts(ptr, len) };
            for (i, cell) in cells.iter().enumerate() {
                if cell.inuse.load(Ordering::SeqCst) == 0
                    && cell
                        .inuse
                        .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                {
                    cell.value.store(std::ptr::null_mut(), Ordering::SeqCst);
                    return Some(base + i);
                }
            }
        }
        None
    }

    /// Install the bucket holding `index` if nobody has yet.
    fn ensure(&self, index: usize) -> &CachePadded<Cell> {
        let (b, offset, len) = locate(index);
        let slot = &self.buckets[b];
        let mut ptr = slot.load(Ordering::SeqCst);
        if ptr.is_null() {
            let fresh: Box<[CachePadded<Cell>]> =
                (0..len).map(|_| CachePadded::new(Cell::new())).collect();
            let raw = Box::into_raw(fresh) as *mut CachePadded<Cell>;
            match slot.compare_exchange(
                std::ptr::null_mut(),
                raw,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => ptr = raw,
                Err(winner) => {
                    // SAFETY: reconstructing the allocation we just leaked.
                    drop(unsafe {
                        Box::from_raw(std::slice::from_raw_parts_mut(raw, len))
                    });
                    ptr = winner;
                }
            }
        }
        // SAFETY: ptr points at `len` live cells; offset < len by locate().
        unsafe { &*ptr.add(offset) }
    }

    #[inline]
    fn cell(&self, index: usize) -> &CachePadded<Cell> {
        let (b, offset, len) = locate(index);
        let ptr = self.buckets[b].load(Ordering::SeqCst);
        assert!(!ptr.is_null() && offset < len, "unallocated cell index");
        // SAFETY: bucket installed (checked) and offset in range.
        unsafe { &*ptr.add(offset) }
    }

    /// Publish the wrapper this cell's owner is protecting.
    #[inline]
    pub(crate) fn publish(&self, index: usize, hdr: *mut WrapperHeader) {
        self.cell(index).value.store(hdr, Ordering::SeqCst);
    }

    /// Drop the protection without giving up the cell.
    #[inline]
    pub(crate) fn clear(&self, index: usize) {
        self.cell(index)
            .value
            .store(std::ptr::null_mut(), Ordering::SeqCst);
    }

    /// Return the cell to the free pool (thread exit).
    pub(crate) fn retire(&self, index: usize) {
        let cell = self.cell(index);
        cell.value.store(std::ptr::null_mut(), Ordering::SeqCst);
        cell.inuse.store(0, Ordering::SeqCst);
    }

    /// Writer-side scan: does any cell currently protect `hdr`?
    pub(crate) fn protects(&self, hdr: *const WrapperHeader) -> bool {
        for (b, bucket) in self.buckets.iter().enumerate() {
            let ptr = bucket.load(Ordering::SeqCst);
            if ptr.is_null() {
                continue;
            }
            let len = FIRST_BUCKET << b;
            // SAFETY: installed buckets are live for the table's lifetime.
            let cells = unsafe { std::slice::from_raw_parts(ptr, len) };
            if cells
                .iter()
                .any(|c| std::ptr::eq(c.value.load(Ordering::SeqCst), hdr))
            {
                return true;
            }
        }
        false
    }
}

impl Drop for CellTable {
    fn drop(&mut self) {
        for (b, bucket) in self.buckets.iter().enumerate() {
            let ptr = bucket.load(Ordering::SeqCst);
            if !ptr.is_null() {
                let len = FIRST_BUCKET << b;
                // SAFETY: installed by `ensure`, freed exactly once here.
                drop(unsafe { Box::from_raw(std::slice::from_raw_parts_mut(ptr, len)) });
            }
        }
    }
}
