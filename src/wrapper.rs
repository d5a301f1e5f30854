//! Refcounted envelope around one published value.
//!
//! Every value handed to a variable is boxed into a `Wrapper<T>`: a
//! `#[repr(C)]` allocation whose first field is a type-erased
//! [`WrapperHeader`]. Engines, subscription cells and the per-thread cache
//! all traffic in `*mut WrapperHeader`; the header carries everything needed
//! to release a reference without knowing `T`: the atomic count, the
//! published version, the value-list link, and a monomorphized destroy
//! function installed at allocation time.
//!
//! Reference accounting:
//! - each engine slot / value-list node owns one reference,
//! - each live [`VarRef`] owns one,
//! - each per-thread cached hold owns one.
//!
//! The wrapper is destroyed exactly when the count hits zero, at which point
//! the user destructor (or `T`'s own `Drop`) runs exactly once. Wrappers are
//! independent allocations and routinely outlive the variable that published
//! them.

use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use crate::Version;

/// Shared destructor callable, cloned into every wrapper a variable creates.
pub(crate) type Destructor<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Type-erased release hook; reconstructs the full `Wrapper<T>` and frees it.
type DestroyFn = unsafe fn(*mut WrapperHeader);

/// Type-erased prefix of every `Wrapper<T>`. Must stay at offset 0.
#[repr(C)]
pub(crate) struct WrapperHeader {
    /// Strong reference count. The wrapper is freed on the 1 -> 0 transition.
    nref: AtomicU32,
    /// Published version, assigned under the writer lock before publication.
    /// Never zero once the wrapper is visible to readers.
    version: Version,
    /// Value-list link (subscription engine); newest-to-oldest. Null in the
    /// slot-pair engine.
    next: AtomicPtr<WrapperHeader>,
    destroy: DestroyFn,
}

#[repr(C)]
pub(crate) struct Wrapper<T> {
    hdr: WrapperHeader,
    dtor: Option<Destructor<T>>,
    value: ManuallyDrop<T>,
}

impl<T: Send + Sync + 'static> Wrapper<T> {
    /// Heap-allocate a wrapper with `nref == 0` and no version.
    ///
    /// The writer sets the version and the initial reference count while the
    /// wrapper is still private to it, then publishes.
    pub(crate) fn alloc(value: T, dtor: Option<Destructor<T>>) -> *mut Wrapper<T> {
        Box::into_raw(Box::new(Wrapper {
            hdr: WrapperHeader {
                nref: AtomicU32::new(0),
                version: 0,
                next: AtomicPtr::new(std::ptr::null_mut()),
                destroy: destroy_wrapper::<T>,
            },
            dtor,
            value: ManuallyDrop::new(value),
        }))
    }
}

/// Monomorphized destroy hook. Takes the value out of the envelope, feeds it
/// to the user destructor (or drops it), then frees the allocation.
///
/// # Safety
/// `hdr` must point to a live `Wrapper<T>` allocated by [`Wrapper::alloc`]
/// whose reference count has reached zero.
unsafe fn destroy_wrapper<T: Send + Sync + 'static>(hdr: *mut WrapperHeader) {
    let mut wrapper = unsafe { Box::from_raw(hdr as *mut Wrapper<T>) };
    // SAFETY: the value was initialized in alloc() and is taken exactly once;
    // ManuallyDrop prevents the Box drop below from touching it again.
    let value = unsafe { ManuallyDrop::take(&mut wrapper.value) };
    match wrapper.dtor.take() {
        Some(dtor) => dtor(value),
        None => drop(value),
    }
}

/// Add one strong reference.
///
/// # Safety
/// `hdr` must point to a live wrapper on which the caller can already rely,
/// either through an existing reference it owns or through a pinned slot /
/// verified subscription cell.
#[inline]
pub(crate) unsafe fn add_ref(hdr: *mut WrapperHeader) {
    let old = unsafe { &(*hdr).nref }.fetch_add(1, Ordering::SeqCst);
    debug_assert!(old != u32::MAX);
}

/// Drop one strong reference; destroys the wrapper on the last release.
///
/// Runs the user destructor inline, so the caller must not hold any of the
/// library's locks.
///
/// # Safety
/// The caller must own the reference being released.
#[inline]
pub(crate) unsafe fn release_ref(hdr: *mut WrapperHeader) {
    let old = unsafe { &(*hdr).nref }.fetch_sub(1, Ordering::SeqCst);
    assert!(old != 0, "wrapper reference count underflow");
    if old == 1 {
        unsafe { ((*hdr).destroy)(hdr) };
    }
}

/// Read the published version.
///
/// # Safety
/// `hdr` must point to a live, published wrapper.
#[inline]
pub(crate) unsafe fn version_of(hdr: *const WrapperHeader) -> Version {
    unsafe { (*hdr).version }
}

/// Set the version while the wrapper is still private to the writer.
///
/// # Safety
/// Must be called before publication; no other thread may observe `hdr` yet.
#[inline]
pub(crate) unsafe fn set_version(hdr: *mut WrapperHeader, version: Version) {
    unsafe { (*hdr).version = version };
}

/// Set the initial reference count while the wrapper is still private.
///
/// # Safety
/// Must be called before publication; no other thread may observe `hdr` yet.
#[inline]
pub(crate) unsafe fn set_refs(hdr: *mut WrapperHeader, n: u32) {
    unsafe { &(*hdr).nref }.store(n, Ordering::SeqCst);
}

/// Value-list link accessors (subscription engine; mutated under the writer
/// lock only, loaded by the variable's destructor).
#[inline]
pub(crate) unsafe fn next_of(hdr: *const WrapperHeader) -> *mut WrapperHeader {
    unsafe { &(*hdr).next }.load(Ordering::SeqCst)
}

#[inline]
pub(crate) unsafe fn set_next(hdr: *mut WrapperHeader, next: *mut WrapperHeader) {
    unsafe { &(*hdr).next }.store(next, Ordering::SeqCst);
}

// ---------------------------------------------------------------------------
// VarRef — RAII read guard
// ---------------------------------------------------------------------------

/// A snapshot of a variable's value, returned by `get` and `wait`.
///
/// Dereferences to `&T` and reports the snapshot's [`version`](VarRef::version).
/// The referenced value is guaranteed live for the lifetime of this handle:
/// it owns one strong reference on the wrapper, released on drop. Cloning
/// adds a reference; the handle may be sent to and dropped on any thread.
///
/// A `VarRef` keeps its snapshot valid even after the value is superseded by
/// a later `set` or the variable itself is dropped.
pub struct VarRef<T: Send + Sync + 'static> {
    wrapper: NonNull<Wrapper<T>>,
    _marker: PhantomData<Wrapper<T>>,
}

impl<T: Send + Sync + 'static> VarRef<T> {
    /// Wrap an owned reference.
    ///
    /// # Safety
    /// `hdr` must point to a live, published `Wrapper<T>` and the caller must
    /// transfer ownership of exactly one strong reference.
    pub(crate) unsafe fn from_owned(hdr: *mut WrapperHeader) -> Self {
        debug_assert!(!hdr.is_null());
        Self {
            // SAFETY: checked non-null above; layout guaranteed by repr(C).
            wrapper: unsafe { NonNull::new_unchecked(hdr as *mut Wrapper<T>) },
            _marker: PhantomData,
        }
    }

    /// The version this snapshot was published as (always ≥ 1).
    #[inline]
    pub fn version(&self) -> Version {
        unsafe { self.wrapper.as_ref() }.hdr.version
    }
}

impl<T: Send + Sync + 'static> Deref for VarRef<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: the owned reference keeps the wrapper alive.
        let wrapper = unsafe { self.wrapper.as_ref() };
        &wrapper.value
    }
}

impl<T: Send + Sync + 'static> Clone for VarRef<T> {
    fn clone(&self) -> Self {
        // SAFETY: self owns a reference, so the wrapper is live.
        unsafe { add_ref(self.wrapper.as_ptr() as *mut WrapperHeader) };
        Self {
            wrapper: self.wrapper,
            _marker: PhantomData,
        }
    }
}

impl<T: Send + Sync + 'static> Drop for VarRef<T> {
    fn drop(&mut self) {
        // SAFETY: releases the reference taken at construction/clone.
        unsafe { release_ref(self.wrapper.as_ptr() as *mut WrapperHeader) };
    }
}

impl<T: Send + Sync + 'static + fmt::Debug> fmt::Debug for VarRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: Send + Sync + 'static + fmt::Display> fmt::Display for VarRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}

// SAFETY: the reference count is atomic and the value is only handed out
// behind &T, so the handle moves and shares freely when T allows it.
unsafe impl<T: Send + Sync + 'static> Send for VarRef<T> {}
unsafe impl<T: Send + Sync + 'static> Sync for VarRef<T> {}
