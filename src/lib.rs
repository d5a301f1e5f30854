//! tsvar: thread-safe variables with near-zero-cost reads and non-blocking
//! writers.
//!
//! A thread-safe variable is a shared cell holding one value: typically
//! configuration, the kind of data that is read constantly and replaced
//! rarely. Readers snapshot the current value for a handful of atomic
//! operations and never wait behind a writer; writers replace the value
//! atomically and never invalidate a snapshot somebody is still using. A
//! superseded value is destroyed exactly once, when its last reference goes
//! away.
//!
//! Every read also parks one reference in the calling thread: the value a
//! thread read stays live in that thread until it reads the variable again,
//! calls `release`, or exits. Repeated reads of an unchanged variable thus
//! cost a single shared load.
//!
//! # Two engines, one contract
//!
//! - [`SlotPairVar`]: two fixed slots and a version counter. O(1) writes, no
//!   allocation on the read path; a writer briefly parks until the previous
//!   slot's last reader leaves.
//! - [`SubscriptionVar`]: a value list plus one hazard-style subscription
//!   cell per reader thread. Readers are lock-free and only loop while the
//!   head is actively churning; writers sweep the list on every publish.
//!
//! Both implement [`Variable`]. Versions are monotonic per variable, and a
//! thread never observes a version older than one it already saw.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::thread;
//! use tsvar::SlotPairVar;
//!
//! let config = Arc::new(SlotPairVar::<u64>::new());
//!
//! let reader = {
//!     let config = Arc::clone(&config);
//!     thread::spawn(move || {
//!         // Blocks until the first value is published.
//!         let snapshot = config.wait();
//!         assert_eq!(snapshot.version(), 1);
//!         *snapshot
//!     })
//! };
//!
//! assert_eq!(config.set(42u64), 1);
//! assert_eq!(reader.join().unwrap(), 42);
//! ```

#![warn(missing_docs)]

mod cache;
mod cells;
mod slot_pair;
mod subscription;
mod waiter;
mod wrapper;

pub use slot_pair::SlotPairVar;
pub use subscription::SubscriptionVar;
pub use wrapper::VarRef;

/// Monotonically increasing publication counter of a variable. Starts at 1
/// for the first published value; 0 means "never set".
pub type Version = u64;

/// The contract both engines expose.
///
/// The engines make opposite trade-offs behind this trait: [`SlotPairVar`]
/// pairs allocation-free reads with parked writers, [`SubscriptionVar`] pairs
/// lock-free readers with sweeping writers. Every guarantee below holds for
/// both.
pub trait Variable<T: Send + Sync + 'static> {
    /// Current value and version, or `None` if nothing was ever published.
    ///
    /// Transfers the calling thread's cached hold to the returned wrapper:
    /// the previously read value is released, the new one stays live in this
    /// thread until the next `get`, [`release`](Variable::release), or
    /// thread exit.
    fn get(&self) -> Option<VarRef<T>>;

    /// Atomically publish `value`, returning the new version (≥ 1).
    ///
    /// Writers are serialized against each other; readers never block on a
    /// writer. Once `set` returns, every subsequent `get` in any thread
    /// observes this version or a newer one.
    fn set(&self, value: T) -> Version;

    /// Block until the variable holds a value, then return it. Returns
    /// immediately if one was already published.
    fn wait(&self) -> VarRef<T>;

    /// Drop the calling thread's cached reference, if any. Idempotent.
    fn release(&self);

    /// The latest published version, 0 if no value has ever been set.
    fn version(&self) -> Version;
}
