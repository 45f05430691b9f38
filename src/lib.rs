//! Opportunistic hardware lock elision and a mostly wait-free concurrent
//! hash map.
//!
//! The crate is built around two primitives:
//!
//! - [`SpinLock`] (and the word-only [`RawSpinLock`]): a spinlock whose
//!   [`transact`](SpinLock::transact) scope runs its body inside a hardware
//!   memory transaction when the CPU supports one, falling back to the lock
//!   after a few aborts. A committed scope never touches the lock word, so
//!   read-mostly critical sections elide the lock entirely.
//! - [`ConcurrentMap`]: a bucketed hash map storing each pair behind a
//!   word-sized pointer-plus-lock cell, with enter/exit counters coordinating
//!   in-place bucket growth with readers. Lookups, inserts, and removals are
//!   wait-free while they touch distinct slots.
//!
//! Hardware-transaction support is probed once at startup; the [`htm`] module
//! exposes the probe and a force-off hook so the optimistic and pessimistic
//! paths can be compared. Both paths are observationally equivalent.
//!
//! # Examples
//!
//! ```
//! use elide::ConcurrentMap;
//!
//! let map = ConcurrentMap::builder().buckets(64).build();
//! map.insert(1, "one");
//! map.insert(2, "two");
//!
//! assert_eq!(map.get(&1), Some("one"));
//! assert_eq!(map.len(), 2);
//! assert_eq!(map.remove(&2), Some((2, "two")));
//! ```

pub mod htm;
mod lock;
mod map;
mod raw;

pub use lock::{RawSpinGuard, RawSpinLock, SpinLock, SpinLockGuard, TRANSACT_RETRIES};
pub use map::{
    AllocError, ConcurrentMap, ConcurrentMapBuilder, Entry, Iter, DEFAULT_BUCKETS,
};
