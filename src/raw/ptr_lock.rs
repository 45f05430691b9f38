use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use parking_lot_core::SpinWait;

/// This bit is set in the cell word while the cell is locked by some thread.
pub(crate) const LOCKED_BIT: usize = 0b1;

/// Returns the pointer with the lock bit cleared.
#[inline(always)]
pub(crate) fn untag<T>(ptr: *mut T) -> *mut T {
    ptr.map_addr(|addr| addr & !LOCKED_BIT)
}

/// A word-sized cell packing an owned pointer and a lock flag together.
///
/// The low bit of the word is the lock flag, so `T` must have an alignment of
/// at least 2. The pointer bits are meaningful only to the thread holding the
/// lock; unlocked readers may load the word, but only as a hint.
///
/// The cell does not drop its pointee. Whoever empties the cell, via [`take`]
/// or by replacing the pointer under the lock, owns the extracted value.
///
/// [`take`]: PtrLock::take
pub(crate) struct PtrLock<T> {
    state: AtomicPtr<T>,
}

impl<T> PtrLock<T> {
    // Slots materialize their cells from zeroed storage; this exists for
    // standalone use.
    #[allow(dead_code)]
    pub const fn new() -> PtrLock<T> {
        PtrLock {
            state: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Loads the raw word: the pointer together with its lock bit.
    #[inline]
    pub fn load(&self, ordering: Ordering) -> *mut T {
        self.state.load(ordering)
    }

    /// Attempts to acquire the lock, preserving the pointer bits.
    ///
    /// Acquisitions are seq-cst so that a claim of an empty cell is ordered
    /// against the claim scans of racing inserters, not just against other
    /// acquisitions of the same cell.
    #[inline]
    pub fn try_lock(&self) -> bool {
        let mut state = self.state.load(Ordering::Relaxed);
        loop {
            if state.addr() & LOCKED_BIT != 0 {
                return false;
            }

            let locked = state.map_addr(|addr| addr | LOCKED_BIT);
            match self.state.compare_exchange_weak(
                state,
                locked,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(found) => state = found,
            }
        }
    }

    #[inline]
    pub fn lock(&self) {
        if !self.try_lock() {
            self.lock_slow();
        }
    }

    #[cold]
    fn lock_slow(&self) {
        let mut spin = SpinWait::new();
        loop {
            if self.state.load(Ordering::Relaxed).addr() & LOCKED_BIT == 0 && self.try_lock() {
                return;
            }
            if !spin.spin() {
                std::thread::yield_now();
            }
        }
    }

    /// Releases the lock, preserving the pointer bits.
    ///
    /// Calling this without holding the lock is a contract violation.
    #[inline]
    pub fn unlock(&self) {
        let state = self.state.load(Ordering::Relaxed);
        debug_assert!(
            state.addr() & LOCKED_BIT != 0,
            "unlock of an unlocked cell"
        );
        // Only the holder mutates a locked word, so a plain store cannot lose
        // a concurrent update.
        self.state.store(untag(state), Ordering::Release);
    }

    /// Returns whether the cell is locked. A hint: the answer may be stale by
    /// the time it is observed.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed).addr() & LOCKED_BIT != 0
    }

    /// Returns the payload pointer. Valid only while holding the lock.
    #[inline]
    pub fn get(&self) -> *mut T {
        debug_assert!(self.is_locked(), "read of an unlocked cell");
        untag(self.state.load(Ordering::Relaxed))
    }

    /// Stores a new payload pointer, keeping the cell locked.
    ///
    /// The release ordering publishes the pointee: a reader that observes the
    /// new pointer with acquire ordering also observes its contents.
    #[inline]
    pub fn set(&self, ptr: *mut T) {
        debug_assert!(self.is_locked(), "write to an unlocked cell");
        self.state
            .store(ptr.map_addr(|addr| addr | LOCKED_BIT), Ordering::Release);
    }

    /// Extracts the payload, leaving the cell empty and unlocked in a single
    /// atomic store. Requires the lock; ownership of the pointee moves to the
    /// caller.
    #[inline]
    pub fn take(&self) -> *mut T {
        let state = self.state.load(Ordering::Relaxed);
        debug_assert!(state.addr() & LOCKED_BIT != 0, "detach of an unlocked cell");
        self.state.store(ptr::null_mut(), Ordering::Release);
        untag(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_cycle() {
        let cell = PtrLock::<u64>::new();
        assert!(!cell.is_locked());
        assert!(cell.try_lock());
        assert!(!cell.try_lock());
        assert!(cell.get().is_null());

        let value = Box::into_raw(Box::new(7u64));
        cell.set(value);
        assert!(cell.is_locked());
        assert_eq!(cell.get(), value);

        let detached = cell.take();
        assert_eq!(detached, value);
        assert!(!cell.is_locked());
        assert!(cell.try_lock());
        assert!(cell.get().is_null());
        cell.unlock();

        drop(unsafe { Box::from_raw(detached) });
    }
}
