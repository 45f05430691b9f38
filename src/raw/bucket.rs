use std::alloc::{self, Layout};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use parking_lot_core::SpinWait;

use super::ptr_lock::{untag, PtrLock, LOCKED_BIT};
use crate::lock::RawSpinLock;
use crate::map::AllocError;

/// A key/value pair owned by exactly one slot.
// align(2) keeps the low bit of pair pointers free for the slot lock flag.
#[repr(align(2))]
pub(crate) struct Pair<K, V> {
    pub key: K,
    pub value: V,
}

impl<K, V> Pair<K, V> {
    /// Heap-allocates a pair, surfacing allocation failure to the caller.
    pub fn alloc(key: K, value: V) -> Result<*mut Pair<K, V>, AllocError> {
        let layout = Layout::new::<Pair<K, V>>();
        if layout.size() == 0 {
            let pair = NonNull::<Pair<K, V>>::dangling().as_ptr();
            unsafe { pair.write(Pair { key, value }) };
            return Ok(pair);
        }

        let pair = unsafe { alloc::alloc(layout) }.cast::<Pair<K, V>>();
        if pair.is_null() {
            return Err(AllocError::new(layout));
        }
        unsafe { pair.write(Pair { key, value }) };
        Ok(pair)
    }

    /// Moves the pair out and releases its allocation.
    ///
    /// # Safety
    ///
    /// `pair` must have come from [`Pair::alloc`] and must not be used again.
    pub unsafe fn into_inner(pair: *mut Pair<K, V>) -> (K, V) {
        let Pair { key, value } = unsafe { ptr::read(pair) };
        let layout = Layout::new::<Pair<K, V>>();
        if layout.size() != 0 {
            unsafe { alloc::dealloc(pair.cast(), layout) };
        }
        (key, value)
    }
}

/// A slot: a lockable pointer to the stored pair plus the pair's cached hash.
///
/// An empty slot is all zeroes: null pointer, unlocked, hash zero. The hash is
/// written only while the slot lock is held and is meaningful only while the
/// pointer is non-null; unlocked scans treat both as hints and must recheck
/// under the lock.
pub(crate) struct Slot<K, V> {
    pub pair: PtrLock<Pair<K, V>>,
    hash: AtomicU64,
}

impl<K, V> Slot<K, V> {
    /// The cached hash. Exact under the slot lock, a hint otherwise.
    #[inline]
    pub fn hash(&self) -> u64 {
        self.hash.load(Ordering::Relaxed)
    }

    /// Marks a claimed, empty slot as reserved for `hash`. Requires the slot
    /// lock. Same-hash scans now block on this slot until the reservation is
    /// published or released, serializing racing inserts of one key.
    #[inline]
    pub fn reserve(&self, hash: u64) {
        self.hash.store(hash, Ordering::Relaxed);
    }

    /// Returns a reserved slot to the empty state and unlocks it.
    #[inline]
    pub fn release(&self) {
        self.hash.store(0, Ordering::Relaxed);
        self.pair.unlock();
    }

    /// Publishes a pair into a reserved slot, leaving it locked.
    ///
    /// The pointer store is a release: any thread that observes it with
    /// acquire ordering also observes the pair's contents and the hash.
    #[inline]
    pub fn publish(&self, pair: *mut Pair<K, V>, hash: u64) {
        self.hash.store(hash, Ordering::Relaxed);
        self.pair.set(pair);
    }

    /// Detaches the pair: zeroes the hash and atomically empties-and-unlocks
    /// the cell. Requires the slot lock; the caller owns the returned pair.
    #[inline]
    pub fn detach(&self) -> *mut Pair<K, V> {
        self.hash.store(0, Ordering::Relaxed);
        self.pair.take()
    }
}

// A bucket's first slot allocation.
const MIN_SLOTS: usize = 4;

/// Grows a slot count by half again, from a small floor.
pub(crate) fn grow(count: usize) -> usize {
    (count + count / 2).max(MIN_SLOTS)
}

/// One bucket: a slot array plus resize coordination state.
///
/// `entered`/`exited` count threads currently using the slot array. They are
/// monotonically increasing and wrap-safe: only their equality is ever
/// examined. `items` and `count` change only while `resize_lock` is held and
/// the counters are equal, so any active using-scope pins both.
pub(crate) struct Bucket<K, V> {
    entered: AtomicU32,
    exited: AtomicU32,
    resize_lock: RawSpinLock,
    count: AtomicUsize,
    items: AtomicPtr<Slot<K, V>>,
}

impl<K, V> Default for Bucket<K, V> {
    fn default() -> Bucket<K, V> {
        Bucket {
            entered: AtomicU32::new(0),
            exited: AtomicU32::new(0),
            resize_lock: RawSpinLock::new(),
            count: AtomicUsize::new(0),
            items: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

/// Pins a bucket's slot array against resize for its lifetime.
pub(crate) struct Using<'a, K, V> {
    bucket: &'a Bucket<K, V>,
}

impl<'a, K, V> Using<'a, K, V> {
    /// The slot array. Stable for the lifetime of the scope.
    #[inline]
    pub fn raw(&self) -> (*const Slot<K, V>, usize) {
        let count = self.bucket.count.load(Ordering::Acquire);
        let items = self.bucket.items.load(Ordering::Acquire);
        if items.is_null() {
            (items, 0)
        } else {
            (items, count)
        }
    }
}

impl<K, V> Drop for Using<'_, K, V> {
    #[inline]
    fn drop(&mut self) {
        self.bucket.exit();
    }
}

impl<K, V> Bucket<K, V> {
    /// Opens a using-scope: pins `items`/`count` until the scope is dropped.
    ///
    /// Must not be called while already holding a scope or a slot lock on
    /// this bucket: if a resize is pending we wait for it here, and the
    /// resizer is waiting for every prior scope to close.
    pub fn enter(&self) -> Using<'_, K, V> {
        let mut spin = SpinWait::new();
        loop {
            // Seq-cst pairs this increment/check with the resizer's
            // lock-acquire/counter-read: either we observe the resize and
            // back out, or the resizer observes our entry and waits for it.
            self.entered.fetch_add(1, Ordering::SeqCst);
            if !self.resize_lock.is_locked_ordered() {
                return Using { bucket: self };
            }

            // A resize is pending. Take ourselves out of the in-flight count
            // and wait for it to finish before trying again.
            self.exit();
            while self.resize_lock.is_locked() {
                if !spin.spin() {
                    std::thread::yield_now();
                }
            }
        }
    }

    #[inline]
    pub(crate) fn exit(&self) {
        // Release: the resizer's acquire reads of `exited` make our slot
        // accesses visible before it touches the array.
        self.exited.fetch_add(1, Ordering::Release);
    }

    // Requires resize_lock: entrants back out, so the counters can only
    // converge.
    fn wait_quiescent(&self) {
        let mut spin = SpinWait::new();
        loop {
            // `exited` must be sampled first: sampling `entered` first can
            // pair a stale entered with a fresh exited and report quiescence
            // while a scope is still in flight.
            let exited = self.exited.load(Ordering::SeqCst);
            let entered = self.entered.load(Ordering::SeqCst);
            if entered == exited {
                return;
            }
            if !spin.spin() {
                std::thread::yield_now();
            }
        }
    }

    /// Grows the slot array to `new_count` slots. Counts never shrink; a
    /// smaller or equal request is a no-op (a racing grow already won).
    ///
    /// On allocation failure the bucket is left unchanged.
    pub fn resize(&self, new_count: usize) -> Result<(), AllocError> {
        let _guard = self.resize_lock.guard();

        let count = self.count.load(Ordering::Relaxed);
        if new_count <= count {
            return Ok(());
        }
        self.wait_quiescent();

        let new_layout = Self::layout(new_count);
        let items = self.items.load(Ordering::Relaxed);
        let new_items = if items.is_null() {
            unsafe { alloc::alloc_zeroed(new_layout) }
        } else {
            unsafe { alloc::realloc(items.cast(), Self::layout(count), new_layout.size()) }
        }
        .cast::<Slot<K, V>>();

        if new_items.is_null() {
            return Err(AllocError::new(new_layout));
        }
        if !items.is_null() {
            // Zero the grown tail; an all-zero slot is empty.
            unsafe { new_items.add(count).write_bytes(0, new_count - count) };
        }

        self.items.store(new_items, Ordering::Release);
        self.count.store(new_count, Ordering::Release);
        Ok(())
    }

    /// Empties the bucket: waits out in-flight users, drops every live pair,
    /// and frees the slot array. Returns the number of pairs dropped.
    pub fn clear(&self) -> usize {
        let _guard = self.resize_lock.guard();
        self.wait_quiescent();

        let items = self.items.load(Ordering::Relaxed);
        if items.is_null() {
            return 0;
        }
        let count = self.count.load(Ordering::Relaxed);

        let mut dropped = 0;
        for offset in 0..count {
            let word = unsafe { &*items.add(offset) }.pair.load(Ordering::Relaxed);
            // Quiescent and resize-locked: no slot can be held.
            debug_assert!(word.addr() & LOCKED_BIT == 0, "clear of a locked slot");
            let pair = untag(word);
            if !pair.is_null() {
                drop(unsafe { Pair::into_inner(pair) });
                dropped += 1;
            }
        }

        unsafe { alloc::dealloc(items.cast(), Self::layout(count)) };
        self.items.store(ptr::null_mut(), Ordering::Release);
        self.count.store(0, Ordering::Release);
        dropped
    }

    fn layout(count: usize) -> Layout {
        Layout::array::<Slot<K, V>>(count).expect("capacity overflow")
    }
}

impl<K, V> Drop for Bucket<K, V> {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_grows_only() {
        let bucket = Bucket::<u32, u32>::default();
        bucket.resize(4).unwrap();
        bucket.resize(2).unwrap();
        {
            let scope = bucket.enter();
            assert_eq!(scope.raw().1, 4);
        }
        bucket.resize(6).unwrap();
        {
            let scope = bucket.enter();
            assert_eq!(scope.raw().1, 6);
        }
        assert_eq!(bucket.clear(), 0);
    }

    #[test]
    fn grow_floors() {
        assert_eq!(grow(0), MIN_SLOTS);
        assert_eq!(grow(4), 6);
        assert_eq!(grow(6), 9);
    }
}
