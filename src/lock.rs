//! Spinlocks with an optional hardware-transactional fast path.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot_core::SpinWait;

use crate::htm::{self, TransactResult};

/// The number of hardware-transaction attempts a [`transact`] scope makes
/// before falling back to taking the lock.
///
/// [`transact`]: RawSpinLock::transact
pub const TRANSACT_RETRIES: usize = 3;

/// A test-and-test-and-set spinlock over a single word.
///
/// Zero means unlocked, non-zero means locked. There is no fairness and no
/// owner tracking: any thread may call [`unlock`], and doing so without
/// holding the lock is a contract violation caught only by a debug assertion.
/// For a lock that protects data and enforces the protocol through guards,
/// see [`SpinLock`].
///
/// Contended acquisitions spin briefly and then yield to the scheduler; the
/// lock never blocks in the OS.
///
/// # Examples
///
/// ```
/// use elide::RawSpinLock;
///
/// let lock = RawSpinLock::new();
/// assert!(lock.try_lock());
/// assert!(!lock.try_lock());
/// lock.unlock();
///
/// let guard = lock.guard();
/// assert!(!lock.try_lock());
/// drop(guard);
/// ```
///
/// [`unlock`]: RawSpinLock::unlock
pub struct RawSpinLock {
    state: AtomicBool,
}

impl RawSpinLock {
    /// Creates an unlocked spinlock.
    pub const fn new() -> RawSpinLock {
        RawSpinLock {
            state: AtomicBool::new(false),
        }
    }

    /// Attempts to acquire the lock without spinning. Returns whether the
    /// lock was acquired.
    #[inline]
    pub fn try_lock(&self) -> bool {
        // Seq-cst on success: the bucket enter/resize protocol orders this
        // acquisition against the entered counter (see raw::bucket).
        self.state
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    }

    /// Acquires the lock, spinning with a scheduler yield once the spin
    /// budget is exhausted.
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
            if !self.state.load(Ordering::Relaxed) && self.try_lock() {
                return;
            }
            if !spin.spin() {
                std::thread::yield_now();
            }
        }
    }

    /// Releases the lock.
    ///
    /// Calling this without holding the lock is a contract violation; debug
    /// builds assert, release builds leave the protected protocol undefined.
    #[inline]
    pub fn unlock(&self) {
        debug_assert!(
            self.state.load(Ordering::Relaxed),
            "unlock of an unlocked spinlock"
        );
        self.state.store(false, Ordering::Release);
    }

    /// Returns whether the lock is currently held. A relaxed observation,
    /// useful only as a hint; it is not a synchronization point.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed)
    }

    // Seq-cst observation for the bucket enter/resize handshake.
    #[inline]
    pub(crate) fn is_locked_ordered(&self) -> bool {
        self.state.load(Ordering::SeqCst)
    }

    /// Acquires the lock and returns a guard that releases it when dropped.
    #[inline]
    pub fn guard(&self) -> RawSpinGuard<'_> {
        self.lock();
        RawSpinGuard { lock: self }
    }

    /// Runs `body` atomically with respect to this lock.
    ///
    /// With hardware transactions available, the body is attempted inside a
    /// transaction that reads the lock word: it commits only if the lock was
    /// free for the duration, and any concurrent acquisition aborts it. After
    /// [`TRANSACT_RETRIES`] aborts, or with no hardware support, the body
    /// runs under the lock. Either way, a completed scope is indistinguishable
    /// from a critical section under this lock.
    ///
    /// The body may run several times, so it must be reentrancy-safe and must
    /// not acquire this lock, perform I/O, or have any other effect that
    /// cannot be discarded on abort. This is a caller contract; it is not
    /// enforced.
    ///
    /// A panic out of the body is propagated; on the pessimistic path the
    /// lock is released first.
    #[inline]
    pub fn transact<R>(&self, body: impl FnMut() -> R) -> R {
        self.transact_retries(TRANSACT_RETRIES, body)
    }

    /// [`transact`](RawSpinLock::transact) with an explicit retry budget.
    pub fn transact_retries<R>(&self, retries: usize, mut body: impl FnMut() -> R) -> R {
        if htm::has_support() {
            for _ in 0..retries {
                match htm::try_transact(|| {
                    // Bring the lock word into the transaction's read set: a
                    // current holder must exclude us, and a later acquisition
                    // conflicts and aborts us.
                    if self.is_locked() {
                        htm::abort();
                    }
                    body()
                }) {
                    TransactResult::Committed(value) => return value,
                    // Let a pessimistic holder finish before retrying, or the
                    // retry budget burns down against the same holder.
                    TransactResult::Aborted => self.wait_unlocked(),
                }
            }
        }

        let _guard = self.guard();
        body()
    }

    fn wait_unlocked(&self) {
        let mut spin = SpinWait::new();
        while self.is_locked() {
            if !spin.spin() {
                std::thread::yield_now();
            }
        }
    }
}

impl Default for RawSpinLock {
    fn default() -> RawSpinLock {
        RawSpinLock::new()
    }
}

impl fmt::Debug for RawSpinLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawSpinLock")
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// Releases a [`RawSpinLock`] on drop.
#[must_use = "dropping a guard immediately releases the lock"]
pub struct RawSpinGuard<'a> {
    lock: &'a RawSpinLock,
}

impl Drop for RawSpinGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// A value protected by a [`RawSpinLock`].
///
/// Access is through RAII guards or through [`transact`], which uses a
/// hardware transaction instead of the lock when one commits.
///
/// # Examples
///
/// ```
/// use elide::SpinLock;
///
/// let counter = SpinLock::new(0);
/// *counter.lock() += 1;
/// let total = counter.transact(|n| {
///     *n += 1;
///     *n
/// });
/// assert_eq!(total, 2);
/// ```
///
/// [`transact`]: SpinLock::transact
pub struct SpinLock<T: ?Sized> {
    raw: RawSpinLock,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new unlocked `SpinLock` protecting `data`.
    pub const fn new(data: T) -> SpinLock<T> {
        SpinLock {
            raw: RawSpinLock::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Consumes the lock, returning the protected value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires the lock, returning a guard that dereferences to the data.
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.raw.lock();
        SpinLockGuard { lock: self }
    }

    /// Attempts to acquire the lock without spinning.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self.raw.try_lock() {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    /// Returns whether the lock is currently held. A hint only.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    /// Returns a mutable reference to the data. Exclusive access makes the
    /// lock unnecessary.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Runs `body` on the protected data, atomically with respect to this
    /// lock. See [`RawSpinLock::transact`] for the protocol and the caller
    /// contract on `body`.
    #[inline]
    pub fn transact<R>(&self, mut body: impl FnMut(&mut T) -> R) -> R {
        // Safety: on the pessimistic path the lock is held. On the optimistic
        // path the transaction read the lock word and saw it free, so a
        // commit certifies that no guard existed for the duration and that
        // racing transactions were serialized by the hardware; an abort
        // discards every write the body made.
        self.raw.transact(|| body(unsafe { &mut *self.data.get() }))
    }

    /// [`transact`](SpinLock::transact) with an explicit retry budget.
    #[inline]
    pub fn transact_retries<R>(&self, retries: usize, mut body: impl FnMut(&mut T) -> R) -> R {
        self.raw
            .transact_retries(retries, || body(unsafe { &mut *self.data.get() }))
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> SpinLock<T> {
        SpinLock::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("SpinLock").field("data", &&*guard).finish(),
            None => f.debug_struct("SpinLock").field("data", &"<locked>").finish(),
        }
    }
}

/// Releases a [`SpinLock`] on drop; dereferences to the protected data.
#[must_use = "dropping a guard immediately releases the lock"]
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
}

unsafe impl<T: ?Sized + Sync> Sync for SpinLockGuard<'_, T> {}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.raw.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_releases() {
        let lock = RawSpinLock::new();
        {
            let _guard = lock.guard();
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
    }

    #[test]
    fn transact_observes_body() {
        // Committed or fallen back, the scope runs the body exactly once as
        // far as any observer can tell.
        let lock = SpinLock::new(1);
        let value = lock.transact(|n| {
            *n += 1;
            *n
        });
        assert_eq!(value, 2);
        assert_eq!(*lock.lock(), 2);
    }
}
