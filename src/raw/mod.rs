pub(crate) mod bucket;
pub(crate) mod ptr_lock;
pub(crate) mod utils;

use std::borrow::Borrow;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicUsize, Ordering};

use self::bucket::{grow, Bucket, Pair, Slot, Using};
use self::ptr_lock::{untag, LOCKED_BIT};
use self::utils::CachePadded;
use crate::map::AllocError;

/// A bucketed hash map with per-slot locking.
///
/// The bucket vector is fixed after construction or `reserve`; buckets grow
/// their slot arrays in place. See `bucket` for the pinning protocol that
/// makes in-place growth safe against readers.
pub(crate) struct RawMap<K, V, S> {
    buckets: Box<[CachePadded<Bucket<K, V>>]>,
    build_hasher: S,
    // Live-pair count: bumped after publication, dropped before destruction.
    // A consistent bound under concurrency, not a snapshot.
    len: CachePadded<AtomicUsize>,
}

impl<K, V, S> RawMap<K, V, S> {
    pub fn with_buckets_and_hasher(buckets: usize, build_hasher: S) -> RawMap<K, V, S> {
        RawMap {
            buckets: new_buckets(buckets),
            build_hasher,
            len: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Replaces the bucket vector. Only legal while the map is empty; the
    /// packed slot layout cannot rehash live content.
    pub fn reserve(&mut self, buckets: usize) {
        assert!(self.len() == 0, "cannot rehash existing content");
        self.buckets = new_buckets(buckets);
    }

    pub fn clear(&self) {
        let mut dropped = 0;
        for bucket in self.buckets.iter() {
            dropped += bucket.clear();
        }
        self.len.fetch_sub(dropped, Ordering::Relaxed);
    }

    pub fn iter(&self) -> RawIter<'_, K, V> {
        RawIter {
            buckets: &self.buckets,
            len: &self.len,
            bucket: 0,
            offset: 0,
        }
    }
}

impl<K, V, S: BuildHasher> RawMap<K, V, S> {
    #[inline]
    fn hash<Q: Hash + ?Sized>(&self, key: &Q) -> u64 {
        self.build_hasher.hash_one(key)
    }

    #[inline]
    fn bucket_for(&self, hash: u64) -> &Bucket<K, V> {
        &self.buckets[(hash % self.buckets.len() as u64) as usize]
    }

    /// Finds `key`, returning its slot locked.
    ///
    /// No empty-map shortcut: only the scope's acquire loads of the slot
    /// array synchronize with a racing insert's publication, so the scan must
    /// reach them. An untouched bucket scans as zero slots anyway.
    pub fn find<Q>(&self, key: &Q) -> Option<RawEntry<'_, K, V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash(key);
        let scope = self.bucket_for(hash).enter();
        let (items, count) = scope.raw();

        for offset in 0..count {
            let slot = unsafe { &*items.add(offset) };
            if slot.hash() != hash {
                continue;
            }

            slot.pair.lock();
            let pair = slot.pair.get();
            // Recheck under the lock: the slot may have been emptied or
            // reused since the unlocked hash read.
            if !pair.is_null() && slot.hash() == hash && unsafe { (*pair).key.borrow() } == key {
                return Some(RawEntry {
                    _scope: scope,
                    slot,
                    pair,
                    len: &self.len,
                    detached: false,
                });
            }
            slot.pair.unlock();
        }
        None
    }

    /// Inserts `key`/`value`, or finds the existing entry for an equal key.
    ///
    /// Returns the entry locked, and whether it was newly inserted. On a
    /// duplicate the provided pair is dropped. Out-of-memory surfaces with
    /// the map unchanged.
    pub fn insert(&self, key: K, value: V) -> Result<(RawEntry<'_, K, V>, bool), AllocError>
    where
        K: Hash + Eq,
    {
        let hash = self.hash(&key);
        let bucket = self.bucket_for(hash);

        'restart: loop {
            let scope = bucket.enter();
            let (items, count) = scope.raw();

            // Pass 1: an existing equal key wins. Remember the lowest empty
            // slot as the claim hint.
            let mut empty = None;
            for offset in 0..count {
                let slot = unsafe { &*items.add(offset) };
                if empty.is_none() && slot.pair.load(Ordering::Relaxed).addr() == 0 {
                    empty = Some(offset);
                }
                if slot.hash() != hash {
                    continue;
                }

                slot.pair.lock();
                let pair = slot.pair.get();
                if !pair.is_null() && slot.hash() == hash && unsafe { &(*pair).key } == &key {
                    return Ok((
                        RawEntry {
                            _scope: scope,
                            slot,
                            pair,
                            len: &self.len,
                            detached: false,
                        },
                        false,
                    ));
                }
                slot.pair.unlock();
            }

            // Pass 2: claim the lowest empty slot at or after the hint. The
            // claim orders racing claimants of one slot by try_lock.
            let mut claimed = None;
            if let Some(start) = empty {
                for offset in start..count {
                    let slot = unsafe { &*items.add(offset) };
                    if slot.pair.load(Ordering::Relaxed).addr() == 0 && slot.pair.try_lock() {
                        if slot.pair.get().is_null() {
                            claimed = Some(offset);
                            break;
                        }
                        // Filled between the load and the lock.
                        slot.pair.unlock();
                    }
                }
            }

            let Some(offset) = claimed else {
                // No free slot: grow the bucket and rescan. The scope must
                // close first; resize waits for quiescence.
                let target = grow(count);
                drop(scope);
                bucket.resize(target)?;
                continue 'restart;
            };

            let slot = unsafe { &*items.add(offset) };
            // Reserve before the duplicate pass: from here, same-hash scans
            // block on this slot, so a racer that sees us serializes behind
            // our publish-or-release.
            slot.reserve(hash);

            // Pass 3: a racing insert of an equal key may have claimed a
            // different slot. The claims and these scans are all seq-cst, so
            // of two racers at least one observes the other here and defers;
            // pass 1 already ruled out anything published before our scan.
            for other in 0..count {
                if other == offset {
                    continue;
                }
                let candidate = unsafe { &*items.add(other) };
                let word = candidate.pair.load(Ordering::SeqCst);
                let suspicious = if untag(word).is_null() {
                    // A locked empty cell is an in-flight reservation whose
                    // hash may not be visible yet; assume the worst.
                    word.addr() & LOCKED_BIT != 0
                } else {
                    candidate.hash() == hash
                };
                if !suspicious {
                    continue;
                }

                // Give up our claim before blocking: two reservations waiting
                // on each other's slots would deadlock.
                slot.release();
                candidate.pair.lock();
                let pair = candidate.pair.get();
                if !pair.is_null()
                    && candidate.hash() == hash
                    && unsafe { &(*pair).key } == &key
                {
                    return Ok((
                        RawEntry {
                            _scope: scope,
                            slot: candidate,
                            pair,
                            len: &self.len,
                            detached: false,
                        },
                        false,
                    ));
                }
                // Not our key after all; our claim is gone, start over.
                candidate.pair.unlock();
                continue 'restart;
            }

            // Publish. The slot stays locked; the caller's entry releases it.
            return match Pair::alloc(key, value) {
                Ok(pair) => {
                    slot.publish(pair, hash);
                    self.len.fetch_add(1, Ordering::Relaxed);
                    Ok((
                        RawEntry {
                            _scope: scope,
                            slot,
                            pair,
                            len: &self.len,
                            detached: false,
                        },
                        true,
                    ))
                }
                Err(err) => {
                    slot.release();
                    Err(err)
                }
            };
        }
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<(K, V)>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        Some(self.find(key)?.remove())
    }
}

/// A found or newly inserted slot, holding both the bucket using-scope and
/// the slot lock. Dropping it releases both.
pub(crate) struct RawEntry<'a, K, V> {
    // Held for the pin; never read. Drop for RawEntry unlocks the slot
    // before this closes the scope.
    _scope: Using<'a, K, V>,
    slot: *const Slot<K, V>,
    pair: *mut Pair<K, V>,
    len: &'a AtomicUsize,
    detached: bool,
}

impl<K, V> RawEntry<'_, K, V> {
    #[inline]
    pub fn key(&self) -> &K {
        unsafe { &(*self.pair).key }
    }

    #[inline]
    pub fn value(&self) -> &V {
        unsafe { &(*self.pair).value }
    }

    #[inline]
    pub fn value_mut(&mut self) -> &mut V {
        unsafe { &mut (*self.pair).value }
    }

    /// Removes the pair, transferring ownership to the caller. The slot is
    /// emptied-and-unlocked atomically; the pair is taken apart only after
    /// the bucket scope has closed.
    pub fn remove(mut self) -> (K, V) {
        let pair = unsafe { &*self.slot }.detach();
        debug_assert_eq!(pair, self.pair);
        self.len.fetch_sub(1, Ordering::Relaxed);
        self.detached = true;
        drop(self);
        unsafe { Pair::into_inner(pair) }
    }
}

impl<K, V> Drop for RawEntry<'_, K, V> {
    #[inline]
    fn drop(&mut self) {
        if !self.detached {
            unsafe { &*self.slot }.pair.unlock();
        }
    }
}

/// Iterates over live slots, bucket by bucket, locking each yielded slot.
///
/// Not stable under concurrent mutation: a pair inserted or removed while
/// iterating may or may not be seen.
pub(crate) struct RawIter<'a, K, V> {
    buckets: &'a [CachePadded<Bucket<K, V>>],
    len: &'a AtomicUsize,
    bucket: usize,
    offset: usize,
}

impl<'a, K, V> Iterator for RawIter<'a, K, V> {
    type Item = RawEntry<'a, K, V>;

    fn next(&mut self) -> Option<RawEntry<'a, K, V>> {
        while self.bucket < self.buckets.len() {
            let bucket: &'a Bucket<K, V> = &self.buckets[self.bucket];
            let scope = bucket.enter();
            let (items, count) = scope.raw();

            while self.offset < count {
                let offset = self.offset;
                self.offset += 1;

                let slot = unsafe { &*items.add(offset) };
                if untag(slot.pair.load(Ordering::Relaxed)).is_null() {
                    continue;
                }
                slot.pair.lock();
                let pair = slot.pair.get();
                if pair.is_null() {
                    // Emptied while we took the lock.
                    slot.pair.unlock();
                    continue;
                }
                return Some(RawEntry {
                    _scope: scope,
                    slot,
                    pair,
                    len: self.len,
                    detached: false,
                });
            }

            drop(scope);
            self.bucket += 1;
            self.offset = 0;
        }
        None
    }
}

fn new_buckets<K, V>(buckets: usize) -> Box<[CachePadded<Bucket<K, V>>]> {
    (0..buckets.max(1))
        .map(|_| CachePadded::new(Bucket::default()))
        .collect()
}
