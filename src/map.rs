use std::alloc::{self, Layout};
use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::error::Error;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;

use crate::raw::{RawEntry, RawIter, RawMap};

/// The number of buckets a map is created with by default.
///
/// Prime, to spread clustered hashes across buckets in small maps.
pub const DEFAULT_BUCKETS: usize = 13;

/// A concurrent hash map with per-slot locking.
///
/// Point operations — [`find`], [`insert`], [`remove`] — are wait-free while
/// they touch distinct slots, which is the common case. Operations on the
/// same key serialize on that key's slot lock; a bucket running out of slots
/// grows its slot array in place, briefly excluding users of that bucket
/// only.
///
/// The bucket vector itself never grows. What [`reserve`] (or the builder)
/// establishes up front is what the map keeps, so size it for the expected
/// key count; the packed slot arrays keep the cost of an excessive load
/// factor low.
///
/// # Entries pin their bucket
///
/// [`find`] and [`insert`] return an [`Entry`]: a guard holding the slot lock
/// and pinning the bucket against resize. Holding an `Entry` while calling
/// other operations of the same map can deadlock — with a lookup of the same
/// key, or with a bucket resize waiting on the pin. Treat an `Entry` as a
/// short-lived view: read or update the value and drop it.
///
/// # Examples
///
/// ```
/// use elide::ConcurrentMap;
///
/// let map = ConcurrentMap::new();
/// let (_, inserted) = map.insert("fast", 1);
/// assert!(inserted);
///
/// if let Some(mut entry) = map.find("fast") {
///     *entry.value_mut() += 1;
/// }
/// assert_eq!(map.get("fast"), Some(2));
///
/// assert_eq!(map.remove("fast"), Some(("fast", 2)));
/// assert!(map.is_empty());
/// ```
///
/// [`find`]: ConcurrentMap::find
/// [`insert`]: ConcurrentMap::insert
/// [`remove`]: ConcurrentMap::remove
/// [`reserve`]: ConcurrentMap::reserve
pub struct ConcurrentMap<K, V, S = RandomState> {
    raw: RawMap<K, V, S>,
}

// Safety: the map hands out &K/&V only through entries holding the slot lock,
// and moves K/V out on removal from whichever thread removes.
unsafe impl<K: Send, V: Send, S: Send> Send for ConcurrentMap<K, V, S> {}
unsafe impl<K: Send + Sync, V: Send + Sync, S: Sync> Sync for ConcurrentMap<K, V, S> {}

impl<K, V> ConcurrentMap<K, V> {
    /// Creates an empty map with [`DEFAULT_BUCKETS`] buckets and a random
    /// hasher.
    pub fn new() -> ConcurrentMap<K, V> {
        ConcurrentMap::builder().build()
    }

    /// Creates an empty map with `buckets` buckets (at least one).
    pub fn with_buckets(buckets: usize) -> ConcurrentMap<K, V> {
        ConcurrentMap::builder().buckets(buckets).build()
    }

    /// Returns a builder for a map, for configuring the bucket count or the
    /// hasher.
    ///
    /// # Examples
    ///
    /// ```
    /// use elide::ConcurrentMap;
    /// use std::collections::hash_map::RandomState;
    ///
    /// let map: ConcurrentMap<u64, u64, _> = ConcurrentMap::builder()
    ///     .buckets(100)
    ///     .hasher(RandomState::new())
    ///     .build();
    /// ```
    pub fn builder() -> ConcurrentMapBuilder<K, V> {
        ConcurrentMapBuilder {
            buckets: DEFAULT_BUCKETS,
            hasher: RandomState::new(),
            _kv: PhantomData,
        }
    }
}

impl<K, V> Default for ConcurrentMap<K, V> {
    fn default() -> ConcurrentMap<K, V> {
        ConcurrentMap::new()
    }
}

impl<K, V, S> ConcurrentMap<K, V, S> {
    /// Returns the number of live entries.
    ///
    /// Under concurrent mutation this is a consistent bound, not a snapshot:
    /// insertions count after they publish, removals before they destroy.
    #[inline]
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Returns whether the map is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every entry, destroying the stored pairs.
    ///
    /// Buckets are emptied one at a time, each waiting out its in-flight
    /// users; entries observed by concurrent operations mid-clear may land in
    /// already-emptied buckets.
    pub fn clear(&self) {
        self.raw.clear();
    }

    /// Resizes the bucket vector to `buckets` buckets (at least one).
    ///
    /// # Panics
    ///
    /// Panics if the map is not empty: the packed slot layout cannot rehash
    /// existing content.
    pub fn reserve(&mut self, buckets: usize) {
        self.raw.reserve(buckets);
    }

    /// Iterates over the live entries, yielding each as a locked [`Entry`].
    ///
    /// The order is unspecified. Iteration is not stable under concurrent
    /// mutation: pairs inserted or removed while iterating may or may not be
    /// seen. A snapshot-consistent view requires external synchronization.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            raw: self.raw.iter(),
            _kv: PhantomData,
        }
    }
}

impl<K, V, S> ConcurrentMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    /// Returns the entry for `key`, locked, or `None` if absent.
    ///
    /// The lookup is wait-free unless it contends on the key's slot. The
    /// returned [`Entry`] keeps the slot locked; see the
    /// [type-level notes](ConcurrentMap#entries-pin-their-bucket) on holding
    /// entries.
    #[inline]
    pub fn find<Q>(&self, key: &Q) -> Option<Entry<'_, K, V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        Some(Entry {
            raw: self.raw.find(key)?,
        })
    }

    /// Returns whether `key` has an entry.
    #[inline]
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.find(key).is_some()
    }

    /// Returns a clone of the value for `key`, taken under the slot lock.
    #[inline]
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        Some(self.find(key)?.value().clone())
    }

    /// Inserts `key`/`value`, or finds the existing entry for an equal key.
    ///
    /// Returns the entry, locked, and whether it was newly inserted. An
    /// existing entry's value is left untouched and the provided pair is
    /// dropped; update through [`Entry::value_mut`] instead. Two racing
    /// inserts of equal keys resolve to one entry, and the map's length
    /// counts only real insertions.
    ///
    /// Aborts on allocation failure, like the standard collections; see
    /// [`try_insert`](ConcurrentMap::try_insert) to handle it.
    #[inline]
    pub fn insert(&self, key: K, value: V) -> (Entry<'_, K, V>, bool) {
        match self.try_insert(key, value) {
            Ok(result) => result,
            Err(err) => alloc::handle_alloc_error(err.layout()),
        }
    }

    /// [`insert`](ConcurrentMap::insert), surfacing allocation failure.
    ///
    /// On `Err` the map is unchanged and the provided pair has been dropped.
    pub fn try_insert(&self, key: K, value: V) -> Result<(Entry<'_, K, V>, bool), AllocError> {
        let (raw, inserted) = self.raw.insert(key, value)?;
        Ok((Entry { raw }, inserted))
    }

    /// Removes the entry for `key`, returning the owned pair.
    ///
    /// The slot is emptied atomically; the pair is destroyed (here, by
    /// returning it) outside any lock.
    #[inline]
    pub fn remove<Q>(&self, key: &Q) -> Option<(K, V)>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.raw.remove(key)
    }
}

impl<K, V, S> fmt::Debug for ConcurrentMap<K, V, S>
where
    K: fmt::Debug,
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for entry in self.iter() {
            map.entry(entry.key(), entry.value());
        }
        map.finish()
    }
}

/// A builder for a [`ConcurrentMap`].
pub struct ConcurrentMapBuilder<K, V, S = RandomState> {
    buckets: usize,
    hasher: S,
    _kv: PhantomData<(K, V)>,
}

impl<K, V, S> ConcurrentMapBuilder<K, V, S> {
    /// Sets the number of buckets (at least one). More buckets mean fewer
    /// keys contending per bucket; the count is fixed for the life of the
    /// map, short of [`ConcurrentMap::reserve`] on an empty map.
    pub fn buckets(self, buckets: usize) -> ConcurrentMapBuilder<K, V, S> {
        ConcurrentMapBuilder { buckets, ..self }
    }

    /// Sets the hasher used to hash keys.
    ///
    /// The default is `RandomState`; a map with a caller-supplied hasher
    /// inherits its collision behavior, including any DoS exposure.
    pub fn hasher<H>(self, hasher: H) -> ConcurrentMapBuilder<K, V, H> {
        ConcurrentMapBuilder {
            buckets: self.buckets,
            hasher,
            _kv: PhantomData,
        }
    }

    /// Builds the map.
    pub fn build(self) -> ConcurrentMap<K, V, S> {
        ConcurrentMap {
            raw: RawMap::with_buckets_and_hasher(self.buckets, self.hasher),
        }
    }
}

/// A view of one live entry, holding its slot lock.
///
/// The lock makes the key and value stable for the lifetime of the entry and
/// excludes concurrent operations on the same key; drop the entry promptly.
/// Removal through [`Entry::remove`] transfers ownership of the pair to the
/// caller.
pub struct Entry<'a, K, V> {
    raw: RawEntry<'a, K, V>,
}

// Safety: an entry reads K/V by shared reference and moves them out on
// remove, from whichever thread holds it.
unsafe impl<K: Send + Sync, V: Send + Sync> Send for Entry<'_, K, V> {}
unsafe impl<K: Sync, V: Sync> Sync for Entry<'_, K, V> {}

impl<K, V> Entry<'_, K, V> {
    /// The entry's key.
    #[inline]
    pub fn key(&self) -> &K {
        self.raw.key()
    }

    /// The entry's value.
    #[inline]
    pub fn value(&self) -> &V {
        self.raw.value()
    }

    /// The entry's value, mutably. The slot lock makes this exclusive.
    #[inline]
    pub fn value_mut(&mut self) -> &mut V {
        self.raw.value_mut()
    }

    /// Removes the entry, returning the owned pair.
    ///
    /// The slot is emptied-and-unlocked in one atomic store; the pair itself
    /// is moved out after the entry's bucket pin is released, so its `Drop`
    /// (when the caller discards it) runs outside any lock.
    #[inline]
    pub fn remove(self) -> (K, V) {
        self.raw.remove()
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for Entry<'_, K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("key", self.key())
            .field("value", self.value())
            .finish()
    }
}

/// An iterator over a map's entries. See [`ConcurrentMap::iter`].
pub struct Iter<'a, K, V> {
    raw: RawIter<'a, K, V>,
    // Ties Send/Sync of the iterator to the referenced keys and values.
    _kv: PhantomData<&'a (K, V)>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = Entry<'a, K, V>;

    #[inline]
    fn next(&mut self) -> Option<Entry<'a, K, V>> {
        Some(Entry {
            raw: self.raw.next()?,
        })
    }
}

/// An allocation for slot storage or a stored pair failed.
///
/// Surfaced by the fallible operations; the map is left unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError {
    layout: Layout,
}

impl AllocError {
    pub(crate) fn new(layout: Layout) -> AllocError {
        AllocError { layout }
    }

    /// The layout of the failed allocation.
    pub fn layout(&self) -> Layout {
        self.layout
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to allocate {} bytes of map storage",
            self.layout.size()
        )
    }
}

impl Error for AllocError {}
