use elide::{ConcurrentMap, RawSpinLock, SpinLock};

use std::hash::{BuildHasherDefault, Hasher};

fn with_map<K, V>(test: impl Fn(ConcurrentMap<K, V>)) {
    test(ConcurrentMap::new());
    test(ConcurrentMap::with_buckets(1));
    test(ConcurrentMap::with_buckets(512));
}

#[test]
fn spinlock_works() {
    let lock = RawSpinLock::new();
    assert!(lock.try_lock());
    assert!(!lock.try_lock());
    lock.unlock();

    let guard = lock.guard();
    assert!(!lock.try_lock());
    drop(guard);
    assert!(!lock.is_locked());
}

#[test]
fn spinlock_protects_data() {
    let lock = SpinLock::new(41);
    {
        let mut guard = lock.lock();
        *guard += 1;
        assert!(lock.try_lock().is_none());
    }
    assert_eq!(*lock.lock(), 42);
    assert_eq!(lock.into_inner(), 42);
}

#[test]
fn transact_single_thread() {
    let lock = SpinLock::new(0u64);
    for _ in 0..100 {
        lock.transact(|n| *n += 1);
    }
    assert_eq!(*lock.lock(), 100);

    // The scope returns the body's value.
    let seen = lock.transact(|n| *n);
    assert_eq!(seen, 100);
}

#[test]
fn new() {
    with_map::<usize, usize>(|map| {
        assert_eq!(map.len(), 0);
        assert!(map.is_empty());
        drop(map);
    });
}

#[test]
fn insert_and_find() {
    with_map::<usize, usize>(|map| {
        let (entry, inserted) = map.insert(42, 1);
        assert!(inserted);
        assert_eq!(*entry.key(), 42);
        assert_eq!(*entry.value(), 1);
        drop(entry);

        assert_eq!(map.len(), 1);
        assert!(map.contains_key(&42));
        assert_eq!(map.get(&42), Some(1));
        assert!(map.find(&7).is_none());
    });
}

#[test]
fn insert_duplicate_keeps_existing() {
    with_map::<usize, usize>(|map| {
        assert!(map.insert(1, 10).1);
        let (entry, inserted) = map.insert(1, 20);
        assert!(!inserted);
        assert_eq!(*entry.value(), 10);
        drop(entry);
        assert_eq!(map.len(), 1);
    });
}

#[test]
fn value_mut_updates() {
    with_map::<usize, usize>(|map| {
        map.insert(3, 30);
        {
            let mut entry = map.find(&3).unwrap();
            *entry.value_mut() += 3;
        }
        assert_eq!(map.get(&3), Some(33));
    });
}

#[test]
fn remove() {
    with_map::<usize, usize>(|map| {
        map.insert(5, 50);
        assert_eq!(map.remove(&5), Some((5, 50)));
        assert_eq!(map.remove(&5), None);
        assert!(map.find(&5).is_none());
        assert_eq!(map.len(), 0);
    });
}

#[test]
fn entry_remove() {
    with_map::<usize, usize>(|map| {
        map.insert(8, 80);
        let entry = map.find(&8).unwrap();
        assert_eq!(entry.remove(), (8, 80));
        assert!(map.is_empty());
    });
}

#[test]
fn reinsert_after_remove() {
    with_map::<usize, usize>(|map| {
        map.insert(9, 90);
        map.remove(&9);
        let (entry, inserted) = map.insert(9, 91);
        assert!(inserted);
        drop(entry);
        assert_eq!(map.get(&9), Some(91));
        assert_eq!(map.len(), 1);
    });
}

#[test]
fn clear() {
    with_map::<usize, usize>(|map| {
        for i in 0..64 {
            map.insert(i, i);
        }
        map.clear();
        assert_eq!(map.len(), 0);
        assert!(map.is_empty());
        assert!(map.iter().next().is_none());
        assert!(map.find(&0).is_none());

        // The map stays usable after a clear.
        map.insert(1, 1);
        assert_eq!(map.len(), 1);
    });
}

#[test]
fn iter_sees_every_entry() {
    with_map::<usize, usize>(|map| {
        for i in 0..100 {
            map.insert(i, i * 2);
        }

        let mut seen: Vec<(usize, usize)> =
            map.iter().map(|e| (*e.key(), *e.value())).collect();
        seen.sort_unstable();
        let expected: Vec<(usize, usize)> = (0..100).map(|i| (i, i * 2)).collect();
        assert_eq!(seen, expected);
    });
}

#[test]
fn reserve_then_fill() {
    let mut map = ConcurrentMap::new();
    map.reserve(100);
    for i in 0..1000 {
        map.insert(i, i);
    }
    assert_eq!(map.len(), 1000);
    for i in 0..1000 {
        assert_eq!(map.get(&i), Some(i));
    }
}

#[test]
#[should_panic(expected = "cannot rehash existing content")]
fn reserve_nonempty_panics() {
    let mut map = ConcurrentMap::new();
    map.insert(1, 1);
    map.reserve(100);
}

// Hashes everything to the same value, forcing every key into one probe
// chain within one bucket.
#[derive(Default)]
struct Collider(u64);

impl Hasher for Collider {
    fn write(&mut self, _bytes: &[u8]) {}

    fn finish(&self) -> u64 {
        0x5EED
    }
}

#[test]
fn full_collisions() {
    let map: ConcurrentMap<usize, usize, _> = ConcurrentMap::builder()
        .buckets(1)
        .hasher(BuildHasherDefault::<Collider>::default())
        .build();

    for i in 0..64 {
        assert!(map.insert(i, i + 1000).1);
    }
    assert_eq!(map.len(), 64);
    for i in 0..64 {
        assert_eq!(map.get(&i), Some(i + 1000));
    }

    for i in 0..32 {
        assert_eq!(map.remove(&i), Some((i, i + 1000)));
    }
    assert_eq!(map.len(), 32);
    for i in 0..32 {
        assert!(map.find(&i).is_none());
    }
    for i in 32..64 {
        assert_eq!(map.get(&i), Some(i + 1000));
    }
}

#[test]
fn zero_sized_pairs() {
    let map: ConcurrentMap<(), ()> = ConcurrentMap::new();
    assert!(map.insert((), ()).1);
    assert!(!map.insert((), ()).1);
    assert_eq!(map.len(), 1);
    assert_eq!(map.remove(&()), Some(((), ())));
    assert!(map.is_empty());
}

#[test]
fn borrowed_key_lookup() {
    let map: ConcurrentMap<String, usize> = ConcurrentMap::new();
    map.insert("alpha".to_owned(), 1);
    assert_eq!(map.get("alpha"), Some(1));
    assert!(map.contains_key("alpha"));
    assert_eq!(map.remove("alpha"), Some(("alpha".to_owned(), 1)));
}

#[test]
fn debug_formats_entries() {
    let map: ConcurrentMap<usize, usize> = ConcurrentMap::new();
    map.insert(1, 2);
    let formatted = format!("{map:?}");
    assert!(formatted.contains("1: 2"), "{formatted}");
}

#[test]
fn drops_values_once() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counted(Arc<AtomicUsize>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    let drops = Arc::new(AtomicUsize::new(0));

    // One value removed, one cleared, one dropped with the map.
    let map: ConcurrentMap<usize, Counted> = ConcurrentMap::new();
    map.insert(1, Counted(drops.clone()));
    map.insert(2, Counted(drops.clone()));
    map.insert(3, Counted(drops.clone()));

    drop(map.remove(&1));
    assert_eq!(drops.load(Ordering::Relaxed), 1);

    drop(map.remove(&2));
    assert_eq!(drops.load(Ordering::Relaxed), 2);

    map.clear();
    assert_eq!(drops.load(Ordering::Relaxed), 3);

    map.insert(4, Counted(drops.clone()));
    drop(map);
    assert_eq!(drops.load(Ordering::Relaxed), 4);
}
