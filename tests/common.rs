use elide::ConcurrentMap;

// Run the test on different bucket shapes of a `ConcurrentMap`.
pub fn with_map<K, V>(mut test: impl FnMut(&dyn Fn() -> ConcurrentMap<K, V>)) {
    // The default prime bucket count.
    test(&|| ConcurrentMap::new());

    // A single bucket: maximum slot contention and growth pressure.
    test(&|| ConcurrentMap::with_buckets(1));

    // A wide map: collisions become rare.
    test(&|| ConcurrentMap::with_buckets(512));
}

pub fn threads() -> usize {
    std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(4)
        .clamp(2, 8)
}
