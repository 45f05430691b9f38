use criterion::{black_box, criterion_group, criterion_main, Criterion};

use elide::{htm, ConcurrentMap, SpinLock};

use std::collections::HashMap;
use std::sync::Mutex;

const SIZE: usize = 10_000;

// A random key iterator.
#[derive(Clone, Copy)]
struct RandomKeys {
    state: usize,
}

impl RandomKeys {
    fn new() -> Self {
        RandomKeys { state: 0 }
    }
}

impl Iterator for RandomKeys {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        // Add 1 then multiply by some 32 bit prime.
        self.state = self.state.wrapping_add(1).wrapping_mul(3_787_392_781);
        Some(self.state)
    }
}

fn counter(c: &mut Criterion) {
    let mut group = c.benchmark_group("counter");

    let lock = SpinLock::new(0u64);
    group.bench_function("locked", |b| {
        b.iter(|| {
            *lock.lock() += 1;
        })
    });

    group.bench_function("transacted", |b| {
        b.iter(|| lock.transact(|count| *count += 1))
    });

    htm::force_support(false);
    group.bench_function("transacted-forced-off", |b| {
        b.iter(|| lock.transact(|count| *count += 1))
    });
    htm::force_support(true);

    group.finish();
}

fn map(c: &mut Criterion) {
    let mut group = c.benchmark_group("map");

    group.bench_function("get", |b| {
        let mut map = ConcurrentMap::new();
        map.reserve(SIZE / 8);
        for key in RandomKeys::new().take(SIZE) {
            map.insert(key, key);
        }

        b.iter(|| {
            for key in RandomKeys::new().take(SIZE) {
                black_box(map.get(&key));
            }
        })
    });

    group.bench_function("get-std-mutex", |b| {
        let map = Mutex::new(HashMap::new());
        for key in RandomKeys::new().take(SIZE) {
            map.lock().unwrap().insert(key, key);
        }

        b.iter(|| {
            for key in RandomKeys::new().take(SIZE) {
                black_box(map.lock().unwrap().get(&key).copied());
            }
        })
    });

    group.bench_function("insert-remove", |b| {
        let mut map = ConcurrentMap::new();
        map.reserve(SIZE / 8);

        b.iter(|| {
            for key in RandomKeys::new().take(SIZE) {
                map.insert(key, key);
            }
            for key in RandomKeys::new().take(SIZE) {
                black_box(map.remove(&key));
            }
        })
    });

    group.finish();
}

criterion_group!(benches, counter, map);
criterion_main!(benches);
