//! Comparison benchmarks: slot-pair vs subscription-slots vs std locks.

use std::sync::{Arc, Mutex, RwLock};
use std::thread;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tsvar::{SlotPairVar, SubscriptionVar, Variable};

const MIXED_OPS: usize = 10_000;

fn bench_uncontended_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("uncontended_read");
    group.throughput(Throughput::Elements(1));

    let pair = SlotPairVar::new();
    pair.set(42u64);
    group.bench_function("slot_pair", |b| {
        b.iter(|| black_box(*pair.get().unwrap()));
    });

    let sub = SubscriptionVar::new();
    sub.set(42u64);
    group.bench_function("subscription", |b| {
        b.iter(|| black_box(*sub.get().unwrap()));
    });

    let rwlock = RwLock::new(42u64);
    group.bench_function("std_rwlock", |b| {
        b.iter(|| black_box(*rwlock.read().unwrap()));
    });

    let mutex = Mutex::new(42u64);
    group.bench_function("std_mutex", |b| {
        b.iter(|| black_box(*mutex.lock().unwrap()));
    });

    group.finish();
}

fn bench_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("write");
    group.throughput(Throughput::Elements(1));

    let pair = SlotPairVar::new();
    group.bench_function("slot_pair", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            black_box(pair.set(i));
        });
    });

    let sub = SubscriptionVar::new();
    group.bench_function("subscription", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            black_box(sub.set(i));
        });
    });

    let rwlock = RwLock::new(0u64);
    group.bench_function("std_rwlock", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            *rwlock.write().unwrap() = black_box(i);
        });
    });

    group.finish();
}

/// Read-heavy mixed workload: N-1 reader threads hammer `get` while one
/// writer publishes continuously.
fn mixed_workload<V: Variable<u64> + Sync>(var: &V, threads: usize) {
    var.set(1);
    thread::scope(|s| {
        for _ in 0..threads.saturating_sub(1) {
            s.spawn(|| {
                for _ in 0..MIXED_OPS {
                    black_box(*var.get().unwrap());
                }
            });
        }
        s.spawn(|| {
            for i in 0..MIXED_OPS / 10 {
                black_box(var.set(i as u64));
            }
        });
    });
}

fn bench_mixed(c: &mut Criterion) {
    let mut group = c.benchmark_group("mixed_read_write");
    group.sample_size(10);

    for threads in [2, 4, 8] {
        group.throughput(Throughput::Elements((threads * MIXED_OPS) as u64));

        group.bench_with_input(
            BenchmarkId::new("slot_pair", threads),
            &threads,
            |b, &threads| {
                b.iter(|| mixed_workload(&SlotPairVar::new(), threads));
            },
        );

        group.bench_with_input(
            BenchmarkId::new("subscription", threads),
            &threads,
            |b, &threads| {
                b.iter(|| mixed_workload(&SubscriptionVar::new(), threads));
            },
        );

        group.bench_with_input(
            BenchmarkId::new("std_rwlock", threads),
            &threads,
            |b, &threads| {
                b.iter(|| {
                    let lock = Arc::new(RwLock::new(1u64));
                    thread::scope(|s| {
                        for _ in 0..threads.saturating_sub(1) {
                            let lock = Arc::clone(&lock);
                            s.spawn(move || {
                                for _ in 0..MIXED_OPS {
                                    black_box(*lock.read().unwrap());
                                }
                            });
                        }
                        let lock = Arc::clone(&lock);
                        s.spawn(move || {
                            for i in 0..MIXED_OPS / 10 {
                                *lock.write().unwrap() = black_box(i as u64);
                            }
                        });
                    });
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_uncontended_read, bench_write, bench_mixed);
criterion_main!(benches);
