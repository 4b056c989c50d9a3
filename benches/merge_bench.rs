//! Merge benchmark: serial vs parallel consolidation of per-thread append lists
//!
//! Measures merge throughput (elements/sec) with and without building an
//! index over the merged array, across total sizes and worker counts.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use std::hint::black_box;
use std::time::Duration;

use flatchain::{
    AppendListConfig, ArrayHashIndex, PerThreadAppendList, ScopedPool, WorkerPool, merge_parallel,
    merge_parallel_with_index, merge_serial, merge_serial_with_index,
};

// How long to record measurements for.
const MEASURE_DURATION_SECS: u64 = 20;

/// Spread `total` records over `segments` segments with uneven lengths.
fn filled(total: usize, segments: usize, seed: u64) -> PerThreadAppendList<(u64, u64)> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut list = PerThreadAppendList::new(&AppendListConfig::new(segments));
    for i in 0..total as u64 {
        let segment = rng.random_range(0..segments);
        list.write(segment, (rng.random(), i)).unwrap();
    }
    list
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");
    group.measurement_time(Duration::from_secs(MEASURE_DURATION_SECS));

    let pool = ScopedPool::available();
    for &total in &[10_000, 100_000, 1_000_000, 10_000_000] {
        let list = filled(total, pool.worker_count(), 42);
        group.throughput(Throughput::Elements(total as u64));

        group.bench_with_input(BenchmarkId::new("serial", total), &list, |b, list| {
            b.iter(|| {
                let mut dest = Vec::new();
                merge_serial(black_box(list), &mut dest);
                dest
            })
        });

        group.bench_with_input(BenchmarkId::new("parallel", total), &list, |b, list| {
            b.iter(|| {
                let mut dest = Vec::new();
                merge_parallel(black_box(list), &mut dest, &pool).unwrap();
                dest
            })
        });
    }

    group.finish();
}

fn bench_merge_with_index(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_with_index");
    group.measurement_time(Duration::from_secs(MEASURE_DURATION_SECS));

    let pool = ScopedPool::available();
    for &total in &[10_000, 100_000, 1_000_000] {
        let list = filled(total, pool.worker_count(), 42);
        group.throughput(Throughput::Elements(total as u64));

        group.bench_with_input(BenchmarkId::new("serial", total), &list, |b, list| {
            b.iter(|| {
                let mut dest = Vec::new();
                let mut index: ArrayHashIndex<u64> = ArrayHashIndex::new();
                merge_serial_with_index(black_box(list), &mut dest, &mut index).unwrap();
                (dest, index)
            })
        });

        group.bench_with_input(BenchmarkId::new("parallel", total), &list, |b, list| {
            b.iter(|| {
                let mut dest = Vec::new();
                let mut index: ArrayHashIndex<u64> = ArrayHashIndex::new();
                merge_parallel_with_index(black_box(list), &mut dest, &mut index, &pool).unwrap();
                (dest, index)
            })
        });
    }

    group.finish();
}

fn bench_worker_count(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_workers");
    group.measurement_time(Duration::from_secs(MEASURE_DURATION_SECS));

    let total = 4_000_000;
    let list = filled(total, 16, 42);
    group.throughput(Throughput::Elements(total as u64));

    for &workers in &[1, 2, 4, 8, 16] {
        let pool = ScopedPool::new(workers);
        group.bench_with_input(BenchmarkId::new("parallel", workers), &list, |b, list| {
            b.iter(|| {
                let mut dest = Vec::new();
                merge_parallel(black_box(list), &mut dest, &pool).unwrap();
                dest
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_merge, bench_merge_with_index, bench_worker_count);
criterion_main!(benches);
