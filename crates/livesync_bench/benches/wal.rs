//! Write buffer benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use livesync_bench::random_writes;
use livesync_engine::WriteBuffer;
use livesync_protocol::SyncKeys;
use std::time::{Duration, Instant};

fn keys() -> SyncKeys {
    SyncKeys::new(["id"], "synced").unwrap()
}

/// Benchmark coalescing writes to a small set of rows.
fn bench_coalesce(c: &mut Criterion) {
    let mut group = c.benchmark_group("wal_coalesce");

    for id_space in [10u64, 100, 10_000].iter() {
        let writes = random_writes(1000, *id_space);
        group.throughput(Throughput::Elements(writes.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(id_space), &writes, |b, writes| {
            b.iter(|| {
                let mut wal = WriteBuffer::new(keys(), 50, Duration::from_secs(2));
                black_box(wal.add_rows(writes.iter().cloned()));
            });
        });
    }
    group.finish();
}

/// Benchmark draining the buffer batch by batch.
fn bench_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("wal_drain");

    for batch_size in [10usize, 50, 200].iter() {
        let writes = random_writes(1000, 1000);
        group.throughput(Throughput::Elements(writes.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            batch_size,
            |b, &batch_size| {
                b.iter(|| {
                    let mut wal = WriteBuffer::new(keys(), batch_size, Duration::from_secs(2));
                    wal.add_rows(writes.iter().cloned());
                    while !wal.is_empty() {
                        black_box(wal.take_batch());
                        wal.finish_batch(Instant::now());
                    }
                });
            },
        );
    }
    group.finish();
}

/// Benchmark echo suppression lookups.
fn bench_history_lookup(c: &mut Criterion) {
    let writes = random_writes(1000, 1000);
    let mut wal = WriteBuffer::new(keys(), 1000, Duration::from_secs(60));
    wal.add_rows(writes.iter().cloned());
    wal.take_batch();
    wal.finish_batch(Instant::now());

    c.bench_function("wal_history_lookup", |b| {
        let now = Instant::now();
        b.iter(|| {
            for row in &writes {
                black_box(wal.is_in_history(row, now));
            }
        });
    });
}

criterion_group!(benches, bench_coalesce, bench_drain, bench_history_lookup);

criterion_main!(benches);
