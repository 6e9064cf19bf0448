//! Criterion benchmarks for the merge path.
//!
//! Benchmarks:
//! 1. In-memory merge of an existing series with an overlapping fresh page
//! 2. Encoding a series with each codec
//! 3. A full commit (read, merge, encode, atomic replace) into a scratch dir

use barvault_core::domain::{Bar, Timeframe, Timestamp};
use barvault_core::storage::{merge_bars, MergeWriter, StorageFormat, StorageKey};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn make_bars(start_slot: i64, n: usize) -> Vec<Bar> {
    (0..n as i64)
        .map(|i| {
            let slot = start_slot + i;
            let close = 100.0 + (slot as f64 * 0.1).sin() * 10.0;
            Bar {
                open_time: Timestamp::new(slot * 60_000).unwrap(),
                open: close - 0.3,
                high: close + 1.5,
                low: close - 1.5,
                close,
                volume: 1_000.0 + (slot % 500) as f64,
            }
        })
        .collect()
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_bars");
    for &n in &[10_000usize, 100_000] {
        let existing = make_bars(0, n);
        let fresh = make_bars(n as i64 - 500, 1_000);
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| merge_bars(black_box(&existing), black_box(&fresh)))
        });
    }
    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let bars = make_bars(0, 50_000);
    let mut group = c.benchmark_group("encode");
    for format in StorageFormat::ALL {
        let codec = format.codec();
        group.bench_function(format.extension(), |b| {
            b.iter(|| codec.encode(black_box(&bars)).unwrap())
        });
    }
    group.finish();
}

fn bench_commit(c: &mut Criterion) {
    let dir = tempfile::TempDir::new().unwrap();
    let writer = MergeWriter::new(dir.path(), StorageFormat::Parquet);
    let key = StorageKey::new("binance", "BTC/USDT", Timeframe::M1).unwrap();
    writer.commit(&key, &make_bars(0, 50_000)).unwrap();
    let fresh = make_bars(49_500, 1_000);

    c.bench_function("commit_50k_plus_page", |b| {
        b.iter(|| writer.commit(&key, black_box(&fresh)).unwrap())
    });
}

criterion_group!(benches, bench_merge, bench_encode, bench_commit);
criterion_main!(benches);
