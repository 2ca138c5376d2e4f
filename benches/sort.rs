//! Micro-benchmarks for [`flintdb::sort::ExternalSorter`].
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench sort
//! ```

use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use flintdb::codec::{RowCodec, Value};
use flintdb::schema::{Column, ColumnType, IndexKind, IndexSpec, Schema};
use flintdb::sort::ExternalSorter;
use tempfile::TempDir;

fn schema() -> Schema {
    Schema::builder()
        .column(Column::new("k", ColumnType::I64, false))
        .column(Column::new("v", ColumnType::Bytes(64), false))
        .index(IndexSpec::new("primary", IndexKind::Primary, vec!["k".into()]))
        .build()
        .unwrap()
}

/// Reverse-order keys, so the sorter's in-memory run buffers are never
/// handed already-sorted input — a more representative bulk-load shape
/// than a sequential ingest.
fn reversed_keys(n: i64) -> Vec<i64> {
    (0..n).rev().collect()
}

/// Benchmark group for [`ExternalSorter::ingest`] + [`ExternalSorter::finish`].
///
/// ## `in_memory`
///
/// **Scenario:** A run-buffer capacity large enough that the entire input
/// fits in one buffer — no run file is ever spilled.
///
/// **What it measures:** Pure in-memory sort cost (comparator + `Vec` sort)
/// plus decode-on-iterate, the floor for any sort-backed bulk load.
///
/// ## `multi_run`
///
/// **Scenario:** A deliberately tiny run-buffer capacity, forcing many
/// spills and a genuine k-way merge across run files.
///
/// **What it measures:** Run-file I/O plus the heap-based merge overhead —
/// the realistic cost for inputs too large to hold in memory at once.
fn bench_sort(c: &mut Criterion) {
    let mut group = c.benchmark_group("external_sort");

    for &count in &[1_000i64, 10_000] {
        group.throughput(Throughput::Elements(count as u64));

        group.bench_with_input(BenchmarkId::new("in_memory", count), &count, |b, &count| {
            let keys = reversed_keys(count);
            b.iter_batched(
                || TempDir::new().unwrap(),
                |dir| {
                    let mut sorter = ExternalSorter::new(dir.path(), RowCodec::new(&schema()), 64 << 20).unwrap();
                    for &k in &keys {
                        let row = vec![Value::I64(k), Value::Bytes(vec![0u8; 64])];
                        sorter.ingest(k.to_be_bytes().to_vec(), &row).unwrap();
                    }
                    let sorted = sorter.finish().unwrap();
                    black_box(sorted.count());
                },
                BatchSize::LargeInput,
            );
        });

        group.bench_with_input(BenchmarkId::new("multi_run", count), &count, |b, &count| {
            let keys = reversed_keys(count);
            b.iter_batched(
                || TempDir::new().unwrap(),
                |dir| {
                    let mut sorter = ExternalSorter::new(dir.path(), RowCodec::new(&schema()), 4 << 10).unwrap();
                    for &k in &keys {
                        let row = vec![Value::I64(k), Value::Bytes(vec![0u8; 64])];
                        sorter.ingest(k.to_be_bytes().to_vec(), &row).unwrap();
                    }
                    let sorted = sorter.finish().unwrap();
                    black_box(sorted.count());
                },
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_sort);
criterion_main!(benches);
