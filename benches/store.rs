//! # Core Operation Benchmarks
//!
//! Measures the three hot paths of the store:
//!
//! - sequential inserts (skip-list descent + payload packing)
//! - point lookups over a populated database
//! - full ascending cursor scans
//!
//! ## Running Benchmarks
//!
//! ```bash
//! cargo bench --bench store
//! cargo bench --bench store -- put     # Only insert benchmarks
//! cargo bench --bench store -- get     # Only lookup benchmarks
//! cargo bench --bench store -- scan    # Only cursor benchmarks
//! ```
//!
//! Stores are created in a fresh tempdir per benchmark with a fixed
//! random seed, so node layouts are reproducible across runs.

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use skipstore::{CursorOp, DbFlags, Store};
use tempfile::tempdir;

const N: u32 = 10_000;

fn populated_store(dir: &tempfile::TempDir) -> Store {
    let store = Store::builder()
        .path(dir.path().join("bench.skp"))
        .random_seed(0xBEEF)
        .open()
        .unwrap();
    let db = store.db(1, DbFlags::empty()).unwrap();
    for i in 0..N {
        let key = format!("key{i:08}");
        let val = format!("value-{i:08}");
        db.put(key.as_bytes(), val.as_bytes()).unwrap();
    }
    store
}

fn bench_put(c: &mut Criterion) {
    c.bench_function("put_sequential_1000", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().unwrap();
                let store = Store::builder()
                    .path(dir.path().join("bench.skp"))
                    .random_seed(0xBEEF)
                    .open()
                    .unwrap();
                (dir, store)
            },
            |(_dir, store)| {
                let db = store.db(1, DbFlags::empty()).unwrap();
                for i in 0..1000u32 {
                    let key = format!("key{i:08}");
                    db.put(key.as_bytes(), b"value").unwrap();
                }
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_get(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let store = populated_store(&dir);
    let db = store.db(1, DbFlags::empty()).unwrap();

    c.bench_function("get_point_lookup", |b| {
        let mut i = 0u32;
        b.iter(|| {
            let key = format!("key{:08}", i % N);
            i = i.wrapping_add(7919);
            db.get(key.as_bytes()).unwrap()
        });
    });

    store.close().unwrap();
}

fn bench_scan(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let store = populated_store(&dir);
    let db = store.db(1, DbFlags::empty()).unwrap();

    c.bench_function("scan_full_ascending", |b| {
        b.iter(|| {
            let mut cur = db.cursor(CursorOp::BeforeFirst, None).unwrap();
            let mut count = 0u32;
            while cur.to(CursorOp::Next).is_ok() {
                count += 1;
            }
            assert_eq!(count, N);
        });
    });

    store.close().unwrap();
}

criterion_group!(benches, bench_put, bench_get, bench_scan);
criterion_main!(benches);
