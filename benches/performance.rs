//! Performance benchmarks for the subscription store.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use subscription_store::{Database, Query, SubscriptionStore};
use tempfile::TempDir;

fn create_store(dir: &TempDir) -> Arc<SubscriptionStore> {
    let db = Database::open(dir.path().join("store")).unwrap();
    SubscriptionStore::create(db, |_| {}).unwrap()
}

/// Benchmark committing sets with varying subscription counts.
fn bench_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit");

    for sub_count in [1, 10, 100] {
        group.bench_with_input(
            BenchmarkId::new("subscriptions", sub_count),
            &sub_count,
            |b, &count| {
                let dir = TempDir::new().unwrap();
                let store = create_store(&dir);

                b.iter(|| {
                    let mut mutable =
                        store.get_latest().unwrap().make_mutable_copy().unwrap();
                    for i in 0..count {
                        mutable
                            .insert_or_assign_named(
                                &format!("sub-{}", i),
                                &Query::new("Person", format!("age > {}", i)),
                            )
                            .unwrap();
                    }
                    black_box(mutable.commit().unwrap());
                });
            },
        );
    }

    group.finish();
}

/// Benchmark reading the latest set from a frozen snapshot.
fn bench_get_latest(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let store = create_store(&dir);

    let mut mutable = store.get_latest().unwrap().make_mutable_copy().unwrap();
    for i in 0..100 {
        mutable
            .insert_or_assign_named(
                &format!("sub-{}", i),
                &Query::new("Person", format!("age > {}", i)),
            )
            .unwrap();
    }
    mutable.commit().unwrap();

    c.bench_function("get_latest_100_subs", |b| {
        b.iter(|| black_box(store.get_latest().unwrap()));
    });
}

/// Benchmark canonical JSON rendering.
fn bench_to_ext_json(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let store = create_store(&dir);

    let mut mutable = store.get_latest().unwrap().make_mutable_copy().unwrap();
    for i in 0..100 {
        mutable
            .insert_or_assign(&Query::new(
                format!("Class{}", i % 10),
                format!("field > {}", i),
            ))
            .unwrap();
    }
    let committed = mutable.commit().unwrap();

    c.bench_function("to_ext_json_100_subs", |b| {
        b.iter(|| black_box(committed.to_ext_json()));
    });
}

criterion_group!(benches, bench_commit, bench_get_latest, bench_to_ext_json);
criterion_main!(benches);
