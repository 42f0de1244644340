//! Query benchmarks: scans with predicate pushdown, nested-loop joins,
//! grouped aggregation, and composite-index range scans.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use squill::store::MemCollection;
use squill::{select, KeyPath, KeySpec, MemoryStore, Record, SourceInput, Value};
use std::sync::Arc;

fn collection(n: i64) -> MemCollection {
    MemCollection::from_records((0..n).map(|i| {
        Record::from_pairs([
            ("id", Value::from(i)),
            ("group", Value::from(i % 10)),
            ("score", Value::from((i * 37) % 1000)),
        ])
    }))
}

fn bench_filtered_scan(c: &mut Criterion) {
    let rows = collection(10_000);
    let query = select("{id: r.id}")
        .from([("r", SourceInput::from(rows))])
        .where_("r.score > 900")
        .finalize()
        .expect("finalize");
    c.bench_function("filtered_scan_10k", |b| {
        b.iter(|| black_box(query.collect_records(Record::new()).expect("collect")));
    });
}

fn bench_join(c: &mut Criterion) {
    let left = collection(1_000);
    let right = MemCollection::from_records((0..10).map(|g| {
        Record::from_pairs([("group", Value::from(g)), ("label", Value::from(g * 100))])
    }));
    let query = select("{id: l.id, label: g.label}")
        .from([
            ("l", SourceInput::from(left)),
            ("g", SourceInput::from(right)),
        ])
        .where_("l.group === g.group")
        .finalize()
        .expect("finalize");
    c.bench_function("join_1k_x_10", |b| {
        b.iter(|| black_box(query.collect_records(Record::new()).expect("collect")));
    });
}

fn bench_group_by(c: &mut Criterion) {
    let rows = collection(10_000);
    let query = select("{group: r.group, total: sum(r.score), n: count(r.id)}")
        .from([("r", SourceInput::from(rows))])
        .group_by("{group: r.group}")
        .finalize()
        .expect("finalize");
    c.bench_function("group_by_10k", |b| {
        b.iter(|| black_box(query.collect_records(Record::new()).expect("collect")));
    });
}

fn bench_composite_index_scan(c: &mut Criterion) {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new("bench"));
    store.define_source(
        "items",
        KeySpec::Composite(vec![KeyPath::parse("shard"), KeyPath::parse("seq")]),
        false,
    );
    store
        .seed(
            "items",
            (0..10_000).map(|i| {
                Record::from_pairs([
                    ("shard", Value::from(i % 16)),
                    ("seq", Value::from(i)),
                    ("payload", Value::from(i * 3)),
                ])
            }),
        )
        .expect("seed");
    let dynamic: Arc<dyn squill::store::Store> = store;
    let query = select("{seq: item.seq}")
        .from([("item", SourceInput::stored(&dynamic, "items"))])
        .where_("item.shard === 3 && item.seq > 5000")
        .finalize()
        .expect("finalize");
    c.bench_function("composite_index_scan_10k", |b| {
        b.iter(|| black_box(query.collect_records(Record::new()).expect("collect")));
    });
}

criterion_group!(
    benches,
    bench_filtered_scan,
    bench_join,
    bench_group_by,
    bench_composite_index_scan
);
criterion_main!(benches);
