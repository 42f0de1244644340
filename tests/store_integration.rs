//! Queries against the persistent-store contract: composite-index range
//! scans, secondary index selection, inserts/upserts/updates/deletes with
//! transactional visibility, rollback on failure, and idle auto-commit.

use serde_json::json;
use squill::exec::index::{choose_access_path, AccessPath};
use squill::expr::EvalScope;
use squill::plan::PlanNode;
use squill::store::{IndexMeta, MemCollection, SourceMeta};
use squill::{
    delete_from, insert, insert_with, select, update_with, upsert_with, KeyPath, KeySpec,
    MemoryStore, QueryError, Record, SourceInput, Value,
};
use std::sync::Arc;

fn inventory_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new("warehouse"));
    store.define_source(
        "inventoryItems",
        KeySpec::Composite(vec![KeyPath::parse("storeId"), KeyPath::parse("isbn")]),
        false,
    );
    store
        .seed(
            "inventoryItems",
            [
                (1, 123_456, 3),
                (1, 234_567, 4),
                (1, 345_678, 5),
                (2, 123_456, 1),
                (2, 234_567, 2),
            ]
            .map(|(store_id, isbn, quantity)| {
                Record::from_pairs([
                    ("storeId", Value::from(store_id)),
                    ("isbn", Value::from(isbn)),
                    ("quantity", Value::from(quantity)),
                ])
            }),
        )
        .expect("seed");
    store
}

fn book_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new("library"));
    store.define_source("books", KeySpec::Single(KeyPath::parse("isbn")), false);
    store
}

fn stored(store: &Arc<MemoryStore>, source: &str) -> SourceInput {
    let dynamic: Arc<dyn squill::store::Store> = store.clone();
    SourceInput::stored(&dynamic, source)
}

#[test]
fn composite_index_scan_with_equality_prefix_and_range() {
    let store = inventory_store();
    let query = select("{isbn: inventoryItem.isbn, quantity: inventoryItem.quantity}")
        .from([("inventoryItem", stored(&store, "inventoryItems"))])
        .where_("inventoryItem.storeId === 1 && inventoryItem.isbn > 200000")
        .finalize()
        .expect("finalize");

    // The plan must carry ranges for both key-path components on the
    // source, and index selection must choose a single composite pass.
    fn find_source(node: &PlanNode) -> &PlanNode {
        match node {
            PlanNode::Source { .. } => node,
            PlanNode::Envelope { child, .. }
            | PlanNode::Select { child, .. }
            | PlanNode::Where { child, .. }
            | PlanNode::OrderBy { child, .. }
            | PlanNode::GroupBy { child, .. }
            | PlanNode::Memoize { child, .. }
            | PlanNode::Write { child, .. } => find_source(child),
            PlanNode::Join { left, .. }
            | PlanNode::SetOp { left, .. }
            | PlanNode::CompositeUnion { left, .. } => find_source(left),
        }
    }
    let PlanNode::Source { key_ranges, .. } = find_source(query.plan()) else {
        panic!("expected source");
    };
    assert!(key_ranges.contains_key(&KeyPath::parse("storeId")));
    assert!(key_ranges.contains_key(&KeyPath::parse("isbn")));

    let meta = SourceMeta {
        key_spec: KeySpec::Composite(vec![KeyPath::parse("storeId"), KeyPath::parse("isbn")]),
        auto_increment: false,
        indexes: Vec::new(),
    };
    let access = choose_access_path(&meta, key_ranges, &EvalScope::constant()).expect("access");
    let AccessPath::Primary(native) = access else {
        panic!("expected a composite primary-index scan, got {access:?}");
    };
    assert_eq!(native.len(), 1);

    let records = query.collect_records(Record::new()).expect("collect");
    assert_eq!(
        records,
        vec![
            Record::from_pairs([("isbn", Value::from(234_567)), ("quantity", Value::from(4))]),
            Record::from_pairs([("isbn", Value::from(345_678)), ("quantity", Value::from(5))]),
        ]
    );
}

#[test]
fn secondary_index_serves_equality_lookups() {
    let store = book_store();
    store
        .define_index(
            "books",
            IndexMeta {
                name: "by_author".into(),
                key_paths: vec![KeyPath::parse("author")],
                multi_entry: false,
                unique: false,
            },
        )
        .expect("index");
    store
        .seed(
            "books",
            [
                Record::from_pairs([("isbn", Value::from(1)), ("author", Value::from("b"))]),
                Record::from_pairs([("isbn", Value::from(2)), ("author", Value::from("a"))]),
                Record::from_pairs([("isbn", Value::from(3)), ("author", Value::from("a"))]),
            ],
        )
        .expect("seed");

    let query = select("{isbn: book.isbn}")
        .from([("book", stored(&store, "books"))])
        .where_("book.author === 'a'")
        .finalize()
        .expect("finalize");
    let records = query.collect_records(Record::new()).expect("collect");
    assert_eq!(
        records,
        vec![
            Record::from_pairs([("isbn", 2)]),
            Record::from_pairs([("isbn", 3)]),
        ]
    );
}

#[test]
fn insert_commits_on_idle_auto_complete() {
    let store = book_store();
    let query = insert_with(
        "{isbn: ?, title: ?}",
        vec![Value::from(123_456), Value::from("Steps")],
    )
    .into(stored(&store, "books"))
    .finalize()
    .expect("finalize");

    let written = query.collect_records(Record::new()).expect("collect");
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].get("title"), &Value::from("Steps"));

    // collect() drove the idle ticks; the transaction committed without
    // an explicit complete().
    let records = store.records("books").expect("records");
    assert_eq!(records.len(), 1);
}

#[test]
fn duplicate_insert_aborts_the_whole_write() {
    let store = book_store();
    store
        .seed(
            "books",
            [Record::from_pairs([
                ("isbn", Value::from(123_456)),
                ("title", Value::from("Original")),
            ])],
        )
        .expect("seed");

    // Two queued writes in one Write node: the first would be new, the
    // second collides. Nothing may persist.
    let incoming = MemCollection::from_json(json!([
        {"isbn": 111, "title": "Fresh"},
        {"isbn": 123456, "title": "Clash"},
    ]));
    let query = insert("{isbn: r.isbn, title: r.title}")
        .from([("r", SourceInput::from(incoming))])
        .into(stored(&store, "books"))
        .finalize()
        .expect("finalize");

    let result = query.collect_records(Record::new());
    assert!(matches!(result, Err(QueryError::DuplicateKey(_))));

    let records = store.records("books").expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].get("title"), &Value::from("Original"));
}

#[test]
fn upsert_overwrites_existing_keys() {
    let store = book_store();
    store
        .seed(
            "books",
            [Record::from_pairs([
                ("isbn", Value::from(1)),
                ("title", Value::from("Old")),
            ])],
        )
        .expect("seed");

    upsert_with("{isbn: ?, title: ?}", vec![Value::from(1), Value::from("New")])
        .into(stored(&store, "books"))
        .finalize()
        .expect("finalize")
        .collect_records(Record::new())
        .expect("collect");

    let records = store.records("books").expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].get("title"), &Value::from("New"));
}

#[test]
fn update_merges_over_prior_records_and_preserves_keys() {
    let store = inventory_store();
    update_with("{quantity: ?}", vec![Value::from(99)])
        .from([("inventoryItem", stored(&store, "inventoryItems"))])
        .where_("inventoryItem.storeId === 2")
        .into(stored(&store, "inventoryItems"))
        .finalize()
        .expect("finalize")
        .collect_records(Record::new())
        .expect("collect");

    let records = store.records("inventoryItems").expect("records");
    assert_eq!(records.len(), 5);
    for record in records {
        let quantity = record.get("quantity").clone();
        match record.get("storeId") {
            Value::Number(n) if *n == 2.0 => assert_eq!(quantity, Value::from(99)),
            _ => assert_ne!(quantity, Value::from(99)),
        }
        // The composite key survived the merge.
        assert!(!record.get("isbn").is_null());
    }
}

#[test]
fn delete_removes_matched_rows_only() {
    let store = inventory_store();
    delete_from("inventoryItems", stored(&store, "inventoryItems"))
        .where_("inventoryItems.storeId === 1 && inventoryItems.isbn > 200000")
        .finalize()
        .expect("finalize")
        .collect_records(Record::new())
        .expect("collect");

    let records = store.records("inventoryItems").expect("records");
    assert_eq!(records.len(), 3);
}

#[test]
fn returning_projects_written_records() {
    let store = book_store();
    let records = insert_with("{isbn: ?, title: ?}", vec![Value::from(7), Value::from("T")])
        .into(stored(&store, "books"))
        .returning("{key: books.isbn}")
        .finalize()
        .expect("finalize")
        .collect_records(Record::new())
        .expect("collect");
    assert_eq!(records, vec![Record::from_pairs([("key", 7)])]);
}

#[test]
fn reads_and_writes_share_one_transaction() {
    let store = book_store();
    store
        .seed(
            "books",
            [Record::from_pairs([
                ("isbn", Value::from(1)),
                ("title", Value::from("A")),
            ])],
        )
        .expect("seed");

    let write = insert_with("{isbn: ?, title: ?}", vec![Value::from(2), Value::from("B")])
        .into(stored(&store, "books"))
        .finalize()
        .expect("finalize");
    let read = select("{title: book.title}")
        .from([("book", stored(&store, "books"))])
        .finalize()
        .expect("finalize");

    let mut execution = write.execute(Record::new());
    let _: Vec<_> = execution.stream.by_ref().collect();
    let txn = execution.txn().expect("transaction");
    assert!(!txn.is_settled());

    // A second query in the same transaction sees the uncommitted write.
    let titles = {
        let mut read_exec = read.execute_in(Record::new(), Some(txn.clone()));
        let rows: Result<Vec<_>, _> = read_exec.stream.by_ref().collect();
        rows.expect("rows").len()
    };
    assert_eq!(titles, 2);

    // The underlying store still has the committed view.
    assert_eq!(store.records("books").expect("records").len(), 1);

    txn.complete();
    assert_eq!(store.records("books").expect("records").len(), 2);
}

#[test]
fn explicit_abort_discards_store_writes() {
    let store = book_store();
    let write = insert_with("{isbn: ?, title: ?}", vec![Value::from(5), Value::from("X")])
        .into(stored(&store, "books"))
        .finalize()
        .expect("finalize");

    let mut execution = write.execute(Record::new());
    let _: Vec<_> = execution.stream.by_ref().collect();
    let txn = execution.txn().expect("transaction");
    txn.abort(QueryError::Aborted("caller changed its mind".into()));

    assert!(store.records("books").expect("records").is_empty());
    assert!(matches!(txn.outcome(), Some(Err(_))));
}

#[test]
fn settled_transaction_refuses_execution() {
    let store = book_store();
    let query = select("{t: book.title}")
        .from([("book", stored(&store, "books"))])
        .finalize()
        .expect("finalize");

    let txn = squill::Transaction::in_memory();
    txn.complete();
    let mut execution = query.execute_in(Record::new(), Some(txn));
    let result: Result<Vec<_>, _> = execution.stream.by_ref().collect();
    assert!(matches!(result, Err(QueryError::TransactionSettled)));
}

#[test]
fn keyed_collection_update_and_delete_through_overlay() {
    let items = MemCollection::keyed(
        KeyPath::parse("id"),
        [
            Record::from_pairs([("id", 1), ("price", 10)]),
            Record::from_pairs([("id", 2), ("price", 20)]),
        ],
    );

    update_with("{price: ?}", vec![Value::from(15)])
        .from([("item", SourceInput::from(items.clone()))])
        .where_("item.id === 1")
        .into(SourceInput::from(items.clone()))
        .finalize()
        .expect("finalize")
        .collect_records(Record::new())
        .expect("collect");
    assert_eq!(items.records()[0].get("price"), &Value::from(15));

    delete_from("item", SourceInput::from(items.clone()))
        .where_("item.id === 2")
        .finalize()
        .expect("finalize")
        .collect_records(Record::new())
        .expect("collect");
    assert_eq!(items.len(), 1);
    assert_eq!(items.records()[0].get("id"), &Value::from(1));
}
