//! # Store Contracts
//!
//! The abstract contract a persistent backing store must satisfy, plus the
//! in-memory collection type queries can run against directly. A store
//! exposes named sources behind short-lived transactions; each source
//! carries a key spec, an auto-increment flag, and named secondary
//! indexes, and serves ordered cursors over native key ranges.
//!
//! The engine opens at most one store transaction per query; writes go
//! through `put`/`add`/`delete` and reads through cursors, which are lazy
//! and release their resources when dropped.

pub mod memory;

pub use memory::MemoryStore;

use crate::error::QueryResult;
use crate::range::NativeRange;
use crate::value::{KeyPath, KeySpec, Record, Value};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Transaction mode requested by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnMode {
    Read,
    ReadWrite,
}

/// Metadata of one named secondary index.
#[derive(Debug, Clone)]
pub struct IndexMeta {
    pub name: String,
    pub key_paths: Vec<KeyPath>,
    pub multi_entry: bool,
    pub unique: bool,
}

/// Metadata of one named source within a store.
#[derive(Debug, Clone)]
pub struct SourceMeta {
    pub key_spec: KeySpec,
    pub auto_increment: bool,
    pub indexes: Vec<IndexMeta>,
}

/// A lazy cursor over `(primary key, record)` pairs.
pub type Cursor = Box<dyn Iterator<Item = QueryResult<(Value, Record)>>>;

/// The persistent key/value store contract.
pub trait Store {
    fn name(&self) -> &str;

    /// Source metadata, available without a transaction; the planner uses
    /// it for index selection.
    fn source_meta(&self, source: &str) -> QueryResult<SourceMeta>;

    /// Open a transaction over the named sources.
    fn transaction(
        &self,
        sources: &[String],
        mode: TxnMode,
    ) -> QueryResult<Box<dyn StoreTransaction>>;
}

/// A store transaction: exposes each named source, settles exactly once.
pub trait StoreTransaction {
    fn source(&self, name: &str) -> QueryResult<Box<dyn StoreSource>>;
    fn commit(&mut self) -> QueryResult<()>;
    fn abort(&mut self);
    fn is_settled(&self) -> bool;
}

/// One named source inside a store transaction.
pub trait StoreSource {
    fn meta(&self) -> SourceMeta;

    /// Cursor over the primary index, in key order.
    fn open_cursor(&self, range: Option<&NativeRange>) -> QueryResult<Cursor>;

    /// Cursor over a named secondary index, in index-key order; yields the
    /// base records with their native primary keys.
    fn open_index_cursor(&self, index: &str, range: Option<&NativeRange>)
        -> QueryResult<Cursor>;

    /// Insert or overwrite; returns the record as persisted (including any
    /// generated primary key).
    fn put(&mut self, record: Record, key: Option<Value>) -> QueryResult<Record>;

    /// Insert; fails with a duplicate-key error if the key exists.
    fn add(&mut self, record: Record, key: Option<Value>) -> QueryResult<Record>;

    fn delete(&mut self, key: &Value) -> QueryResult<()>;
}

// --------------------------------------------------------------------------
// In-memory collections
// --------------------------------------------------------------------------

/// Identity of one row slot in an in-memory collection, unique across the
/// process. Transaction overlays key their shadows by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowId(u64);

impl RowId {
    pub(crate) fn fresh() -> RowId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        RowId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Identity of a collection, used to route overlay writes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CollectionId(u64);

impl CollectionId {
    fn fresh() -> CollectionId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        CollectionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug)]
struct CollectionInner {
    rows: Vec<(RowId, Record)>,
}

/// An in-memory collection: an ordered sequence of records, optionally
/// keyed by a path (a mapping from primary key to record).
///
/// Cloning shares the underlying rows; queries read through the ambient
/// transaction's overlay so uncommitted writes stay private to their
/// transaction.
#[derive(Debug, Clone)]
pub struct MemCollection {
    id: CollectionId,
    key: Option<KeyPath>,
    inner: Rc<RefCell<CollectionInner>>,
}

impl MemCollection {
    pub fn new() -> MemCollection {
        MemCollection {
            id: CollectionId::fresh(),
            key: None,
            inner: Rc::new(RefCell::new(CollectionInner { rows: Vec::new() })),
        }
    }

    pub fn from_records(records: impl IntoIterator<Item = Record>) -> MemCollection {
        let collection = MemCollection::new();
        {
            let mut inner = collection.inner.borrow_mut();
            for record in records {
                inner.rows.push((RowId::fresh(), record));
            }
        }
        collection
    }

    /// Keyed variant: a mapping from the key-path value to the record.
    pub fn keyed(key: KeyPath, records: impl IntoIterator<Item = Record>) -> MemCollection {
        let mut collection = MemCollection::from_records(records);
        collection.key = Some(key);
        collection
    }

    /// Build from JSON array literals, for embedders and tests.
    pub fn from_json(value: serde_json::Value) -> MemCollection {
        let records = match Value::from(value) {
            Value::Sequence(items) => items
                .into_iter()
                .filter_map(|v| match v {
                    Value::Record(r) => Some(r),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };
        MemCollection::from_records(records)
    }

    pub fn id(&self) -> CollectionId {
        self.id
    }

    pub fn key_path(&self) -> Option<&KeyPath> {
        self.key.as_ref()
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().rows.is_empty()
    }

    /// Snapshot the base rows, in insertion order.
    pub fn rows(&self) -> Vec<(RowId, Record)> {
        self.inner.borrow().rows.clone()
    }

    pub fn records(&self) -> Vec<Record> {
        self.inner
            .borrow()
            .rows
            .iter()
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Append a record to the base collection, bypassing any overlay.
    pub fn push(&self, record: Record) -> RowId {
        let id = RowId::fresh();
        self.inner.borrow_mut().rows.push((id, record));
        id
    }

    /// Row lookup by key-path value; `None` for unkeyed collections.
    pub fn find_by_key(&self, key: &Value) -> Option<(RowId, Record)> {
        let path = self.key.as_ref()?;
        self.inner
            .borrow()
            .rows
            .iter()
            .find(|(_, rec)| &path.extract(rec) == key)
            .cloned()
    }

    /// Commit-back entry points used by the transaction overlay.
    pub(crate) fn apply_insert(&self, id: RowId, record: Record) {
        self.inner.borrow_mut().rows.push((id, record));
    }

    pub(crate) fn apply_shadow(&self, id: RowId, shadow: &Record) {
        let mut inner = self.inner.borrow_mut();
        if let Some((_, base)) = inner.rows.iter_mut().find(|(rid, _)| *rid == id) {
            *base = base.merged_with(shadow);
        }
    }

    pub(crate) fn apply_delete(&self, id: RowId) {
        self.inner.borrow_mut().rows.retain(|(rid, _)| *rid != id);
    }
}

impl Default for MemCollection {
    fn default() -> MemCollection {
        MemCollection::new()
    }
}

impl fmt::Display for MemCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "collection#{} ({} rows)", self.id.0, self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_json_builds_records() {
        let c = MemCollection::from_json(json!([
            {"id": 1, "name": "Apple"},
            {"id": 2, "name": "Banana"},
        ]));
        assert_eq!(c.len(), 2);
        assert_eq!(c.records()[1].get("name"), &Value::from("Banana"));
    }

    #[test]
    fn keyed_lookup_uses_key_path() {
        let c = MemCollection::keyed(
            KeyPath::parse("id"),
            [
                Record::from_pairs([("id", 1), ("x", 10)]),
                Record::from_pairs([("id", 2), ("x", 20)]),
            ],
        );
        let (_, rec) = c.find_by_key(&Value::from(2)).expect("found");
        assert_eq!(rec.get("x"), &Value::from(20));
        assert!(c.find_by_key(&Value::from(3)).is_none());
    }

    #[test]
    fn clones_share_rows() {
        let a = MemCollection::new();
        let b = a.clone();
        a.push(Record::from_pairs([("x", 1)]));
        assert_eq!(b.len(), 1);
        assert_eq!(a.id(), b.id());
    }
}
