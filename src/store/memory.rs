//! In-memory reference implementation of the store contract.
//!
//! An ordered key/value store with named sources, primary keys (in-line,
//! out-of-line, or composite), auto-increment key generation, and named
//! secondary indexes. Transactions take a snapshot of the touched sources
//! at open; writes land in the snapshot and swap back into the store on
//! commit, so an aborted transaction leaves no trace.
//!
//! This store backs the integration tests and doubles as the embedded
//! default backend; it favours clarity over throughput.

use crate::error::{QueryError, QueryResult};
use crate::range::NativeRange;
use crate::store::{
    Cursor, IndexMeta, SourceMeta, Store, StoreSource, StoreTransaction, TxnMode,
};
use crate::value::{KeyPath, KeySpec, Record, Value};
use parking_lot::RwLock;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct Table {
    key_spec: KeySpec,
    auto_increment: bool,
    indexes: Vec<IndexMeta>,
    rows: BTreeMap<Value, Record>,
    next_key: u64,
}

impl Table {
    fn meta(&self) -> SourceMeta {
        SourceMeta {
            key_spec: self.key_spec.clone(),
            auto_increment: self.auto_increment,
            indexes: self.indexes.clone(),
        }
    }
}

/// An ordered in-memory store.
pub struct MemoryStore {
    name: String,
    tables: Arc<RwLock<BTreeMap<String, Table>>>,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> MemoryStore {
        MemoryStore {
            name: name.into(),
            tables: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Define a source. `key_spec` of `KeySpec::None` makes the primary
    /// key out-of-line (carried on `Record::primary_key`).
    pub fn define_source(&self, name: impl Into<String>, key_spec: KeySpec, auto_increment: bool) {
        self.tables.write().insert(
            name.into(),
            Table {
                key_spec,
                auto_increment,
                indexes: Vec::new(),
                rows: BTreeMap::new(),
                next_key: 1,
            },
        );
    }

    /// Attach a secondary index to an existing source.
    pub fn define_index(&self, source: &str, index: IndexMeta) -> QueryResult<()> {
        let mut tables = self.tables.write();
        let table = tables
            .get_mut(source)
            .ok_or_else(|| QueryError::Store(format!("unknown source '{source}'")))?;
        table.indexes.push(index);
        Ok(())
    }

    /// Seed records directly, outside any transaction. Intended for setup
    /// code; fails on key conflicts.
    pub fn seed(&self, source: &str, records: impl IntoIterator<Item = Record>) -> QueryResult<()> {
        let mut tables = self.tables.write();
        let table = tables
            .get_mut(source)
            .ok_or_else(|| QueryError::Store(format!("unknown source '{source}'")))?;
        for record in records {
            let key = table
                .key_spec
                .extract(&record)
                .ok_or_else(|| QueryError::Store("seed record has no primary key".into()))?;
            if table.rows.insert(key.clone(), record).is_some() {
                return Err(QueryError::DuplicateKey(key.to_string()));
            }
        }
        Ok(())
    }

    /// Direct snapshot of a source's records, in primary-key order.
    pub fn records(&self, source: &str) -> QueryResult<Vec<Record>> {
        let tables = self.tables.read();
        let table = tables
            .get(source)
            .ok_or_else(|| QueryError::Store(format!("unknown source '{source}'")))?;
        Ok(table.rows.values().cloned().collect())
    }
}

impl Store for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_meta(&self, source: &str) -> QueryResult<SourceMeta> {
        let tables = self.tables.read();
        tables
            .get(source)
            .map(Table::meta)
            .ok_or_else(|| QueryError::Store(format!("unknown source '{source}'")))
    }

    fn transaction(
        &self,
        sources: &[String],
        mode: TxnMode,
    ) -> QueryResult<Box<dyn StoreTransaction>> {
        let tables = self.tables.read();
        let mut snapshot = BTreeMap::new();
        for name in sources {
            let table = tables
                .get(name)
                .ok_or_else(|| QueryError::Store(format!("unknown source '{name}'")))?;
            snapshot.insert(name.clone(), table.clone());
        }
        Ok(Box::new(MemoryTransaction {
            store: Arc::clone(&self.tables),
            snapshot: Rc::new(RefCell::new(snapshot)),
            mode,
            settled: false,
        }))
    }
}

struct MemoryTransaction {
    store: Arc<RwLock<BTreeMap<String, Table>>>,
    snapshot: Rc<RefCell<BTreeMap<String, Table>>>,
    mode: TxnMode,
    settled: bool,
}

impl StoreTransaction for MemoryTransaction {
    fn source(&self, name: &str) -> QueryResult<Box<dyn StoreSource>> {
        if !self.snapshot.borrow().contains_key(name) {
            return Err(QueryError::Store(format!(
                "source '{name}' is not part of this transaction"
            )));
        }
        Ok(Box::new(MemorySource {
            name: name.to_string(),
            snapshot: Rc::clone(&self.snapshot),
            mode: self.mode,
        }))
    }

    fn commit(&mut self) -> QueryResult<()> {
        if self.settled {
            return Err(QueryError::TransactionSettled);
        }
        self.settled = true;
        let mut tables = self.store.write();
        for (name, table) in self.snapshot.borrow().iter() {
            tables.insert(name.clone(), table.clone());
        }
        Ok(())
    }

    fn abort(&mut self) {
        // Snapshot is simply dropped; idempotent.
        self.settled = true;
    }

    fn is_settled(&self) -> bool {
        self.settled
    }
}

struct MemorySource {
    name: String,
    snapshot: Rc<RefCell<BTreeMap<String, Table>>>,
    mode: TxnMode,
}

impl MemorySource {
    fn with_table<T>(&self, f: impl FnOnce(&Table) -> T) -> T {
        let snapshot = self.snapshot.borrow();
        f(snapshot.get(&self.name).expect("source checked at open"))
    }

    fn with_table_mut<T>(&self, f: impl FnOnce(&mut Table) -> QueryResult<T>) -> QueryResult<T> {
        if self.mode == TxnMode::Read {
            return Err(QueryError::Store(
                "write attempted in a read-only transaction".into(),
            ));
        }
        let mut snapshot = self.snapshot.borrow_mut();
        f(snapshot.get_mut(&self.name).expect("source checked at open"))
    }

    fn check_unique_indexes(table: &Table, record: &Record, key: &Value) -> QueryResult<()> {
        for index in table.indexes.iter().filter(|i| i.unique) {
            let Some(candidate) = index_key(index, record) else {
                continue;
            };
            for (other_key, other) in &table.rows {
                if other_key == key {
                    continue;
                }
                if index_key(index, other).as_ref() == Some(&candidate) {
                    return Err(QueryError::DuplicateKey(format!(
                        "unique index '{}' already contains {candidate}",
                        index.name
                    )));
                }
            }
        }
        Ok(())
    }

    fn resolve_key(table: &mut Table, record: &mut Record, explicit: Option<Value>) -> QueryResult<Value> {
        match (&table.key_spec, explicit) {
            (KeySpec::None, Some(key)) => {
                record.set_primary_key(key.clone());
                Ok(key)
            }
            (KeySpec::None, None) => {
                if !table.auto_increment {
                    return Err(QueryError::Store(
                        "source has no key path and no explicit key was given".into(),
                    ));
                }
                let key = Value::Number(table.next_key as f64);
                table.next_key += 1;
                record.set_primary_key(key.clone());
                Ok(key)
            }
            (KeySpec::Single(_) | KeySpec::Composite(_), Some(_)) => Err(QueryError::Store(
                "explicit key is not allowed with an in-line key path".into(),
            )),
            (KeySpec::Single(path), None) => match table.key_spec.extract(record) {
                Some(key) => Ok(key),
                None => {
                    if !table.auto_increment {
                        return Err(QueryError::Store(
                            "record is missing its primary key".into(),
                        ));
                    }
                    let key = Value::Number(table.next_key as f64);
                    table.next_key += 1;
                    set_path(record, path, key.clone());
                    Ok(key)
                }
            },
            (KeySpec::Composite(_), None) => table.key_spec.extract(record).ok_or_else(|| {
                QueryError::Store("record is missing a composite key component".into())
            }),
        }
    }
}

impl StoreSource for MemorySource {
    fn meta(&self) -> SourceMeta {
        self.with_table(Table::meta)
    }

    fn open_cursor(&self, range: Option<&NativeRange>) -> QueryResult<Cursor> {
        let rows: Vec<(Value, Record)> = self.with_table(|table| {
            table
                .rows
                .iter()
                .filter(|(key, _)| range.is_none_or(|r| r.contains(key)))
                .map(|(key, record)| {
                    let mut record = record.clone();
                    if matches!(table.key_spec, KeySpec::None) {
                        record.set_primary_key(key.clone());
                    }
                    (key.clone(), record)
                })
                .collect()
        });
        Ok(Box::new(rows.into_iter().map(Ok)))
    }

    fn open_index_cursor(
        &self,
        index: &str,
        range: Option<&NativeRange>,
    ) -> QueryResult<Cursor> {
        let entries = self.with_table(|table| {
            let Some(meta) = table.indexes.iter().find(|i| i.name == index) else {
                return Err(QueryError::Store(format!(
                    "unknown index '{index}' on source '{}'",
                    self.name
                )));
            };
            let mut entries: Vec<(Value, Value, Record)> = Vec::new();
            for (pk, record) in &table.rows {
                for key in index_keys(meta, record) {
                    if range.is_none_or(|r| r.contains(&key)) {
                        entries.push((key, pk.clone(), record.clone()));
                    }
                }
            }
            // Index-key order, primary key breaking ties.
            entries.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
            Ok(entries)
        })?;
        Ok(Box::new(
            entries.into_iter().map(|(_, pk, record)| Ok((pk, record))),
        ))
    }

    fn put(&mut self, record: Record, key: Option<Value>) -> QueryResult<Record> {
        self.with_table_mut(|table| {
            let mut record = record;
            let key = MemorySource::resolve_key(table, &mut record, key)?;
            MemorySource::check_unique_indexes(table, &record, &key)?;
            table.rows.insert(key, record.clone());
            Ok(record)
        })
    }

    fn add(&mut self, record: Record, key: Option<Value>) -> QueryResult<Record> {
        self.with_table_mut(|table| {
            let mut record = record;
            let key = MemorySource::resolve_key(table, &mut record, key)?;
            if table.rows.contains_key(&key) {
                return Err(QueryError::DuplicateKey(key.to_string()));
            }
            MemorySource::check_unique_indexes(table, &record, &key)?;
            table.rows.insert(key, record.clone());
            Ok(record)
        })
    }

    fn delete(&mut self, key: &Value) -> QueryResult<()> {
        self.with_table_mut(|table| {
            table.rows.remove(key);
            Ok(())
        })
    }
}

/// Key of `record` under `index`, ignoring multi-entry fan-out.
fn index_key(index: &IndexMeta, record: &Record) -> Option<Value> {
    if index.key_paths.len() == 1 {
        match index.key_paths[0].extract(record) {
            Value::Null => None,
            v => Some(v),
        }
    } else {
        let parts: Vec<Value> = index
            .key_paths
            .iter()
            .map(|p| p.extract(record))
            .collect();
        if parts.iter().any(Value::is_null) {
            None
        } else {
            Some(Value::Sequence(parts))
        }
    }
}

/// All index keys of `record`, fanning out sequence values for
/// multi-entry indexes.
fn index_keys(index: &IndexMeta, record: &Record) -> Vec<Value> {
    if index.multi_entry && index.key_paths.len() == 1 {
        match index.key_paths[0].extract(record) {
            Value::Sequence(items) => items,
            Value::Null => Vec::new(),
            v => vec![v],
        }
    } else {
        index_key(index, record).into_iter().collect()
    }
}

/// Write `value` at `path`, creating intermediate records as needed.
fn set_path(record: &mut Record, path: &KeyPath, value: Value) {
    let segments = path.segments();
    if segments.len() == 1 {
        record.set(segments[0].clone(), value);
        return;
    }
    let mut nested = match record.get(&segments[0]) {
        Value::Record(r) => r.clone(),
        _ => Record::new(),
    };
    set_path(&mut nested, &KeyPath::new(segments[1..].to_vec()), value);
    record.set(segments[0].clone(), Value::Record(nested));
}
