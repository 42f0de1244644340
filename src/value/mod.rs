//! # Value Type System
//!
//! Core value domain for the query engine: Null, Bool, Number, Timestamp,
//! String, Sequence, Record. A single total order (`Value::cmp`) ranks
//! values across types in the fixed sequence
//! `number < timestamp < string < sequence`, which drives key comparison,
//! ordering, deduplication, and group keys.
//!
//! ## Usage
//!
//! ```rust
//! use squill::value::{Record, Value};
//!
//! let rec = Record::from_pairs([
//!     ("id", Value::from(1)),
//!     ("name", Value::from("Apple")),
//! ]);
//! assert_eq!(rec.get("name"), &Value::from("Apple"));
//! ```

pub mod key;

pub use key::{next_up, KeyPath, KeySpec};

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// A value in the ordered domain.
///
/// `Timestamp` carries epoch milliseconds; `chrono` conversions live at the
/// boundary ([`Value::from_datetime`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    /// Epoch milliseconds.
    Timestamp(i64),
    String(String),
    Sequence(Vec<Value>),
    Record(Record),
}

impl Value {
    /// Rank of the variant in the cross-type total order.
    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::Timestamp(_) => 3,
            Value::String(_) => 4,
            Value::Sequence(_) => 5,
            Value::Record(_) => 6,
        }
    }

    /// Null or absent, as far as ordering and aggregates are concerned.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Truthiness used by predicate evaluation.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::Timestamp(_) => true,
            Value::String(s) => !s.is_empty(),
            Value::Sequence(_) | Value::Record(_) => true,
        }
    }

    /// Strict equality: same variant and equal under the total order.
    pub fn strict_eq(&self, other: &Value) -> bool {
        self.type_rank() == other.type_rank() && self.cmp(other) == Ordering::Equal
    }

    pub fn from_datetime(dt: chrono::DateTime<chrono::Utc>) -> Value {
        Value::Timestamp(dt.timestamp_millis())
    }
}

impl Ord for Value {
    /// The total order over the value domain.
    ///
    /// Across types: null < bool < number < timestamp < string < sequence
    /// < record. Within a type the natural order applies; numbers compare
    /// via `f64::total_cmp`, sequences lexicographically, records by their
    /// ordered field lists.
    fn cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Number(a), Value::Number(b)) => a.total_cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Sequence(a), Value::Sequence(b)) => a.cmp(b),
            (Value::Record(a), Value::Record(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Value) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::Timestamp(t) => write!(f, "@{t}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Sequence(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Record(r) => write!(f, "{r}"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Value {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Value {
        Value::Number(f64::from(n))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Value {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::String(s)
    }
}

impl From<Record> for Value {
    fn from(r: Record) -> Value {
        Value::Record(r)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Value {
        Value::Sequence(items.into_iter().map(Into::into).collect())
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Value {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Sequence(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(fields) => Value::Record(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

/// A string-keyed record of values.
///
/// For records read from a keyless store the native primary key rides along
/// in the explicit `primary_key` slot instead of a sentinel attribute.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Record {
    fields: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    primary_key: Option<Box<Value>>,
}

impl Record {
    pub fn new() -> Record {
        Record::default()
    }

    pub fn from_pairs<K, V, I>(pairs: I) -> Record
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Record {
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            primary_key: None,
        }
    }

    /// Field lookup; absent fields read as `Null`.
    pub fn get(&self, name: &str) -> &Value {
        static NULL: Value = Value::Null;
        self.fields.get(name).unwrap_or(&NULL)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    pub fn field_names(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Shallow merge: fields of `other` overwrite fields of `self`.
    pub fn merged_with(&self, other: &Record) -> Record {
        let mut out = self.clone();
        for (k, v) in other.iter() {
            out.set(k.clone(), v.clone());
        }
        if other.primary_key.is_some() {
            out.primary_key = other.primary_key.clone();
        }
        out
    }

    /// Native primary key for records from keyless stores.
    pub fn primary_key(&self) -> Option<&Value> {
        self.primary_key.as_deref()
    }

    pub fn set_primary_key(&mut self, key: Value) {
        self.primary_key = Some(Box::new(key));
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (k, v)) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{k}: {v}")?;
        }
        write!(f, "}}")
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Record {
        Record {
            fields: iter.into_iter().collect(),
            primary_key: None,
        }
    }
}

/// Binding name carried by anonymous tuples (select, group-by, and write
/// outputs). `this` in downstream expressions resolves to this record.
pub const VALUE_BINDING: &str = "$value";

/// The executor's tuple: one bound record per source name in scope.
///
/// A row always carries exactly the sources in scope at its point in the
/// plan; a missing binding is an internal bug, not a runtime condition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    entries: BTreeMap<String, Record>,
}

impl Row {
    pub fn new() -> Row {
        Row::default()
    }

    pub fn get(&self, source: &str) -> Option<&Record> {
        self.entries.get(source)
    }

    pub fn bind(&mut self, source: impl Into<String>, record: Record) {
        self.entries.insert(source.into(), record);
    }

    /// New row with `source` bound to `record` on top of `self`.
    pub fn with(&self, source: impl Into<String>, record: Record) -> Row {
        let mut out = self.clone();
        out.bind(source, record);
        out
    }

    /// Union of two rows; bindings of `other` win on collision.
    pub fn union(&self, other: &Row) -> Row {
        let mut out = self.clone();
        for (name, rec) in &other.entries {
            out.entries.insert(name.clone(), rec.clone());
        }
        out
    }

    pub fn sources(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Record)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Structural value form, used for dedup sets and group keys.
    pub fn as_value(&self) -> Value {
        Value::Record(
            self.entries
                .iter()
                .map(|(name, rec)| (name.clone(), Value::Record(rec.clone())))
                .collect(),
        )
    }

    /// The sentinel record bound for right-side sources of an outer join
    /// that produced no match.
    pub fn otherwise_record() -> Record {
        Record::from_pairs([("otherwise", Value::Bool(true))])
    }

    /// An anonymous tuple holding one output record.
    pub fn of_value(record: Record) -> Row {
        let mut row = Row::new();
        row.bind(VALUE_BINDING, record);
        row
    }

    /// The record a consumer sees for this row: the anonymous output
    /// record when present, a single source binding, or the whole row as
    /// a record of records.
    pub fn result_record(&self) -> Record {
        if let Some(rec) = self.entries.get(VALUE_BINDING) {
            return rec.clone();
        }
        if self.entries.len() == 1 {
            return self.entries.values().next().cloned().unwrap_or_default();
        }
        self.entries
            .iter()
            .map(|(name, rec)| (name.clone(), Value::Record(rec.clone())))
            .collect::<Record>()
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, (name, rec)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}: {rec}")?;
        }
        write!(f, ")")
    }
}
