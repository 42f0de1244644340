//! Key paths and key-space arithmetic.
//!
//! A [`KeyPath`] is a dot-separated chain of field accesses into a record;
//! stores use one (or an ordered list, for composite keys) to derive the
//! primary or index key of a record. [`next_up`] defines the least value
//! strictly greater than a given value in the total order, which the range
//! algebra uses to rewrite closed upper bounds as half-open ones.

use crate::value::{Record, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A chain of identifier accesses into a record, e.g. `address.city`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyPath(Vec<String>);

impl KeyPath {
    pub fn new(segments: Vec<String>) -> KeyPath {
        KeyPath(segments)
    }

    /// Parse a dot-separated path.
    pub fn parse(path: &str) -> KeyPath {
        KeyPath(path.split('.').map(str::to_string).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Walk the path through nested records; absent fields yield `Null`.
    pub fn extract(&self, record: &Record) -> Value {
        let mut current = record.get(&self.0[0]).clone();
        for segment in &self.0[1..] {
            current = match current {
                Value::Record(ref r) => r.get(segment).clone(),
                _ => return Value::Null,
            };
        }
        current
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

impl From<&str> for KeyPath {
    fn from(path: &str) -> KeyPath {
        KeyPath::parse(path)
    }
}

/// How a store source derives primary keys from records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeySpec {
    /// Keyless store; the native key travels on `Record::primary_key`.
    None,
    Single(KeyPath),
    /// Composite key: the ordered list of paths forms a key sequence.
    Composite(Vec<KeyPath>),
}

impl KeySpec {
    /// Extract the primary key of `record` under this spec.
    ///
    /// Composite specs produce a `Sequence` of the component values.
    pub fn extract(&self, record: &Record) -> Option<Value> {
        match self {
            KeySpec::None => record.primary_key().cloned(),
            KeySpec::Single(path) => match path.extract(record) {
                Value::Null => None,
                v => Some(v),
            },
            KeySpec::Composite(paths) => {
                let parts: Vec<Value> = paths.iter().map(|p| p.extract(record)).collect();
                if parts.iter().any(Value::is_null) {
                    None
                } else {
                    Some(Value::Sequence(parts))
                }
            }
        }
    }

    pub fn paths(&self) -> Vec<KeyPath> {
        match self {
            KeySpec::None => vec![],
            KeySpec::Single(p) => vec![p.clone()],
            KeySpec::Composite(ps) => ps.clone(),
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, KeySpec::Composite(_))
    }
}

/// The least value strictly greater than `v` in the total order.
///
/// Crossing a type boundary steps to the least value of the next type:
/// `+inf` steps to the earliest timestamp, the latest timestamp to the
/// empty string. Strings gain a trailing NUL, sequences a trailing `-inf`.
pub fn next_up(v: &Value) -> Value {
    match v {
        Value::Null => Value::Bool(false),
        Value::Bool(false) => Value::Bool(true),
        Value::Bool(true) => Value::Number(f64::NEG_INFINITY),
        Value::Number(n) => {
            if *n == f64::INFINITY {
                Value::Timestamp(i64::MIN)
            } else {
                Value::Number(n.next_up())
            }
        }
        Value::Timestamp(t) => {
            if *t == i64::MAX {
                Value::String(String::new())
            } else {
                Value::Timestamp(t + 1)
            }
        }
        Value::String(s) => {
            let mut out = s.clone();
            out.push('\0');
            Value::String(out)
        }
        Value::Sequence(items) => {
            let mut out = items.clone();
            out.push(Value::Number(f64::NEG_INFINITY));
            Value::Sequence(out)
        }
        Value::Record(_) => {
            // Records never appear as index keys; treat like a sequence
            // suffix so the function stays total.
            Value::Sequence(vec![v.clone(), Value::Number(f64::NEG_INFINITY)])
        }
    }
}
