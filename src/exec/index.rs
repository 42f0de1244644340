//! Index selection for persistent sources.
//!
//! Given the key ranges finalization attached to a source and the store's
//! index metadata, pick the most selective access path: the primary index
//! when any prefix of it is usable, then unique secondaries, then
//! non-unique ones, else a full scan. A prefix is usable when every
//! component has a range and every range before the last is an equality;
//! the cross product of the prepared equality points and the prepared
//! final intervals becomes one native range per cursor pass.

use crate::error::{QueryError, QueryResult};
use crate::expr::EvalScope;
use crate::range::{CompositeRange, Interval, KeyRange, NativeRange};
use crate::store::SourceMeta;
use crate::value::{KeyPath, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// The chosen access path for one source scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessPath {
    FullScan,
    /// Primary index with the native ranges to visit, in order.
    Primary(Vec<NativeRange>),
    /// Named secondary index with the native ranges to visit.
    Secondary(String, Vec<NativeRange>),
    /// The attached ranges prepared to nothing: the result is empty.
    Empty,
}

/// Longest usable prefix of `paths` under the attached ranges.
fn usable_len(paths: &[KeyPath], ranges: &BTreeMap<KeyPath, KeyRange>) -> usize {
    let mut len = 0;
    for path in paths {
        let Some(range) = ranges.get(path) else {
            break;
        };
        len += 1;
        if !range.is_equality() {
            // A general range may only terminate the prefix.
            break;
        }
    }
    len
}

/// Choose the access path for a stored source.
pub fn choose_access_path(
    meta: &SourceMeta,
    ranges: &BTreeMap<KeyPath, KeyRange>,
    scope: &EvalScope<'_>,
) -> QueryResult<AccessPath> {
    if ranges.is_empty() {
        return Ok(AccessPath::FullScan);
    }

    let primary_paths = meta.key_spec.paths();
    let primary_usable = usable_len(&primary_paths, ranges);
    if primary_usable > 0 {
        debug!(prefix = primary_usable, "scanning primary index");
        let native = native_ranges(&primary_paths, primary_usable, ranges, scope)?;
        return Ok(match native {
            Some(native) => AccessPath::Primary(native),
            None => AccessPath::Empty,
        });
    }

    // Unique secondaries first, then non-unique; multi-entry indexes are
    // not candidates. Longest usable prefix wins within each class.
    for unique in [true, false] {
        let best = meta
            .indexes
            .iter()
            .filter(|i| !i.multi_entry && i.unique == unique)
            .map(|i| (usable_len(&i.key_paths, ranges), i))
            .filter(|(len, _)| *len > 0)
            .max_by_key(|(len, _)| *len);
        if let Some((len, index)) = best {
            debug!(index = %index.name, prefix = len, "scanning secondary index");
            let native = native_ranges(&index.key_paths, len, ranges, scope)?;
            return Ok(match native {
                Some(native) => AccessPath::Secondary(index.name.clone(), native),
                None => AccessPath::Empty,
            });
        }
    }

    Ok(AccessPath::FullScan)
}

/// Native ranges for a usable prefix: cross product of the equality
/// points with the final prepared intervals. `None` means some component
/// prepared to the empty relation.
fn native_ranges(
    paths: &[KeyPath],
    usable: usize,
    ranges: &BTreeMap<KeyPath, KeyRange>,
    scope: &EvalScope<'_>,
) -> QueryResult<Option<Vec<NativeRange>>> {
    let composite = paths.len() > 1;

    // Prepared equality components, each a list of single points.
    let mut equality_points: Vec<Vec<Value>> = Vec::new();
    for path in &paths[..usable - 1] {
        let prepared = ranges[path].prepare(scope)?;
        if prepared.is_empty() {
            return Ok(None);
        }
        let mut points = Vec::with_capacity(prepared.len());
        for interval in prepared {
            if !interval.is_equality() {
                return Err(QueryError::Internal(
                    "equality range prepared to a non-point interval".into(),
                ));
            }
            match interval.lower {
                crate::range::Bound::Inclusive(v) => points.push(v),
                _ => {
                    return Err(QueryError::Internal(
                        "equality range with unbounded endpoint".into(),
                    ))
                }
            }
        }
        equality_points.push(points);
    }

    let last: Vec<Interval> = ranges[&paths[usable - 1]].prepare(scope)?;
    if last.is_empty() {
        return Ok(None);
    }

    let mut out = Vec::new();
    let mut prefixes: Vec<Vec<Value>> = vec![Vec::new()];
    for points in equality_points {
        let mut next = Vec::with_capacity(prefixes.len() * points.len());
        for prefix in &prefixes {
            for point in &points {
                let mut p = prefix.clone();
                p.push(point.clone());
                next.push(p);
            }
        }
        prefixes = next;
    }
    for prefix in prefixes {
        for interval in &last {
            let composite_range = CompositeRange {
                equalities: prefix.clone(),
                last: interval.clone(),
            };
            out.push(composite_range.to_native(composite));
        }
    }
    Ok(Some(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::IndexMeta;
    use crate::value::KeySpec;

    fn scope() -> EvalScope<'static> {
        EvalScope::constant()
    }

    fn composite_meta() -> SourceMeta {
        SourceMeta {
            key_spec: KeySpec::Composite(vec![
                KeyPath::parse("storeId"),
                KeyPath::parse("isbn"),
            ]),
            auto_increment: false,
            indexes: Vec::new(),
        }
    }

    #[test]
    fn no_ranges_means_full_scan() {
        let path = choose_access_path(&composite_meta(), &BTreeMap::new(), &scope())
            .expect("choose");
        assert_eq!(path, AccessPath::FullScan);
    }

    #[test]
    fn equality_prefix_plus_range_uses_primary() {
        let mut ranges = BTreeMap::new();
        ranges.insert(
            KeyPath::parse("storeId"),
            KeyRange::Literal(Interval::equality(Value::from(1))),
        );
        ranges.insert(
            KeyPath::parse("isbn"),
            KeyRange::Literal(Interval::above(Value::from(200_000))),
        );
        let path =
            choose_access_path(&composite_meta(), &ranges, &scope()).expect("choose");
        let AccessPath::Primary(native) = path else {
            panic!("expected primary scan, got {path:?}");
        };
        assert_eq!(native.len(), 1);
        assert!(native[0].contains(&Value::Sequence(vec![
            Value::from(1),
            Value::from(234_567)
        ])));
        assert!(!native[0].contains(&Value::Sequence(vec![
            Value::from(2),
            Value::from(234_567)
        ])));
    }

    #[test]
    fn range_on_first_component_stops_the_prefix() {
        // storeId > 1 && isbn > 2: only storeId is usable (a general range
        // terminates the prefix).
        let mut ranges = BTreeMap::new();
        ranges.insert(
            KeyPath::parse("storeId"),
            KeyRange::Literal(Interval::above(Value::from(1))),
        );
        ranges.insert(
            KeyPath::parse("isbn"),
            KeyRange::Literal(Interval::above(Value::from(2))),
        );
        let path =
            choose_access_path(&composite_meta(), &ranges, &scope()).expect("choose");
        let AccessPath::Primary(native) = path else {
            panic!("expected primary scan");
        };
        // Suffix unconstrained: every isbn under storeId 2 is included.
        assert!(native[0].contains(&Value::Sequence(vec![Value::from(2), Value::from(0)])));
    }

    #[test]
    fn secondary_chosen_when_primary_unusable() {
        let meta = SourceMeta {
            key_spec: KeySpec::Single(KeyPath::parse("id")),
            auto_increment: true,
            indexes: vec![
                IndexMeta {
                    name: "by_tag".into(),
                    key_paths: vec![KeyPath::parse("tag")],
                    multi_entry: true,
                    unique: false,
                },
                IndexMeta {
                    name: "by_name".into(),
                    key_paths: vec![KeyPath::parse("name")],
                    multi_entry: false,
                    unique: true,
                },
            ],
        };
        let mut ranges = BTreeMap::new();
        ranges.insert(
            KeyPath::parse("name"),
            KeyRange::Literal(Interval::equality(Value::from("x"))),
        );
        // A multi-entry index over the same path must never win.
        ranges.insert(
            KeyPath::parse("tag"),
            KeyRange::Literal(Interval::equality(Value::from("y"))),
        );
        let path = choose_access_path(&meta, &ranges, &scope()).expect("choose");
        assert!(matches!(path, AccessPath::Secondary(name, _) if name == "by_name"));
    }

    #[test]
    fn empty_prepared_range_yields_empty_access() {
        let mut ranges = BTreeMap::new();
        let contradiction = KeyRange::Literal(Interval::above(Value::from(5)))
            .intersection(KeyRange::Literal(Interval::below(Value::from(1))));
        ranges.insert(KeyPath::parse("storeId"), contradiction);
        let path =
            choose_access_path(&composite_meta(), &ranges, &scope()).expect("choose");
        assert_eq!(path, AccessPath::Empty);
    }

    #[test]
    fn union_of_equalities_fans_out_cursor_passes() {
        let mut ranges = BTreeMap::new();
        ranges.insert(
            KeyPath::parse("storeId"),
            KeyRange::Literal(Interval::equality(Value::from(1)))
                .union(KeyRange::Literal(Interval::equality(Value::from(2)))),
        );
        ranges.insert(
            KeyPath::parse("isbn"),
            KeyRange::Literal(Interval::at_least(Value::from(0))),
        );
        let path =
            choose_access_path(&composite_meta(), &ranges, &scope()).expect("choose");
        let AccessPath::Primary(native) = path else {
            panic!("expected primary scan");
        };
        assert_eq!(native.len(), 2);
    }
}
