//! # Finalization
//!
//! Two passes rewrite the builder's tree into its executable form.
//!
//! `hoist_predicates` carries a single accumulator of terms down the tree:
//! a `Where` over a schema-bearing child dissolves into the accumulator; a
//! term lands on the deepest named source whose scope (own schema plus
//! left siblings of enclosing joins) satisfies its dependencies, together
//! with its key ranges; outer and anti joins first capture the range-less
//! terms that touch their right side, because sinking those past the
//! sentinel semantics would change results. Consecutive orderings fuse,
//! outermost highest-priority. Terms left over at the root are an error.
//!
//! `prepare_transaction` collects the one persistent store the tree may
//! touch and wraps the tree in a transaction envelope; a write-only tree
//! over in-memory collections gets a storeless envelope so the overlay
//! still commits atomically.

use crate::error::{QueryError, QueryResult};
use crate::expr::DepId;
use crate::plan::{JoinKind, PlanNode, SourceDef, WriteSink};
use crate::store::{Store, TxnMode};
use crate::term::TermGroups;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

/// Run both finalization passes.
pub fn finalize(root: PlanNode) -> QueryResult<PlanNode> {
    let root = hoist_root(root)?;
    prepare_transaction(root)
}

/// Predicate hoisting only; used for plans embedded as opaque subquery
/// sources, which join the enclosing query's transaction instead of
/// carrying their own envelope.
pub fn hoist_root(root: PlanNode) -> QueryResult<PlanNode> {
    let mut available = TermGroups::new();
    let root = hoist(root, &mut available, &BTreeMap::new())?;
    if !available.is_empty() {
        return Err(QueryError::UnassignedTerms(format!("{available}")));
    }
    Ok(root)
}

fn hoist(
    node: PlanNode,
    available: &mut TermGroups,
    scope: &BTreeMap<String, DepId>,
) -> QueryResult<PlanNode> {
    match node {
        PlanNode::Where {
            child,
            groups,
            predicate,
        } => {
            if child.schema().is_some() {
                // The Where dissolves: its terms travel down with the
                // accumulator and the node is replaced by its child.
                available.merge(groups);
                hoist(*child, available, scope)
            } else {
                // The child hides its schema; the predicate cannot be
                // pushed down. Evaluate the merged conjunction here.
                let predicate = predicate.or_else(|| groups.merged_expression());
                let child = hoist(*child, available, scope)?;
                Ok(PlanNode::Where {
                    child: Box::new(child),
                    groups,
                    predicate,
                })
            }
        }

        PlanNode::Source {
            name,
            dep,
            def,
            mut predicates,
            mut key_ranges,
        } => {
            let mut visible = scope.clone();
            visible.insert(name.clone(), dep);
            let subs = available.sealed_subs();
            for term in available.extract_satisfied(&visible) {
                debug!(source = %name, term = %term, "attaching term to source");
                predicates.push(term.to_expression(&subs));
                if let Some(paths) = term.sealed_ranges(&subs).remove(&name) {
                    for (path, range) in paths {
                        match key_ranges.remove(&path) {
                            Some(existing) => {
                                key_ranges.insert(path, existing.intersection(range));
                            }
                            None => {
                                key_ranges.insert(path, range);
                            }
                        }
                    }
                }
            }
            Ok(PlanNode::Source {
                name,
                dep,
                def,
                predicates,
                key_ranges,
            })
        }

        PlanNode::Join {
            kind,
            left,
            right,
            groups,
            mut predicates,
        } => {
            if kind != JoinKind::Inner {
                // Terms without key ranges that touch the right relation
                // stay at the join; hoisting them below would change what
                // matches and so what produces the sentinel.
                let right_ids: BTreeSet<DepId> = right
                    .schema()
                    .map(|s| s.into_values().collect())
                    .unwrap_or_default();
                let subs = available.sealed_subs();
                for term in available.extract_rangeless_touching(&right_ids) {
                    debug!(term = %term, "retaining term at outer/anti join");
                    predicates.push(term.to_expression(&subs));
                }
            }
            available.merge(groups);

            let left = hoist(*left, available, scope)?;
            let mut right_scope = scope.clone();
            if let Some(left_schema) = left.schema() {
                right_scope.extend(left_schema);
            }
            let right = hoist(*right, available, &right_scope)?;

            Ok(PlanNode::Join {
                kind,
                left: Box::new(left),
                right: Box::new(right),
                groups: TermGroups::new(),
                predicates,
            })
        }

        PlanNode::OrderBy {
            mut child,
            mut ordering,
        } => {
            // Consecutive orderings fuse; the outermost entries keep the
            // highest priority.
            loop {
                match *child {
                    PlanNode::OrderBy {
                        child: grandchild,
                        ordering: inner,
                    } => {
                        ordering.extend(inner);
                        child = grandchild;
                    }
                    other => {
                        child = Box::new(other);
                        break;
                    }
                }
            }
            let child = hoist(*child, available, scope)?;
            Ok(PlanNode::OrderBy {
                child: Box::new(child),
                ordering,
            })
        }

        PlanNode::GroupBy {
            child,
            selector,
            grouper,
        } => Ok(PlanNode::GroupBy {
            child: Box::new(hoist(*child, available, scope)?),
            selector,
            grouper,
        }),

        PlanNode::Select {
            child,
            selector,
            merge_source,
        } => Ok(PlanNode::Select {
            child: Box::new(hoist(*child, available, scope)?),
            selector,
            merge_source,
        }),

        PlanNode::SetOp { kind, left, right } => Ok(PlanNode::SetOp {
            kind,
            left: Box::new(hoist(*left, available, scope)?),
            right: Box::new(hoist(*right, available, scope)?),
        }),

        PlanNode::CompositeUnion { left, right } => Ok(PlanNode::CompositeUnion {
            left: Box::new(hoist(*left, available, scope)?),
            right: Box::new(hoist(*right, available, scope)?),
        }),

        PlanNode::Write {
            child,
            sink,
            alias,
            options,
        } => Ok(PlanNode::Write {
            child: Box::new(hoist(*child, available, scope)?),
            sink,
            alias,
            options,
        }),

        PlanNode::Memoize { id, child } => Ok(PlanNode::Memoize {
            id,
            child: Box::new(hoist(*child, available, scope)?),
        }),

        PlanNode::Envelope { .. } => Err(QueryError::Internal(
            "transaction envelope present before finalization".into(),
        )),
    }
}

// --------------------------------------------------------------------------
// Transaction preparation
// --------------------------------------------------------------------------

struct StoreUse {
    stores: Vec<Arc<dyn Store>>,
    sources: BTreeSet<String>,
    has_write: bool,
}

fn prepare_transaction(root: PlanNode) -> QueryResult<PlanNode> {
    let mut usage = StoreUse {
        stores: Vec::new(),
        sources: BTreeSet::new(),
        has_write: false,
    };
    collect_stores(&root, &mut usage)?;

    if let Some(store) = usage.stores.first() {
        let mode = if usage.has_write {
            TxnMode::ReadWrite
        } else {
            TxnMode::Read
        };
        debug!(store = store.name(), ?mode, "wrapping plan in transaction envelope");
        return Ok(PlanNode::Envelope {
            store: Some(Arc::clone(store)),
            sources: usage.sources.into_iter().collect(),
            mode,
            child: Box::new(root),
        });
    }
    if usage.has_write {
        // Writes to in-memory collections still get an ambient
        // transaction so the overlay commits atomically.
        return Ok(PlanNode::Envelope {
            store: None,
            sources: Vec::new(),
            mode: TxnMode::ReadWrite,
            child: Box::new(root),
        });
    }
    Ok(root)
}

fn collect_stores(node: &PlanNode, usage: &mut StoreUse) -> QueryResult<()> {
    let note_store = |store: &Arc<dyn Store>, source: &str, usage: &mut StoreUse| {
        if !usage.stores.iter().any(|s| Arc::ptr_eq(s, store)) {
            usage.stores.push(Arc::clone(store));
        }
        usage.sources.insert(source.to_string());
        if usage.stores.len() > 1 {
            return Err(QueryError::MultipleStores);
        }
        Ok(())
    };

    match node {
        PlanNode::Source { def, .. } => match def {
            SourceDef::Stored { store, source } => note_store(store, source, usage)?,
            SourceDef::Subquery(plan) => collect_stores(plan, usage)?,
            SourceDef::Collection(_) | SourceDef::Derived(_) => {}
        },
        PlanNode::Write { sink, .. } => {
            usage.has_write = true;
            if let WriteSink::Stored { store, source } = sink {
                note_store(store, source, usage)?;
            }
        }
        _ => {}
    }
    for child in node.children() {
        collect_stores(child, usage)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{DepId, Schema};
    use crate::store::{MemCollection, MemoryStore};
    use crate::value::{KeyPath, KeySpec};
    use std::collections::BTreeMap;

    fn source(name: &str) -> (PlanNode, DepId) {
        let dep = DepId::fresh();
        (
            PlanNode::Source {
                name: name.to_string(),
                dep,
                def: SourceDef::Collection(MemCollection::new()),
                predicates: Vec::new(),
                key_ranges: BTreeMap::new(),
            },
            dep,
        )
    }

    fn schema_of(pairs: &[(&str, DepId)]) -> Schema {
        Schema::Known(
            pairs
                .iter()
                .map(|(n, d)| ((*n).to_string(), *d))
                .collect(),
        )
    }

    fn where_over(child: PlanNode, template: &str, schema: &Schema) -> PlanNode {
        let mut groups = TermGroups::new();
        groups.parse(template, vec![], schema).expect("parse");
        PlanNode::Where {
            child: Box::new(child),
            groups,
            predicate: None,
        }
    }

    #[test]
    fn where_dissolves_and_term_lands_on_source() {
        let (things, dep) = source("thing");
        let schema = schema_of(&[("thing", dep)]);
        let tree = where_over(things, "thing.calories > 100", &schema);

        let out = hoist_root(tree).expect("finalize");
        let PlanNode::Source {
            predicates,
            key_ranges,
            ..
        } = out
        else {
            panic!("expected bare source, got {out}");
        };
        assert_eq!(predicates.len(), 1);
        assert!(key_ranges.contains_key(&KeyPath::parse("calories")));
    }

    #[test]
    fn cross_source_term_lands_on_the_right_join_side() {
        let (things, thing_dep) = source("thing");
        let (types, type_dep) = source("type");
        let schema = schema_of(&[("thing", thing_dep), ("type", type_dep)]);
        let join = PlanNode::Join {
            kind: JoinKind::Inner,
            left: Box::new(things),
            right: Box::new(types),
            groups: TermGroups::new(),
            predicates: Vec::new(),
        };
        let tree = where_over(join, "thing.type_id === type.id", &schema);

        let out = hoist_root(tree).expect("finalize");
        let PlanNode::Join { left, right, .. } = out else {
            panic!("expected join");
        };
        let PlanNode::Source {
            predicates: left_preds,
            ..
        } = *left
        else {
            panic!("expected left source");
        };
        let PlanNode::Source {
            predicates: right_preds,
            key_ranges,
            ..
        } = *right
        else {
            panic!("expected right source");
        };
        assert!(left_preds.is_empty());
        assert_eq!(right_preds.len(), 1);
        assert!(key_ranges.contains_key(&KeyPath::parse("id")));
    }

    #[test]
    fn outer_join_retains_rangeless_right_terms() {
        let (things, thing_dep) = source("thing");
        let (types, type_dep) = source("type");
        let schema = schema_of(&[("thing", thing_dep), ("type", type_dep)]);
        let join = PlanNode::Join {
            kind: JoinKind::Outer,
            left: Box::new(things),
            right: Box::new(types),
            groups: TermGroups::new(),
            predicates: Vec::new(),
        };
        // A disjunction extracts no range, so the term must stay at the
        // join rather than sink into the right source.
        let tree = where_over(join, "type.name == 'a' || type.kind == 'b'", &schema);

        let out = hoist_root(tree).expect("finalize");
        let PlanNode::Join {
            predicates, right, ..
        } = out
        else {
            panic!("expected join");
        };
        assert_eq!(predicates.len(), 1);
        let PlanNode::Source {
            predicates: right_preds,
            ..
        } = *right
        else {
            panic!("expected source");
        };
        assert!(right_preds.is_empty());
    }

    #[test]
    fn consecutive_orderings_fuse_outermost_first() {
        let (things, dep) = source("thing");
        let schema = schema_of(&[("thing", dep)]);
        let entry = |template: &str| {
            let compiled = crate::expr::compile_fragment(
                template,
                0,
                &schema,
                crate::expr::CompileOptions {
                    allow_aggregates: false,
                    compile_all: true,
                },
            )
            .expect("compile");
            crate::plan::OrderingEntry {
                expr: compiled.full.expect("full"),
                direction: 1,
                nulls: 1,
            }
        };
        let inner = PlanNode::OrderBy {
            child: Box::new(things),
            ordering: vec![entry("thing.a")],
        };
        let outer = PlanNode::OrderBy {
            child: Box::new(inner),
            ordering: vec![entry("thing.b")],
        };

        let out = hoist_root(outer).expect("finalize");
        let PlanNode::OrderBy { ordering, child } = out else {
            panic!("expected order-by");
        };
        assert_eq!(ordering.len(), 2);
        assert_eq!(format!("{}", ordering[0].expr), "thing.b");
        assert_eq!(format!("{}", ordering[1].expr), "thing.a");
        assert!(matches!(*child, PlanNode::Source { .. }));
    }

    #[test]
    fn unassigned_terms_fail_finalization() {
        let (things, _) = source("thing");
        // Parse against an unrelated identity: never satisfiable.
        let foreign = schema_of(&[("thing", DepId::fresh())]);
        let tree = where_over(things, "thing.calories > 100", &foreign);
        assert!(matches!(
            hoist_root(tree),
            Err(QueryError::UnassignedTerms(_))
        ));
    }

    #[test]
    fn envelope_wraps_persistent_sources() {
        let store = std::sync::Arc::new(MemoryStore::new("s"));
        store.define_source("books", KeySpec::Single(KeyPath::parse("isbn")), false);
        let plan = PlanNode::Source {
            name: "book".into(),
            dep: DepId::fresh(),
            def: SourceDef::Stored {
                store: store.clone(),
                source: "books".into(),
            },
            predicates: Vec::new(),
            key_ranges: BTreeMap::new(),
        };
        let out = finalize(plan).expect("finalize");
        let PlanNode::Envelope {
            store: Some(_),
            mode,
            sources,
            ..
        } = out
        else {
            panic!("expected envelope");
        };
        assert_eq!(mode, TxnMode::Read);
        assert_eq!(sources, vec!["books".to_string()]);
    }

    #[test]
    fn no_envelope_for_pure_in_memory_reads() {
        let (things, _) = source("thing");
        let out = finalize(things).expect("finalize");
        assert!(matches!(out, PlanNode::Source { .. }));
    }

    #[test]
    fn two_distinct_stores_are_rejected() {
        let store_a: std::sync::Arc<MemoryStore> = std::sync::Arc::new(MemoryStore::new("a"));
        let store_b: std::sync::Arc<MemoryStore> = std::sync::Arc::new(MemoryStore::new("b"));
        store_a.define_source("x", KeySpec::None, true);
        store_b.define_source("y", KeySpec::None, true);
        let join = PlanNode::Join {
            kind: JoinKind::Inner,
            left: Box::new(PlanNode::Source {
                name: "x".into(),
                dep: DepId::fresh(),
                def: SourceDef::Stored {
                    store: store_a,
                    source: "x".into(),
                },
                predicates: Vec::new(),
                key_ranges: BTreeMap::new(),
            }),
            right: Box::new(PlanNode::Source {
                name: "y".into(),
                dep: DepId::fresh(),
                def: SourceDef::Stored {
                    store: store_b,
                    source: "y".into(),
                },
                predicates: Vec::new(),
                key_ranges: BTreeMap::new(),
            }),
            groups: TermGroups::new(),
            predicates: Vec::new(),
        };
        assert!(matches!(
            finalize(join),
            Err(QueryError::MultipleStores)
        ));
    }

    // A merged predicate on a Where over a schema-hiding child survives.
    #[test]
    fn where_over_select_keeps_merged_predicate() {
        let (things, dep) = source("thing");
        let schema = schema_of(&[("thing", dep)]);
        let selector = crate::expr::compile_fragment(
            "{name: thing.name}",
            0,
            &schema,
            crate::expr::CompileOptions {
                allow_aggregates: false,
                compile_all: true,
            },
        )
        .expect("compile")
        .full
        .expect("full");
        let select = PlanNode::Select {
            child: Box::new(things),
            selector,
            merge_source: None,
        };
        let tree = where_over(select, "this.name == 'Apple'", &Schema::Unknown);

        let out = hoist_root(tree).expect("finalize");
        let PlanNode::Where { predicate, .. } = out else {
            panic!("expected surviving where");
        };
        assert!(predicate.is_some());
    }
}
