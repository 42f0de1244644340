//! # Relational Tree
//!
//! The plan node types the fluent builder emits and the finalization pass
//! rewrites. Every node owns its children; after finalization the tree is
//! immutable and the executor walks it to produce a lazy row stream.
//!
//! Schema visibility rules: sources, joins, `Where`, `OrderBy`, set
//! operations and memoization preserve identifiable sources and report a
//! schema; `GroupBy`, `Select`, `Write` and `CompositeUnion` produce
//! anonymous tuples and hide theirs.

pub mod finalize;

use crate::expr::{DepId, Expression};
use crate::range::KeyRange;
use crate::store::{MemCollection, Store, TxnMode};
use crate::term::TermGroups;
use crate::value::{KeyPath, Record};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Stable identity of a plan node, used by memoization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u64);

impl NodeId {
    pub fn fresh() -> NodeId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        NodeId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// What a named source reads from.
#[derive(Clone)]
pub enum SourceDef {
    /// In-memory collection (ordered records, optionally keyed).
    Collection(MemCollection),
    /// A named source inside a persistent store.
    Stored { store: Arc<dyn Store>, source: String },
    /// An opaque subquery; each result record is wrapped under the alias.
    Subquery(Box<PlanNode>),
    /// A function producing records from the query parameters.
    Derived(Rc<dyn Fn(&Record) -> Vec<Record>>),
}

impl fmt::Debug for SourceDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceDef::Collection(c) => write!(f, "Collection({c})"),
            SourceDef::Stored { store, source } => {
                write!(f, "Stored({}/{source})", store.name())
            }
            SourceDef::Subquery(_) => write!(f, "Subquery"),
            SourceDef::Derived(_) => write!(f, "Derived"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    /// Left outer: unmatched left rows emit the sentinel record for every
    /// right source.
    Outer,
    /// Anti: left rows emit (with the sentinel) only when the right side
    /// is empty.
    Anti,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOpKind {
    Union,
    UnionAll,
}

/// Write behaviour requested by the builder.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Overwrite existing keys (upsert/update/delete) instead of failing.
    pub overwrite: bool,
    pub delete: bool,
}

/// Where a write lands.
#[derive(Clone)]
pub enum WriteSink {
    Collection(MemCollection),
    Stored { store: Arc<dyn Store>, source: String },
}

impl fmt::Debug for WriteSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteSink::Collection(c) => write!(f, "Collection({c})"),
            WriteSink::Stored { store, source } => {
                write!(f, "Stored({}/{source})", store.name())
            }
        }
    }
}

/// One ordering entry: expression, direction, null placement.
///
/// `direction` and `nulls` are +1/-1 multipliers; `nulls = +1` places null
/// values after non-null ones.
#[derive(Debug, Clone)]
pub struct OrderingEntry {
    pub expr: Expression,
    pub direction: i8,
    pub nulls: i8,
}

/// A node of the relational tree.
#[derive(Clone)]
pub enum PlanNode {
    Source {
        name: String,
        dep: DepId,
        def: SourceDef,
        /// Predicates attached by finalization; fail-fast AND semantics.
        predicates: Vec<Expression>,
        /// Key ranges attached by finalization, per key path.
        key_ranges: BTreeMap<KeyPath, KeyRange>,
    },
    Join {
        kind: JoinKind,
        left: Box<PlanNode>,
        right: Box<PlanNode>,
        groups: TermGroups,
        /// Predicates retained at the join by finalization.
        predicates: Vec<Expression>,
    },
    Where {
        child: Box<PlanNode>,
        groups: TermGroups,
        /// Merged predicate, set by finalization when the child hides its
        /// schema; such a Where survives finalization.
        predicate: Option<Expression>,
    },
    GroupBy {
        child: Box<PlanNode>,
        selector: Expression,
        grouper: Expression,
    },
    OrderBy {
        child: Box<PlanNode>,
        ordering: Vec<OrderingEntry>,
    },
    Select {
        child: Box<PlanNode>,
        selector: Expression,
        /// For updates: alias whose prior record is shallow-merged under
        /// the selector output.
        merge_source: Option<String>,
    },
    SetOp {
        kind: SetOpKind,
        left: Box<PlanNode>,
        right: Box<PlanNode>,
    },
    /// Merges two row streams without deduplication; used to synthesise
    /// full outer joins.
    CompositeUnion {
        left: Box<PlanNode>,
        right: Box<PlanNode>,
    },
    Write {
        child: Box<PlanNode>,
        sink: WriteSink,
        /// Alias the written records are bound under in the output rows.
        alias: String,
        options: WriteOptions,
    },
    /// Single-producer replay: the child executes once per execution
    /// context regardless of the number of consumers.
    Memoize { id: NodeId, child: Box<PlanNode> },
    /// Transaction wrapper introduced by finalization.
    Envelope {
        child: Box<PlanNode>,
        store: Option<Arc<dyn Store>>,
        sources: Vec<String>,
        mode: TxnMode,
    },
}

impl PlanNode {
    /// The node's visible schema: source alias -> dependency identity, or
    /// `None` for nodes producing anonymous tuples.
    pub fn schema(&self) -> Option<BTreeMap<String, DepId>> {
        match self {
            PlanNode::Source { name, dep, .. } => {
                Some([(name.clone(), *dep)].into_iter().collect())
            }
            PlanNode::Join { kind, left, right, .. } => {
                let mut schema = left.schema()?;
                if *kind != JoinKind::Anti {
                    schema.extend(right.schema()?);
                }
                Some(schema)
            }
            PlanNode::Where { child, .. }
            | PlanNode::OrderBy { child, .. }
            | PlanNode::Memoize { child, .. }
            | PlanNode::Envelope { child, .. } => child.schema(),
            PlanNode::SetOp { left, .. } => left.schema(),
            PlanNode::GroupBy { .. }
            | PlanNode::Select { .. }
            | PlanNode::CompositeUnion { .. }
            | PlanNode::Write { .. } => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            PlanNode::Source { name, def, predicates, key_ranges, .. } => format!(
                "Source {name} <- {def:?} [{} predicates, {} ranged paths]",
                predicates.len(),
                key_ranges.len()
            ),
            PlanNode::Join { kind, predicates, .. } => {
                format!("Join {kind:?} [{} predicates]", predicates.len())
            }
            PlanNode::Where { groups, predicate, .. } => format!(
                "Where [{} terms{}]",
                groups.len(),
                if predicate.is_some() { ", merged" } else { "" }
            ),
            PlanNode::GroupBy { .. } => "GroupBy".to_string(),
            PlanNode::OrderBy { ordering, .. } => {
                format!("OrderBy [{} entries]", ordering.len())
            }
            PlanNode::Select { merge_source, .. } => match merge_source {
                Some(alias) => format!("Select [merge {alias}]"),
                None => "Select".to_string(),
            },
            PlanNode::SetOp { kind, .. } => format!("SetOp {kind:?}"),
            PlanNode::CompositeUnion { .. } => "CompositeUnion".to_string(),
            PlanNode::Write { alias, options, .. } => format!(
                "Write {alias} [overwrite={}, delete={}]",
                options.overwrite, options.delete
            ),
            PlanNode::Memoize { .. } => "Memoize".to_string(),
            PlanNode::Envelope { store, mode, sources, .. } => format!(
                "Envelope [{}mode={mode:?}, sources={sources:?}]",
                store.as_ref().map_or(String::new(), |s| format!("{}, ", s.name())),
            ),
        }
    }

    fn children(&self) -> Vec<&PlanNode> {
        match self {
            PlanNode::Source { .. } => vec![],
            PlanNode::Join { left, right, .. }
            | PlanNode::SetOp { left, right, .. }
            | PlanNode::CompositeUnion { left, right } => vec![left, right],
            PlanNode::Where { child, .. }
            | PlanNode::GroupBy { child, .. }
            | PlanNode::OrderBy { child, .. }
            | PlanNode::Select { child, .. }
            | PlanNode::Write { child, .. }
            | PlanNode::Memoize { child, .. }
            | PlanNode::Envelope { child, .. } => vec![child],
        }
    }
}

impl fmt::Debug for PlanNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for PlanNode {
    /// Indented tree rendering, for logs and plan inspection.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn render(
            node: &PlanNode,
            indent: usize,
            f: &mut fmt::Formatter<'_>,
        ) -> fmt::Result {
            writeln!(f, "{:indent$}{}", "", node.describe(), indent = indent)?;
            for child in node.children() {
                render(child, indent + 2, f)?;
            }
            Ok(())
        }
        render(self, 0, f)
    }
}
