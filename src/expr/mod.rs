//! # Expression Compiler
//!
//! Parses predicate and projection fragments into an evaluable form with
//! explicit free variables. A fragment is compiled against a schema
//! (source alias -> dependency identity); its unbound identifiers become
//! source references and are recorded as dependencies, `$name` becomes a
//! parameter access, and aggregate calls become group-state slots. The
//! compiler also splits top-level conjunctions into term roots and
//! extracts key-range constraints from comparisons over key paths.
//!
//! ```text
//! "item.storeId === ? && item.isbn > 200000"   (subs: [1])
//!     |
//!     v  parse + compile
//! terms: [ {deps: {item}, range: storeId == $$subs[0]},
//!          {deps: {item}, range: isbn in (200000, +inf)} ]
//! ```

pub mod aggregate;
pub mod ast;
mod compile;
mod eval;
mod parser;
mod token;

pub use aggregate::{AggFunc, AggInit, AggState};
pub use compile::{compile_fragment, Compiled, CompileOptions, TermParts};
pub use eval::EvalScope;

use crate::error::QueryResult;
use crate::expr::ast::Node;
use crate::value::{Row, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Dependency identity of a named source.
///
/// Two syntactically distinct sources have distinct identities even when
/// they wrap the same underlying collection; identity `UNKNOWN` is the
/// sentinel recorded when compiling against an unknown schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DepId(u64);

impl DepId {
    pub const UNKNOWN: DepId = DepId(0);

    pub fn fresh() -> DepId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        DepId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for DepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == DepId::UNKNOWN {
            write!(f, "?")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

/// The compile-time schema: source alias -> dependency identity.
///
/// `Unknown` auto-declares every unbound identifier as a dependency on the
/// sentinel identity; it is used for fragments compiled over schema-hiding
/// nodes (group-by, select, write).
#[derive(Debug, Clone)]
pub enum Schema {
    Known(BTreeMap<String, DepId>),
    Unknown,
}

impl Schema {
    pub fn empty() -> Schema {
        Schema::Known(BTreeMap::new())
    }

    pub fn resolve(&self, name: &str) -> DepId {
        match self {
            Schema::Known(map) => map.get(name).copied().unwrap_or(DepId::UNKNOWN),
            Schema::Unknown => DepId::UNKNOWN,
        }
    }

    pub fn names(&self) -> Vec<String> {
        match self {
            Schema::Known(map) => map.keys().cloned().collect(),
            Schema::Unknown => Vec::new(),
        }
    }
}

/// A set of dependencies: source alias -> identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DepSet(BTreeMap<String, DepId>);

impl DepSet {
    pub fn new() -> DepSet {
        DepSet::default()
    }

    pub fn insert(&mut self, name: String, id: DepId) {
        self.0.insert(name, id);
    }

    pub fn remove(&mut self, name: &str) {
        self.0.remove(name);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn ids(&self) -> BTreeSet<DepId> {
        self.0.values().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, DepId)> {
        self.0.iter().map(|(n, id)| (n.as_str(), *id))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Identity-set equality, the merge criterion for terms.
    pub fn same_ids(&self, other: &DepSet) -> bool {
        self.ids() == other.ids()
    }

    /// Every dependency is bound, by identity, in `available`.
    pub fn satisfied_by(&self, available: &BTreeMap<String, DepId>) -> bool {
        self.0
            .iter()
            .all(|(name, id)| available.get(name) == Some(id))
    }

    /// Whether any dependency touches one of `ids`.
    pub fn intersects(&self, ids: &BTreeSet<DepId>) -> bool {
        self.0.values().any(|id| ids.contains(id))
    }
}

impl fmt::Display for DepSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (name, id)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}{id}")?;
        }
        write!(f, "}}")
    }
}

/// A compiled expression: an immutable tree plus its dependency set, the
/// substitution table it indexes into, its aggregate initializers, and any
/// bindings frozen by partial evaluation.
#[derive(Debug, Clone)]
pub struct Expression {
    ast: Rc<Node>,
    deps: DepSet,
    subs: Option<Rc<Vec<Value>>>,
    aggs: Rc<Vec<AggInit>>,
    prebound: Row,
}

impl Expression {
    pub(crate) fn new(ast: Node, deps: DepSet) -> Expression {
        Expression {
            ast: Rc::new(ast),
            deps,
            subs: None,
            aggs: Rc::new(Vec::new()),
            prebound: Row::new(),
        }
    }

    pub(crate) fn with_aggs(ast: Node, deps: DepSet, aggs: Vec<AggInit>) -> Expression {
        Expression {
            ast: Rc::new(ast),
            deps,
            subs: None,
            aggs: Rc::new(aggs),
            prebound: Row::new(),
        }
    }

    /// Attach the owning group's sealed substitution table.
    pub(crate) fn with_subs(&self, subs: Rc<Vec<Value>>) -> Expression {
        Expression {
            subs: Some(subs),
            ..self.clone()
        }
    }

    /// Rebuild with substitution references shifted by `base`.
    pub(crate) fn shift_subs(&self, base: usize) -> Expression {
        Expression {
            ast: Rc::new(self.ast.as_ref().clone().shift_subs(base)),
            deps: self.deps.clone(),
            subs: self.subs.clone(),
            aggs: Rc::clone(&self.aggs),
            prebound: self.prebound.clone(),
        }
    }

    pub fn deps(&self) -> &DepSet {
        &self.deps
    }

    pub fn ast(&self) -> &Node {
        &self.ast
    }

    /// Number of aggregate slots the expression folds into.
    pub fn group_slots(&self) -> usize {
        self.aggs.len()
    }

    /// Fresh group state sized for this expression's aggregates.
    pub fn fresh_group_state(&self) -> Vec<AggState> {
        self.aggs.iter().map(|a| a.func.fresh_state()).collect()
    }

    /// Evaluate with `(row, group_state)` from the scope.
    ///
    /// When a group context is present the aggregate initializers fold the
    /// current row into the state slots before the body is evaluated, so
    /// reads of the slots observe the running aggregates.
    pub fn eval(&self, scope: &EvalScope<'_>) -> QueryResult<Value> {
        let mut env = eval::Env {
            scope: *scope,
            subs: self.subs.as_deref().map(Vec::as_slice),
            prebound: &self.prebound,
            locals: Vec::new(),
        };
        if let Some(group) = scope.group {
            for init in self.aggs.iter() {
                let input = match init.args.first() {
                    None => None,
                    Some(arg) => Some(eval::eval_node(arg, &mut env)?),
                };
                let mut state = group.borrow_mut();
                let slot = state.get_mut(init.slot).ok_or_else(|| {
                    crate::error::QueryError::GroupState(format!(
                        "slot {} out of bounds",
                        init.slot
                    ))
                })?;
                slot.update(input.as_ref())?;
            }
        }
        eval::eval_node(&self.ast, &mut env)
    }

    /// Evaluate as a predicate: truthiness of the result.
    pub fn matches(&self, scope: &EvalScope<'_>) -> QueryResult<bool> {
        Ok(self.eval(scope)?.is_truthy())
    }

    /// Freeze `binding` into the expression and drop the bound names from
    /// the dependency set; later evaluation needs only the remaining keys.
    pub fn partial(&self, binding: &Row) -> Expression {
        let mut deps = self.deps.clone();
        for name in binding.sources() {
            deps.remove(name);
        }
        Expression {
            ast: Rc::clone(&self.ast),
            deps,
            subs: self.subs.clone(),
            aggs: Rc::clone(&self.aggs),
            prebound: self.prebound.union(binding),
        }
    }

    /// Conjunction of two expressions; dependency sets union.
    pub(crate) fn and(&self, other: &Expression) -> Expression {
        let mut deps = self.deps.clone();
        for (name, id) in other.deps.iter() {
            deps.insert(name.to_string(), id);
        }
        let mut aggs: Vec<AggInit> = self.aggs.as_ref().clone();
        aggs.extend(other.aggs.iter().cloned());
        Expression {
            ast: Rc::new(Node::And(
                Box::new(self.ast.as_ref().clone()),
                Box::new(other.ast.as_ref().clone()),
            )),
            deps,
            subs: self.subs.clone().or_else(|| other.subs.clone()),
            aggs: Rc::new(aggs),
            prebound: self.prebound.union(&other.prebound),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ast)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Record;

    #[test]
    fn fresh_dep_ids_are_distinct() {
        assert_ne!(DepId::fresh(), DepId::fresh());
        assert_ne!(DepId::fresh(), DepId::UNKNOWN);
    }

    #[test]
    fn partial_freezes_bindings() {
        let a = DepId::fresh();
        let b = DepId::fresh();
        let schema = Schema::Known(
            [("a".to_string(), a), ("b".to_string(), b)]
                .into_iter()
                .collect(),
        );
        let compiled = compile_fragment(
            "a.x + b.y",
            0,
            &schema,
            CompileOptions {
                allow_aggregates: false,
                compile_all: true,
            },
        )
        .expect("compile");
        let full = compiled.full.expect("full");
        assert_eq!(full.deps().len(), 2);

        let mut binding = Row::new();
        binding.bind("a", Record::from_pairs([("x", 40)]));
        let partial = full.partial(&binding);
        assert_eq!(partial.deps().names().collect::<Vec<_>>(), vec!["b"]);

        let mut row = Row::new();
        row.bind("b", Record::from_pairs([("y", 2)]));
        let params = Record::new();
        let scope = EvalScope::new(&row, &params);
        assert_eq!(partial.eval(&scope).expect("eval"), Value::from(42));
    }

    #[test]
    fn dep_set_satisfaction_is_by_identity() {
        let id = DepId::fresh();
        let other = DepId::fresh();
        let mut deps = DepSet::new();
        deps.insert("a".into(), id);

        let mut available = BTreeMap::new();
        available.insert("a".to_string(), other);
        assert!(!deps.satisfied_by(&available));
        available.insert("a".to_string(), id);
        assert!(deps.satisfied_by(&available));
    }
}
