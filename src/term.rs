//! # Term Decomposition
//!
//! A predicate fragment splits at top-level conjunctions into terms, each
//! carrying its dependency set and extracted key ranges. [`TermGroups`] is
//! the list-plus-substitution-table container attached to Where and Join
//! nodes; merging two groups concatenates the substitution tables,
//! re-indexes the incoming references, and conjunction-merges terms whose
//! dependency sets coincide.

use crate::error::{QueryError, QueryResult};
use crate::expr::ast::Node;
use crate::expr::{compile_fragment, CompileOptions, DepSet, Expression, Schema};
use crate::range::KeyRange;
use crate::value::{KeyPath, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// Key ranges extracted from one term: source alias -> key path -> range.
pub type TermRanges = BTreeMap<String, BTreeMap<KeyPath, KeyRange>>;

/// One conjunctive atom of a predicate.
#[derive(Debug, Clone)]
pub struct Term {
    ast: Node,
    deps: DepSet,
    ranges: TermRanges,
}

impl Term {
    pub fn deps(&self) -> &DepSet {
        &self.deps
    }

    pub fn ranges(&self) -> &TermRanges {
        &self.ranges
    }

    /// Conjunction-merge another term with the same dependency set.
    ///
    /// Ranges for a (source, path) pair present in both terms intersect;
    /// pairs present in only one side are kept (the merged expression is a
    /// conjunction, so either side's constraint still bounds the result).
    fn merge_with(&mut self, other: Term) {
        self.ast = Node::And(
            Box::new(std::mem::replace(&mut self.ast, Node::This)),
            Box::new(other.ast),
        );
        for (source, paths) in other.ranges {
            let entry = self.ranges.entry(source).or_default();
            for (path, range) in paths {
                match entry.remove(&path) {
                    Some(existing) => {
                        entry.insert(path, existing.intersection(range));
                    }
                    None => {
                        entry.insert(path, range);
                    }
                }
            }
        }
    }

    fn shift_subs(self, base: usize) -> Term {
        Term {
            ast: self.ast.shift_subs(base),
            deps: self.deps,
            ranges: self
                .ranges
                .into_iter()
                .map(|(source, paths)| {
                    (
                        source,
                        paths
                            .into_iter()
                            .map(|(path, range)| (path, range.shift_subs(base)))
                            .collect(),
                    )
                })
                .collect(),
        }
    }

    /// Seal the term into an evaluable expression over `subs`.
    pub fn to_expression(&self, subs: &Rc<Vec<Value>>) -> Expression {
        Expression::new(self.ast.clone(), self.deps.clone()).with_subs(Rc::clone(subs))
    }

    /// Seal the term's key ranges over `subs`.
    pub fn sealed_ranges(&self, subs: &Rc<Vec<Value>>) -> TermRanges {
        self.ranges
            .iter()
            .map(|(source, paths)| {
                (
                    source.clone(),
                    paths
                        .iter()
                        .map(|(path, range)| (path.clone(), range.with_subs(subs)))
                        .collect(),
                )
            })
            .collect()
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} :: {}", self.ast, self.deps)
    }
}

/// A list of terms sharing one substitution table.
#[derive(Debug, Clone, Default)]
pub struct TermGroups {
    terms: Vec<Term>,
    subs: Vec<Value>,
}

impl TermGroups {
    pub fn new() -> TermGroups {
        TermGroups::default()
    }

    /// Parse `template` against `schema` and fold the resulting terms in.
    ///
    /// Substitution holes in the template index into this group's table
    /// starting at its current length; the number of holes must equal the
    /// number of supplied substitution values.
    pub fn parse(
        &mut self,
        template: &str,
        subs: Vec<Value>,
        schema: &Schema,
    ) -> QueryResult<()> {
        let base = self.subs.len();
        let compiled = compile_fragment(template, base, schema, CompileOptions::default())?;
        if compiled.holes != subs.len() {
            return Err(QueryError::BuilderMisuse(format!(
                "template has {} substitution holes but {} values were supplied",
                compiled.holes,
                subs.len()
            )));
        }
        self.subs.extend(subs);
        for parts in compiled.terms {
            self.insert(Term {
                ast: parts.ast,
                deps: parts.deps,
                ranges: parts.ranges,
            });
        }
        Ok(())
    }

    /// Merge another group into this one, re-indexing its substitution
    /// references past the current table.
    pub fn merge(&mut self, other: TermGroups) {
        let base = self.subs.len();
        self.subs.extend(other.subs);
        for term in other.terms {
            self.insert(term.shift_subs(base));
        }
    }

    /// Insert a term, conjunction-merging into an existing term with the
    /// same dependency identity set.
    fn insert(&mut self, term: Term) {
        match self
            .terms
            .iter_mut()
            .find(|t| t.deps.same_ids(&term.deps))
        {
            Some(existing) => existing.merge_with(term),
            None => self.terms.push(term),
        }
    }

    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    /// Drain the terms whose dependencies are fully bound, by identity, in
    /// `available`.
    pub fn extract_satisfied(
        &mut self,
        available: &std::collections::BTreeMap<String, crate::expr::DepId>,
    ) -> Vec<Term> {
        let mut kept = Vec::new();
        let mut out = Vec::new();
        for term in std::mem::take(&mut self.terms) {
            if term.deps.satisfied_by(available) {
                out.push(term);
            } else {
                kept.push(term);
            }
        }
        self.terms = kept;
        out
    }

    /// Drain the range-less terms whose dependency set touches any of
    /// `ids`. Outer and anti joins use this to retain right-side-dependent
    /// predicates that must not sink past their sentinel semantics.
    pub fn extract_rangeless_touching(
        &mut self,
        ids: &std::collections::BTreeSet<crate::expr::DepId>,
    ) -> Vec<Term> {
        let mut kept = Vec::new();
        let mut out = Vec::new();
        for term in std::mem::take(&mut self.terms) {
            if term.ranges.is_empty() && term.deps.intersects(ids) {
                out.push(term);
            } else {
                kept.push(term);
            }
        }
        self.terms = kept;
        out
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    /// Seal the substitution table for expression construction.
    pub fn sealed_subs(&self) -> Rc<Vec<Value>> {
        Rc::new(self.subs.clone())
    }

    /// Drain every term, leaving the group empty.
    pub fn take_terms(&mut self) -> Vec<Term> {
        std::mem::take(&mut self.terms)
    }

    pub fn push_term(&mut self, term: Term) {
        self.insert(term);
    }

    /// The conjunction of all terms as a single sealed expression, or
    /// `None` for an empty group.
    pub fn merged_expression(&self) -> Option<Expression> {
        let subs = self.sealed_subs();
        let mut iter = self.terms.iter();
        let first = iter.next()?.to_expression(&subs);
        Some(iter.fold(first, |acc, term| acc.and(&term.to_expression(&subs))))
    }
}

impl fmt::Display for TermGroups {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, term) in self.terms.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{term}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{DepId, EvalScope};
    use crate::value::{Record, Row};

    fn schema(names: &[&str]) -> Schema {
        Schema::Known(
            names
                .iter()
                .map(|n| ((*n).to_string(), DepId::fresh()))
                .collect(),
        )
    }

    #[test]
    fn same_dependency_terms_merge_by_conjunction() {
        let s = schema(&["a"]);
        let mut groups = TermGroups::new();
        groups
            .parse("a.x > 1 && a.x < 9", vec![], &s)
            .expect("parse");
        assert_eq!(groups.len(), 1);
        // Ranges over the same path intersect under the merge.
        let subs = groups.sealed_subs();
        let ranges = groups.terms()[0].sealed_ranges(&subs);
        let prepared = ranges["a"][&KeyPath::parse("x")]
            .prepare(&EvalScope::constant())
            .expect("prepare");
        assert_eq!(prepared.len(), 1);
        assert!(!prepared[0].contains(&Value::from(1)));
        assert!(prepared[0].contains(&Value::from(5)));
        assert!(!prepared[0].contains(&Value::from(9)));
    }

    #[test]
    fn distinct_dependency_terms_stay_separate() {
        let s = schema(&["a", "b"]);
        let mut groups = TermGroups::new();
        groups
            .parse("a.x > 1 && b.y < 2 && a.x < 5", vec![], &s)
            .expect("parse");
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn substitution_count_must_match_holes() {
        let s = schema(&["a"]);
        let mut groups = TermGroups::new();
        let err = groups.parse("a.x > ?", vec![], &s);
        assert!(matches!(err, Err(QueryError::BuilderMisuse(_))));
    }

    #[test]
    fn merge_reindexes_substitutions() {
        let s = schema(&["a", "b"]);
        let mut left = TermGroups::new();
        left.parse("a.x > ?", vec![Value::from(1)], &s)
            .expect("parse");
        let mut right = TermGroups::new();
        right
            .parse("b.y < ?", vec![Value::from(9)], &s)
            .expect("parse");
        left.merge(right);
        assert_eq!(left.len(), 2);

        let subs = left.sealed_subs();
        assert_eq!(subs.as_ref(), &vec![Value::from(1), Value::from(9)]);

        // The re-indexed term must read its own substitution, not the
        // first group's.
        let mut row = Row::new();
        row.bind("a", Record::from_pairs([("x", 5)]));
        row.bind("b", Record::from_pairs([("y", 5)]));
        let params = Record::new();
        let scope = EvalScope::new(&row, &params);
        for term in left.terms() {
            assert!(term
                .to_expression(&subs)
                .matches(&scope)
                .expect("eval"));
        }
    }

    #[test]
    fn merged_expression_is_the_conjunction() {
        let s = schema(&["a"]);
        let mut groups = TermGroups::new();
        groups
            .parse("a.x > 1 && a.y < 5", vec![], &s)
            .expect("parse");

        let expr = groups.merged_expression().expect("expression");
        let mut row = Row::new();
        row.bind("a", Record::from_pairs([("x", 3), ("y", 3)]));
        let params = Record::new();
        assert!(expr.matches(&EvalScope::new(&row, &params)).expect("eval"));

        row.bind("a", Record::from_pairs([("x", 0), ("y", 3)]));
        assert!(!expr.matches(&EvalScope::new(&row, &params)).expect("eval"));
    }
}
