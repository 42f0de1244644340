//! Compile pass over parsed expression trees.
//!
//! Applies, in order: comparison normalisation to the marked three-way
//! form, aggregate-call materialisation into group slots, renaming of
//! `this`, and classification of unbound identifiers ($$-reserved names,
//! `$`-parameters, schema sources). While classifying it records the
//! dependency set, splits the top-level conjunction into term roots, and
//! extracts key-range constraints per term.

use crate::error::{QueryError, QueryResult};
use crate::expr::aggregate::{AggFunc, AggInit};
use crate::expr::ast::{CmpOp, Node};
use crate::expr::parser::Parser;
use crate::expr::{DepSet, Expression, Schema};
use crate::range::{Interval, KeyRange};
use crate::value::KeyPath;
#[cfg(test)]
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Options for one compile call.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompileOptions {
    pub allow_aggregates: bool,
    pub compile_all: bool,
}

/// One term root: a conjunct subtree with its dependency set and the key
/// ranges extracted from it. The substitution table is owned by the
/// enclosing term group; `ast` references it by index.
#[derive(Debug, Clone)]
pub struct TermParts {
    pub ast: Node,
    pub deps: DepSet,
    pub ranges: BTreeMap<String, BTreeMap<KeyPath, KeyRange>>,
}

/// Result of compiling one fragment.
#[derive(Debug, Clone)]
pub struct Compiled {
    pub terms: Vec<TermParts>,
    /// The whole expression, present under `compile_all`.
    pub full: Option<Expression>,
    /// Number of substitution holes the fragment consumed.
    pub holes: usize,
}

/// Parse and compile `source` against `schema`. Substitution holes are
/// numbered from `subs_base`.
pub fn compile_fragment(
    source: &str,
    subs_base: usize,
    schema: &Schema,
    opts: CompileOptions,
) -> QueryResult<Compiled> {
    let (raw, holes) = Parser::parse(source, subs_base)?;

    let mut rw = Rewriter {
        schema,
        opts,
        deps: DepSet::new(),
        aggs: Vec::new(),
        lambda_vars: Vec::new(),
    };
    let ast = rw.rewrite(raw)?;

    let full = if opts.compile_all {
        Some(Expression::with_aggs(
            ast.clone(),
            rw.deps.clone(),
            rw.aggs.clone(),
        ))
    } else {
        None
    };

    let mut terms = Vec::new();
    for conjunct in ast.conjuncts() {
        let mut sources = BTreeSet::new();
        conjunct.collect_sources(&mut sources);
        let mut deps = DepSet::new();
        for name in sources {
            deps.insert(name.clone(), schema.resolve(&name));
        }
        let ranges = extract_ranges(&conjunct, false);
        terms.push(TermParts {
            ast: conjunct,
            deps,
            ranges,
        });
    }

    Ok(Compiled { terms, full, holes })
}

struct Rewriter<'a> {
    schema: &'a Schema,
    opts: CompileOptions,
    deps: DepSet,
    aggs: Vec<AggInit>,
    lambda_vars: Vec<String>,
}

impl Rewriter<'_> {
    fn rewrite(&mut self, node: Node) -> QueryResult<Node> {
        Ok(match node {
            // Comparison normalisation. `ThreeWay` is the mark: rewritten
            // nodes are never rewritten again.
            Node::Compare(op, l, r) => Node::ThreeWay(
                op,
                Box::new(self.rewrite(*l)?),
                Box::new(self.rewrite(*r)?),
            ),
            Node::StrictEq { negate, lhs, rhs } => Node::ThreeWay(
                if negate { CmpOp::Ne } else { CmpOp::Eq },
                Box::new(self.rewrite(*lhs)?),
                Box::new(self.rewrite(*rhs)?),
            ),

            Node::Call(callee, args) => match *callee {
                Node::Ident(ref name) if !self.is_lambda_var(name) => {
                    if let Some(func) = AggFunc::from_name(name) {
                        if !self.opts.allow_aggregates {
                            return Err(QueryError::AggregateNotAllowed(name.clone()));
                        }
                        let mut rewritten = Vec::with_capacity(args.len());
                        for a in args {
                            rewritten.push(self.rewrite(a)?);
                        }
                        let slot = self.aggs.len();
                        self.aggs.push(AggInit {
                            slot,
                            func,
                            args: rewritten,
                        });
                        Node::GroupRead(slot)
                    } else if name == "cmp" {
                        if args.len() != 2 {
                            return Err(QueryError::Parse(
                                "cmp takes exactly two arguments".into(),
                            ));
                        }
                        let mut it = args.into_iter();
                        let l = self.rewrite(it.next().expect("arity checked"))?;
                        let r = self.rewrite(it.next().expect("arity checked"))?;
                        Node::CmpCall(Box::new(l), Box::new(r))
                    } else {
                        let callee = self.rewrite(Node::Ident(name.clone()))?;
                        let mut rewritten = Vec::with_capacity(args.len());
                        for a in args {
                            rewritten.push(self.rewrite(a)?);
                        }
                        Node::Call(Box::new(callee), rewritten)
                    }
                }
                other => {
                    let callee = self.rewrite(other)?;
                    let mut rewritten = Vec::with_capacity(args.len());
                    for a in args {
                        rewritten.push(self.rewrite(a)?);
                    }
                    Node::Call(Box::new(callee), rewritten)
                }
            },

            Node::Ident(name) => self.classify_ident(name)?,

            Node::Lambda(params, body) => {
                let depth = self.lambda_vars.len();
                self.lambda_vars.extend(params.iter().cloned());
                let body = self.rewrite(*body)?;
                self.lambda_vars.truncate(depth);
                Node::Lambda(params, Box::new(body))
            }

            // Structural recursion for the rest.
            Node::Member(base, field) => Node::Member(Box::new(self.rewrite(*base)?), field),
            Node::Index(base, idx) => Node::Index(
                Box::new(self.rewrite(*base)?),
                Box::new(self.rewrite(*idx)?),
            ),
            Node::RecordLit(fields) => {
                let mut out = Vec::with_capacity(fields.len());
                for (k, v) in fields {
                    out.push((k, self.rewrite(v)?));
                }
                Node::RecordLit(out)
            }
            Node::SeqLit(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.rewrite(item)?);
                }
                Node::SeqLit(out)
            }
            Node::Neg(e) => Node::Neg(Box::new(self.rewrite(*e)?)),
            Node::Not(e) => Node::Not(Box::new(self.rewrite(*e)?)),
            Node::Arith(op, l, r) => Node::Arith(
                op,
                Box::new(self.rewrite(*l)?),
                Box::new(self.rewrite(*r)?),
            ),
            Node::ThreeWay(op, l, r) => Node::ThreeWay(
                op,
                Box::new(self.rewrite(*l)?),
                Box::new(self.rewrite(*r)?),
            ),
            Node::CmpCall(l, r) => Node::CmpCall(
                Box::new(self.rewrite(*l)?),
                Box::new(self.rewrite(*r)?),
            ),
            Node::And(l, r) => Node::And(
                Box::new(self.rewrite(*l)?),
                Box::new(self.rewrite(*r)?),
            ),
            Node::Or(l, r) => Node::Or(
                Box::new(self.rewrite(*l)?),
                Box::new(self.rewrite(*r)?),
            ),
            Node::Ternary(c, t, e) => Node::Ternary(
                Box::new(self.rewrite(*c)?),
                Box::new(self.rewrite(*t)?),
                Box::new(self.rewrite(*e)?),
            ),

            leaf @ (Node::Literal(_)
            | Node::Source(_)
            | Node::Param(_)
            | Node::Subs(_)
            | Node::This
            | Node::Var(_)
            | Node::GroupRead(_)) => leaf,
        })
    }

    fn is_lambda_var(&self, name: &str) -> bool {
        self.lambda_vars.iter().any(|v| v == name)
    }

    fn classify_ident(&mut self, name: String) -> QueryResult<Node> {
        // Bound identifiers (lambda parameters) shadow everything.
        if self.is_lambda_var(&name) {
            return Ok(Node::Var(name));
        }
        if let Some(stripped) = name.strip_prefix("$$") {
            return match stripped {
                "this" => Ok(Node::This),
                _ => Err(QueryError::ReservedName(name)),
            };
        }
        if let Some(stripped) = name.strip_prefix('$') {
            if stripped.is_empty() {
                return Err(QueryError::Parse("bare '$' is not a parameter".into()));
            }
            return Ok(Node::Param(stripped.to_string()));
        }
        // Unbound identifiers resolve against the standard scope first,
        // then the schema.
        if AggFunc::from_name(&name).is_some() || name == "cmp" {
            return Err(QueryError::Parse(format!(
                "'{name}' is a standard-scope function, not a value"
            )));
        }
        match self.schema {
            Schema::Known(map) => {
                if let Some(id) = map.get(&name) {
                    self.deps.insert(name.clone(), *id);
                    Ok(Node::Source(name))
                } else {
                    Err(QueryError::UnknownName(name))
                }
            }
            Schema::Unknown => {
                self.deps.insert(name.clone(), crate::expr::DepId::UNKNOWN);
                Ok(Node::Source(name))
            }
        }
    }
}

// --------------------------------------------------------------------------
// Range extraction
// --------------------------------------------------------------------------

type RangeMap = BTreeMap<String, BTreeMap<KeyPath, KeyRange>>;

/// Extract key-range constraints from a term-root subtree.
///
/// The complement flag toggles under `!`; under complement `&&` combines
/// as union and `||` as intersection, and pairs present in only one branch
/// are dropped (required for soundness under complement, conservative
/// otherwise).
fn extract_ranges(node: &Node, complement: bool) -> RangeMap {
    match node {
        Node::ThreeWay(op, l, r) => {
            let mut out = RangeMap::new();
            if let Some((source, path)) = key_path_of(l) {
                if !references_source(r, &source) {
                    if let Some(range) = range_for(*op, r, complement) {
                        out.entry(source).or_default().insert(path, range);
                    }
                }
            }
            if let Some((source, path)) = key_path_of(r) {
                if !references_source(l, &source) {
                    if let Some(range) = range_for(op.flip(), l, complement) {
                        out.entry(source).or_default().insert(path, range);
                    }
                }
            }
            out
        }
        Node::And(l, r) => combine(
            extract_ranges(l, complement),
            extract_ranges(r, complement),
            !complement,
        ),
        Node::Or(l, r) => combine(
            extract_ranges(l, complement),
            extract_ranges(r, complement),
            complement,
        ),
        Node::Not(e) => extract_ranges(e, !complement),
        _ => RangeMap::new(),
    }
}

/// Keep only (source, path) pairs present in both maps; combine with
/// intersection when `intersect`, union otherwise.
fn combine(mut left: RangeMap, mut right: RangeMap, intersect: bool) -> RangeMap {
    let mut out = RangeMap::new();
    let sources: Vec<String> = left
        .keys()
        .filter(|s| right.contains_key(*s))
        .cloned()
        .collect();
    for source in sources {
        let mut lpaths = left.remove(&source).unwrap_or_default();
        let mut rpaths = right.remove(&source).unwrap_or_default();
        let paths: Vec<KeyPath> = lpaths
            .keys()
            .filter(|p| rpaths.contains_key(*p))
            .cloned()
            .collect();
        let mut merged = BTreeMap::new();
        for path in paths {
            let (Some(l), Some(r)) = (lpaths.remove(&path), rpaths.remove(&path)) else {
                continue;
            };
            merged.insert(
                path,
                if intersect {
                    l.intersection(r)
                } else {
                    l.union(r)
                },
            );
        }
        if !merged.is_empty() {
            out.insert(source, merged);
        }
    }
    out
}

/// `source.field.field...` chains rooted at a schema source.
fn key_path_of(node: &Node) -> Option<(String, KeyPath)> {
    let mut segments = Vec::new();
    let mut current = node;
    loop {
        match current {
            Node::Member(base, field) => {
                segments.push(field.clone());
                current = base;
            }
            Node::Source(name) if !segments.is_empty() => {
                segments.reverse();
                return Some((name.clone(), KeyPath::new(segments)));
            }
            _ => return None,
        }
    }
}

fn references_source(node: &Node, source: &str) -> bool {
    let mut found = false;
    node.walk(&mut |n| {
        if let Node::Source(name) = n {
            if name == source {
                found = true;
            }
        }
    });
    found
}

/// Map `keyPath <op> expr` (after complementing) to a key range over the
/// path. The expression side must not depend on the path's source.
fn range_for(op: CmpOp, other: &Node, complement: bool) -> Option<KeyRange> {
    let effective = if complement { op.complement()? } else { op };

    // Constant bounds fold to literal intervals.
    if let Node::Literal(v) = other {
        let interval = match effective {
            CmpOp::Eq => Interval::equality(v.clone()),
            CmpOp::Ge => Interval::at_least(v.clone()),
            CmpOp::Gt => Interval::above(v.clone()),
            CmpOp::Le => Interval::at_most(v.clone()),
            CmpOp::Lt => Interval::below(v.clone()),
            CmpOp::Ne => return None,
        };
        return Some(KeyRange::Literal(interval));
    }

    let expr = bound_expression(other);
    Some(match effective {
        CmpOp::Eq => KeyRange::equality_expr(expr),
        CmpOp::Ge => KeyRange::lower_expr(expr, false),
        CmpOp::Gt => KeyRange::lower_expr(expr, true),
        CmpOp::Le => KeyRange::upper_expr(expr, false),
        CmpOp::Lt => KeyRange::upper_expr(expr, true),
        CmpOp::Ne => return None,
    })
}

fn bound_expression(node: &Node) -> Expression {
    let mut sources = BTreeSet::new();
    node.collect_sources(&mut sources);
    let mut deps = DepSet::new();
    for name in sources {
        // The bound side keeps whatever identity the term resolved; the
        // executor evaluates it against the ambient row, so the identity
        // here is informational only.
        deps.insert(name, crate::expr::DepId::UNKNOWN);
    }
    Expression::new(node.clone(), deps)
}
