//! # Range Algebra
//!
//! Intervals over the value domain and the key-range trees the compiler
//! extracts from comparison predicates. Ranges drive index selection: a
//! prepared range is a canonical ordered list of non-overlapping intervals,
//! and a [`CompositeRange`] (equality prefix + final interval) synthesises
//! the single native range handed to a composite index cursor.
//!
//! Canonical form invariants for `KeyRange::prepare`:
//! - every interval in the output is non-empty,
//! - no two intervals overlap (touching intervals are coalesced),
//! - intervals are ordered by their lower endpoint,
//! - the empty list denotes the empty relation.

use crate::error::QueryResult;
use crate::expr::{EvalScope, Expression};
use crate::value::{next_up, Value};
use std::cmp::Ordering;
use std::fmt;

/// One endpoint of an interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bound {
    Unbounded,
    Inclusive(Value),
    Exclusive(Value),
}

impl Bound {
    fn value(&self) -> Option<&Value> {
        match self {
            Bound::Unbounded => None,
            Bound::Inclusive(v) | Bound::Exclusive(v) => Some(v),
        }
    }
}

/// A contiguous interval over the value domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    pub lower: Bound,
    pub upper: Bound,
}

impl Interval {
    pub fn full() -> Interval {
        Interval {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
        }
    }

    /// The single-point interval `[v, v]`.
    pub fn equality(v: Value) -> Interval {
        Interval {
            lower: Bound::Inclusive(v.clone()),
            upper: Bound::Inclusive(v),
        }
    }

    pub fn at_least(v: Value) -> Interval {
        Interval {
            lower: Bound::Inclusive(v),
            upper: Bound::Unbounded,
        }
    }

    pub fn above(v: Value) -> Interval {
        Interval {
            lower: Bound::Exclusive(v),
            upper: Bound::Unbounded,
        }
    }

    pub fn at_most(v: Value) -> Interval {
        Interval {
            lower: Bound::Unbounded,
            upper: Bound::Inclusive(v),
        }
    }

    pub fn below(v: Value) -> Interval {
        Interval {
            lower: Bound::Unbounded,
            upper: Bound::Exclusive(v),
        }
    }

    pub fn is_empty(&self) -> bool {
        match (self.lower.value(), self.upper.value()) {
            (Some(lo), Some(hi)) => match lo.cmp(hi) {
                Ordering::Greater => true,
                Ordering::Equal => {
                    !(matches!(self.lower, Bound::Inclusive(_))
                        && matches!(self.upper, Bound::Inclusive(_)))
                }
                Ordering::Less => false,
            },
            _ => false,
        }
    }

    /// A single point with both endpoints closed.
    pub fn is_equality(&self) -> bool {
        matches!(
            (&self.lower, &self.upper),
            (Bound::Inclusive(a), Bound::Inclusive(b)) if a == b
        )
    }

    pub fn contains(&self, v: &Value) -> bool {
        let above_lower = match &self.lower {
            Bound::Unbounded => true,
            Bound::Inclusive(lo) => v >= lo,
            Bound::Exclusive(lo) => v > lo,
        };
        let below_upper = match &self.upper {
            Bound::Unbounded => true,
            Bound::Inclusive(hi) => v <= hi,
            Bound::Exclusive(hi) => v < hi,
        };
        above_lower && below_upper
    }

    /// Rewrite a closed upper bound `[a, b]` as the half-open `[a, next_up(b))`.
    pub fn open_upper(&self) -> Interval {
        match &self.upper {
            Bound::Inclusive(v) => Interval {
                lower: self.lower.clone(),
                upper: Bound::Exclusive(next_up(v)),
            },
            _ => self.clone(),
        }
    }

    pub fn intersect(&self, other: &Interval) -> Interval {
        let lower = match cmp_lower(&self.lower, &other.lower) {
            Ordering::Less => other.lower.clone(),
            _ => self.lower.clone(),
        };
        let upper = match cmp_upper(&self.upper, &other.upper) {
            Ordering::Greater => other.upper.clone(),
            _ => self.upper.clone(),
        };
        Interval { lower, upper }
    }

    /// Whether the union of two intervals is contiguous (they overlap or
    /// touch without a gap).
    fn joinable(&self, other: &Interval) -> bool {
        // Ordered by lower endpoint; self comes first.
        match (self.upper.value(), other.lower.value()) {
            (None, _) | (_, None) => true,
            (Some(hi), Some(lo)) => match hi.cmp(lo) {
                Ordering::Greater => true,
                Ordering::Equal => {
                    matches!(self.upper, Bound::Inclusive(_))
                        || matches!(other.lower, Bound::Inclusive(_))
                }
                Ordering::Less => false,
            },
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.lower {
            Bound::Unbounded => write!(f, "(-inf")?,
            Bound::Inclusive(v) => write!(f, "[{v}")?,
            Bound::Exclusive(v) => write!(f, "({v}")?,
        }
        write!(f, ", ")?;
        match &self.upper {
            Bound::Unbounded => write!(f, "+inf)"),
            Bound::Inclusive(v) => write!(f, "{v}]"),
            Bound::Exclusive(v) => write!(f, "{v})"),
        }
    }
}

/// Order of lower endpoints: unbounded first; at equal values an inclusive
/// bound starts before an exclusive one.
pub fn cmp_lower(a: &Bound, b: &Bound) -> Ordering {
    match (a, b) {
        (Bound::Unbounded, Bound::Unbounded) => Ordering::Equal,
        (Bound::Unbounded, _) => Ordering::Less,
        (_, Bound::Unbounded) => Ordering::Greater,
        _ => {
            let (av, bv) = (a.value().expect("bounded"), b.value().expect("bounded"));
            av.cmp(bv).then_with(|| match (a, b) {
                (Bound::Inclusive(_), Bound::Exclusive(_)) => Ordering::Less,
                (Bound::Exclusive(_), Bound::Inclusive(_)) => Ordering::Greater,
                _ => Ordering::Equal,
            })
        }
    }
}

/// Order of upper endpoints: unbounded last; at equal values an exclusive
/// bound ends before an inclusive one.
pub fn cmp_upper(a: &Bound, b: &Bound) -> Ordering {
    match (a, b) {
        (Bound::Unbounded, Bound::Unbounded) => Ordering::Equal,
        (Bound::Unbounded, _) => Ordering::Greater,
        (_, Bound::Unbounded) => Ordering::Less,
        _ => {
            let (av, bv) = (a.value().expect("bounded"), b.value().expect("bounded"));
            av.cmp(bv).then_with(|| match (a, b) {
                (Bound::Exclusive(_), Bound::Inclusive(_)) => Ordering::Less,
                (Bound::Inclusive(_), Bound::Exclusive(_)) => Ordering::Greater,
                _ => Ordering::Equal,
            })
        }
    }
}

/// An expression-valued endpoint, evaluated per row at preparation time.
#[derive(Debug, Clone)]
pub struct ExprBound {
    pub expr: Expression,
    pub open: bool,
}

impl ExprBound {
    fn shift_subs(self, base: usize) -> ExprBound {
        ExprBound {
            expr: self.expr.shift_subs(base),
            open: self.open,
        }
    }

    fn with_subs(&self, subs: &std::rc::Rc<Vec<Value>>) -> ExprBound {
        ExprBound {
            expr: self.expr.with_subs(std::rc::Rc::clone(subs)),
            open: self.open,
        }
    }
}

/// A key-range constraint against a single key path.
///
/// Literal ranges come from comparisons against constants; expression
/// ranges from comparisons whose other side depends on a different source
/// and must be evaluated per row. Unions and intersections mirror `||` and
/// `&&` in the predicate they were extracted from.
#[derive(Debug, Clone)]
pub enum KeyRange {
    Literal(Interval),
    Expr {
        lower: Option<ExprBound>,
        upper: Option<ExprBound>,
        /// Both endpoints stem from one `==` against the same expression.
        equality: bool,
    },
    Union(Box<KeyRange>, Box<KeyRange>),
    Intersection(Box<KeyRange>, Box<KeyRange>),
}

impl KeyRange {
    pub fn equality_expr(expr: Expression) -> KeyRange {
        KeyRange::Expr {
            lower: Some(ExprBound {
                expr: expr.clone(),
                open: false,
            }),
            upper: Some(ExprBound { expr, open: false }),
            equality: true,
        }
    }

    pub fn lower_expr(expr: Expression, open: bool) -> KeyRange {
        KeyRange::Expr {
            lower: Some(ExprBound { expr, open }),
            upper: None,
            equality: false,
        }
    }

    pub fn upper_expr(expr: Expression, open: bool) -> KeyRange {
        KeyRange::Expr {
            lower: None,
            upper: Some(ExprBound { expr, open }),
            equality: false,
        }
    }

    pub fn union(self, other: KeyRange) -> KeyRange {
        KeyRange::Union(Box::new(self), Box::new(other))
    }

    pub fn intersection(self, other: KeyRange) -> KeyRange {
        KeyRange::Intersection(Box::new(self), Box::new(other))
    }

    /// Sound equality test; conservatively false when unknown.
    ///
    /// A `true` answer guarantees every prepared interval is a closed
    /// single point, which is what composite-prefix matching relies on.
    pub fn is_equality(&self) -> bool {
        match self {
            KeyRange::Literal(i) => i.is_equality(),
            KeyRange::Expr { equality, .. } => *equality,
            KeyRange::Union(l, r) => l.is_equality() && r.is_equality(),
            KeyRange::Intersection(l, r) => l.is_equality() || r.is_equality(),
        }
    }

    /// Shift substitution references in expression bounds by `base`.
    pub(crate) fn shift_subs(self, base: usize) -> KeyRange {
        match self {
            KeyRange::Literal(i) => KeyRange::Literal(i),
            KeyRange::Expr {
                lower,
                upper,
                equality,
            } => KeyRange::Expr {
                lower: lower.map(|b| b.shift_subs(base)),
                upper: upper.map(|b| b.shift_subs(base)),
                equality,
            },
            KeyRange::Union(l, r) => KeyRange::Union(
                Box::new(l.shift_subs(base)),
                Box::new(r.shift_subs(base)),
            ),
            KeyRange::Intersection(l, r) => KeyRange::Intersection(
                Box::new(l.shift_subs(base)),
                Box::new(r.shift_subs(base)),
            ),
        }
    }

    /// Attach the sealed substitution table to every expression bound.
    pub(crate) fn with_subs(&self, subs: &std::rc::Rc<Vec<Value>>) -> KeyRange {
        match self {
            KeyRange::Literal(i) => KeyRange::Literal(i.clone()),
            KeyRange::Expr {
                lower,
                upper,
                equality,
            } => KeyRange::Expr {
                lower: lower.as_ref().map(|b| b.with_subs(subs)),
                upper: upper.as_ref().map(|b| b.with_subs(subs)),
                equality: *equality,
            },
            KeyRange::Union(l, r) => {
                KeyRange::Union(Box::new(l.with_subs(subs)), Box::new(r.with_subs(subs)))
            }
            KeyRange::Intersection(l, r) => KeyRange::Intersection(
                Box::new(l.with_subs(subs)),
                Box::new(r.with_subs(subs)),
            ),
        }
    }

    /// Resolve to the canonical ordered list of non-overlapping intervals.
    pub fn prepare(&self, scope: &EvalScope<'_>) -> QueryResult<Vec<Interval>> {
        let intervals = match self {
            KeyRange::Literal(i) => vec![i.clone()],
            KeyRange::Expr { lower, upper, .. } => {
                let lower = match lower {
                    None => Bound::Unbounded,
                    Some(b) => {
                        let v = b.expr.eval(scope)?;
                        if b.open {
                            Bound::Exclusive(v)
                        } else {
                            Bound::Inclusive(v)
                        }
                    }
                };
                let upper = match upper {
                    None => Bound::Unbounded,
                    Some(b) => {
                        let v = b.expr.eval(scope)?;
                        if b.open {
                            Bound::Exclusive(v)
                        } else {
                            Bound::Inclusive(v)
                        }
                    }
                };
                vec![Interval { lower, upper }]
            }
            KeyRange::Union(l, r) => {
                let mut out = l.prepare(scope)?;
                out.extend(r.prepare(scope)?);
                out
            }
            KeyRange::Intersection(l, r) => {
                let left = l.prepare(scope)?;
                let right = r.prepare(scope)?;
                let mut out = Vec::new();
                for a in &left {
                    for b in &right {
                        out.push(a.intersect(b));
                    }
                }
                out
            }
        };
        Ok(canonicalize(intervals))
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyRange::Literal(i) => write!(f, "{i}"),
            KeyRange::Expr { lower, upper, .. } => {
                let lo = lower.as_ref().map_or("-inf".into(), |b| {
                    format!("{}{}", if b.open { ">" } else { ">=" }, b.expr)
                });
                let hi = upper.as_ref().map_or("+inf".into(), |b| {
                    format!("{}{}", if b.open { "<" } else { "<=" }, b.expr)
                });
                write!(f, "expr({lo}, {hi})")
            }
            KeyRange::Union(l, r) => write!(f, "({l} | {r})"),
            KeyRange::Intersection(l, r) => write!(f, "({l} & {r})"),
        }
    }
}

/// Drop empty intervals, sort by lower endpoint, coalesce overlap.
fn canonicalize(mut intervals: Vec<Interval>) -> Vec<Interval> {
    intervals.retain(|i| !i.is_empty());
    intervals.sort_by(|a, b| cmp_lower(&a.lower, &b.lower));
    let mut out: Vec<Interval> = Vec::with_capacity(intervals.len());
    for next in intervals {
        match out.last_mut() {
            Some(last) if last.joinable(&next) => {
                if cmp_upper(&next.upper, &last.upper) == Ordering::Greater {
                    last.upper = next.upper;
                }
            }
            _ => out.push(next),
        }
    }
    out
}

/// Membership across a prepared interval list.
pub fn intervals_contain(intervals: &[Interval], v: &Value) -> bool {
    intervals.iter().any(|i| i.contains(v))
}

/// An equality prefix plus a final interval, used to drive one composite
/// index cursor pass.
#[derive(Debug, Clone)]
pub struct CompositeRange {
    pub equalities: Vec<Value>,
    pub last: Interval,
}

impl CompositeRange {
    /// Synthesise the native range against the index.
    ///
    /// For a composite index the key is the sequence of component values;
    /// a closed final upper bound is opened with `next_up` so the native
    /// half-open form still includes the original endpoint.
    pub fn to_native(&self, composite_key: bool) -> NativeRange {
        if !composite_key {
            // Single-component key: the interval maps through directly.
            return NativeRange::from_interval(&self.last);
        }
        let prefix = || self.equalities.clone();

        let lower = match &self.last.lower {
            Bound::Unbounded => Some((Value::Sequence(prefix()), false)),
            Bound::Inclusive(v) => {
                let mut key = prefix();
                key.push(v.clone());
                Some((Value::Sequence(key), false))
            }
            Bound::Exclusive(v) => {
                let mut key = prefix();
                key.push(v.clone());
                Some((Value::Sequence(key), true))
            }
        };
        let upper = match &self.last.upper {
            Bound::Unbounded => {
                // Least key strictly past every key with this prefix.
                let mut key = prefix();
                match key.pop() {
                    Some(last_eq) => {
                        key.push(next_up(&last_eq));
                        Some((Value::Sequence(key), true))
                    }
                    None => None,
                }
            }
            Bound::Inclusive(v) => {
                let mut key = prefix();
                key.push(next_up(v));
                Some((Value::Sequence(key), true))
            }
            Bound::Exclusive(v) => {
                let mut key = prefix();
                key.push(v.clone());
                Some((Value::Sequence(key), true))
            }
        };
        NativeRange { lower, upper }
    }
}

/// The store-facing range form: optional lower/upper endpoints with open
/// flags; `None` on both sides means all records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeRange {
    pub lower: Option<(Value, bool)>,
    pub upper: Option<(Value, bool)>,
}

impl NativeRange {
    pub fn all() -> NativeRange {
        NativeRange::default()
    }

    pub fn from_interval(interval: &Interval) -> NativeRange {
        let lower = match &interval.lower {
            Bound::Unbounded => None,
            Bound::Inclusive(v) => Some((v.clone(), false)),
            Bound::Exclusive(v) => Some((v.clone(), true)),
        };
        let upper = match &interval.upper {
            Bound::Unbounded => None,
            Bound::Inclusive(v) => Some((v.clone(), false)),
            Bound::Exclusive(v) => Some((v.clone(), true)),
        };
        NativeRange { lower, upper }
    }

    pub fn contains(&self, key: &Value) -> bool {
        let above = match &self.lower {
            None => true,
            Some((v, true)) => key > v,
            Some((v, false)) => key >= v,
        };
        let below = match &self.upper {
            None => true,
            Some((v, true)) => key < v,
            Some((v, false)) => key <= v,
        };
        above && below
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::EvalScope;
    use proptest::prelude::*;

    fn n(v: f64) -> Value {
        Value::Number(v)
    }

    fn scope() -> EvalScope<'static> {
        EvalScope::constant()
    }

    #[test]
    fn empty_interval_detection() {
        assert!(Interval {
            lower: Bound::Inclusive(n(2.0)),
            upper: Bound::Inclusive(n(1.0)),
        }
        .is_empty());
        assert!(Interval {
            lower: Bound::Inclusive(n(1.0)),
            upper: Bound::Exclusive(n(1.0)),
        }
        .is_empty());
        assert!(!Interval::equality(n(1.0)).is_empty());
        assert!(!Interval::full().is_empty());
    }

    #[test]
    fn union_coalesces_overlap_and_touch() {
        let r = KeyRange::Literal(Interval::at_most(n(5.0)))
            .union(KeyRange::Literal(Interval::at_least(n(5.0))));
        let prepared = r.prepare(&scope()).expect("prepare");
        assert_eq!(prepared, vec![Interval::full()]);

        let gap = KeyRange::Literal(Interval::below(n(1.0)))
            .union(KeyRange::Literal(Interval::above(n(1.0))));
        let prepared = gap.prepare(&scope()).expect("prepare");
        assert_eq!(prepared.len(), 2);
    }

    #[test]
    fn intersection_narrows() {
        let r = KeyRange::Literal(Interval::at_least(n(1.0)))
            .intersection(KeyRange::Literal(Interval::below(n(3.0))));
        let prepared = r.prepare(&scope()).expect("prepare");
        assert_eq!(
            prepared,
            vec![Interval {
                lower: Bound::Inclusive(n(1.0)),
                upper: Bound::Exclusive(n(3.0)),
            }]
        );

        let empty = KeyRange::Literal(Interval::below(n(1.0)))
            .intersection(KeyRange::Literal(Interval::above(n(2.0))));
        assert!(empty.prepare(&scope()).expect("prepare").is_empty());
    }

    #[test]
    fn equality_soundness() {
        assert!(KeyRange::Literal(Interval::equality(n(1.0))).is_equality());
        assert!(!KeyRange::Literal(Interval::at_least(n(1.0))).is_equality());
        // Union of two equalities prepares to closed points only.
        let u = KeyRange::Literal(Interval::equality(n(1.0)))
            .union(KeyRange::Literal(Interval::equality(n(2.0))));
        assert!(u.is_equality());
    }

    #[test]
    fn open_upper_includes_closed_endpoint() {
        let i = Interval {
            lower: Bound::Inclusive(n(1.0)),
            upper: Bound::Inclusive(n(2.0)),
        };
        let opened = i.open_upper();
        assert!(opened.contains(&n(2.0)));
        assert!(!opened.contains(&next_up(&n(2.0))));
    }

    #[test]
    fn composite_range_against_composite_index() {
        // storeId == 1 && isbn > 200000
        let c = CompositeRange {
            equalities: vec![n(1.0)],
            last: Interval::above(n(200_000.0)),
        };
        let native = c.to_native(true);
        assert!(native.contains(&Value::Sequence(vec![n(1.0), n(234_567.0)])));
        assert!(!native.contains(&Value::Sequence(vec![n(1.0), n(200_000.0)])));
        assert!(!native.contains(&Value::Sequence(vec![n(2.0), n(123_456.0)])));
    }

    #[test]
    fn composite_range_closed_upper_is_opened() {
        let c = CompositeRange {
            equalities: vec![n(1.0)],
            last: Interval {
                lower: Bound::Inclusive(n(10.0)),
                upper: Bound::Inclusive(n(20.0)),
            },
        };
        let native = c.to_native(true);
        assert!(native.contains(&Value::Sequence(vec![n(1.0), n(20.0)])));
        assert!(!native.contains(&Value::Sequence(vec![n(1.0), next_up(&n(20.0))])));
    }

    fn arb_interval() -> impl Strategy<Value = Interval> {
        let bound = prop_oneof![
            Just(Bound::Unbounded),
            (-100i32..100).prop_map(|v| Bound::Inclusive(Value::from(v))),
            (-100i32..100).prop_map(|v| Bound::Exclusive(Value::from(v))),
        ];
        (bound.clone(), bound).prop_map(|(lower, upper)| Interval { lower, upper })
    }

    proptest! {
        // Invariant: prepare yields non-empty, ordered, non-overlapping
        // intervals, and union/intersection agree with membership.
        #[test]
        fn prepare_is_canonical(a in arb_interval(), b in arb_interval(), probe in -100i32..100) {
            let v = Value::from(probe);
            let union = KeyRange::Literal(a.clone()).union(KeyRange::Literal(b.clone()));
            let inter = KeyRange::Literal(a.clone()).intersection(KeyRange::Literal(b.clone()));
            let u = union.prepare(&scope()).expect("prepare");
            let i = inter.prepare(&scope()).expect("prepare");

            for iv in u.iter().chain(i.iter()) {
                prop_assert!(!iv.is_empty());
            }
            for w in u.windows(2) {
                prop_assert_eq!(cmp_lower(&w[0].lower, &w[1].lower), Ordering::Less);
                prop_assert!(!w[0].joinable(&w[1]));
            }

            prop_assert_eq!(
                intervals_contain(&u, &v),
                a.contains(&v) || b.contains(&v)
            );
            prop_assert_eq!(
                intervals_contain(&i, &v),
                a.contains(&v) && b.contains(&v)
            );
        }
    }
}
