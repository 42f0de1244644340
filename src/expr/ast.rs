//! Expression AST.
//!
//! The parser produces raw nodes (`Ident`, `Binary` comparisons); the
//! compile pass rewrites them into their resolved forms (`Source`,
//! `Param`, `ThreeWay`, `GroupRead`) and records dependencies. Nodes are
//! plain owned trees; compile transforms rebuild rather than mutate.

use crate::value::Value;
use std::fmt;

/// Arithmetic binary operators. `Add` doubles as string concatenation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

/// Comparison operators that normalise to the three-way form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    /// The complemented operator, used by range extraction under `!`.
    pub fn complement(self) -> Option<CmpOp> {
        match self {
            CmpOp::Eq => None,
            CmpOp::Ne => Some(CmpOp::Eq),
            CmpOp::Lt => Some(CmpOp::Ge),
            CmpOp::Le => Some(CmpOp::Gt),
            CmpOp::Gt => Some(CmpOp::Le),
            CmpOp::Ge => Some(CmpOp::Lt),
        }
    }

    /// Operator with the comparison sides swapped.
    pub fn flip(self) -> CmpOp {
        match self {
            CmpOp::Eq => CmpOp::Eq,
            CmpOp::Ne => CmpOp::Ne,
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::Le => CmpOp::Ge,
            CmpOp::Gt => CmpOp::Lt,
            CmpOp::Ge => CmpOp::Le,
        }
    }

    pub fn matches(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            CmpOp::Eq => ordering == Equal,
            CmpOp::Ne => ordering != Equal,
            CmpOp::Lt => ordering == Less,
            CmpOp::Le => ordering != Greater,
            CmpOp::Gt => ordering == Greater,
            CmpOp::Ge => ordering != Less,
        }
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        };
        write!(f, "{s}")
    }
}

/// An expression tree node.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Literal(Value),
    /// Unresolved identifier; only present before the compile pass.
    Ident(String),
    /// Reference to a schema source by alias.
    Source(String),
    /// `$name` parameter access.
    Param(String),
    /// `$$subs[i]`: substitution hole, index into the owning group's table.
    Subs(usize),
    /// The implicit row identifier (`this` after renaming).
    This,
    /// Lambda-bound variable.
    Var(String),
    /// Read of aggregate group slot `k`.
    GroupRead(usize),
    Member(Box<Node>, String),
    Index(Box<Node>, Box<Node>),
    Call(Box<Node>, Vec<Node>),
    Lambda(Vec<String>, Box<Node>),
    RecordLit(Vec<(String, Node)>),
    SeqLit(Vec<Node>),
    Neg(Box<Node>),
    Not(Box<Node>),
    Arith(ArithOp, Box<Node>, Box<Node>),
    /// Raw comparison as parsed; rewritten to `ThreeWay` by the compiler.
    Compare(CmpOp, Box<Node>, Box<Node>),
    /// Marked three-way form: `cmp(lhs, rhs) <op> 0`. Idempotent rewrite
    /// target; range extraction pattern-matches on this node.
    ThreeWay(CmpOp, Box<Node>, Box<Node>),
    /// Explicit `cmp(a, b)` call resolved from the standard scope.
    CmpCall(Box<Node>, Box<Node>),
    /// Strict (`===` / `!==`) equality; never rewritten to three-way.
    StrictEq {
        negate: bool,
        lhs: Box<Node>,
        rhs: Box<Node>,
    },
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Ternary(Box<Node>, Box<Node>, Box<Node>),
}

impl Node {
    /// Split a top-level conjunction into its conjunct subtrees, in source
    /// order. Non-conjunction nodes yield themselves.
    pub fn conjuncts(self) -> Vec<Node> {
        match self {
            Node::And(l, r) => {
                let mut out = l.conjuncts();
                out.extend(r.conjuncts());
                out
            }
            other => vec![other],
        }
    }

    /// Collect the source aliases referenced beneath this node.
    pub fn collect_sources(&self, out: &mut std::collections::BTreeSet<String>) {
        self.walk(&mut |n| {
            if let Node::Source(name) = n {
                out.insert(name.clone());
            }
        });
    }

    /// Pre-order walk over the tree.
    pub fn walk(&self, visit: &mut impl FnMut(&Node)) {
        visit(self);
        match self {
            Node::Literal(_)
            | Node::Ident(_)
            | Node::Source(_)
            | Node::Param(_)
            | Node::Subs(_)
            | Node::This
            | Node::Var(_)
            | Node::GroupRead(_) => {}
            Node::Member(base, _) => base.walk(visit),
            Node::Index(base, idx) => {
                base.walk(visit);
                idx.walk(visit);
            }
            Node::Call(callee, args) => {
                callee.walk(visit);
                for a in args {
                    a.walk(visit);
                }
            }
            Node::Lambda(_, body) => body.walk(visit),
            Node::RecordLit(fields) => {
                for (_, v) in fields {
                    v.walk(visit);
                }
            }
            Node::SeqLit(items) => {
                for item in items {
                    item.walk(visit);
                }
            }
            Node::Neg(e) | Node::Not(e) => e.walk(visit),
            Node::Arith(_, l, r)
            | Node::Compare(_, l, r)
            | Node::ThreeWay(_, l, r)
            | Node::CmpCall(l, r)
            | Node::And(l, r)
            | Node::Or(l, r) => {
                l.walk(visit);
                r.walk(visit);
            }
            Node::StrictEq { lhs, rhs, .. } => {
                lhs.walk(visit);
                rhs.walk(visit);
            }
            Node::Ternary(c, t, e) => {
                c.walk(visit);
                t.walk(visit);
                e.walk(visit);
            }
        }
    }

    /// Rebuild the tree, applying `f` bottom-up to every node.
    pub fn map(self, f: &mut impl FnMut(Node) -> Node) -> Node {
        let rebuilt = match self {
            Node::Member(base, field) => Node::Member(Box::new(base.map(f)), field),
            Node::Index(base, idx) => Node::Index(Box::new(base.map(f)), Box::new(idx.map(f))),
            Node::Call(callee, args) => Node::Call(
                Box::new(callee.map(f)),
                args.into_iter().map(|a| a.map(f)).collect(),
            ),
            Node::Lambda(params, body) => Node::Lambda(params, Box::new(body.map(f))),
            Node::RecordLit(fields) => Node::RecordLit(
                fields.into_iter().map(|(k, v)| (k, v.map(f))).collect(),
            ),
            Node::SeqLit(items) => {
                Node::SeqLit(items.into_iter().map(|i| i.map(f)).collect())
            }
            Node::Neg(e) => Node::Neg(Box::new(e.map(f))),
            Node::Not(e) => Node::Not(Box::new(e.map(f))),
            Node::Arith(op, l, r) => Node::Arith(op, Box::new(l.map(f)), Box::new(r.map(f))),
            Node::Compare(op, l, r) => {
                Node::Compare(op, Box::new(l.map(f)), Box::new(r.map(f)))
            }
            Node::ThreeWay(op, l, r) => {
                Node::ThreeWay(op, Box::new(l.map(f)), Box::new(r.map(f)))
            }
            Node::CmpCall(l, r) => Node::CmpCall(Box::new(l.map(f)), Box::new(r.map(f))),
            Node::StrictEq { negate, lhs, rhs } => Node::StrictEq {
                negate,
                lhs: Box::new(lhs.map(f)),
                rhs: Box::new(rhs.map(f)),
            },
            Node::And(l, r) => Node::And(Box::new(l.map(f)), Box::new(r.map(f))),
            Node::Or(l, r) => Node::Or(Box::new(l.map(f)), Box::new(r.map(f))),
            Node::Ternary(c, t, e) => Node::Ternary(
                Box::new(c.map(f)),
                Box::new(t.map(f)),
                Box::new(e.map(f)),
            ),
            leaf => leaf,
        };
        f(rebuilt)
    }

    /// Shift every substitution reference by `base`. Used when term groups
    /// merge and the substitution tables are concatenated.
    pub fn shift_subs(self, base: usize) -> Node {
        if base == 0 {
            return self;
        }
        self.map(&mut |n| match n {
            Node::Subs(i) => Node::Subs(i + base),
            other => other,
        })
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Literal(v) => write!(f, "{v}"),
            Node::Ident(s) | Node::Source(s) | Node::Var(s) => write!(f, "{s}"),
            Node::Param(s) => write!(f, "${s}"),
            Node::Subs(i) => write!(f, "$$subs[{i}]"),
            Node::This => write!(f, "$$this"),
            Node::GroupRead(k) => write!(f, "$$g[{k}].value"),
            Node::Member(base, field) => write!(f, "{base}.{field}"),
            Node::Index(base, idx) => write!(f, "{base}[{idx}]"),
            Node::Call(callee, args) => {
                write!(f, "{callee}(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")
            }
            Node::Lambda(params, body) => write!(f, "({}) => {body}", params.join(", ")),
            Node::RecordLit(fields) => {
                write!(f, "{{")?;
                for (i, (k, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Node::SeqLit(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Node::Neg(e) => write!(f, "-({e})"),
            Node::Not(e) => write!(f, "!({e})"),
            Node::Arith(op, l, r) => {
                let s = match op {
                    ArithOp::Add => "+",
                    ArithOp::Sub => "-",
                    ArithOp::Mul => "*",
                    ArithOp::Div => "/",
                    ArithOp::Mod => "%",
                };
                write!(f, "({l} {s} {r})")
            }
            Node::Compare(op, l, r) => write!(f, "({l} {op} {r})"),
            Node::ThreeWay(op, l, r) => write!(f, "(cmp({l}, {r}) {op} 0)"),
            Node::CmpCall(l, r) => write!(f, "cmp({l}, {r})"),
            Node::StrictEq { negate, lhs, rhs } => {
                write!(f, "({lhs} {} {rhs})", if *negate { "!==" } else { "===" })
            }
            Node::And(l, r) => write!(f, "({l} && {r})"),
            Node::Or(l, r) => write!(f, "({l} || {r})"),
            Node::Ternary(c, t, e) => write!(f, "({c} ? {t} : {e})"),
        }
    }
}
