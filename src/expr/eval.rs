//! Tree-walking evaluator for compiled expressions.
//!
//! Evaluation is pure over `(row, group_state)`: the only mutation is the
//! aggregate fold into the group-state slots. Exceptions surface as
//! `QueryError::Eval` and propagate as stream errors.

use crate::error::{QueryError, QueryResult};
use crate::expr::aggregate::AggState;
use crate::expr::ast::{ArithOp, Node};
use crate::value::{Record, Row, Value};
use std::cell::RefCell;
use std::sync::OnceLock;

/// The evaluation context handed to compiled expressions: the current row,
/// the parameter record, and (inside a group fold) the group-state slots.
#[derive(Clone, Copy)]
pub struct EvalScope<'a> {
    pub row: &'a Row,
    pub params: &'a Record,
    pub group: Option<&'a RefCell<Vec<AggState>>>,
}

impl EvalScope<'static> {
    /// Scope with no row and no parameters, for constant evaluation.
    pub fn constant() -> EvalScope<'static> {
        static EMPTY_ROW: OnceLock<Row> = OnceLock::new();
        static EMPTY_PARAMS: OnceLock<Record> = OnceLock::new();
        EvalScope {
            row: EMPTY_ROW.get_or_init(Row::new),
            params: EMPTY_PARAMS.get_or_init(Record::new),
            group: None,
        }
    }
}

impl<'a> EvalScope<'a> {
    pub fn new(row: &'a Row, params: &'a Record) -> EvalScope<'a> {
        EvalScope {
            row,
            params,
            group: None,
        }
    }

    pub fn with_group(self, group: &'a RefCell<Vec<AggState>>) -> EvalScope<'a> {
        EvalScope {
            group: Some(group),
            ..self
        }
    }
}

pub(crate) struct Env<'a> {
    pub scope: EvalScope<'a>,
    pub subs: Option<&'a [Value]>,
    pub prebound: &'a Row,
    pub locals: Vec<(String, Value)>,
}

impl Env<'_> {
    fn source_record(&self, name: &str) -> QueryResult<&Record> {
        self.scope
            .row
            .get(name)
            .or_else(|| self.prebound.get(name))
            .ok_or_else(|| {
                QueryError::Internal(format!("source '{name}' is not bound in the current row"))
            })
    }
}

pub(crate) fn eval_node(node: &Node, env: &mut Env<'_>) -> QueryResult<Value> {
    match node {
        Node::Literal(v) => Ok(v.clone()),
        Node::Ident(name) => Err(QueryError::Internal(format!(
            "unresolved identifier '{name}' reached evaluation"
        ))),
        Node::Source(name) => Ok(Value::Record(env.source_record(name)?.clone())),
        Node::Param(name) => Ok(env.scope.params.get(name).clone()),
        Node::Subs(i) => {
            let subs = env.subs.ok_or_else(|| {
                QueryError::Internal("substitution table missing at evaluation".into())
            })?;
            subs.get(*i).cloned().ok_or_else(|| {
                QueryError::Internal(format!("substitution index {i} out of bounds"))
            })
        }
        Node::This => {
            // The implicit row identifier: the anonymous output record
            // when the row carries one, otherwise the whole tuple as a
            // record of records.
            if let Some(rec) = env.scope.row.get(crate::value::VALUE_BINDING) {
                return Ok(Value::Record(rec.clone()));
            }
            Ok(Value::Record(
                env.scope
                    .row
                    .iter()
                    .map(|(name, rec)| (name.clone(), Value::Record(rec.clone())))
                    .collect(),
            ))
        }
        Node::Var(name) => env
            .locals
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| QueryError::Internal(format!("unbound lambda variable '{name}'"))),
        Node::GroupRead(slot) => {
            let group = env.scope.group.ok_or_else(|| {
                QueryError::GroupState("aggregate read outside a group context".into())
            })?;
            let group = group.borrow();
            group
                .get(*slot)
                .map(AggState::value)
                .ok_or_else(|| QueryError::GroupState(format!("slot {slot} out of bounds")))
        }
        Node::Member(base, field) => {
            let base = eval_node(base, env)?;
            match base {
                Value::Record(rec) => Ok(rec.get(field).clone()),
                Value::Null => Ok(Value::Null),
                other => Err(QueryError::Eval(format!(
                    "cannot access field '{field}' of {other}"
                ))),
            }
        }
        Node::Index(base, idx) => {
            let base = eval_node(base, env)?;
            let idx = eval_node(idx, env)?;
            match (base, idx) {
                (Value::Sequence(items), Value::Number(n)) => {
                    let i = n as usize;
                    Ok(items.get(i).cloned().unwrap_or(Value::Null))
                }
                (Value::Record(rec), Value::String(field)) => Ok(rec.get(&field).clone()),
                (base, idx) => Err(QueryError::Eval(format!(
                    "cannot index {base} with {idx}"
                ))),
            }
        }
        Node::Call(callee, args) => match callee.as_ref() {
            Node::Lambda(params, body) => {
                if params.len() != args.len() {
                    return Err(QueryError::Eval(format!(
                        "lambda expects {} arguments, got {}",
                        params.len(),
                        args.len()
                    )));
                }
                let mut bound = Vec::with_capacity(params.len());
                for (param, arg) in params.iter().zip(args) {
                    bound.push((param.clone(), eval_node(arg, env)?));
                }
                let depth = env.locals.len();
                env.locals.extend(bound);
                let result = eval_node(body, env);
                env.locals.truncate(depth);
                result
            }
            other => Err(QueryError::Eval(format!("{other} is not callable"))),
        },
        Node::Lambda(..) => Err(QueryError::Eval(
            "lambda value escapes its call position".into(),
        )),
        Node::RecordLit(fields) => {
            let mut rec = Record::new();
            for (name, value) in fields {
                rec.set(name.clone(), eval_node(value, env)?);
            }
            Ok(Value::Record(rec))
        }
        Node::SeqLit(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval_node(item, env)?);
            }
            Ok(Value::Sequence(out))
        }
        Node::Neg(e) => match eval_node(e, env)? {
            Value::Number(n) => Ok(Value::Number(-n)),
            other => Err(QueryError::Eval(format!("cannot negate {other}"))),
        },
        Node::Not(e) => Ok(Value::Bool(!eval_node(e, env)?.is_truthy())),
        Node::Arith(op, l, r) => arith(*op, eval_node(l, env)?, eval_node(r, env)?),
        Node::Compare(op, l, r) | Node::ThreeWay(op, l, r) => {
            let l = eval_node(l, env)?;
            let r = eval_node(r, env)?;
            Ok(Value::Bool(op.matches(l.cmp(&r))))
        }
        Node::CmpCall(l, r) => {
            let l = eval_node(l, env)?;
            let r = eval_node(r, env)?;
            Ok(Value::Number(match l.cmp(&r) {
                std::cmp::Ordering::Less => -1.0,
                std::cmp::Ordering::Equal => 0.0,
                std::cmp::Ordering::Greater => 1.0,
            }))
        }
        Node::StrictEq { negate, lhs, rhs } => {
            let l = eval_node(lhs, env)?;
            let r = eval_node(rhs, env)?;
            Ok(Value::Bool(l.strict_eq(&r) != *negate))
        }
        Node::And(l, r) => {
            let l = eval_node(l, env)?;
            if l.is_truthy() {
                eval_node(r, env)
            } else {
                Ok(l)
            }
        }
        Node::Or(l, r) => {
            let l = eval_node(l, env)?;
            if l.is_truthy() {
                Ok(l)
            } else {
                eval_node(r, env)
            }
        }
        Node::Ternary(c, t, e) => {
            if eval_node(c, env)?.is_truthy() {
                eval_node(t, env)
            } else {
                eval_node(e, env)
            }
        }
    }
}

fn arith(op: ArithOp, l: Value, r: Value) -> QueryResult<Value> {
    // `+` doubles as string concatenation when either side is a string.
    if op == ArithOp::Add {
        if let (Value::String(a), b) = (&l, &r) {
            return Ok(Value::String(format!("{a}{}", display_concat(b))));
        }
        if let (a, Value::String(b)) = (&l, &r) {
            return Ok(Value::String(format!("{}{b}", display_concat(a))));
        }
    }
    let (a, b) = match (&l, &r) {
        (Value::Number(a), Value::Number(b)) => (*a, *b),
        _ => {
            return Err(QueryError::Eval(format!(
                "arithmetic requires numbers, got {l} and {r}"
            )))
        }
    };
    Ok(Value::Number(match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::Mod => a % b,
    }))
}

fn display_concat(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::parser::Parser;

    fn eval_src(src: &str) -> Value {
        let (ast, _) = Parser::parse(src, 0).expect("parse");
        let scope = EvalScope::constant();
        let mut env = Env {
            scope,
            subs: None,
            prebound: scope.row,
            locals: Vec::new(),
        };
        eval_node(&ast, &mut env).expect("eval")
    }

    #[test]
    fn arithmetic_and_precedence() {
        assert_eq!(eval_src("1 + 2 * 3"), Value::from(7));
        assert_eq!(eval_src("(1 + 2) * 3"), Value::from(9));
        assert_eq!(eval_src("7 % 4"), Value::from(3));
    }

    #[test]
    fn string_concatenation() {
        assert_eq!(eval_src("'a' + 'b'"), Value::from("ab"));
        assert_eq!(eval_src("'n=' + 3"), Value::from("n=3"));
    }

    #[test]
    fn short_circuit_keeps_operand_value() {
        assert_eq!(eval_src("null && 1"), Value::Null);
        assert_eq!(eval_src("0 || 'x'"), Value::from("x"));
    }

    #[test]
    fn lambda_application() {
        assert_eq!(eval_src("(x => x + 1)(41)"), Value::from(42));
        assert_eq!(eval_src("((a, b) => a * b)(6, 7)"), Value::from(42));
    }

    #[test]
    fn sequence_and_record_access() {
        assert_eq!(eval_src("[1, 2, 3][1]"), Value::from(2));
        assert_eq!(eval_src("{a: 1}['a']"), Value::from(1));
        assert_eq!(eval_src("[1][9]"), Value::Null);
    }

    #[test]
    fn ternary_branches() {
        assert_eq!(eval_src("1 < 2 ? 'y' : 'n'"), Value::from("y"));
        assert_eq!(eval_src("2 < 1 ? 'y' : 'n'"), Value::from("n"));
    }
}
