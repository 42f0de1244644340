//! Aggregate functions and per-group state.
//!
//! The compiler rewrites each aggregate call into an initializer bound to a
//! group-state slot plus a read of that slot. Evaluating the enclosing
//! expression first folds the current row into every slot, then reads the
//! slot values, so after the last row of a group the reads yield the
//! finished aggregates. Null inputs are excluded from every fold.

use crate::error::{QueryError, QueryResult};
use crate::expr::ast::Node;
use crate::value::Value;
use std::fmt;

/// The tagged aggregate functions of the standard scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    Avg,
    Count,
    Max,
    Min,
    Sum,
}

impl AggFunc {
    pub fn from_name(name: &str) -> Option<AggFunc> {
        match name {
            "avg" => Some(AggFunc::Avg),
            "count" => Some(AggFunc::Count),
            "max" => Some(AggFunc::Max),
            "min" => Some(AggFunc::Min),
            "sum" => Some(AggFunc::Sum),
            _ => None,
        }
    }

    pub fn fresh_state(self) -> AggState {
        match self {
            AggFunc::Avg => AggState::Avg { sum: 0.0, count: 0 },
            AggFunc::Count => AggState::Count(0),
            AggFunc::Max => AggState::Max(None),
            AggFunc::Min => AggState::Min(None),
            AggFunc::Sum => AggState::Sum(None),
        }
    }
}

impl fmt::Display for AggFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AggFunc::Avg => "avg",
            AggFunc::Count => "count",
            AggFunc::Max => "max",
            AggFunc::Min => "min",
            AggFunc::Sum => "sum",
        };
        write!(f, "{s}")
    }
}

/// One aggregate call site: fold `args` into group slot `slot`.
#[derive(Debug, Clone)]
pub struct AggInit {
    pub slot: usize,
    pub func: AggFunc,
    pub args: Vec<Node>,
}

/// Accumulated state of one aggregate slot.
#[derive(Debug, Clone)]
pub enum AggState {
    Count(u64),
    Sum(Option<f64>),
    Avg { sum: f64, count: u64 },
    Min(Option<Value>),
    Max(Option<Value>),
}

impl AggState {
    /// Fold one input into the state. `input` is `None` for zero-argument
    /// `count()`.
    pub fn update(&mut self, input: Option<&Value>) -> QueryResult<()> {
        match self {
            AggState::Count(n) => {
                // count() counts rows; count(x) counts non-null values.
                match input {
                    Some(v) if v.is_null() => {}
                    _ => *n += 1,
                }
            }
            AggState::Sum(acc) => {
                if let Some(v) = input {
                    if !v.is_null() {
                        let n = numeric(v)?;
                        *acc = Some(acc.unwrap_or(0.0) + n);
                    }
                }
            }
            AggState::Avg { sum, count } => {
                if let Some(v) = input {
                    if !v.is_null() {
                        *sum += numeric(v)?;
                        *count += 1;
                    }
                }
            }
            AggState::Min(acc) => {
                if let Some(v) = input {
                    if !v.is_null() && acc.as_ref().is_none_or(|cur| v < cur) {
                        *acc = Some(v.clone());
                    }
                }
            }
            AggState::Max(acc) => {
                if let Some(v) = input {
                    if !v.is_null() && acc.as_ref().is_none_or(|cur| v > cur) {
                        *acc = Some(v.clone());
                    }
                }
            }
        }
        Ok(())
    }

    /// Current value of the slot.
    pub fn value(&self) -> Value {
        match self {
            AggState::Count(n) => Value::Number(*n as f64),
            AggState::Sum(acc) => acc.map_or(Value::Null, Value::Number),
            AggState::Avg { sum, count } => {
                if *count == 0 {
                    Value::Null
                } else {
                    Value::Number(sum / *count as f64)
                }
            }
            AggState::Min(acc) | AggState::Max(acc) => {
                acc.clone().unwrap_or(Value::Null)
            }
        }
    }
}

fn numeric(v: &Value) -> QueryResult<f64> {
    match v {
        Value::Number(n) => Ok(*n),
        Value::Timestamp(t) => Ok(*t as f64),
        other => Err(QueryError::Eval(format!(
            "aggregate input must be numeric, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_excludes_nulls() {
        let mut state = AggFunc::Sum.fresh_state();
        for v in [Value::Null, Value::from(1), Value::from(2), Value::Null] {
            state.update(Some(&v)).expect("update");
        }
        assert_eq!(state.value(), Value::from(3));
    }

    #[test]
    fn sum_of_nothing_is_null() {
        let mut state = AggFunc::Sum.fresh_state();
        state.update(Some(&Value::Null)).expect("update");
        assert_eq!(state.value(), Value::Null);
    }

    #[test]
    fn count_without_args_counts_rows() {
        let mut state = AggFunc::Count.fresh_state();
        state.update(None).expect("update");
        state.update(None).expect("update");
        assert_eq!(state.value(), Value::from(2));
    }

    #[test]
    fn min_max_use_total_order() {
        let mut min = AggFunc::Min.fresh_state();
        let mut max = AggFunc::Max.fresh_state();
        for v in [Value::from(3), Value::from("a"), Value::from(1)] {
            min.update(Some(&v)).expect("update");
            max.update(Some(&v)).expect("update");
        }
        // number < string in the cross-type order
        assert_eq!(min.value(), Value::from(1));
        assert_eq!(max.value(), Value::from("a"));
    }

    #[test]
    fn avg_divides_by_non_null_count() {
        let mut state = AggFunc::Avg.fresh_state();
        for v in [Value::from(2), Value::Null, Value::from(4)] {
            state.update(Some(&v)).expect("update");
        }
        assert_eq!(state.value(), Value::from(3));
    }
}
