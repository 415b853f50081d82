use orchestra_proto::{Tuple, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A predicate over the attributes of a tuple, restricting which tuples a trust condition covers.
///
/// Columns are positional. Ordering comparisons between values of different types, or involving nulls,
/// evaluate to false.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TuplePredicate {
    True,
    Eq(usize, Value),
    Ne(usize, Value),
    Lt(usize, Value),
    Le(usize, Value),
    Gt(usize, Value),
    Ge(usize, Value),
    IsNull(usize),
    And(Box<TuplePredicate>, Box<TuplePredicate>),
    Or(Box<TuplePredicate>, Box<TuplePredicate>),
    Not(Box<TuplePredicate>),
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
        (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

impl TuplePredicate {
    pub fn and(self, other: TuplePredicate) -> Self { TuplePredicate::And(Box::new(self), Box::new(other)) }

    pub fn or(self, other: TuplePredicate) -> Self { TuplePredicate::Or(Box::new(self), Box::new(other)) }

    pub fn negate(self) -> Self { TuplePredicate::Not(Box::new(self)) }

    pub fn evaluate(&self, tuple: &Tuple) -> bool {
        let ordered = |column: &usize, value: &Value, accept: fn(Ordering) -> bool| {
            tuple.get(*column).and_then(|attr| compare(attr, value)).map(accept).unwrap_or(false)
        };
        match self {
            TuplePredicate::True => true,
            TuplePredicate::Eq(column, value) => tuple.get(*column) == Some(value),
            TuplePredicate::Ne(column, value) => tuple.get(*column).is_some_and(|attr| attr != value),
            TuplePredicate::Lt(column, value) => ordered(column, value, Ordering::is_lt),
            TuplePredicate::Le(column, value) => ordered(column, value, Ordering::is_le),
            TuplePredicate::Gt(column, value) => ordered(column, value, Ordering::is_gt),
            TuplePredicate::Ge(column, value) => ordered(column, value, Ordering::is_ge),
            TuplePredicate::IsNull(column) => tuple.get(*column).is_some_and(Value::is_null),
            TuplePredicate::And(a, b) => a.evaluate(tuple) && b.evaluate(tuple),
            TuplePredicate::Or(a, b) => a.evaluate(tuple) || b.evaluate(tuple),
            TuplePredicate::Not(a) => !a.evaluate(tuple),
        }
    }
}
