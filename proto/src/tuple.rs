use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of a relation in the shared schema
#[derive(PartialEq, Eq, Hash, Clone, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RelationId(String);

impl RelationId {
    pub fn new(name: impl Into<String>) -> Self { RelationId(name.into()) }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Debug for RelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

impl fmt::Display for RelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

impl From<&str> for RelationId {
    fn from(name: &str) -> Self { RelationId(name.to_owned()) }
}

/// A single attribute value.
///
/// `Labeled` is a labeled null: it is only equal to a labeled null carrying the same label, and never to
/// a plain `Null`.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Ord, PartialOrd, Serialize, Deserialize)]
pub enum Value {
    Null,
    Labeled(i32),
    Bool(bool),
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool { matches!(self, Value::Null | Value::Labeled(_)) }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Labeled(label) => write!(f, "NULL#{}", label),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Text(s) => write!(f, "{:?}", s),
            Value::Bytes(b) => write!(f, "<{}b>", b.len()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self { Value::Int(v) }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self { Value::Int(v as i64) }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self { Value::Text(v.to_owned()) }
}

impl From<String> for Value {
    fn from(v: String) -> Self { Value::Text(v) }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self { Value::Bool(v) }
}

/// An ordered sequence of attribute values belonging to one relation.
///
/// The first `key_arity` attributes form the key subtuple, which stands in for the whole tuple wherever
/// keys are compared or hashed. Two tuples are equal only when they belong to the same relation, have the
/// same key arity and all attributes are equal.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Tuple {
    relation: RelationId,
    key_arity: u16,
    values: Vec<Value>,
}

impl Tuple {
    pub fn new(relation: impl Into<RelationId>, key_arity: u16, values: Vec<Value>) -> Self {
        debug_assert!(key_arity as usize <= values.len(), "key arity exceeds tuple width");
        Self { relation: relation.into(), key_arity, values }
    }

    pub fn relation(&self) -> &RelationId { &self.relation }

    pub fn key_arity(&self) -> u16 { self.key_arity }

    pub fn values(&self) -> &[Value] { &self.values }

    pub fn get(&self, column: usize) -> Option<&Value> { self.values.get(column) }

    pub fn len(&self) -> usize { self.values.len() }

    pub fn is_empty(&self) -> bool { self.values.is_empty() }

    /// The primary-key projection of this tuple
    pub fn key(&self) -> Key {
        let arity = (self.key_arity as usize).min(self.values.len());
        Key { relation: self.relation.clone(), values: self.values[..arity].to_vec() }
    }

    pub fn same_key(&self, other: &Tuple) -> bool {
        self.relation == other.relation && self.key_arity == other.key_arity && {
            let arity = self.key_arity as usize;
            self.values.get(..arity) == other.values.get(..arity)
        }
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.relation)?;
        for (i, value) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            if i == self.key_arity as usize {
                write!(f, " ")?;
            }
            write!(f, "{}", value)?;
        }
        write!(f, ")")
    }
}

impl From<&Tuple> for Key {
    fn from(tuple: &Tuple) -> Self { tuple.key() }
}

/// Key subtuple of a tuple, qualified by its relation
#[derive(Debug, PartialEq, Eq, Hash, Clone, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Key {
    pub relation: RelationId,
    pub values: Vec<Value>,
}

impl Key {
    pub fn new(relation: impl Into<RelationId>, values: Vec<Value>) -> Self { Self { relation: relation.into(), values } }

    /// Self-delimiting byte form, suitable as a storage key prefix
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> { bincode::serialize(self) }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.relation, self.values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(","))
    }
}

/// Build a tuple from a relation name, key arity and a list of values
#[macro_export]
macro_rules! tuple {
    ($relation:expr, $arity:expr; $($value:expr),* $(,)?) => {
        $crate::Tuple::new($relation, $arity, vec![$($crate::Value::from($value)),*])
    };
}
