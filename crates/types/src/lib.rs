//! Column types and row values used throughout the storage stack.
//!
//! Widths here are load-bearing: `Value::Int` is four bytes because the row
//! codec and the B+-tree key encoder both depend on it being exactly four
//! bytes little-endian, and `Value::Float` is single-precision for the same
//! reason (see `storage::row_codec` and `btree::key`).

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SqlType {
    Int,
    Float,
    Text,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub enum Value {
    Int(i32),
    Float(f32),
    Text(String),
    Null,
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Null, Value::Null) => true,
            _ => false,
        }
    }
}

impl Eq for Value {}

// Hash is defined in terms of bit patterns so NaN payloads that compare
// equal above also hash equal.
impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Int(i) => i.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Text(s) => s.hash(state),
            Value::Null => {}
        }
    }
}

impl Value {
    pub fn sql_type(&self) -> Option<SqlType> {
        match self {
            Value::Int(_) => Some(SqlType::Int),
            Value::Float(_) => Some(SqlType::Float),
            Value::Text(_) => Some(SqlType::Text),
            Value::Null => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn cmp_same_type(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    pub fn eq_same_type(&self, other: &Value) -> Option<bool> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.eq(b)),
            (Value::Float(a), Value::Float(b)) => Some(a.eq(b)),
            (Value::Text(a), Value::Text(b)) => Some(a.eq(b)),
            _ => None,
        }
    }
}
