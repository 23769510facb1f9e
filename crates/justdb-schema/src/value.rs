//! Scalar values stored in records and used as field defaults.

use crate::{FieldType, ScalarType};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::fmt;
use std::str::FromStr;

/// A single field value.
///
/// Values are totally ordered so they can key ordered record maps; the order
/// between variants of different types is arbitrary but stable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Value {
    /// SQL-style NULL.
    #[default]
    Null,
    Boolean(bool),
    Integer(i64),
    Decimal(Decimal),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The scalar type of this value, `None` for `Null`.
    pub fn scalar_type(&self) -> Option<ScalarType> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(ScalarType::Boolean),
            Value::Integer(_) => Some(ScalarType::Integer),
            Value::Decimal(_) => Some(ScalarType::Decimal),
            Value::Text(_) => Some(ScalarType::Text),
            Value::Timestamp(_) => Some(ScalarType::Timestamp),
        }
    }

    /// Whether this value may be stored in a field of the given type.
    pub fn conforms_to(&self, ty: &FieldType) -> bool {
        match self.scalar_type() {
            None => ty.nullable,
            Some(scalar) => scalar == ty.scalar,
        }
    }

    /// Convert this value to another scalar type, as a driver does when a
    /// field's type is altered. Returns `None` when the value cannot be
    /// represented in the target type.
    pub fn coerce_to(&self, target: ScalarType) -> Option<Value> {
        if self.scalar_type() == Some(target) || self.is_null() {
            return Some(self.clone());
        }
        match (self, target) {
            (Value::Integer(i), ScalarType::Decimal) => Some(Value::Decimal(Decimal::from(*i))),
            (Value::Integer(i), ScalarType::Text) => Some(Value::Text(i.to_string())),
            (Value::Integer(i), ScalarType::Boolean) => Some(Value::Boolean(*i != 0)),
            (Value::Decimal(d), ScalarType::Text) => Some(Value::Text(d.to_string())),
            (Value::Decimal(d), ScalarType::Integer) if d.fract().is_zero() => {
                d.to_i64().map(Value::Integer)
            }
            (Value::Boolean(b), ScalarType::Integer) => Some(Value::Integer(i64::from(*b))),
            (Value::Boolean(b), ScalarType::Text) => Some(Value::Text(b.to_string())),
            (Value::Timestamp(t), ScalarType::Text) => Some(Value::Text(t.to_rfc3339())),
            (Value::Text(s), ScalarType::Integer) => s.trim().parse().ok().map(Value::Integer),
            (Value::Text(s), ScalarType::Decimal) => {
                Decimal::from_str(s.trim()).ok().map(Value::Decimal)
            }
            (Value::Text(s), ScalarType::Boolean) => s.trim().parse().ok().map(Value::Boolean),
            (Value::Text(s), ScalarType::Timestamp) => DateTime::parse_from_rfc3339(s.trim())
                .ok()
                .map(|t| Value::Timestamp(t.with_timezone(&Utc))),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::Text(s) => write!(f, "{:?}", s),
            Value::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Value::Decimal(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}
