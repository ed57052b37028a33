//! The polymorphic scalar crossing the storage boundary.

use crate::error::{Error, Result};
use crate::types::LogicalType;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A single scalar value.
///
/// Variants mirror the physical column layouts; nested values are used for
/// fixed arrays and structs. Equality is structural; ordering across values
/// of the same type is total (floats via `total_cmp`, NULL sorts first).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Null
    Null,
    /// Boolean
    Bool(bool),
    /// 8-bit signed integer
    Int8(i8),
    /// 16-bit signed integer
    Int16(i16),
    /// 32-bit signed integer
    Int32(i32),
    /// 64-bit signed integer
    Int64(i64),
    /// 8-bit unsigned integer
    UInt8(u8),
    /// 16-bit unsigned integer
    UInt16(u16),
    /// 32-bit unsigned integer
    UInt32(u32),
    /// 64-bit unsigned integer
    UInt64(u64),
    /// 32-bit float
    Float(f32),
    /// 64-bit float
    Double(f64),
    /// UTF-8 string
    String(String),
    /// Fixed-size array
    FixedArray(Vec<Value>),
    /// Struct of named fields
    Struct(Vec<(String, Value)>),
}

impl Value {
    /// Whether this is `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Signed-integer view, widening every integer variant.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int8(v) => Some(*v as i64),
            Value::Int16(v) => Some(*v as i64),
            Value::Int32(v) => Some(*v as i64),
            Value::Int64(v) => Some(*v),
            Value::UInt8(v) => Some(*v as i64),
            Value::UInt16(v) => Some(*v as i64),
            Value::UInt32(v) => Some(*v as i64),
            Value::UInt64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Floating-point view, widening integers as well.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            other => other.as_i64().map(|v| v as f64),
        }
    }

    /// Boolean view.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// String view.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Struct field access by name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Struct(fields) => fields.iter().find(|(n, _)| n == name).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Array element access by position.
    pub fn element(&self, index: usize) -> Option<&Value> {
        match self {
            Value::FixedArray(items) => items.get(index),
            _ => None,
        }
    }

    /// Short name of the value's own type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::Int8(_) => "TINYINT",
            Value::Int16(_) => "SMALLINT",
            Value::Int32(_) => "INTEGER",
            Value::Int64(_) => "BIGINT",
            Value::UInt8(_) => "UTINYINT",
            Value::UInt16(_) => "USMALLINT",
            Value::UInt32(_) => "UINTEGER",
            Value::UInt64(_) => "UBIGINT",
            Value::Float(_) => "FLOAT",
            Value::Double(_) => "DOUBLE",
            Value::String(_) => "STRING",
            Value::FixedArray(_) => "ARRAY",
            Value::Struct(_) => "STRUCT",
        }
    }

    /// Coerce into the declared column type, widening integers and
    /// accepting integer literals for float columns. NULL passes through
    /// unchanged; constraint checks happen at the table boundary.
    pub fn coerce(self, ty: &LogicalType) -> Result<Value> {
        if self.is_null() {
            return Ok(Value::Null);
        }
        let mismatch = |value: &Value| Error::TypeMismatch {
            expected: ty.to_string(),
            got: value.type_name().to_string(),
        };
        match ty {
            LogicalType::Boolean => match self {
                v @ Value::Bool(_) => Ok(v),
                v => Err(mismatch(&v)),
            },
            LogicalType::TinyInt => match self.as_i64() {
                Some(v) => i8::try_from(v).map(Value::Int8).map_err(|_| mismatch(&self)),
                None => Err(mismatch(&self)),
            },
            LogicalType::SmallInt => match self.as_i64() {
                Some(v) => i16::try_from(v).map(Value::Int16).map_err(|_| mismatch(&self)),
                None => Err(mismatch(&self)),
            },
            LogicalType::Integer => match self.as_i64() {
                Some(v) => i32::try_from(v).map(Value::Int32).map_err(|_| mismatch(&self)),
                None => Err(mismatch(&self)),
            },
            LogicalType::BigInt => self.as_i64().map(Value::Int64).ok_or_else(|| mismatch(&self)),
            LogicalType::UTinyInt => match self.as_i64() {
                Some(v) => u8::try_from(v).map(Value::UInt8).map_err(|_| mismatch(&self)),
                None => Err(mismatch(&self)),
            },
            LogicalType::USmallInt => match self.as_i64() {
                Some(v) => u16::try_from(v).map(Value::UInt16).map_err(|_| mismatch(&self)),
                None => Err(mismatch(&self)),
            },
            LogicalType::UInteger => match self.as_i64() {
                Some(v) => u32::try_from(v).map(Value::UInt32).map_err(|_| mismatch(&self)),
                None => Err(mismatch(&self)),
            },
            LogicalType::UBigInt => match self {
                Value::UInt64(v) => Ok(Value::UInt64(v)),
                other => match other.as_i64() {
                    Some(v) => u64::try_from(v).map(Value::UInt64).map_err(|_| mismatch(&other)),
                    None => Err(mismatch(&other)),
                },
            },
            LogicalType::Float => self
                .as_f64()
                .map(|v| Value::Float(v as f32))
                .ok_or_else(|| mismatch(&self)),
            LogicalType::Double => self.as_f64().map(Value::Double).ok_or_else(|| mismatch(&self)),
            LogicalType::String => match self {
                v @ Value::String(_) => Ok(v),
                v => Err(mismatch(&v)),
            },
            LogicalType::FixedArray(elem, len) => match self {
                Value::FixedArray(items) if items.len() == *len => {
                    let coerced: Result<Vec<Value>> =
                        items.into_iter().map(|v| v.coerce(elem)).collect();
                    Ok(Value::FixedArray(coerced?))
                }
                v => Err(mismatch(&v)),
            },
            LogicalType::Struct(fields) => match self {
                Value::Struct(values) if values.len() == fields.len() => {
                    let mut out = Vec::with_capacity(values.len());
                    for ((name, field_ty), (_, value)) in fields.iter().zip(values) {
                        out.push((name.clone(), value.coerce(field_ty)?));
                    }
                    Ok(Value::Struct(out))
                }
                v => Err(mismatch(&v)),
            },
            LogicalType::Enum(labels) => match self {
                Value::String(s) if labels.iter().any(|l| l == &s) => Ok(Value::String(s)),
                v => Err(mismatch(&v)),
            },
        }
    }

    /// Total order across values. NULL sorts before everything; values of
    /// different families compare by a fixed type rank so sorting mixed
    /// columns never panics.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        fn rank(v: &Value) -> u8 {
            match v {
                Value::Null => 0,
                Value::Bool(_) => 1,
                Value::Int8(_)
                | Value::Int16(_)
                | Value::Int32(_)
                | Value::Int64(_)
                | Value::UInt8(_)
                | Value::UInt16(_)
                | Value::UInt32(_)
                | Value::UInt64(_)
                | Value::Float(_)
                | Value::Double(_) => 2,
                Value::String(_) => 3,
                Value::FixedArray(_) => 4,
                Value::Struct(_) => 5,
            }
        }
        let (ra, rb) = (rank(self), rank(other));
        if ra != rb {
            return ra.cmp(&rb);
        }
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::FixedArray(a), Value::FixedArray(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.sort_cmp(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Struct(a), Value::Struct(b)) => {
                for ((_, x), (_, y)) in a.iter().zip(b.iter()) {
                    let ord = x.sort_cmp(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            // Numeric family: prefer exact integer comparison when both
            // sides are integral, else compare as doubles.
            (a, b) => match (a.as_i64(), b.as_i64()) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => {
                    let x = a.as_f64().unwrap_or(f64::NAN);
                    let y = b.as_f64().unwrap_or(f64::NAN);
                    x.total_cmp(&y)
                }
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int8(v) => write!(f, "{}", v),
            Value::Int16(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::UInt8(v) => write!(f, "{}", v),
            Value::UInt16(v) => write!(f, "{}", v),
            Value::UInt32(v) => write!(f, "{}", v),
            Value::UInt64(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::String(v) => write!(f, "'{}'", v),
            Value::FixedArray(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Struct(fields) => {
                write!(f, "{{")?;
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", name, value)?;
                }
                write!(f, "}}")
            }
        }
    }
}
