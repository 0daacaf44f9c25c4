//! Tagged cache value

use crate::error::{CacheError, Result};

/// A cached value.
///
/// Scalars keep their integer family so counter arithmetic is a checked
/// branch instead of runtime type inspection; everything else rides along
/// as a raw JSON object and is only serialized at the remote-tier
/// boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    UInt(u64),
    Object(serde_json::Value),
}

impl Value {
    /// Convert an object into a value, keeping the integer family for
    /// plain JSON numbers so counters stay incrementable.
    pub fn from_json(val: serde_json::Value) -> Value {
        if let Some(n) = val.as_i64() {
            Value::Int(n)
        } else if let Some(n) = val.as_u64() {
            Value::UInt(n)
        } else {
            Value::Object(val)
        }
    }

    /// Type-preserving object view, used by `get_object`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::UInt(u) => serde_json::Value::from(*u),
            Value::Object(v) => v.clone(),
        }
    }

    /// Scalar string rendering, used by `get`.
    pub fn render(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Int(i) => i.to_string(),
            Value::UInt(u) => u.to_string(),
            Value::Object(v) => v.to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Str(_) => "a string",
            Value::Int(_) => "a signed integer",
            Value::UInt(_) => "an unsigned integer",
            Value::Object(_) => "an object",
        }
    }

    /// Increment by one. Fails with a `Type` error on non-integer values
    /// and a `Range` error on overflow.
    pub fn incr(&mut self, key: &str) -> Result<()> {
        match self {
            Value::Int(i) => {
                *i = i.checked_add(1).ok_or_else(|| CacheError::Range { key: key.into() })?;
                Ok(())
            }
            Value::UInt(u) => {
                *u = u.checked_add(1).ok_or_else(|| CacheError::Range { key: key.into() })?;
                Ok(())
            }
            other => Err(CacheError::Type {
                key: key.into(),
                found: other.kind(),
            }),
        }
    }

    /// Decrement by one. An unsigned value at zero fails with a `Range`
    /// error rather than wrapping.
    pub fn decr(&mut self, key: &str) -> Result<()> {
        match self {
            Value::Int(i) => {
                *i = i.checked_sub(1).ok_or_else(|| CacheError::Range { key: key.into() })?;
                Ok(())
            }
            Value::UInt(u) => {
                *u = u.checked_sub(1).ok_or_else(|| CacheError::Range { key: key.into() })?;
                Ok(())
            }
            other => Err(CacheError::Type {
                key: key.into(),
                found: other.kind(),
            }),
        }
    }
}
