use std::hash::{Hash, Hasher};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Values that can be bound as query parameters or read back from a row.
///
/// `Null` doubles as the database-NULL sentinel:
/// ```rust
/// use sql_composer::prelude::*;
///
/// let values = vec![
///     RowValues::Int(1),
///     RowValues::Text("alice".into()),
///     RowValues::Null,
/// ];
/// assert!(values[2].is_null());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum RowValues {
    /// Integer value (64-bit)
    Int(i64),
    /// Floating point value (64-bit)
    Float(f64),
    /// Text/string value
    Text(String),
    /// Boolean value
    Bool(bool),
    /// Timestamp value
    Timestamp(NaiveDateTime),
    /// NULL value
    Null,
    /// JSON value
    JSON(JsonValue),
    /// Binary data
    Blob(Vec<u8>),
}

impl RowValues {
    /// Check if this value is NULL
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_int(&self) -> Option<&i64> {
        if let RowValues::Int(value) = self {
            Some(value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        if let RowValues::Text(value) = self {
            Some(value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<&bool> {
        if let RowValues::Bool(value) = self {
            return Some(value);
        } else if let Some(i) = self.as_int() {
            if *i == 1 {
                return Some(&true);
            } else if *i == 0 {
                return Some(&false);
            }
        }
        None
    }

    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        if let RowValues::Float(value) = self {
            Some(*value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        if let RowValues::Timestamp(value) = self {
            return Some(*value);
        } else if let Some(s) = self.as_text() {
            if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
                return Some(dt);
            }
            if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
                return Some(dt);
            }
        }
        None
    }

    #[must_use]
    pub fn as_blob(&self) -> Option<&[u8]> {
        if let RowValues::Blob(bytes) = self {
            Some(bytes)
        } else {
            None
        }
    }

    /// The type a value would be declared as when no explicit hint is given.
    ///
    /// `Null` carries no type information and yields `None`.
    #[must_use]
    pub fn inferred_type(&self) -> Option<SqlType> {
        match self {
            RowValues::Int(i) if i32::try_from(*i).is_ok() => Some(SqlType::Int),
            RowValues::Int(_) => Some(SqlType::BigInt),
            RowValues::Float(_) => Some(SqlType::Float),
            RowValues::Text(_) => Some(SqlType::NVarChar),
            RowValues::Bool(_) => Some(SqlType::Bit),
            RowValues::Timestamp(_) => Some(SqlType::DateTime),
            RowValues::JSON(_) => Some(SqlType::Json),
            RowValues::Blob(_) => Some(SqlType::VarBinary),
            RowValues::Null => None,
        }
    }
}

// Floats hash by bit pattern and JSON by its serialized form so that equal
// values (per `PartialEq`) land in the same bucket for the common cases.
impl Hash for RowValues {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            RowValues::Int(i) => i.hash(state),
            RowValues::Float(f) => f.to_bits().hash(state),
            RowValues::Text(s) => s.hash(state),
            RowValues::Bool(b) => b.hash(state),
            RowValues::Timestamp(ts) => ts.hash(state),
            RowValues::Null => {}
            RowValues::JSON(v) => v.to_string().hash(state),
            RowValues::Blob(b) => b.hash(state),
        }
    }
}

impl From<i64> for RowValues {
    fn from(value: i64) -> Self {
        RowValues::Int(value)
    }
}

impl From<i32> for RowValues {
    fn from(value: i32) -> Self {
        RowValues::Int(i64::from(value))
    }
}

impl From<f64> for RowValues {
    fn from(value: f64) -> Self {
        RowValues::Float(value)
    }
}

impl From<bool> for RowValues {
    fn from(value: bool) -> Self {
        RowValues::Bool(value)
    }
}

impl From<&str> for RowValues {
    fn from(value: &str) -> Self {
        RowValues::Text(value.to_string())
    }
}

impl From<String> for RowValues {
    fn from(value: String) -> Self {
        RowValues::Text(value)
    }
}

impl From<NaiveDateTime> for RowValues {
    fn from(value: NaiveDateTime) -> Self {
        RowValues::Timestamp(value)
    }
}

impl From<Vec<u8>> for RowValues {
    fn from(value: Vec<u8>) -> Self {
        RowValues::Blob(value)
    }
}

impl<T: Into<RowValues>> From<Option<T>> for RowValues {
    fn from(value: Option<T>) -> Self {
        value.map_or(RowValues::Null, Into::into)
    }
}

/// Explicit database type hint attached to a parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SqlType {
    Int,
    BigInt,
    Float,
    Bit,
    NVarChar,
    DateTime,
    VarBinary,
    Json,
    /// A structured or table-valued type known to the database by name.
    Structured(String),
}

impl SqlType {
    /// The type name used in `DECLARE` statements.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            SqlType::Int => "int",
            SqlType::BigInt => "bigint",
            SqlType::Float => "float",
            SqlType::Bit => "bit",
            SqlType::NVarChar | SqlType::Json => "nvarchar(max)",
            SqlType::DateTime => "datetime2",
            SqlType::VarBinary => "varbinary(max)",
            SqlType::Structured(name) => name,
        }
    }
}

impl std::fmt::Display for SqlType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
