use std::fmt::Write;

use crate::types::{RowValues, SqlType};

/// Type name used when neither a hint nor the value says anything about the type.
pub const FALLBACK_TYPE_NAME: &str = "nvarchar(max)";

/// Maps runtime values to database type names and SQL literals.
///
/// Consumed when producing `DECLARE` blocks and literal-expanded query text.
pub trait TypeRegistry: Send + Sync {
    /// Database type name for a value, honoring an explicit hint when present.
    fn type_name(&self, value: &RowValues, hint: Option<&SqlType>) -> String;

    /// SQL literal spelling of a value.
    fn literal(&self, value: &RowValues) -> String;
}

/// Registry with SQL Server flavored type names and ANSI literals.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTypeRegistry;

impl TypeRegistry for DefaultTypeRegistry {
    fn type_name(&self, value: &RowValues, hint: Option<&SqlType>) -> String {
        match hint {
            Some(hint) => hint.name().to_string(),
            None => value
                .inferred_type()
                .map_or_else(|| FALLBACK_TYPE_NAME.to_string(), |t| t.name().to_string()),
        }
    }

    fn literal(&self, value: &RowValues) -> String {
        match value {
            RowValues::Int(i) => i.to_string(),
            RowValues::Float(f) => f.to_string(),
            RowValues::Text(s) => quote(s),
            RowValues::Bool(b) => String::from(if *b { "1" } else { "0" }),
            RowValues::Timestamp(ts) => quote(&ts.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
            RowValues::Null => "NULL".to_string(),
            RowValues::JSON(v) => quote(&v.to_string()),
            RowValues::Blob(bytes) => {
                let mut out = String::with_capacity(bytes.len() * 2 + 3);
                out.push_str("X'");
                for b in bytes {
                    let _ = write!(out, "{b:02X}");
                }
                out.push('\'');
                out
            }
        }
    }
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}
