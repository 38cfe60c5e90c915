//! SQL type definitions and mapping.

use crate::value::Value;
use serde::{Deserialize, Serialize};

/// SQL data types a mapped field can declare.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlType {
    // Integer types
    SmallInt,
    Integer,
    BigInt,

    // Floating point
    Real,
    Double,

    // Fixed precision
    Decimal { precision: u8, scale: u8 },

    // Boolean
    Boolean,

    // String types
    VarChar(u32),
    Text,

    // Binary
    Blob,

    // Date/time types
    Date,
    Time,
    Timestamp,
    TimestampTz,

    // UUID
    Uuid,

    // JSON
    Json,

    // Custom type name
    Custom(String),
}

impl SqlType {
    /// Get the SQL type name for this type.
    pub fn sql_name(&self) -> String {
        match self {
            SqlType::SmallInt => "SMALLINT".to_string(),
            SqlType::Integer => "INTEGER".to_string(),
            SqlType::BigInt => "BIGINT".to_string(),
            SqlType::Real => "REAL".to_string(),
            SqlType::Double => "DOUBLE PRECISION".to_string(),
            SqlType::Decimal { precision, scale } => format!("DECIMAL({}, {})", precision, scale),
            SqlType::Boolean => "BOOLEAN".to_string(),
            SqlType::VarChar(len) => format!("VARCHAR({})", len),
            SqlType::Text => "TEXT".to_string(),
            SqlType::Blob => "BLOB".to_string(),
            SqlType::Date => "DATE".to_string(),
            SqlType::Time => "TIME".to_string(),
            SqlType::Timestamp => "TIMESTAMP".to_string(),
            SqlType::TimestampTz => "TIMESTAMPTZ".to_string(),
            SqlType::Uuid => "UUID".to_string(),
            SqlType::Json => "JSON".to_string(),
            SqlType::Custom(name) => name.clone(),
        }
    }

    /// Check if this type is numeric.
    pub const fn is_numeric(&self) -> bool {
        matches!(
            self,
            SqlType::SmallInt
                | SqlType::Integer
                | SqlType::BigInt
                | SqlType::Real
                | SqlType::Double
                | SqlType::Decimal { .. }
        )
    }

    /// Check if this type is text-based.
    pub const fn is_text(&self) -> bool {
        matches!(self, SqlType::VarChar(_) | SqlType::Text)
    }

    /// Whether a value may be stored in a column of this type.
    ///
    /// NULL is accepted everywhere; nullability is checked separately.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) | (SqlType::Custom(_), _) => true,
            (SqlType::SmallInt | SqlType::Integer | SqlType::BigInt, v) => v.as_i64().is_some(),
            (SqlType::Real | SqlType::Double | SqlType::Decimal { .. }, v) => v.as_f64().is_some(),
            (SqlType::Boolean, v) => v.as_bool().is_some(),
            (SqlType::VarChar(_) | SqlType::Text, Value::Text(_)) => true,
            (SqlType::Blob, Value::Bytes(_)) => true,
            (SqlType::Date, Value::Date(_)) => true,
            (SqlType::Time, Value::Time(_)) => true,
            (SqlType::Timestamp | SqlType::TimestampTz, Value::Timestamp(_) | Value::TimestampTz(_)) => {
                true
            }
            (SqlType::Uuid, Value::Uuid(_)) => true,
            (SqlType::Json, _) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_names() {
        assert_eq!(SqlType::VarChar(255).sql_name(), "VARCHAR(255)");
        assert_eq!(
            SqlType::Decimal {
                precision: 10,
                scale: 2
            }
            .sql_name(),
            "DECIMAL(10, 2)"
        );
    }

    #[test]
    fn test_accepts() {
        assert!(SqlType::BigInt.accepts(&Value::Int(3)));
        assert!(SqlType::Text.accepts(&Value::Null));
        assert!(!SqlType::Integer.accepts(&Value::Text("3".into())));
        assert!(SqlType::Double.accepts(&Value::BigInt(3)));
        assert!(SqlType::Custom("citext".into()).accepts(&Value::Bool(true)));
    }
}
