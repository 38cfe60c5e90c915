//! Field and column descriptors.

use crate::types::SqlType;
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// Referential action for foreign key constraints (ON DELETE / ON UPDATE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReferentialAction {
    /// No action - raise error if any references exist.
    #[default]
    NoAction,
    /// Restrict - same as NO ACTION.
    Restrict,
    /// Cascade - automatically delete/update referencing rows.
    Cascade,
    /// Set null - set referencing columns to NULL.
    SetNull,
    /// Set default - set referencing columns to their default values.
    SetDefault,
}

impl ReferentialAction {
    /// Get the SQL representation of this action.
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            ReferentialAction::NoAction => "NO ACTION",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::SetDefault => "SET DEFAULT",
        }
    }

    /// Parse a referential action from a string (case-insensitive).
    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "NO ACTION" | "NOACTION" | "NO_ACTION" => Some(ReferentialAction::NoAction),
            "RESTRICT" => Some(ReferentialAction::Restrict),
            "CASCADE" => Some(ReferentialAction::Cascade),
            "SET NULL" | "SETNULL" | "SET_NULL" => Some(ReferentialAction::SetNull),
            "SET DEFAULT" | "SETDEFAULT" | "SET_DEFAULT" => Some(ReferentialAction::SetDefault),
            _ => None,
        }
    }
}

/// How two values of a field are compared during change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ComparisonMode {
    /// Values are equal iff they are the same variant with the same payload.
    #[default]
    Strict,
    /// Numeric values are compared by magnitude regardless of width.
    Numeric,
}

/// Metadata about a mapped scalar field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMetadata {
    /// Field name used in entity records and queries
    pub name: String,
    /// Database column name (may differ from field name)
    pub column_name: String,
    /// SQL type for this field
    pub sql_type: SqlType,
    /// Whether this field is nullable
    pub nullable: bool,
    /// Change detection semantics
    pub comparison: ComparisonMode,
}

impl FieldMetadata {
    /// Create a field whose column carries the same name.
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        let name = name.into();
        Self {
            column_name: name.clone(),
            name,
            sql_type,
            nullable: false,
            comparison: ComparisonMode::Strict,
        }
    }

    /// Set the database column name.
    pub fn column(mut self, name: impl Into<String>) -> Self {
        self.column_name = name.into();
        self
    }

    /// Mark the field as nullable.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn comparison(mut self, mode: ComparisonMode) -> Self {
        self.comparison = mode;
        self
    }

    /// Compare two values of this field using its declared semantics.
    pub fn values_equal(&self, a: &Value, b: &Value) -> bool {
        match self.comparison {
            ComparisonMode::Strict => a == b,
            ComparisonMode::Numeric => a.numeric_eq(b),
        }
    }
}
