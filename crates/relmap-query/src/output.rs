//! What the terminal walker produces: SQL text, bound parameter sources and
//! the mapping from result columns back to entities and scalars.

use relmap_core::Value;
use serde::{Deserialize, Serialize};

/// Where the value of one positional SQL placeholder comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterSource {
    /// A literal from the query text, or a value fixed by metadata.
    Literal(Value),
    /// `:name` in the query text.
    Named(String),
    /// `?n` in the query text.
    Positional(usize),
}

/// A selected column hydrating an entity field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldResult {
    pub column: String,
    pub field: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityResult {
    /// Alias in the object query.
    pub alias: String,
    pub entity: String,
    pub fields: Vec<FieldResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalarResult {
    pub column: String,
    pub name: String,
}

/// Result column aliases mapped back to the query's entities and scalars.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSetMapping {
    pub entities: Vec<EntityResult>,
    pub scalars: Vec<ScalarResult>,
}

impl ResultSetMapping {
    pub fn entity(&self, alias: &str) -> Option<&EntityResult> {
        self.entities.iter().find(|e| e.alias == alias)
    }

    pub fn scalar(&self, name: &str) -> Option<&ScalarResult> {
        self.scalars.iter().find(|s| s.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.scalars.is_empty()
    }
}

/// Generated SQL with one parameter source per placeholder, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlOutput {
    pub sql: String,
    pub parameters: Vec<ParameterSource>,
    pub result_set_mapping: ResultSetMapping,
}

impl SqlOutput {
    pub fn new(
        sql: impl Into<String>,
        parameters: Vec<ParameterSource>,
        result_set_mapping: ResultSetMapping,
    ) -> Self {
        Self {
            sql: sql.into(),
            parameters,
            result_set_mapping,
        }
    }
}
