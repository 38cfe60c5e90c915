//! Query components: the resolution context shared along a walker chain.
//!
//! The parser records one [`QueryComponent`] per identification variable
//! (alias). Walkers read them to resolve paths and may annotate the context
//! with hints for later walkers; the AST itself is never modified.

use relmap_core::{EntityMetadata, Error, QuerySyntaxError};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Hint set on the context when the SELECT list should be replaced by a
/// distinct count of the named root alias.
pub const COUNT_HINT: &str = "relmap.count";

/// What one alias resolves to.
#[derive(Debug, Clone)]
pub struct QueryComponent {
    pub metadata: Arc<EntityMetadata>,
    /// Alias this component was joined from; `None` for range declarations.
    pub parent: Option<String>,
    /// Association of the parent that was joined.
    pub association: Option<String>,
    pub fetch: bool,
    pub position: usize,
}

impl QueryComponent {
    pub fn root(metadata: Arc<EntityMetadata>, position: usize) -> Self {
        Self {
            metadata,
            parent: None,
            association: None,
            fetch: false,
            position,
        }
    }

    pub fn joined(
        metadata: Arc<EntityMetadata>,
        parent: impl Into<String>,
        association: impl Into<String>,
        fetch: bool,
        position: usize,
    ) -> Self {
        Self {
            metadata,
            parent: Some(parent.into()),
            association: Some(association.into()),
            fetch,
            position,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// Alias → component map in declaration order, plus walker hints.
#[derive(Debug, Clone, Default)]
pub struct QueryComponents {
    order: Vec<String>,
    components: HashMap<String, QueryComponent>,
    result_variables: Vec<String>,
    hints: BTreeMap<String, String>,
}

impl QueryComponents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an alias. Aliases are unique per query, result variables included.
    pub fn add(&mut self, alias: &str, component: QueryComponent) -> Result<(), Error> {
        if self.is_declared(alias) {
            return Err(QuerySyntaxError::at_token(
                format!("alias '{alias}' is already defined"),
                component.position,
                alias,
            )
            .into());
        }
        self.order.push(alias.to_string());
        self.components.insert(alias.to_string(), component);
        Ok(())
    }

    pub fn add_result_variable(&mut self, name: &str, position: usize) -> Result<(), Error> {
        if self.is_declared(name) {
            return Err(QuerySyntaxError::at_token(
                format!("alias '{name}' is already defined"),
                position,
                name,
            )
            .into());
        }
        self.result_variables.push(name.to_string());
        Ok(())
    }

    fn is_declared(&self, name: &str) -> bool {
        self.components.contains_key(name) || self.is_result_variable(name)
    }

    pub fn is_result_variable(&self, name: &str) -> bool {
        self.result_variables.iter().any(|v| v == name)
    }

    pub fn get(&self, alias: &str) -> Option<&QueryComponent> {
        self.components.get(alias)
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.components.contains_key(alias)
    }

    /// Components in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &QueryComponent)> {
        self.order
            .iter()
            .filter_map(|alias| self.components.get(alias).map(|c| (alias.as_str(), c)))
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn root_aliases(&self) -> impl Iterator<Item = &str> {
        self.iter()
            .filter(|(_, c)| c.is_root())
            .map(|(alias, _)| alias)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn set_hint(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.hints.insert(name.into(), value.into());
    }

    pub fn hint(&self, name: &str) -> Option<&str> {
        self.hints.get(name).map(String::as_str)
    }

    pub fn hints(&self) -> &BTreeMap<String, String> {
        &self.hints
    }
}
