//! Entity metadata and its validating builder.

use super::association::{AssociationKind, AssociationMetadata, JoinColumnMetadata, JoinTableMetadata};
use super::field::FieldMetadata;
use crate::error::{Error, MappingError, MappingErrorKind, Result};
use crate::value::Value;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::OnceLock;

const IDENTIFIER_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]*$";

fn identifier_regex() -> Option<&'static Regex> {
    static REGEX: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    REGEX
        .get_or_init(|| Regex::new(IDENTIFIER_PATTERN))
        .as_ref()
        .ok()
}

/// Whether `name` is usable as an entity, field or column name.
pub fn is_valid_identifier(name: &str) -> bool {
    match identifier_regex() {
        Some(regex) => regex.is_match(name),
        None => {
            tracing::warn!(name = name, "Identifier pattern failed to compile");
            false
        }
    }
}

/// How identifier values come into existence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdGenerator {
    /// Generated by storage on insert.
    #[default]
    Auto,
    /// Supplied by the application before persisting.
    Assigned,
}

/// Single-table inheritance discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscriminatorMetadata {
    /// Column holding the discriminator
    pub column: String,
    /// Value identifying this entity type
    pub value: String,
    /// Root entity of the hierarchy
    pub root_entity: String,
    /// Values of this type and all of its subtypes
    pub family_values: Vec<String>,
}

impl DiscriminatorMetadata {
    pub fn new(
        column: impl Into<String>,
        value: impl Into<String>,
        root_entity: impl Into<String>,
    ) -> Self {
        let value = value.into();
        Self {
            column: column.into(),
            family_values: vec![value.clone()],
            value,
            root_entity: root_entity.into(),
        }
    }

    /// Add the discriminator value of a subtype.
    pub fn subtype_value(mut self, value: impl Into<String>) -> Self {
        let value = value.into();
        if !self.family_values.contains(&value) {
            self.family_values.push(value);
        }
        self
    }
}

/// Everything known about how one entity type maps to a table.
///
/// Immutable once built and shared by `Arc` across all entities of the type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMetadata {
    name: String,
    table: String,
    schema: Option<String>,
    identifier: Vec<String>,
    id_generator: IdGenerator,
    fields: Vec<FieldMetadata>,
    associations: Vec<AssociationMetadata>,
    discriminator: Option<DiscriminatorMetadata>,
}

impl EntityMetadata {
    pub fn builder(name: impl Into<String>) -> EntityMetadataBuilder {
        EntityMetadataBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Identifier field names, in declaration order.
    pub fn identifier(&self) -> &[String] {
        &self.identifier
    }

    pub fn is_identifier(&self, field: &str) -> bool {
        self.identifier.iter().any(|f| f == field)
    }

    /// Identifier column names, in identifier order.
    pub fn identifier_columns(&self) -> Vec<&str> {
        self.identifier
            .iter()
            .filter_map(|f| self.field(f))
            .map(|f| f.column_name.as_str())
            .collect()
    }

    pub fn id_generator(&self) -> IdGenerator {
        self.id_generator
    }

    pub fn fields(&self) -> &[FieldMetadata] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldMetadata> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Look up a field, failing with a mapping error.
    pub fn require_field(&self, name: &str) -> Result<&FieldMetadata> {
        self.field(name)
            .ok_or_else(|| Error::unknown_field(&self.name, name))
    }

    pub fn field_for_column(&self, column: &str) -> Option<&FieldMetadata> {
        self.fields.iter().find(|f| f.column_name == column)
    }

    pub fn associations(&self) -> &[AssociationMetadata] {
        &self.associations
    }

    pub fn association(&self, name: &str) -> Option<&AssociationMetadata> {
        self.associations.iter().find(|a| a.name == name)
    }

    pub fn require_association(&self, name: &str) -> Result<&AssociationMetadata> {
        self.association(name)
            .ok_or_else(|| Error::unknown_field(&self.name, name))
    }

    /// Owning to-one associations, whose foreign keys live in this table.
    pub fn owning_to_one(&self) -> impl Iterator<Item = &AssociationMetadata> {
        self.associations.iter().filter(|a| a.has_join_columns())
    }

    pub fn discriminator(&self) -> Option<&DiscriminatorMetadata> {
        self.discriminator.as_ref()
    }

    /// Build an identifier from per-field values, if every part is non-null.
    pub fn identifier_from<'a>(
        &self,
        mut lookup: impl FnMut(&str) -> Option<&'a Value>,
    ) -> Option<Vec<Value>> {
        let mut values = Vec::with_capacity(self.identifier.len());
        for field in &self.identifier {
            match lookup(field) {
                Some(v) if !v.is_null() => values.push(v.clone()),
                _ => return None,
            }
        }
        Some(values)
    }
}

/// Builds and validates an [`EntityMetadata`].
#[derive(Debug, Clone)]
pub struct EntityMetadataBuilder {
    name: String,
    table: Option<String>,
    schema: Option<String>,
    identifier: Vec<String>,
    id_generator: IdGenerator,
    fields: Vec<FieldMetadata>,
    associations: Vec<AssociationMetadata>,
    discriminator: Option<DiscriminatorMetadata>,
}

impl EntityMetadataBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: None,
            schema: None,
            identifier: Vec::new(),
            id_generator: IdGenerator::Auto,
            fields: Vec::new(),
            associations: Vec::new(),
            discriminator: None,
        }
    }

    /// Table name; defaults to the entity name.
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Add an identifier field.
    pub fn id(mut self, field: FieldMetadata) -> Self {
        self.identifier.push(field.name.clone());
        self.fields.push(field);
        self
    }

    pub fn field(mut self, field: FieldMetadata) -> Self {
        self.fields.push(field);
        self
    }

    pub fn association(mut self, association: AssociationMetadata) -> Self {
        self.associations.push(association);
        self
    }

    pub fn id_generator(mut self, generator: IdGenerator) -> Self {
        self.id_generator = generator;
        self
    }

    pub fn discriminator(mut self, discriminator: DiscriminatorMetadata) -> Self {
        self.discriminator = Some(discriminator);
        self
    }

    fn mapping_error(&self, kind: MappingErrorKind, message: String) -> Error {
        MappingError::new(kind, &self.name, message).into()
    }

    /// Validate the mapping, fill in default join columns and join tables,
    /// and freeze the result.
    pub fn build(mut self) -> Result<EntityMetadata> {
        if !is_valid_identifier(&self.name) {
            return Err(self.mapping_error(
                MappingErrorKind::InvalidIdentifier,
                format!("'{}' is not a valid entity name", self.name),
            ));
        }
        let table = self.table.clone().unwrap_or_else(|| self.name.clone());
        if !is_valid_identifier(&table) {
            return Err(self.mapping_error(
                MappingErrorKind::InvalidIdentifier,
                format!("'{}' is not a valid table name", table),
            ));
        }
        if self.identifier.is_empty() {
            return Err(self.mapping_error(
                MappingErrorKind::MissingIdentifier,
                format!("entity '{}' declares no identifier", self.name),
            ));
        }

        let mut names = HashSet::new();
        let mut columns = HashSet::new();
        for field in &self.fields {
            if !is_valid_identifier(&field.name) || !is_valid_identifier(&field.column_name) {
                return Err(self.mapping_error(
                    MappingErrorKind::InvalidIdentifier,
                    format!("'{}' is not a valid field or column name", field.name),
                ));
            }
            if !names.insert(field.name.clone()) {
                return Err(self.mapping_error(
                    MappingErrorKind::DuplicateField,
                    format!("field '{}' is declared twice on '{}'", field.name, self.name),
                ));
            }
            if !columns.insert(field.column_name.clone()) {
                return Err(self.mapping_error(
                    MappingErrorKind::DuplicateField,
                    format!(
                        "column '{}' is mapped twice on '{}'",
                        field.column_name, self.name
                    ),
                ));
            }
        }
        for id in &self.identifier {
            if self.fields.iter().any(|f| &f.name == id && f.nullable) {
                return Err(self.mapping_error(
                    MappingErrorKind::Invalid,
                    format!("identifier field '{}' cannot be nullable", id),
                ));
            }
        }

        let entity_snake = snake_case(&self.name);
        let id_count = self.identifier.len();
        let mut associations = std::mem::take(&mut self.associations);
        for assoc in &mut associations {
            if !is_valid_identifier(&assoc.name) {
                return Err(self.mapping_error(
                    MappingErrorKind::InvalidIdentifier,
                    format!("'{}' is not a valid association name", assoc.name),
                ));
            }
            if !names.insert(assoc.name.clone()) {
                return Err(self.mapping_error(
                    MappingErrorKind::DuplicateField,
                    format!("'{}' is declared twice on '{}'", assoc.name, self.name),
                ));
            }
            match assoc.kind {
                AssociationKind::OneToMany if assoc.mapped_by.is_none() => {
                    return Err(self.mapping_error(
                        MappingErrorKind::Invalid,
                        format!("one-to-many '{}' requires mapped_by", assoc.name),
                    ));
                }
                AssociationKind::OneToOne | AssociationKind::ManyToOne
                    if assoc.is_owning_side() =>
                {
                    if assoc.join_columns.is_empty() {
                        assoc.join_columns.push(JoinColumnMetadata::new(
                            format!("{}_id", snake_case(&assoc.name)),
                            "id",
                        ));
                    }
                    for column in &assoc.join_columns {
                        if !columns.insert(column.name.clone()) {
                            return Err(self.mapping_error(
                                MappingErrorKind::DuplicateField,
                                format!(
                                    "join column '{}' of '{}' collides with another column",
                                    column.name, assoc.name
                                ),
                            ));
                        }
                    }
                }
                AssociationKind::ManyToMany if assoc.is_owning_side() => {
                    let target_snake = snake_case(&assoc.target_entity);
                    let join_table = assoc.join_table.get_or_insert_with(|| {
                        JoinTableMetadata::new(format!("{}_{}", entity_snake, target_snake))
                    });
                    if join_table.join_columns().is_empty() {
                        for id in &self.identifier {
                            join_table.add_join_column(JoinColumnMetadata::new(
                                format!("{}_{}", entity_snake, snake_case(id)),
                                self.fields
                                    .iter()
                                    .find(|f| &f.name == id)
                                    .map_or_else(|| id.clone(), |f| f.column_name.clone()),
                            ));
                        }
                    }
                    if join_table.inverse_join_columns().is_empty() {
                        join_table.add_inverse_join_column(JoinColumnMetadata::new(
                            format!("{}_id", target_snake),
                            "id",
                        ));
                    }
                    join_table.validate_join_columns(&self.name, id_count)?;
                }
                _ => {}
            }
        }

        if let Some(discriminator) = &self.discriminator {
            if !is_valid_identifier(&discriminator.column) {
                return Err(self.mapping_error(
                    MappingErrorKind::InvalidIdentifier,
                    format!(
                        "'{}' is not a valid discriminator column",
                        discriminator.column
                    ),
                ));
            }
            if columns.contains(&discriminator.column) {
                return Err(self.mapping_error(
                    MappingErrorKind::DuplicateField,
                    format!(
                        "discriminator column '{}' is also mapped as a field",
                        discriminator.column
                    ),
                ));
            }
        }

        tracing::trace!(
            entity = %self.name,
            table = %table,
            fields = self.fields.len(),
            associations = associations.len(),
            "Built entity metadata"
        );

        Ok(EntityMetadata {
            name: self.name,
            table,
            schema: self.schema,
            identifier: self.identifier,
            id_generator: self.id_generator,
            fields: self.fields,
            associations,
            discriminator: self.discriminator,
        })
    }
}

/// `OrderLine` -> `order_line`
pub(crate) fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 && !out.ends_with('_') {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}
