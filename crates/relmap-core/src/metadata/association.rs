//! Association metadata: to-one references, collections and join tables.

use super::field::ReferentialAction;
use crate::error::{MappingError, MappingErrorKind, Result};
use serde::{Deserialize, Serialize};

/// The type of association between two entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssociationKind {
    /// One-to-one: `User` has one `Profile`.
    OneToOne,
    /// Many-to-one: many `Order`s belong to one `Customer`.
    ManyToOne,
    /// One-to-many: one `Customer` has many `Order`s.
    OneToMany,
    /// Many-to-many: `User`s have many `Group`s via a join table.
    ManyToMany,
}

impl AssociationKind {
    pub const fn is_to_one(self) -> bool {
        matches!(self, AssociationKind::OneToOne | AssociationKind::ManyToOne)
    }

    pub const fn is_to_many(self) -> bool {
        !self.is_to_one()
    }
}

/// When associated entities are loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchMode {
    /// Load on first access.
    #[default]
    Lazy,
    /// Load together with the owning entity.
    Eager,
    /// Load collection members one at a time, never the whole collection.
    ExtraLazy,
}

/// Lifecycle operations propagated across an association.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeSet {
    pub persist: bool,
    pub remove: bool,
    pub detach: bool,
}

impl CascadeSet {
    pub const NONE: CascadeSet = CascadeSet {
        persist: false,
        remove: false,
        detach: false,
    };

    pub const ALL: CascadeSet = CascadeSet {
        persist: true,
        remove: true,
        detach: true,
    };

    pub const fn persist() -> Self {
        CascadeSet {
            persist: true,
            ..Self::NONE
        }
    }

    pub const fn remove() -> Self {
        CascadeSet {
            remove: true,
            ..Self::NONE
        }
    }

    pub const fn with_persist(mut self) -> Self {
        self.persist = true;
        self
    }

    pub const fn with_remove(mut self) -> Self {
        self.remove = true;
        self
    }

    pub const fn with_detach(mut self) -> Self {
        self.detach = true;
        self
    }

    pub const fn is_empty(&self) -> bool {
        !(self.persist || self.remove || self.detach)
    }
}

/// A foreign key column on the owning side of an association.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinColumnMetadata {
    /// Column holding the foreign key
    pub name: String,
    /// Identifier column on the referenced entity
    pub referenced_column_name: String,
    pub nullable: bool,
    pub on_delete: Option<ReferentialAction>,
}

impl JoinColumnMetadata {
    /// A nullable join column referencing `referenced_column_name`.
    pub fn new(name: impl Into<String>, referenced_column_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            referenced_column_name: referenced_column_name.into(),
            nullable: true,
            on_delete: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn on_delete(mut self, action: ReferentialAction) -> Self {
        self.on_delete = Some(action);
        self
    }
}

/// The link table of an owning many-to-many association.
///
/// Join columns reference the owning entity's identifier columns, inverse join
/// columns reference the target's. Each list must be as long as the
/// corresponding identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinTableMetadata {
    pub name: String,
    pub schema: Option<String>,
    join_columns: Vec<JoinColumnMetadata>,
    inverse_join_columns: Vec<JoinColumnMetadata>,
}

impl JoinTableMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: None,
            join_columns: Vec::new(),
            inverse_join_columns: Vec::new(),
        }
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn join_column(mut self, column: JoinColumnMetadata) -> Self {
        self.add_join_column(column);
        self
    }

    pub fn inverse_join_column(mut self, column: JoinColumnMetadata) -> Self {
        self.add_inverse_join_column(column);
        self
    }

    pub fn add_join_column(&mut self, column: JoinColumnMetadata) {
        self.join_columns.push(column);
    }

    pub fn add_inverse_join_column(&mut self, column: JoinColumnMetadata) {
        self.inverse_join_columns.push(column);
    }

    pub fn join_columns(&self) -> &[JoinColumnMetadata] {
        &self.join_columns
    }

    pub fn inverse_join_columns(&self) -> &[JoinColumnMetadata] {
        &self.inverse_join_columns
    }

    /// Check the join columns against the owning side's identifier width.
    pub fn validate_join_columns(&self, owner: &str, owner_identifier_count: usize) -> Result<()> {
        if self.join_columns.len() != owner_identifier_count {
            return Err(MappingError::new(
                MappingErrorKind::JoinColumnMismatch,
                owner,
                format!(
                    "join table '{}' declares {} join column(s) but '{}' has {} identifier column(s)",
                    self.name,
                    self.join_columns.len(),
                    owner,
                    owner_identifier_count
                ),
            )
            .into());
        }
        Ok(())
    }

    /// Check the inverse join columns against the target's identifier width.
    pub fn validate_inverse_join_columns(
        &self,
        owner: &str,
        target: &str,
        target_identifier_count: usize,
    ) -> Result<()> {
        if self.inverse_join_columns.len() != target_identifier_count {
            return Err(MappingError::new(
                MappingErrorKind::JoinColumnMismatch,
                owner,
                format!(
                    "join table '{}' declares {} inverse join column(s) but '{}' has {} identifier column(s)",
                    self.name,
                    self.inverse_join_columns.len(),
                    target,
                    target_identifier_count
                ),
            )
            .into());
        }
        Ok(())
    }
}

/// Metadata about one association of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociationMetadata {
    pub name: String,
    pub target_entity: String,
    pub kind: AssociationKind,
    /// Field on the target that owns this association (inverse side only)
    pub mapped_by: Option<String>,
    /// Field on the target that maps back to this association (owning side)
    pub inversed_by: Option<String>,
    pub join_columns: Vec<JoinColumnMetadata>,
    pub join_table: Option<JoinTableMetadata>,
    pub cascade: CascadeSet,
    pub fetch: FetchMode,
    /// Collection order is significant for change detection
    pub ordered: bool,
}

impl AssociationMetadata {
    fn new(name: impl Into<String>, target: impl Into<String>, kind: AssociationKind) -> Self {
        Self {
            name: name.into(),
            target_entity: target.into(),
            kind,
            mapped_by: None,
            inversed_by: None,
            join_columns: Vec::new(),
            join_table: None,
            cascade: CascadeSet::NONE,
            fetch: FetchMode::Lazy,
            ordered: false,
        }
    }

    pub fn many_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, target, AssociationKind::ManyToOne)
    }

    pub fn one_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, target, AssociationKind::OneToOne)
    }

    /// Inverse side of a many-to-one, mapped by `mapped_by` on the target.
    pub fn one_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        mapped_by: impl Into<String>,
    ) -> Self {
        let mut assoc = Self::new(name, target, AssociationKind::OneToMany);
        assoc.mapped_by = Some(mapped_by.into());
        assoc
    }

    pub fn many_to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, target, AssociationKind::ManyToMany)
    }

    pub fn join_column(mut self, column: JoinColumnMetadata) -> Self {
        self.join_columns.push(column);
        self
    }

    pub fn join_table(mut self, join_table: JoinTableMetadata) -> Self {
        self.join_table = Some(join_table);
        self
    }

    pub fn mapped_by(mut self, field: impl Into<String>) -> Self {
        self.mapped_by = Some(field.into());
        self
    }

    pub fn inversed_by(mut self, field: impl Into<String>) -> Self {
        self.inversed_by = Some(field.into());
        self
    }

    pub fn cascade(mut self, cascade: CascadeSet) -> Self {
        self.cascade = cascade;
        self
    }

    pub fn fetch(mut self, fetch: FetchMode) -> Self {
        self.fetch = fetch;
        self
    }

    pub fn ordered(mut self) -> Self {
        self.ordered = true;
        self
    }

    /// The side whose table stores the relationship.
    pub fn is_owning_side(&self) -> bool {
        self.mapped_by.is_none() && self.kind != AssociationKind::OneToMany
    }

    /// Owning to-one association backed by join columns on this entity's table.
    pub fn has_join_columns(&self) -> bool {
        self.kind.is_to_one() && self.is_owning_side()
    }

    /// Whether the foreign key may temporarily hold NULL.
    pub fn is_nullable(&self) -> bool {
        self.join_columns.iter().all(|c| c.nullable)
    }
}
