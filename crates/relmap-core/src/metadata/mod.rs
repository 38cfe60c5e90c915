//! The mapping model: how entity types map to tables, columns and join tables.

mod association;
mod entity;
mod field;
mod provider;

pub use association::{
    AssociationKind, AssociationMetadata, CascadeSet, FetchMode, JoinColumnMetadata,
    JoinTableMetadata,
};
pub use entity::{
    DiscriminatorMetadata, EntityMetadata, EntityMetadataBuilder, IdGenerator,
    is_valid_identifier,
};
pub use field::{ComparisonMode, FieldMetadata, ReferentialAction};
pub use provider::{
    CachedMetadataProvider, MetadataProvider, MetadataRegistry, MetadataRegistryBuilder,
};
