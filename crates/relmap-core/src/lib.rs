//! Core types and traits for relmap.
//!
//! This crate provides the foundations shared by the session and query crates:
//!
//! - `Value`, `SqlType` and `Row` for dynamically typed SQL data
//! - The mapping model (`EntityMetadata` and friends) and `MetadataProvider`
//! - Runtime entities (`Entity`, `EntityRef`, `Collection`)
//! - The `DatabaseExecutor` and `CacheProvider` collaborator traits
//! - `Outcome` and `Cx` re-exported from asupersync for cancel-correct operations

pub use asupersync::{Cx, Outcome};

pub mod cache;
pub mod dialect;
pub mod entity;
pub mod error;
pub mod executor;
pub mod metadata;
pub mod row;
pub mod types;
pub mod value;

pub use cache::{ArrayCache, CacheProvider, CacheStats, NamespacedCache};
pub use dialect::Dialect;
pub use entity::{
    Collection, CollectionChange, Entity, EntityRef, Identifier, ObjectId, WeakEntityRef,
};
pub use error::{
    CommitOrderingError, ConnectionError, ConnectionErrorKind, EntityState, Error,
    InvalidEntityStateError, MappingError, MappingErrorKind, PersistenceFailure, QueryError,
    QueryErrorKind, QuerySyntaxError, Result, TypeError,
};
pub use executor::DatabaseExecutor;
pub use metadata::{
    AssociationKind, AssociationMetadata, CachedMetadataProvider, CascadeSet, ComparisonMode,
    DiscriminatorMetadata, EntityMetadata, EntityMetadataBuilder, FetchMode, FieldMetadata,
    IdGenerator, JoinColumnMetadata, JoinTableMetadata, MetadataProvider, MetadataRegistry,
    MetadataRegistryBuilder, ReferentialAction,
};
pub use row::{ColumnInfo, Row};
pub use types::SqlType;
pub use value::Value;
