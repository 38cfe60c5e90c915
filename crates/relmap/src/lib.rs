//! relmap - unit-of-work object-relational mapping for Rust.
//!
//! Entities are described by runtime metadata and tracked by a
//! [`UnitOfWork`]; changes are written in dependency order when the
//! [`EntityManager`] is flushed. Reads go through an object query language
//! compiled to dialect SQL.
//!
//! # Quick Start
//!
//! ```ignore
//! use relmap::prelude::*;
//!
//! async fn place_order(cx: &Cx, em: &mut EntityManager<impl DatabaseExecutor>) -> Result<()> {
//!     let customer = em.create("Customer")?;
//!     customer.write().set("name", "Ada")?;
//!
//!     let order = em.create("Order")?;
//!     order.write().set_reference("customer", Some(customer.clone()))?;
//!
//!     em.persist(&customer)?;
//!     em.persist(&order)?;
//!     // INSERT customers, then INSERT orders with the generated customer id
//!     em.flush(cx).await.unwrap();
//!
//!     let mut query = em.create_query("SELECT o FROM Order o JOIN o.customer c WHERE c.name = :name");
//!     query.set_parameter("name", "Ada");
//!     let orders = em.get_result(cx, &mut query).await.unwrap();
//!     assert_eq!(orders.len(), 1);
//!     Ok(())
//! }
//! ```
//!
//! # Crates
//!
//! - `relmap-core`: values, rows, metadata, entities, errors and the
//!   collaborator traits ([`DatabaseExecutor`], [`MetadataProvider`],
//!   [`CacheProvider`])
//! - `relmap-query`: lexer, parser, tree walker chain and SQL generation
//! - `relmap-session`: unit of work, identity map, change sets and commit
//!   ordering
//!
//! # Configuration
//!
//! [`Configuration::from_env`] reads `RELMAP_DIALECT` and
//! `RELMAP_CYCLE_POLICY`; everything else is set through builders.

pub mod config;
pub mod entity_manager;

pub use config::{CYCLE_POLICY_ENV, Configuration, DIALECT_ENV};
pub use entity_manager::EntityManager;

pub use relmap_core::{
    ArrayCache, AssociationKind, AssociationMetadata, CacheProvider, CacheStats,
    CachedMetadataProvider, CascadeSet, Collection, CommitOrderingError, Cx, DatabaseExecutor,
    Dialect, Entity, EntityMetadata, EntityRef, EntityState, Error, FieldMetadata, Identifier,
    IdGenerator, InvalidEntityStateError, JoinColumnMetadata, JoinTableMetadata, MappingError,
    MappingErrorKind, MetadataProvider, MetadataRegistry, Outcome, QueryError, QuerySyntaxError,
    Result, Row, SqlType, Value,
};
pub use relmap_query::{
    CountWalker, ParameterKey, Query, QueryResult, ResultSetMapping, SqlOutput, SqlWalker,
    TreeWalker, TreeWalkerChain, WalkerType,
};
pub use relmap_session::{
    CommitReport, CyclePolicy, EntityPersister, SqlEntityPersister, UnitOfWork, UnitOfWorkConfig,
};

pub use relmap_core;
pub use relmap_query;
pub use relmap_session;

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        CacheProvider, CommitReport, Configuration, Cx, DatabaseExecutor, Dialect, Entity,
        EntityManager, EntityMetadata, EntityRef, EntityState, Error, Identifier,
        MetadataProvider, MetadataRegistry, Outcome, Query, Result, Row, UnitOfWork, Value,
    };
}
