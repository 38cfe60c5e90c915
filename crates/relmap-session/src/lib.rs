//! Unit of Work, identity map and entity persistence for relmap.
//!
//! `relmap-session` owns the write side of the ORM:
//!
//! - [`UnitOfWork`] tracks entity lifecycles and commits changes in
//!   dependency order
//! - [`IdentityMap`] guarantees one in-memory instance per stored row
//! - [`compute_change_set`] diffs managed entities against their snapshots
//! - [`CommitOrderCalculator`] orders writes so foreign keys are satisfied
//! - [`EntityPersister`] turns planned writes into storage operations;
//!   [`SqlEntityPersister`] does so through any
//!   [`DatabaseExecutor`](relmap_core::DatabaseExecutor)
//!
//! # Example
//!
//! ```ignore
//! use relmap_session::{SqlEntityPersister, UnitOfWork};
//!
//! let persister = SqlEntityPersister::new(executor);
//! let mut uow = UnitOfWork::new();
//! uow.persist(&customer)?;
//! let report = uow.commit(&cx, &persister).await;
//! ```

pub mod change_set;
pub mod commit_order;
pub mod events;
pub mod identity_map;
pub mod persister;
pub mod unit_of_work;

pub use change_set::{
    ChangeSet, FieldChange, OriginalData, compute_change_set, compute_collection_changes,
    compute_insert_change_set,
};
pub use commit_order::{CommitOrder, CommitOrderCalculator, CyclePolicy, DeferredEdge};
pub use events::{FlushEvent, FlushEventArgs, FlushEventCallbacks};
pub use identity_map::{IdentityKey, IdentityMap};
pub use persister::{EntityPersister, SqlEntityPersister, Statement, StatementBuilder};
pub use unit_of_work::{CommitReport, PendingCounts, UnitOfWork, UnitOfWorkConfig};
