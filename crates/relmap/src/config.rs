//! Entity manager configuration.

use relmap_core::{CacheProvider, Dialect};
use relmap_query::WalkerType;
use relmap_session::{CyclePolicy, UnitOfWorkConfig};
use std::fmt;
use std::sync::Arc;

/// Environment variable selecting the SQL dialect.
pub const DIALECT_ENV: &str = "RELMAP_DIALECT";
/// Environment variable selecting the commit cycle policy.
pub const CYCLE_POLICY_ENV: &str = "RELMAP_CYCLE_POLICY";

/// Configuration for an [`EntityManager`](crate::EntityManager).
#[derive(Clone, Default)]
pub struct Configuration {
    /// Dialect used when no executor dictates one.
    pub dialect: Dialect,
    pub cycle_policy: CyclePolicy,
    /// Cache for compiled query SQL.
    pub query_cache: Option<Arc<dyn CacheProvider>>,
    /// Cache for entity metadata.
    pub metadata_cache: Option<Arc<dyn CacheProvider>>,
    /// Tree walkers added to every query created by the entity manager.
    pub default_tree_walkers: Vec<WalkerType>,
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Configuration")
            .field("dialect", &self.dialect)
            .field("cycle_policy", &self.cycle_policy)
            .field("query_cache", &self.query_cache.is_some())
            .field("metadata_cache", &self.metadata_cache.is_some())
            .field("default_tree_walkers", &self.default_tree_walkers)
            .finish()
    }
}

impl Configuration {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `RELMAP_DIALECT` and `RELMAP_CYCLE_POLICY`.
    ///
    /// Unknown values are ignored.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(value) = lookup(DIALECT_ENV) {
            match Dialect::from_name(&value) {
                Some(dialect) => config.dialect = dialect,
                None => tracing::warn!(value = %value, "Ignoring unknown {DIALECT_ENV}"),
            }
        }
        if let Some(value) = lookup(CYCLE_POLICY_ENV) {
            match CyclePolicy::from_name(&value) {
                Some(policy) => config.cycle_policy = policy,
                None => tracing::warn!(value = %value, "Ignoring unknown {CYCLE_POLICY_ENV}"),
            }
        }
        config
    }

    #[must_use]
    pub fn dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    #[must_use]
    pub fn cycle_policy(mut self, policy: CyclePolicy) -> Self {
        self.cycle_policy = policy;
        self
    }

    #[must_use]
    pub fn query_cache(mut self, cache: Arc<dyn CacheProvider>) -> Self {
        self.query_cache = Some(cache);
        self
    }

    #[must_use]
    pub fn metadata_cache(mut self, cache: Arc<dyn CacheProvider>) -> Self {
        self.metadata_cache = Some(cache);
        self
    }

    #[must_use]
    pub fn default_tree_walker(mut self, walker: WalkerType) -> Self {
        self.default_tree_walkers.push(walker);
        self
    }

    /// The session-level subset handed to each unit of work.
    pub fn unit_of_work_config(&self) -> UnitOfWorkConfig {
        UnitOfWorkConfig {
            cycle_policy: self.cycle_policy,
        }
    }
}
