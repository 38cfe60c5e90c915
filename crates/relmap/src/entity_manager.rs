//! The entity manager: one unit of work bound to one database executor.

use crate::config::Configuration;
use relmap_core::{
    CachedMetadataProvider, Cx, DatabaseExecutor, Entity, EntityMetadata, EntityRef,
    EntityState, Error, Identifier, MetadataProvider, Outcome, Row,
};
use relmap_query::{Query, ResultSetMapping};
use relmap_session::{CommitReport, SqlEntityPersister, UnitOfWork};
use std::sync::Arc;

/// Tracks entities, runs object queries and flushes changes in a transaction.
///
/// Not shared between tasks: each logical owner creates its own manager.
pub struct EntityManager<E: DatabaseExecutor> {
    executor: Arc<E>,
    metadata: Arc<dyn MetadataProvider>,
    config: Configuration,
    unit_of_work: UnitOfWork,
}

impl<E: DatabaseExecutor> std::fmt::Debug for EntityManager<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityManager")
            .field("dialect", &self.executor.dialect())
            .field("config", &self.config)
            .field("tracked", &self.unit_of_work.size())
            .finish_non_exhaustive()
    }
}

impl<E: DatabaseExecutor> EntityManager<E> {
    pub fn new(executor: Arc<E>, metadata: Arc<dyn MetadataProvider>) -> Self {
        Self::with_config(executor, metadata, Configuration::default())
    }

    pub fn with_config(
        executor: Arc<E>,
        metadata: Arc<dyn MetadataProvider>,
        config: Configuration,
    ) -> Self {
        let metadata: Arc<dyn MetadataProvider> = match &config.metadata_cache {
            Some(cache) => Arc::new(CachedMetadataProvider::new(metadata, Arc::clone(cache))),
            None => metadata,
        };
        Self {
            executor,
            metadata,
            unit_of_work: UnitOfWork::with_config(config.unit_of_work_config()),
            config,
        }
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn executor(&self) -> &Arc<E> {
        &self.executor
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataProvider> {
        &self.metadata
    }

    pub fn metadata_for(&self, entity: &str) -> Result<Arc<EntityMetadata>, Error> {
        self.metadata.metadata_for(entity)
    }

    pub fn unit_of_work(&self) -> &UnitOfWork {
        &self.unit_of_work
    }

    pub fn unit_of_work_mut(&mut self) -> &mut UnitOfWork {
        &mut self.unit_of_work
    }

    /// A blank entity of type `entity`, not yet tracked.
    pub fn create(&self, entity: &str) -> Result<EntityRef, Error> {
        Ok(EntityRef::new(Entity::new(self.metadata_for(entity)?)))
    }

    pub fn persist(&mut self, entity: &EntityRef) -> Result<(), Error> {
        self.unit_of_work.persist(entity)
    }

    pub fn remove(&mut self, entity: &EntityRef) -> Result<(), Error> {
        self.unit_of_work.remove(entity)
    }

    pub fn detach(&mut self, entity: &EntityRef) {
        self.unit_of_work.detach(entity);
    }

    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.unit_of_work.contains(entity)
    }

    pub fn state(&self, entity: &EntityRef) -> EntityState {
        self.unit_of_work.entity_state(entity)
    }

    /// Detach everything.
    pub fn clear(&mut self) {
        self.unit_of_work.clear();
    }

    /// A query using the executor's dialect, the configured query cache and
    /// the default tree walkers.
    pub fn create_query(&self, dql: impl Into<String>) -> Query {
        let mut query = Query::new(dql, Arc::clone(&self.metadata), self.executor.dialect());
        if let Some(cache) = &self.config.query_cache {
            query = query.with_cache(Arc::clone(cache));
        }
        for walker in &self.config.default_tree_walkers {
            query.add_tree_walker(*walker);
        }
        query
    }

    /// Look an entity up by identifier: identity map first, then storage.
    pub async fn find(
        &mut self,
        cx: &Cx,
        entity: &str,
        identifier: Identifier,
    ) -> Outcome<Option<EntityRef>, Error> {
        let metadata = match self.metadata_for(entity) {
            Ok(metadata) => metadata,
            Err(e) => return Outcome::Err(e),
        };
        if metadata.identifier().len() != identifier.len() {
            return Outcome::Err(Error::Custom(format!(
                "'{}' has {} identifier field(s), {} value(s) given",
                metadata.name(),
                metadata.identifier().len(),
                identifier.len()
            )));
        }
        if let Some(found) = self
            .unit_of_work
            .try_get_by_id(&metadata, identifier.clone())
        {
            tracing::trace!(entity = %found.describe(), "Found in identity map");
            return Outcome::Ok(Some(found));
        }

        let restrictions: Vec<String> = metadata
            .identifier()
            .iter()
            .enumerate()
            .map(|(i, field)| format!("e.{field} = ?{}", i + 1))
            .collect();
        let mut query = self.create_query(format!(
            "SELECT e FROM {} e WHERE {}",
            metadata.name(),
            restrictions.join(" AND ")
        ));
        for (i, value) in identifier.into_values().into_iter().enumerate() {
            query.set_parameter(i + 1, value);
        }
        match self.get_result(cx, &mut query).await {
            Outcome::Ok(entities) => Outcome::Ok(entities.into_iter().next()),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Execute a SELECT and hydrate its first selected entity into managed
    /// instances. Rows of already managed identities yield the managed instance.
    pub async fn get_result(&mut self, cx: &Cx, query: &mut Query) -> Outcome<Vec<EntityRef>, Error> {
        let output = match query.compile(self.executor.dialect()) {
            Ok(output) => output,
            Err(e) => return Outcome::Err(e),
        };
        let rows = match query.execute(cx, self.executor.as_ref()).await {
            Outcome::Ok(result) => result.into_rows(),
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        match self.hydrate(&rows, &output.result_set_mapping) {
            Ok(entities) => Outcome::Ok(entities),
            Err(e) => Outcome::Err(e),
        }
    }

    fn hydrate(&mut self, rows: &[Row], mapping: &ResultSetMapping) -> Result<Vec<EntityRef>, Error> {
        let Some(result) = mapping.entities.first() else {
            return Err(Error::Custom("query selects no entity to hydrate".to_string()));
        };
        let metadata = self.metadata_for(&result.entity)?;
        let mut entities = Vec::with_capacity(rows.len());
        for row in rows {
            let mut entity = Entity::new(Arc::clone(&metadata));
            for field in &result.fields {
                if let Some(value) = row.get_by_name(&field.column) {
                    entity.set(&field.field, value.clone())?;
                }
            }
            if entity.identifier().is_none() {
                continue;
            }
            let managed = self.unit_of_work.register_managed(&EntityRef::new(entity))?;
            if !entities.iter().any(|e: &EntityRef| e.ptr_eq(&managed)) {
                entities.push(managed);
            }
        }
        tracing::debug!(
            entity = %result.entity,
            rows = rows.len(),
            hydrated = entities.len(),
            "Hydrated query result"
        );
        Ok(entities)
    }

    /// Commit the unit of work inside a transaction.
    ///
    /// The transaction is rolled back when the commit does not succeed; the
    /// unit of work keeps its schedules in that case.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<CommitReport, Error> {
        if !self.unit_of_work.has_changes() {
            return Outcome::Ok(CommitReport::default());
        }
        match self.executor.begin(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let persister = SqlEntityPersister::new(Arc::clone(&self.executor))
            .with_metadata(Arc::clone(&self.metadata));
        let outcome = self.unit_of_work.commit(cx, &persister).await;
        if !matches!(outcome, Outcome::Ok(_)) {
            if let Outcome::Err(e) = self.executor.rollback(cx).await {
                tracing::warn!(error = %e, "Rollback after failed flush failed");
            }
            return outcome;
        }

        match self.executor.commit(cx).await {
            Outcome::Ok(()) => outcome,
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }
}
