//! Unit of Work: entity lifecycle tracking and dependency-ordered commits.
//!
//! The unit of work tracks every entity handed to it and writes the
//! accumulated changes in one [`commit`](UnitOfWork::commit):
//!
//! - inserts, referenced entities before their referrers
//! - foreign keys deferred to break nullable cycles
//! - updates of changed fields
//! - join-table changes of owning to-many collections
//! - deletes, referrers before the entities they reference
//!
//! # Lifecycle
//!
//! ```text
//! NEW --persist--> MANAGED --remove--> REMOVED --commit--> DETACHED
//!                  MANAGED --detach--> DETACHED
//! ```
//!
//! # Example
//!
//! ```ignore
//! let mut uow = UnitOfWork::new();
//! uow.persist(&customer)?;
//! uow.persist(&order)?;
//! let report = uow.commit(&cx, &persister).await;
//! ```

use crate::change_set::{
    ChangeSet, FieldChange, OriginalData, compute_change_set, compute_collection_changes,
    compute_insert_change_set,
};
use crate::commit_order::{CommitOrderCalculator, CyclePolicy, DeferredEdge};
use crate::events::{FlushEvent, FlushEventCallbacks, FlushEventArgs};
use crate::identity_map::{IdentityKey, IdentityMap};
use crate::persister::EntityPersister;
use asupersync::{Cx, Outcome};
use relmap_core::{
    CollectionChange, EntityMetadata, EntityRef, EntityState, Error, IdGenerator, Identifier,
    ObjectId, PersistenceFailure, WeakEntityRef,
};
use std::collections::{HashMap, HashSet, VecDeque};

/// Session-level settings of a unit of work.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnitOfWorkConfig {
    pub cycle_policy: CyclePolicy,
}

/// Count of pending operations by type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    /// Entities pending INSERT.
    pub inserts: usize,
    /// Managed entities with a non-empty change set.
    pub updates: usize,
    /// Entities pending DELETE.
    pub deletes: usize,
    /// Dirty owning to-many collections.
    pub collection_updates: usize,
}

impl PendingCounts {
    #[must_use]
    pub fn total(&self) -> usize {
        self.inserts + self.updates + self.deletes + self.collection_updates
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Operations performed by a successful commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitReport {
    pub inserted: usize,
    pub updated: usize,
    /// Updates writing foreign keys deferred during insert or cleared before delete.
    pub extra_updates: usize,
    pub collection_updates: usize,
    pub deleted: usize,
}

impl CommitReport {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.extra_updates + self.collection_updates + self.deleted
    }
}

/// The unit of work's record of one tracked entity.
#[derive(Debug)]
struct ManagedEntity {
    entity: EntityRef,
    state: EntityState,
    original: OriginalData,
    key: Option<IdentityKey>,
}

#[derive(Clone, Copy)]
enum CascadeOp {
    Persist,
    Remove,
    Detach,
}

/// Targets of the associations of `entity` that cascade `op`.
fn cascade_targets(entity: &EntityRef, op: CascadeOp) -> Vec<EntityRef> {
    let guard = entity.read();
    let mut targets = Vec::new();
    for assoc in guard.metadata().associations() {
        let enabled = match op {
            CascadeOp::Persist => assoc.cascade.persist,
            CascadeOp::Remove => assoc.cascade.remove,
            CascadeOp::Detach => assoc.cascade.detach,
        };
        if !enabled {
            continue;
        }
        if assoc.kind.is_to_one() {
            targets.extend(guard.reference(&assoc.name).cloned());
        } else if let Some(collection) = guard.collection(&assoc.name) {
            targets.extend(collection.iter().cloned());
        }
    }
    targets
}

/// Every entity reachable in one step, with the association and its persist cascade flag.
fn associated_entities(entity: &EntityRef) -> Vec<(String, bool, EntityRef)> {
    let guard = entity.read();
    let mut reached = Vec::new();
    for assoc in guard.metadata().associations() {
        let cascades = assoc.cascade.persist;
        if assoc.kind.is_to_one() {
            if let Some(target) = guard.reference(&assoc.name) {
                reached.push((assoc.name.clone(), cascades, target.clone()));
            }
        } else if let Some(collection) = guard.collection(&assoc.name) {
            for element in collection.iter() {
                reached.push((assoc.name.clone(), cascades, element.clone()));
            }
        }
    }
    reached
}

/// The writes of one commit, in execution order.
#[derive(Debug, Default)]
struct CommitPlan {
    inserts: Vec<(EntityRef, Vec<String>)>,
    extra_updates: Vec<(EntityRef, ChangeSet)>,
    updates: Vec<(EntityRef, ChangeSet)>,
    collection_updates: Vec<(EntityRef, String, CollectionChange)>,
    delete_nullings: Vec<(EntityRef, ChangeSet)>,
    deletes: Vec<EntityRef>,
}

impl CommitPlan {
    fn len(&self) -> usize {
        self.inserts.len()
            + self.extra_updates.len()
            + self.updates.len()
            + self.collection_updates.len()
            + self.delete_nullings.len()
            + self.deletes.len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn counts(&self) -> PendingCounts {
        PendingCounts {
            inserts: self.inserts.len(),
            updates: self.updates.len(),
            deletes: self.deletes.len(),
            collection_updates: self.collection_updates.len(),
        }
    }
}

/// In-memory effects of a commit attempt, undone if it fails.
#[derive(Debug, Default)]
struct CommitAttempt {
    generated: Vec<EntityRef>,
    registered: Vec<ObjectId>,
}

fn persistence_failure(
    operation: &'static str,
    entity: &EntityRef,
    applied: usize,
    total: usize,
    source: Error,
) -> Error {
    Error::Persistence(PersistenceFailure {
        operation,
        entity_type: Some(entity.entity_type()),
        applied,
        pending: total.saturating_sub(applied),
        source: Box::new(source),
    })
}

/// Change set writing a single to-one reference.
fn reference_change(
    association: &str,
    old: Option<EntityRef>,
    new: Option<EntityRef>,
) -> ChangeSet {
    let mut changes = ChangeSet::new();
    changes.push(association, FieldChange::Reference { old, new });
    changes
}

/// Tracks entity lifecycles and commits their changes.
///
/// One unit of work belongs to one logical owner; it is driven through
/// `&mut self` and never shared.
#[derive(Default)]
pub struct UnitOfWork {
    config: UnitOfWorkConfig,
    entities: HashMap<ObjectId, ManagedEntity>,
    /// Registration order, for deterministic plans.
    order: Vec<ObjectId>,
    /// Weak handles keep the allocation, and so the object id, reserved.
    detached: HashMap<ObjectId, WeakEntityRef>,
    identity_map: IdentityMap,
    scheduled_inserts: Vec<ObjectId>,
    scheduled_deletes: Vec<ObjectId>,
    events: FlushEventCallbacks,
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("config", &self.config)
            .field("tracked", &self.entities.len())
            .field("detached", &self.detached.len())
            .field("scheduled_inserts", &self.scheduled_inserts.len())
            .field("scheduled_deletes", &self.scheduled_deletes.len())
            .field("identity_map", &self.identity_map)
            .field("events", &self.events)
            .finish()
    }
}

impl UnitOfWork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_config(config: UnitOfWorkConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &UnitOfWorkConfig {
        &self.config
    }

    /// Register a flush lifecycle callback.
    pub fn on_flush_event(
        &mut self,
        event: FlushEvent,
        f: impl FnMut(&FlushEventArgs) -> Result<(), Error> + Send + 'static,
    ) {
        self.events.register(event, f);
    }

    // ------------------------------------------------------------------
    // State queries
    // ------------------------------------------------------------------

    fn state_of(&self, oid: ObjectId) -> EntityState {
        if let Some(managed) = self.entities.get(&oid) {
            managed.state
        } else if self.detached.contains_key(&oid) {
            EntityState::Detached
        } else {
            EntityState::New
        }
    }

    /// Lifecycle state of `entity` relative to this unit of work.
    pub fn entity_state(&self, entity: &EntityRef) -> EntityState {
        self.state_of(entity.object_id())
    }

    /// Whether `entity` is managed and not scheduled for deletion.
    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.entity_state(entity) == EntityState::Managed
    }

    /// Number of tracked entities (managed or removed).
    pub fn size(&self) -> usize {
        self.entities.len()
    }

    pub fn identity_map(&self) -> &IdentityMap {
        &self.identity_map
    }

    /// The managed instance with this identity, if any.
    pub fn try_get(&self, key: &IdentityKey) -> Option<EntityRef> {
        self.identity_map.get(key)
    }

    pub fn try_get_by_id(&self, metadata: &EntityMetadata, identifier: Identifier) -> Option<EntityRef> {
        self.try_get(&IdentityKey::for_metadata(metadata, identifier))
    }

    pub fn is_scheduled_for_insert(&self, entity: &EntityRef) -> bool {
        self.scheduled_inserts.contains(&entity.object_id())
    }

    pub fn is_scheduled_for_delete(&self, entity: &EntityRef) -> bool {
        self.scheduled_deletes.contains(&entity.object_id())
    }

    /// Whether the next commit would update `entity` or its collections.
    pub fn is_scheduled_for_update(&self, entity: &EntityRef) -> bool {
        let oid = entity.object_id();
        match self.entities.get(&oid) {
            Some(m) if m.state == EntityState::Managed && !self.scheduled_inserts.contains(&oid) => {
                let guard = entity.read();
                !compute_change_set(&guard, &m.original).is_empty()
                    || !compute_collection_changes(&guard).is_empty()
            }
            _ => false,
        }
    }

    /// Changes of a managed entity since its snapshot.
    ///
    /// Entities scheduled for insert report every field as changed.
    pub fn compute_change_set(&self, entity: &EntityRef) -> Result<ChangeSet, Error> {
        let oid = entity.object_id();
        match self.entities.get(&oid) {
            Some(m) if m.state == EntityState::Managed => {
                let guard = entity.read();
                if self.scheduled_inserts.contains(&oid) {
                    Ok(compute_insert_change_set(&guard))
                } else {
                    Ok(compute_change_set(&guard, &m.original))
                }
            }
            _ => Err(Error::invalid_state(
                &entity.entity_type(),
                self.state_of(oid),
                "compute_change_set",
                "change sets are only available for managed entities",
            )),
        }
    }

    pub fn pending_counts(&self) -> PendingCounts {
        let mut counts = PendingCounts {
            inserts: self.scheduled_inserts.len(),
            deletes: self.scheduled_deletes.len(),
            ..PendingCounts::default()
        };
        for oid in &self.order {
            let Some(m) = self.entities.get(oid) else {
                continue;
            };
            if m.state != EntityState::Managed {
                continue;
            }
            let guard = m.entity.read();
            if !self.scheduled_inserts.contains(oid)
                && !compute_change_set(&guard, &m.original).is_empty()
            {
                counts.updates += 1;
            }
            counts.collection_updates += compute_collection_changes(&guard).len();
        }
        counts
    }

    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.pending_counts().is_empty()
    }

    // ------------------------------------------------------------------
    // Tracking helpers
    // ------------------------------------------------------------------

    fn track(&mut self, entity: &EntityRef, original: OriginalData, key: Option<IdentityKey>) {
        let oid = entity.object_id();
        self.detached.remove(&oid);
        if !self.order.contains(&oid) {
            self.order.push(oid);
        }
        self.entities.insert(
            oid,
            ManagedEntity {
                entity: entity.clone(),
                state: EntityState::Managed,
                original,
                key,
            },
        );
    }

    /// Drop every trace of `oid`: record, identity, schedules.
    fn forget(&mut self, oid: ObjectId) -> Option<ManagedEntity> {
        let managed = self.entities.remove(&oid)?;
        if let Some(key) = &managed.key {
            self.identity_map.remove(key, &managed.entity);
        }
        self.order.retain(|o| *o != oid);
        self.scheduled_inserts.retain(|o| *o != oid);
        self.scheduled_deletes.retain(|o| *o != oid);
        Some(managed)
    }

    fn register_identity(
        &mut self,
        key: &IdentityKey,
        entity: &EntityRef,
        operation: &'static str,
    ) -> Result<(), Error> {
        self.identity_map.insert(key.clone(), entity).map_err(|_| {
            Error::invalid_state(
                &entity.entity_type(),
                self.state_of(entity.object_id()),
                operation,
                format!("another instance with identity {key} is already managed"),
            )
        })
    }

    /// Track an entity loaded from storage as MANAGED.
    ///
    /// If an instance with the same identity is already managed, that
    /// instance is returned instead and `entity` is left untracked.
    pub fn register_managed(&mut self, entity: &EntityRef) -> Result<EntityRef, Error> {
        let oid = entity.object_id();
        if self.entities.contains_key(&oid) {
            return Ok(entity.clone());
        }
        let key = IdentityKey::of(entity).ok_or_else(|| {
            Error::invalid_state(
                &entity.entity_type(),
                self.state_of(oid),
                "register_managed",
                "entities loaded from storage must carry an identifier",
            )
        })?;
        if let Some(existing) = self.identity_map.get(&key) {
            return Ok(existing);
        }
        self.register_identity(&key, entity, "register_managed")?;
        entity.write().snapshot_collections();
        let original = OriginalData::capture(&entity.read());
        tracing::trace!(key = %key, "Registered managed entity");
        self.track(entity, original, Some(key));
        Ok(entity.clone())
    }

    // ------------------------------------------------------------------
    // persist / remove / detach
    // ------------------------------------------------------------------

    /// Make `entity` managed and schedule its insert, cascading over
    /// cascade-persist associations.
    #[tracing::instrument(level = "trace", skip_all, fields(entity = %entity.describe()))]
    pub fn persist(&mut self, entity: &EntityRef) -> Result<(), Error> {
        let mut visited = HashSet::new();
        self.do_persist(entity, &mut visited)
    }

    fn do_persist(&mut self, entity: &EntityRef, visited: &mut HashSet<ObjectId>) -> Result<(), Error> {
        let oid = entity.object_id();
        if !visited.insert(oid) {
            return Ok(());
        }
        match self.state_of(oid) {
            EntityState::Managed => {}
            EntityState::New => self.persist_new(entity)?,
            EntityState::Removed => {
                self.scheduled_deletes.retain(|o| *o != oid);
                if let Some(m) = self.entities.get_mut(&oid) {
                    m.state = EntityState::Managed;
                }
                tracing::trace!("Removed entity persisted again");
            }
            EntityState::Detached => {
                return Err(Error::invalid_state(
                    &entity.entity_type(),
                    EntityState::Detached,
                    "persist",
                    "detached entities cannot be persisted",
                ));
            }
        }
        for target in cascade_targets(entity, CascadeOp::Persist) {
            self.do_persist(&target, visited)?;
        }
        Ok(())
    }

    fn persist_new(&mut self, entity: &EntityRef) -> Result<(), Error> {
        let (metadata, identifier) = {
            let guard = entity.read();
            (std::sync::Arc::clone(guard.metadata()), guard.identifier())
        };
        let oid = entity.object_id();
        match (metadata.id_generator(), identifier) {
            (IdGenerator::Assigned, None) => Err(Error::invalid_state(
                metadata.name(),
                EntityState::New,
                "persist",
                "an assigned identifier must be set before persist",
            )),
            (IdGenerator::Auto, Some(identifier)) => {
                // A generated identifier is already present: the row exists.
                let key = IdentityKey::for_metadata(&metadata, identifier);
                self.register_identity(&key, entity, "persist")?;
                entity.write().snapshot_collections();
                let original = OriginalData::capture(&entity.read());
                self.track(entity, original, Some(key));
                tracing::trace!("Persisted entity with existing identifier as managed");
                Ok(())
            }
            (IdGenerator::Assigned, Some(identifier)) => {
                let key = IdentityKey::for_metadata(&metadata, identifier);
                self.register_identity(&key, entity, "persist")?;
                self.track(entity, OriginalData::default(), Some(key));
                self.scheduled_inserts.push(oid);
                tracing::trace!("Scheduled insert");
                Ok(())
            }
            (IdGenerator::Auto, None) => {
                self.track(entity, OriginalData::default(), None);
                self.scheduled_inserts.push(oid);
                tracing::trace!("Scheduled insert");
                Ok(())
            }
        }
    }

    /// Schedule `entity` for deletion, cascading over cascade-remove associations.
    ///
    /// An entity that was only scheduled for insert is simply forgotten.
    #[tracing::instrument(level = "trace", skip_all, fields(entity = %entity.describe()))]
    pub fn remove(&mut self, entity: &EntityRef) -> Result<(), Error> {
        let mut visited = HashSet::new();
        self.do_remove(entity, &mut visited)
    }

    fn do_remove(&mut self, entity: &EntityRef, visited: &mut HashSet<ObjectId>) -> Result<(), Error> {
        let oid = entity.object_id();
        if !visited.insert(oid) {
            return Ok(());
        }
        let state = self.state_of(oid);
        if state == EntityState::Detached {
            return Err(Error::invalid_state(
                &entity.entity_type(),
                EntityState::Detached,
                "remove",
                "detached entities cannot be removed",
            ));
        }
        for target in cascade_targets(entity, CascadeOp::Remove) {
            self.do_remove(&target, visited)?;
        }
        if state == EntityState::Managed {
            if self.scheduled_inserts.contains(&oid) {
                self.forget(oid);
                tracing::trace!("Unscheduled insert of removed entity");
            } else {
                if let Some(m) = self.entities.get_mut(&oid) {
                    m.state = EntityState::Removed;
                }
                self.scheduled_deletes.push(oid);
                tracing::trace!("Scheduled delete");
            }
        }
        Ok(())
    }

    /// Stop tracking `entity`, cascading over cascade-detach associations.
    #[tracing::instrument(level = "trace", skip_all, fields(entity = %entity.describe()))]
    pub fn detach(&mut self, entity: &EntityRef) {
        let mut visited = HashSet::new();
        self.do_detach(entity, &mut visited);
    }

    fn do_detach(&mut self, entity: &EntityRef, visited: &mut HashSet<ObjectId>) {
        let oid = entity.object_id();
        if !visited.insert(oid) {
            return;
        }
        match self.state_of(oid) {
            EntityState::New | EntityState::Detached => return,
            EntityState::Managed | EntityState::Removed => {
                self.forget(oid);
                self.detached.insert(oid, entity.downgrade());
            }
        }
        for target in cascade_targets(entity, CascadeOp::Detach) {
            self.do_detach(&target, visited);
        }
    }

    /// Detach everything.
    pub fn clear(&mut self) {
        for (oid, managed) in self.entities.drain() {
            self.detached.insert(oid, managed.entity.downgrade());
        }
        self.prune_detached();
        self.order.clear();
        self.identity_map.clear();
        self.scheduled_inserts.clear();
        self.scheduled_deletes.clear();
    }

    // ------------------------------------------------------------------
    // Commit
    // ------------------------------------------------------------------

    /// Persist NEW entities reachable through cascade-persist associations;
    /// reject those reachable through any other association.
    fn persist_reachable(&mut self) -> Result<(), Error> {
        let mut queue: VecDeque<EntityRef> = self
            .order
            .iter()
            .filter_map(|oid| self.entities.get(oid))
            .filter(|m| m.state == EntityState::Managed)
            .map(|m| m.entity.clone())
            .collect();
        let mut seen = HashSet::new();

        while let Some(entity) = queue.pop_front() {
            if !seen.insert(entity.object_id()) {
                continue;
            }
            for (association, cascades, target) in associated_entities(&entity) {
                let target_state = self.entity_state(&target);
                if target_state == EntityState::New {
                    if !cascades {
                        return Err(Error::invalid_state(
                            &target.entity_type(),
                            EntityState::New,
                            "commit",
                            format!(
                                "a new entity was found through '{}.{}', which does not cascade persist; persist it explicitly",
                                entity.entity_type(),
                                association
                            ),
                        ));
                    }
                    self.persist(&target)?;
                }
                if self.entity_state(&target) == EntityState::Managed {
                    queue.push_back(target);
                }
            }
        }
        Ok(())
    }

    fn plan(&self) -> Result<CommitPlan, Error> {
        let mut plan = CommitPlan::default();

        // Inserts: referenced before referrer
        let mut inserts = CommitOrderCalculator::new();
        for oid in &self.scheduled_inserts {
            if let Some(m) = self.entities.get(oid) {
                inserts.add_node(*oid, m.entity.describe());
            }
        }
        for oid in &self.scheduled_inserts {
            let Some(m) = self.entities.get(oid) else {
                continue;
            };
            let guard = m.entity.read();
            for assoc in guard.metadata().owning_to_one() {
                if let Some(target) = guard.reference(&assoc.name) {
                    inserts.add_dependency(*oid, target.object_id(), &assoc.name, assoc.is_nullable());
                }
            }
        }
        let insert_order = inserts.sort(self.config.cycle_policy)?;
        let mut deferred_by_entity: HashMap<ObjectId, Vec<String>> = HashMap::new();
        for DeferredEdge { from, to, association } in &insert_order.deferred {
            deferred_by_entity
                .entry(*from)
                .or_default()
                .push(association.clone());
            if let (Some(referrer), Some(target)) = (self.entities.get(from), self.entities.get(to)) {
                plan.extra_updates.push((
                    referrer.entity.clone(),
                    reference_change(association, None, Some(target.entity.clone())),
                ));
            }
        }
        for oid in &insert_order.order {
            if let Some(m) = self.entities.get(oid) {
                let deferred = deferred_by_entity.remove(oid).unwrap_or_default();
                plan.inserts.push((m.entity.clone(), deferred));
            }
        }

        // Updates and collection changes, in registration order
        for oid in &self.order {
            let Some(m) = self.entities.get(oid) else {
                continue;
            };
            if m.state != EntityState::Managed {
                continue;
            }
            let guard = m.entity.read();
            if !self.scheduled_inserts.contains(oid) {
                let changes = compute_change_set(&guard, &m.original);
                if !changes.is_empty() {
                    plan.updates.push((m.entity.clone(), changes));
                }
            }
            for (association, change) in compute_collection_changes(&guard) {
                plan.collection_updates
                    .push((m.entity.clone(), association, change));
            }
        }

        // Deletes: referrer before referenced
        let mut deletes = CommitOrderCalculator::new();
        for oid in &self.scheduled_deletes {
            if let Some(m) = self.entities.get(oid) {
                deletes.add_node(*oid, m.entity.describe());
            }
        }
        for oid in &self.scheduled_deletes {
            let Some(m) = self.entities.get(oid) else {
                continue;
            };
            let guard = m.entity.read();
            for assoc in guard.metadata().owning_to_one() {
                let target = m
                    .original
                    .reference(&assoc.name)
                    .or_else(|| guard.reference(&assoc.name));
                if let Some(target) = target {
                    deletes.add_dependency(*oid, target.object_id(), &assoc.name, assoc.is_nullable());
                }
            }
        }
        let delete_order = deletes.sort(self.config.cycle_policy)?;
        for DeferredEdge { from, to, association } in &delete_order.deferred {
            if let (Some(referrer), Some(target)) = (self.entities.get(from), self.entities.get(to)) {
                plan.delete_nullings.push((
                    referrer.entity.clone(),
                    reference_change(association, Some(target.entity.clone()), None),
                ));
            }
        }
        for oid in delete_order.order.iter().rev() {
            if let Some(m) = self.entities.get(oid) {
                plan.deletes.push(m.entity.clone());
            }
        }

        tracing::debug!(
            inserts = plan.inserts.len(),
            extra_updates = plan.extra_updates.len(),
            updates = plan.updates.len(),
            collection_updates = plan.collection_updates.len(),
            delete_nullings = plan.delete_nullings.len(),
            deletes = plan.deletes.len(),
            "Commit plan computed"
        );
        Ok(plan)
    }

    /// Assign a generated identifier and register the new identity.
    fn after_insert(
        &mut self,
        entity: &EntityRef,
        generated: Option<Identifier>,
        attempt: &mut CommitAttempt,
    ) -> Result<(), Error> {
        if let Some(identifier) = generated {
            entity.write().set_identifier(&identifier)?;
            attempt.generated.push(entity.clone());
        }
        let oid = entity.object_id();
        let needs_key = self.entities.get(&oid).is_some_and(|m| m.key.is_none());
        if needs_key {
            if let Some(key) = IdentityKey::of(entity) {
                self.register_identity(&key, entity, "commit")?;
                if let Some(m) = self.entities.get_mut(&oid) {
                    m.key = Some(key);
                }
                attempt.registered.push(oid);
            }
        }
        Ok(())
    }

    /// Undo generated identifiers and identity registrations of a failed attempt.
    fn roll_back_attempt(&mut self, attempt: CommitAttempt) {
        for oid in attempt.registered {
            if let Some(m) = self.entities.get_mut(&oid) {
                if let Some(key) = m.key.take() {
                    self.identity_map.remove(&key, &m.entity);
                }
            }
        }
        for entity in attempt.generated {
            entity.write().clear_identifier();
        }
    }

    async fn execute_plan<P: EntityPersister>(
        &mut self,
        cx: &Cx,
        persister: &P,
        plan: &CommitPlan,
        attempt: &mut CommitAttempt,
    ) -> Outcome<CommitReport, Error> {
        let total = plan.len();
        let mut report = CommitReport::default();

        for (entity, deferred) in &plan.inserts {
            match persister.insert(cx, entity, deferred).await {
                Outcome::Ok(generated) => {
                    if let Err(e) = self.after_insert(entity, generated, attempt) {
                        return Outcome::Err(persistence_failure("insert", entity, report.total(), total, e));
                    }
                    report.inserted += 1;
                }
                Outcome::Err(e) => {
                    return Outcome::Err(persistence_failure("insert", entity, report.total(), total, e));
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        for (entity, changes) in &plan.extra_updates {
            match persister.update(cx, entity, changes).await {
                Outcome::Ok(()) => report.extra_updates += 1,
                Outcome::Err(e) => {
                    return Outcome::Err(persistence_failure("update", entity, report.total(), total, e));
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        for (entity, changes) in &plan.updates {
            match persister.update(cx, entity, changes).await {
                Outcome::Ok(()) => report.updated += 1,
                Outcome::Err(e) => {
                    return Outcome::Err(persistence_failure("update", entity, report.total(), total, e));
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        for (owner, association, change) in &plan.collection_updates {
            match persister.update_collection(cx, owner, association, change).await {
                Outcome::Ok(()) => report.collection_updates += 1,
                Outcome::Err(e) => {
                    return Outcome::Err(persistence_failure(
                        "update_collection",
                        owner,
                        report.total(),
                        total,
                        e,
                    ));
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        for (entity, changes) in &plan.delete_nullings {
            match persister.update(cx, entity, changes).await {
                Outcome::Ok(()) => report.extra_updates += 1,
                Outcome::Err(e) => {
                    return Outcome::Err(persistence_failure("update", entity, report.total(), total, e));
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        for entity in &plan.deletes {
            match persister.delete(cx, entity).await {
                Outcome::Ok(()) => report.deleted += 1,
                Outcome::Err(e) => {
                    return Outcome::Err(persistence_failure("delete", entity, report.total(), total, e));
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        Outcome::Ok(report)
    }

    /// Drop detached entries whose entity no longer exists.
    fn prune_detached(&mut self) {
        let before = self.detached.len();
        self.detached.retain(|_, weak| weak.upgrade().is_some());
        let pruned = before - self.detached.len();
        if pruned > 0 {
            tracing::trace!(pruned, "Pruned dropped detached entities");
        }
    }

    /// Accept a successful commit: refresh snapshots, detach deleted entities.
    fn finish(&mut self, plan: &CommitPlan) {
        for entity in &plan.deletes {
            let oid = entity.object_id();
            self.forget(oid);
            self.detached.insert(oid, entity.downgrade());
        }
        self.prune_detached();
        self.scheduled_inserts.clear();
        self.scheduled_deletes.clear();

        for managed in self.entities.values_mut() {
            managed.entity.write().snapshot_collections();
            managed.original = OriginalData::capture(&managed.entity.read());
        }
    }

    /// Write every pending change through `persister`.
    ///
    /// On failure nothing is committed in memory: schedules stay in place,
    /// generated identifiers and new identity registrations are undone, and
    /// the error is a [`PersistenceFailure`] naming the failing operation.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn commit<P: EntityPersister>(
        &mut self,
        cx: &Cx,
        persister: &P,
    ) -> Outcome<CommitReport, Error> {
        let pending = self.pending_counts();
        if let Err(e) = self.events.fire(FlushEvent::PreFlush, pending) {
            return Outcome::Err(e);
        }
        if let Err(e) = self.persist_reachable() {
            return Outcome::Err(e);
        }
        let plan = match self.plan() {
            Ok(plan) => plan,
            Err(e) => return Outcome::Err(e),
        };
        if plan.is_empty() {
            tracing::debug!("Nothing to commit");
            return Outcome::Ok(CommitReport::default());
        }
        if let Err(e) = self.events.fire(FlushEvent::OnFlush, plan.counts()) {
            return Outcome::Err(e);
        }

        let mut attempt = CommitAttempt::default();
        match self.execute_plan(cx, persister, &plan, &mut attempt).await {
            Outcome::Ok(report) => {
                self.finish(&plan);
                tracing::info!(
                    inserted = report.inserted,
                    updated = report.updated,
                    extra_updates = report.extra_updates,
                    collection_updates = report.collection_updates,
                    deleted = report.deleted,
                    "Commit complete"
                );
                if let Err(e) = self.events.fire(FlushEvent::PostFlush, plan.counts()) {
                    return Outcome::Err(e);
                }
                Outcome::Ok(report)
            }
            Outcome::Err(e) => {
                tracing::warn!(error = %e, "Commit failed; rolling back in-memory changes");
                self.roll_back_attempt(attempt);
                Outcome::Err(e)
            }
            Outcome::Cancelled(r) => {
                self.roll_back_attempt(attempt);
                Outcome::Cancelled(r)
            }
            Outcome::Panicked(p) => {
                self.roll_back_attempt(attempt);
                Outcome::Panicked(p)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use relmap_core::{
        AssociationMetadata, CascadeSet, Entity, FieldMetadata, JoinColumnMetadata, SqlType, Value,
    };
    use std::future::Future;
    use std::sync::{Arc, Mutex};

    fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => panic!("unexpected error: {e}"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    fn run<T>(f: impl Future<Output = T>) -> T {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        rt.block_on(f)
    }

    fn label(entity: &EntityRef) -> String {
        let guard = entity.read();
        match guard.get("name") {
            Some(Value::Text(name)) => name.clone(),
            _ => guard.entity_type().to_string(),
        }
    }

    /// Logs every call and hands out sequential identifiers.
    #[derive(Default)]
    struct RecordingPersister {
        log: Mutex<Vec<String>>,
        next_id: Mutex<i64>,
        fail_on: Option<String>,
    }

    impl RecordingPersister {
        fn failing_on(op: &str) -> Self {
            Self {
                fail_on: Some(op.to_string()),
                ..Self::default()
            }
        }

        fn entries(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn record(&self, entry: String) -> Outcome<(), Error> {
            let fails = self.fail_on.as_deref() == Some(entry.as_str());
            self.log.lock().unwrap().push(entry);
            if fails {
                Outcome::Err(Error::Custom("storage unavailable".into()))
            } else {
                Outcome::Ok(())
            }
        }
    }

    impl EntityPersister for RecordingPersister {
        fn insert(
            &self,
            _cx: &Cx,
            entity: &EntityRef,
            deferred: &[String],
        ) -> impl Future<Output = Outcome<Option<Identifier>, Error>> + Send {
            let mut entry = format!("insert {}", label(entity));
            if !deferred.is_empty() {
                entry.push_str(&format!(" deferring {}", deferred.join(",")));
            }
            let generated = if entity.identifier().is_none() {
                let mut next = self.next_id.lock().unwrap();
                *next += 1;
                Some(Identifier::single(*next))
            } else {
                None
            };
            let outcome = match self.record(entry) {
                Outcome::Ok(()) => Outcome::Ok(generated),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            };
            async move { outcome }
        }

        fn update(
            &self,
            _cx: &Cx,
            entity: &EntityRef,
            changes: &ChangeSet,
        ) -> impl Future<Output = Outcome<(), Error>> + Send {
            let outcome = self.record(format!(
                "update {} {}",
                label(entity),
                changes.fields().join(",")
            ));
            async move { outcome }
        }

        fn delete(
            &self,
            _cx: &Cx,
            entity: &EntityRef,
        ) -> impl Future<Output = Outcome<(), Error>> + Send {
            let outcome = self.record(format!("delete {}", label(entity)));
            async move { outcome }
        }

        fn update_collection(
            &self,
            _cx: &Cx,
            owner: &EntityRef,
            association: &str,
            change: &CollectionChange,
        ) -> impl Future<Output = Outcome<(), Error>> + Send {
            let outcome = self.record(format!(
                "collection {}.{} +{} -{}",
                label(owner),
                association,
                change.inserted.len(),
                change.deleted.len()
            ));
            async move { outcome }
        }
    }

    fn customer_meta() -> Arc<EntityMetadata> {
        Arc::new(
            EntityMetadata::builder("Customer")
                .id(FieldMetadata::new("id", SqlType::BigInt))
                .field(FieldMetadata::new("name", SqlType::Text))
                .association(
                    AssociationMetadata::one_to_many("orders", "Order", "customer")
                        .cascade(CascadeSet::persist().with_remove()),
                )
                .build()
                .unwrap(),
        )
    }

    fn order_meta() -> Arc<EntityMetadata> {
        Arc::new(
            EntityMetadata::builder("Order")
                .id(FieldMetadata::new("id", SqlType::BigInt))
                .field(FieldMetadata::new("name", SqlType::Text))
                .association(
                    AssociationMetadata::many_to_one("customer", "Customer")
                        .join_column(JoinColumnMetadata::new("customer_id", "id").not_null()),
                )
                .association(AssociationMetadata::many_to_many("gifts", "Customer"))
                .build()
                .unwrap(),
        )
    }

    fn node_meta(nullable: bool, cascade: CascadeSet) -> Arc<EntityMetadata> {
        let column = JoinColumnMetadata::new("partner_id", "id");
        let column = if nullable { column } else { column.not_null() };
        Arc::new(
            EntityMetadata::builder("Node")
                .id(FieldMetadata::new("id", SqlType::BigInt))
                .field(FieldMetadata::new("name", SqlType::Text))
                .association(
                    AssociationMetadata::many_to_one("partner", "Node")
                        .join_column(column)
                        .cascade(cascade),
                )
                .build()
                .unwrap(),
        )
    }

    fn named(meta: &Arc<EntityMetadata>, name: &str) -> EntityRef {
        EntityRef::new(Entity::new(Arc::clone(meta)).with("name", name).unwrap())
    }

    fn link(from: &EntityRef, association: &str, to: &EntityRef) {
        from.write()
            .set_reference(association, Some(to.clone()))
            .unwrap();
    }

    fn index_of(log: &[String], entry: &str) -> usize {
        log.iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("missing {entry} in {log:?}"))
    }

    #[test]
    fn test_referenced_entity_inserted_first() {
        let mut uow = UnitOfWork::new();
        let customer = named(&customer_meta(), "alice");
        let order = named(&order_meta(), "o1");
        link(&order, "customer", &customer);

        // Persist the referrer first; ordering must still put the customer first
        uow.persist(&order).unwrap();
        uow.persist(&customer).unwrap();
        assert!(uow.is_scheduled_for_insert(&order));

        let persister = RecordingPersister::default();
        let cx = Cx::for_testing();
        let report = unwrap_outcome(run(uow.commit(&cx, &persister)));

        assert_eq!(persister.entries(), vec!["insert alice", "insert o1"]);
        assert_eq!(report.inserted, 2);
        assert_eq!(customer.identifier(), Some(Identifier::single(1i64)));
        assert_eq!(order.identifier(), Some(Identifier::single(2i64)));

        // Snapshots now equal the current state
        assert!(uow.compute_change_set(&order).unwrap().is_empty());
        assert!(uow.compute_change_set(&customer).unwrap().is_empty());
        assert!(!uow.is_scheduled_for_insert(&order));
        assert!(
            uow.try_get_by_id(&customer_meta(), Identifier::single(1i64))
                .unwrap()
                .ptr_eq(&customer)
        );
    }

    #[test]
    fn test_referrer_deleted_first() {
        let mut uow = UnitOfWork::new();
        let customer = named(&customer_meta(), "alice");
        customer.write().set("id", 1i64).unwrap();
        let order = named(&order_meta(), "o1");
        order.write().set("id", 2i64).unwrap();
        link(&order, "customer", &customer);
        uow.register_managed(&customer).unwrap();
        uow.register_managed(&order).unwrap();

        uow.remove(&customer).unwrap();
        uow.remove(&order).unwrap();
        assert_eq!(uow.entity_state(&customer), EntityState::Removed);

        let persister = RecordingPersister::default();
        let cx = Cx::for_testing();
        unwrap_outcome(run(uow.commit(&cx, &persister)));

        assert_eq!(persister.entries(), vec!["delete o1", "delete alice"]);
        assert_eq!(uow.entity_state(&customer), EntityState::Detached);
        assert!(uow.identity_map().is_empty());
    }

    #[test]
    fn test_unchanged_entity_is_not_updated() {
        let mut uow = UnitOfWork::new();
        let customer = named(&customer_meta(), "alice");
        customer.write().set("id", 1i64).unwrap();
        uow.register_managed(&customer).unwrap();
        assert!(uow.compute_change_set(&customer).unwrap().is_empty());
        assert!(!uow.is_scheduled_for_update(&customer));

        let persister = RecordingPersister::default();
        let cx = Cx::for_testing();
        let report = unwrap_outcome(run(uow.commit(&cx, &persister)));
        assert_eq!(report.total(), 0);
        assert!(persister.entries().is_empty());
    }

    #[test]
    fn test_changed_entity_is_updated_once() {
        let mut uow = UnitOfWork::new();
        let customer = named(&customer_meta(), "alice");
        customer.write().set("id", 1i64).unwrap();
        uow.register_managed(&customer).unwrap();
        customer.write().set("name", "alicia").unwrap();
        assert!(uow.is_scheduled_for_update(&customer));
        assert_eq!(uow.pending_counts().updates, 1);

        let persister = RecordingPersister::default();
        let cx = Cx::for_testing();
        unwrap_outcome(run(uow.commit(&cx, &persister)));
        assert_eq!(persister.entries(), vec!["update alicia name"]);
        assert!(uow.compute_change_set(&customer).unwrap().is_empty());

        unwrap_outcome(run(uow.commit(&cx, &persister)));
        assert_eq!(persister.entries().len(), 1);
    }

    #[test]
    fn test_detach_then_remove_fails() {
        let mut uow = UnitOfWork::new();
        let customer = named(&customer_meta(), "alice");
        uow.persist(&customer).unwrap();
        uow.detach(&customer);
        assert_eq!(uow.entity_state(&customer), EntityState::Detached);

        let err = uow.remove(&customer).unwrap_err();
        match err {
            Error::InvalidEntityState(e) => {
                assert_eq!(e.state, EntityState::Detached);
                assert_eq!(e.operation, "remove");
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(uow.persist(&customer).is_err());
        assert!(uow.compute_change_set(&customer).is_err());
    }

    #[test]
    fn test_mandatory_cycle_fails_commit() {
        let meta = node_meta(false, CascadeSet::NONE);
        let a = named(&meta, "a");
        let b = named(&meta, "b");
        link(&a, "partner", &b);
        link(&b, "partner", &a);
        let mut uow = UnitOfWork::new();
        uow.persist(&a).unwrap();
        uow.persist(&b).unwrap();

        let persister = RecordingPersister::default();
        let cx = Cx::for_testing();
        match run(uow.commit(&cx, &persister)) {
            Outcome::Err(Error::CommitOrdering(e)) => assert_eq!(e.cycle.len(), 3),
            other => panic!("expected commit ordering error, got {other:?}"),
        }
        assert!(persister.entries().is_empty());
        assert_eq!(uow.pending_counts().inserts, 2);
    }

    #[test]
    fn test_nullable_cycle_is_deferred() {
        let meta = node_meta(true, CascadeSet::NONE);
        let a = named(&meta, "a");
        let b = named(&meta, "b");
        link(&a, "partner", &b);
        link(&b, "partner", &a);
        let mut uow = UnitOfWork::new();
        uow.persist(&a).unwrap();
        uow.persist(&b).unwrap();

        let persister = RecordingPersister::default();
        let cx = Cx::for_testing();
        let report = unwrap_outcome(run(uow.commit(&cx, &persister)));
        assert_eq!(
            persister.entries(),
            vec!["insert b deferring partner", "insert a", "update b partner"]
        );
        assert_eq!(report.extra_updates, 1);
        assert!(uow.compute_change_set(&b).unwrap().is_empty());
    }

    #[test]
    fn test_reject_policy_refuses_nullable_cycle() {
        let meta = node_meta(true, CascadeSet::NONE);
        let a = named(&meta, "a");
        let b = named(&meta, "b");
        link(&a, "partner", &b);
        link(&b, "partner", &a);
        let mut uow = UnitOfWork::with_config(UnitOfWorkConfig {
            cycle_policy: CyclePolicy::Reject,
        });
        uow.persist(&a).unwrap();
        uow.persist(&b).unwrap();
        let persister = RecordingPersister::default();
        let cx = Cx::for_testing();
        assert!(matches!(
            run(uow.commit(&cx, &persister)),
            Outcome::Err(Error::CommitOrdering(_))
        ));
    }

    #[test]
    fn test_cascade_persist_terminates_on_cycles() {
        let meta = node_meta(true, CascadeSet::ALL);
        let a = named(&meta, "a");
        let b = named(&meta, "b");
        let c = named(&meta, "c");
        link(&a, "partner", &b);
        link(&b, "partner", &c);
        link(&c, "partner", &a);
        let mut uow = UnitOfWork::new();
        uow.persist(&a).unwrap();
        assert!(uow.contains(&b));
        assert!(uow.contains(&c));
        assert_eq!(uow.pending_counts().inserts, 3);

        uow.detach(&a);
        assert_eq!(uow.size(), 0);
    }

    #[test]
    fn test_cascade_remove_reaches_collection() {
        let customer = named(&customer_meta(), "alice");
        customer.write().set("id", 1i64).unwrap();
        let order = named(&order_meta(), "o1");
        order.write().set("id", 5i64).unwrap();
        link(&order, "customer", &customer);
        customer
            .write()
            .collection_mut("orders")
            .unwrap()
            .add(order.clone());

        let mut uow = UnitOfWork::new();
        uow.register_managed(&customer).unwrap();
        uow.register_managed(&order).unwrap();
        uow.remove(&customer).unwrap();
        assert!(uow.is_scheduled_for_delete(&order));

        let persister = RecordingPersister::default();
        let cx = Cx::for_testing();
        unwrap_outcome(run(uow.commit(&cx, &persister)));
        assert_eq!(persister.entries(), vec!["delete o1", "delete alice"]);
    }

    #[test]
    fn test_commit_persists_through_cascade() {
        let customer = named(&customer_meta(), "alice");
        let order = named(&order_meta(), "o1");
        link(&order, "customer", &customer);
        let mut uow = UnitOfWork::new();
        uow.persist(&customer).unwrap();
        // Added after persist; picked up at commit
        customer
            .write()
            .collection_mut("orders")
            .unwrap()
            .add(order.clone());

        let persister = RecordingPersister::default();
        let cx = Cx::for_testing();
        unwrap_outcome(run(uow.commit(&cx, &persister)));
        assert_eq!(persister.entries(), vec!["insert alice", "insert o1"]);
        assert!(uow.contains(&order));
    }

    #[test]
    fn test_new_entity_behind_non_cascading_association_fails() {
        let customer = named(&customer_meta(), "alice");
        let order = named(&order_meta(), "o1");
        link(&order, "customer", &customer);
        let mut uow = UnitOfWork::new();
        uow.persist(&order).unwrap();

        let persister = RecordingPersister::default();
        let cx = Cx::for_testing();
        match run(uow.commit(&cx, &persister)) {
            Outcome::Err(Error::InvalidEntityState(e)) => {
                assert_eq!(e.state, EntityState::New);
                assert_eq!(e.entity_type, "Customer");
            }
            other => panic!("expected invalid state, got {other:?}"),
        }
        assert!(persister.entries().is_empty());
    }

    #[test]
    fn test_remove_of_scheduled_insert_forgets_entity() {
        let customer = named(&customer_meta(), "alice");
        let mut uow = UnitOfWork::new();
        uow.persist(&customer).unwrap();
        uow.remove(&customer).unwrap();
        assert_eq!(uow.entity_state(&customer), EntityState::New);
        assert!(!uow.has_changes());
    }

    #[test]
    fn test_persist_removed_entity_restores_it() {
        let customer = named(&customer_meta(), "alice");
        customer.write().set("id", 3i64).unwrap();
        let mut uow = UnitOfWork::new();
        uow.register_managed(&customer).unwrap();
        uow.remove(&customer).unwrap();
        uow.persist(&customer).unwrap();
        assert_eq!(uow.entity_state(&customer), EntityState::Managed);
        assert!(!uow.is_scheduled_for_delete(&customer));
    }

    #[test]
    fn test_failed_commit_rolls_back_in_memory_state() {
        let customer = named(&customer_meta(), "alice");
        let order = named(&order_meta(), "o1");
        link(&order, "customer", &customer);
        let mut uow = UnitOfWork::new();
        uow.persist(&customer).unwrap();
        uow.persist(&order).unwrap();

        let failing = RecordingPersister::failing_on("insert o1");
        let cx = Cx::for_testing();
        match run(uow.commit(&cx, &failing)) {
            Outcome::Err(Error::Persistence(failure)) => {
                assert_eq!(failure.operation, "insert");
                assert_eq!(failure.entity_type.as_deref(), Some("Order"));
                assert_eq!(failure.applied, 1);
                assert_eq!(failure.pending, 1);
            }
            other => panic!("expected persistence failure, got {other:?}"),
        }
        assert!(customer.identifier().is_none());
        assert!(uow.identity_map().is_empty());
        assert!(uow.is_scheduled_for_insert(&customer));
        assert!(uow.is_scheduled_for_insert(&order));

        let persister = RecordingPersister::default();
        unwrap_outcome(run(uow.commit(&cx, &persister)));
        assert_eq!(persister.entries(), vec!["insert alice", "insert o1"]);
    }

    #[test]
    fn test_collection_changes_dispatched() {
        let order = named(&order_meta(), "o1");
        order.write().set("id", 1i64).unwrap();
        let gift = named(&customer_meta(), "bob");
        gift.write().set("id", 2i64).unwrap();
        let mut uow = UnitOfWork::new();
        uow.register_managed(&order).unwrap();
        uow.register_managed(&gift).unwrap();

        order
            .write()
            .collection_mut("gifts")
            .unwrap()
            .add(gift.clone());
        assert_eq!(uow.pending_counts().collection_updates, 1);

        let persister = RecordingPersister::default();
        let cx = Cx::for_testing();
        let report = unwrap_outcome(run(uow.commit(&cx, &persister)));
        assert_eq!(persister.entries(), vec!["collection o1.gifts +1 -0"]);
        assert_eq!(report.collection_updates, 1);
        assert!(!uow.has_changes());
    }

    #[test]
    fn test_register_managed_returns_existing_instance() {
        let first = named(&customer_meta(), "alice");
        first.write().set("id", 1i64).unwrap();
        let second = named(&customer_meta(), "alice again");
        second.write().set("id", 1i64).unwrap();
        let mut uow = UnitOfWork::new();
        assert!(uow.register_managed(&first).unwrap().ptr_eq(&first));
        assert!(uow.register_managed(&second).unwrap().ptr_eq(&first));
        assert_eq!(uow.entity_state(&second), EntityState::New);

        let blank = named(&customer_meta(), "nobody");
        assert!(uow.register_managed(&blank).is_err());
    }

    #[test]
    fn test_assigned_identifier_required() {
        let meta = Arc::new(
            EntityMetadata::builder("Country")
                .id(FieldMetadata::new("code", SqlType::Text))
                .id_generator(IdGenerator::Assigned)
                .build()
                .unwrap(),
        );
        let country = EntityRef::new(Entity::new(Arc::clone(&meta)));
        let mut uow = UnitOfWork::new();
        assert!(matches!(
            uow.persist(&country),
            Err(Error::InvalidEntityState(_))
        ));
        country.write().set("code", "NL").unwrap();
        uow.persist(&country).unwrap();
        assert!(uow.is_scheduled_for_insert(&country));
        assert!(
            uow.try_get_by_id(&meta, Identifier::single("NL"))
                .unwrap()
                .ptr_eq(&country)
        );
    }

    #[test]
    fn test_flush_events_fire() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut uow = UnitOfWork::new();
        for event in [FlushEvent::PreFlush, FlushEvent::OnFlush, FlushEvent::PostFlush] {
            let seen = Arc::clone(&seen);
            uow.on_flush_event(event, move |args| {
                seen.lock().unwrap().push((args.event, args.pending.inserts));
                Ok(())
            });
        }
        uow.persist(&named(&customer_meta(), "alice")).unwrap();
        let persister = RecordingPersister::default();
        let cx = Cx::for_testing();
        unwrap_outcome(run(uow.commit(&cx, &persister)));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (FlushEvent::PreFlush, 1),
                (FlushEvent::OnFlush, 1),
                (FlushEvent::PostFlush, 1)
            ]
        );
    }

    #[test]
    fn test_clear_detaches_everything() {
        let customer = named(&customer_meta(), "alice");
        let mut uow = UnitOfWork::new();
        uow.persist(&customer).unwrap();
        uow.clear();
        assert_eq!(uow.size(), 0);
        assert_eq!(uow.entity_state(&customer), EntityState::Detached);
    }

    #[test]
    fn test_dropped_detached_entities_are_pruned() {
        let kept = named(&customer_meta(), "alice");
        let mut uow = UnitOfWork::new();
        uow.persist(&kept).unwrap();
        {
            let dropped = named(&customer_meta(), "bob");
            uow.persist(&dropped).unwrap();
            uow.detach(&dropped);
            assert_eq!(uow.detached.len(), 1);
        }
        uow.clear();
        assert_eq!(uow.detached.len(), 1);
        assert_eq!(uow.entity_state(&kept), EntityState::Detached);

        let cx = Cx::for_testing();
        let persister = RecordingPersister::default();
        let removed = named(&customer_meta(), "carol");
        uow.persist(&removed).unwrap();
        unwrap_outcome(run(uow.commit(&cx, &persister)));
        uow.remove(&removed).unwrap();
        unwrap_outcome(run(uow.commit(&cx, &persister)));
        assert_eq!(uow.detached.len(), 2);

        drop(kept);
        drop(removed);
        let other = named(&customer_meta(), "dave");
        uow.persist(&other).unwrap();
        unwrap_outcome(run(uow.commit(&cx, &persister)));
        assert!(uow.detached.is_empty());
    }
}
