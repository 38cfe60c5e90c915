//! Identity Map: at most one managed entity instance per identity.
//!
//! The map ensures that each database row corresponds to exactly one
//! [`EntityRef`] within a unit of work. Looking an identity up twice yields
//! handles to the same allocation, so changes are visible everywhere.
//!
//! Entities of a single-table inheritance family share the root entity's
//! namespace: an `Employee#1` and a `Person#1` are the same row.

use relmap_core::{EntityMetadata, EntityRef, Identifier, ObjectId};
use std::collections::HashMap;
use std::fmt;

/// Identity of a persistent entity: root entity type name plus identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    entity_type: String,
    identifier: Identifier,
}

impl IdentityKey {
    pub fn new(entity_type: impl Into<String>, identifier: Identifier) -> Self {
        Self {
            entity_type: entity_type.into(),
            identifier,
        }
    }

    /// Key an identifier under the root of `metadata`'s inheritance family.
    pub fn for_metadata(metadata: &EntityMetadata, identifier: Identifier) -> Self {
        let root = metadata
            .discriminator()
            .map_or(metadata.name(), |d| d.root_entity.as_str());
        Self::new(root, identifier)
    }

    /// The key of an entity, if its identifier is fully assigned.
    pub fn of(entity: &EntityRef) -> Option<Self> {
        let guard = entity.read();
        let identifier = guard.identifier()?;
        Some(Self::for_metadata(guard.metadata(), identifier))
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity_type, self.identifier)
    }
}

/// Identity Map for tracking unique entity instances.
#[derive(Default)]
pub struct IdentityMap {
    entries: HashMap<IdentityKey, EntityRef>,
}

impl IdentityMap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register an entity under `key`.
    ///
    /// If another instance already holds the key, that instance is returned and
    /// the map is left unchanged. Registering the same instance again is a no-op.
    pub fn insert(&mut self, key: IdentityKey, entity: &EntityRef) -> Result<(), EntityRef> {
        if let Some(existing) = self.entries.get(&key) {
            if existing.ptr_eq(entity) {
                return Ok(());
            }
            return Err(existing.clone());
        }
        tracing::trace!(key = %key, "Identity map registration");
        self.entries.insert(key, entity.clone());
        Ok(())
    }

    pub fn get(&self, key: &IdentityKey) -> Option<EntityRef> {
        self.entries.get(key).cloned()
    }

    pub fn contains(&self, key: &IdentityKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove `key` if it is held by `entity`.
    ///
    /// # Returns
    ///
    /// `true` if the entry was removed.
    pub fn remove(&mut self, key: &IdentityKey, entity: &EntityRef) -> bool {
        match self.entries.get(key) {
            Some(existing) if existing.ptr_eq(entity) => {
                self.entries.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Remove whatever key currently maps to the instance `oid`.
    pub fn remove_object(&mut self, oid: ObjectId) -> Option<IdentityKey> {
        let key = self
            .entries
            .iter()
            .find(|(_, e)| e.object_id() == oid)
            .map(|(k, _)| k.clone())?;
        self.entries.remove(&key);
        Some(key)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for IdentityMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self.entries.keys().map(ToString::to_string).collect();
        keys.sort();
        f.debug_struct("IdentityMap").field("keys", &keys).finish()
    }
}
