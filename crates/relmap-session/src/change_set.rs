//! Change detection for managed entities.
//!
//! The unit of work keeps an [`OriginalData`] snapshot per managed entity.
//! Comparing it with the entity's current state yields a [`ChangeSet`]:
//! scalar fields compared with their declared comparison mode, owning to-one
//! references compared by identity. Collections track their own snapshots and
//! are reported separately as [`CollectionChange`]s.
//!
//! Every function here is pure: neither the entity nor the snapshot is touched.

use relmap_core::{CollectionChange, Entity, EntityRef, Value};
use std::collections::BTreeMap;

/// Snapshot of an entity's persistent state at load or last commit.
#[derive(Debug, Clone, Default)]
pub struct OriginalData {
    values: BTreeMap<String, Value>,
    references: BTreeMap<String, Option<EntityRef>>,
}

impl OriginalData {
    /// Capture the scalar values and owning to-one references of `entity`.
    pub fn capture(entity: &Entity) -> Self {
        let values = entity
            .values()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        let references = entity
            .metadata()
            .owning_to_one()
            .map(|assoc| {
                (
                    assoc.name.clone(),
                    entity.reference(&assoc.name).cloned(),
                )
            })
            .collect();
        Self { values, references }
    }

    pub fn value(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    pub fn reference(&self, association: &str) -> Option<&EntityRef> {
        self.references.get(association).and_then(Option::as_ref)
    }
}

/// Change of a single field or owning to-one association.
#[derive(Debug, Clone)]
pub enum FieldChange {
    Scalar { old: Value, new: Value },
    Reference {
        old: Option<EntityRef>,
        new: Option<EntityRef>,
    },
}

/// Changed fields of one entity, in mapping order.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    changes: Vec<(String, FieldChange)>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, field: impl Into<String>, change: FieldChange) {
        self.changes.push((field.into(), change));
    }

    pub fn get(&self, field: &str) -> Option<&FieldChange> {
        self.changes
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, change)| change)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.get(field).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldChange)> {
        self.changes.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn fields(&self) -> Vec<&str> {
        self.changes.iter().map(|(k, _)| k.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Whether two to-one reference states denote the same row.
///
/// Same instance, or both identified with equal identifiers.
pub(crate) fn same_reference(a: Option<&EntityRef>, b: Option<&EntityRef>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            if a.ptr_eq(b) {
                return true;
            }
            match (a.identifier(), b.identifier()) {
                (Some(x), Some(y)) => a.metadata().name() == b.metadata().name() && x == y,
                _ => false,
            }
        }
        _ => false,
    }
}

/// Diff `entity` against its snapshot.
pub fn compute_change_set(entity: &Entity, original: &OriginalData) -> ChangeSet {
    let metadata = entity.metadata();
    let mut changes = ChangeSet::new();

    for field in metadata.fields() {
        let new = entity.get(&field.name).unwrap_or(&Value::Null);
        let old = original.value(&field.name).unwrap_or(&Value::Null);
        if !field.values_equal(old, new) {
            changes.push(
                field.name.clone(),
                FieldChange::Scalar {
                    old: old.clone(),
                    new: new.clone(),
                },
            );
        }
    }

    for assoc in metadata.owning_to_one() {
        let new = entity.reference(&assoc.name);
        let old = original.reference(&assoc.name);
        if !same_reference(old, new) {
            changes.push(
                assoc.name.clone(),
                FieldChange::Reference {
                    old: old.cloned(),
                    new: new.cloned(),
                },
            );
        }
    }

    tracing::trace!(
        entity = entity.entity_type(),
        changed = changes.len(),
        "Computed change set"
    );
    changes
}

/// Change set of an entity about to be inserted: every field, old value NULL.
pub fn compute_insert_change_set(entity: &Entity) -> ChangeSet {
    let metadata = entity.metadata();
    let mut changes = ChangeSet::new();
    for field in metadata.fields() {
        changes.push(
            field.name.clone(),
            FieldChange::Scalar {
                old: Value::Null,
                new: entity.get(&field.name).cloned().unwrap_or(Value::Null),
            },
        );
    }
    for assoc in metadata.owning_to_one() {
        changes.push(
            assoc.name.clone(),
            FieldChange::Reference {
                old: None,
                new: entity.reference(&assoc.name).cloned(),
            },
        );
    }
    changes
}

/// Pending changes of the owning many-to-many collections of `entity`.
pub fn compute_collection_changes(entity: &Entity) -> Vec<(String, CollectionChange)> {
    let metadata = entity.metadata();
    let mut result = Vec::new();
    for assoc in metadata.associations() {
        if !(assoc.kind.is_to_many() && assoc.is_owning_side()) {
            continue;
        }
        let Some(collection) = entity.collection(&assoc.name) else {
            continue;
        };
        let change = collection.change();
        if !change.is_empty() {
            result.push((assoc.name.clone(), change));
        }
    }
    result
}
