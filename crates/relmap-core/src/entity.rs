//! Runtime entity records.
//!
//! An [`Entity`] holds the current state of one object: scalar field values,
//! to-one references and to-many collections, all described by its
//! [`EntityMetadata`]. Entities are shared through [`EntityRef`] handles
//! (`Arc<RwLock<Entity>>`); two handles denote the same object exactly when
//! they point at the same allocation.

use crate::error::{Error, MappingError, MappingErrorKind, Result, TypeError};
use crate::metadata::EntityMetadata;
use crate::value::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

/// A composite identifier: one value per identifier field, in declaration order.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Identifier(Vec<Value>);

impl Identifier {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn single(value: impl Into<Value>) -> Self {
        Self(vec![value.into()])
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn into_values(self) -> Vec<Value> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// Identifiers never hold NaN, so equality is reflexive in practice.
impl Eq for Identifier {}

impl Hash for Identifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.len().hash(state);
        for value in &self.0 {
            value.hash_into(state);
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [single] => write!(f, "{single}"),
            values => {
                write!(f, "(")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Object identity of an entity handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(usize);

/// The current state of one entity.
pub struct Entity {
    metadata: Arc<EntityMetadata>,
    values: BTreeMap<String, Value>,
    references: BTreeMap<String, Option<EntityRef>>,
    collections: BTreeMap<String, Collection>,
}

impl Entity {
    /// A blank entity: every field NULL, no references, empty collections.
    pub fn new(metadata: Arc<EntityMetadata>) -> Self {
        let values = metadata
            .fields()
            .iter()
            .map(|f| (f.name.clone(), Value::Null))
            .collect();
        let mut references = BTreeMap::new();
        let mut collections = BTreeMap::new();
        for assoc in metadata.associations() {
            if assoc.kind.is_to_one() {
                references.insert(assoc.name.clone(), None);
            } else {
                collections.insert(assoc.name.clone(), Collection::new(assoc.ordered));
            }
        }
        Self {
            metadata,
            values,
            references,
            collections,
        }
    }

    /// Builder-style [`set`](Self::set).
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Result<Self> {
        self.set(field, value)?;
        Ok(self)
    }

    pub fn metadata(&self) -> &Arc<EntityMetadata> {
        &self.metadata
    }

    pub fn entity_type(&self) -> &str {
        self.metadata.name()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    /// Assign a scalar field, checking it is mapped and type-compatible.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let meta = self.metadata.require_field(field)?;
        if !meta.sql_type.accepts(&value) {
            return Err(Error::Type(TypeError {
                expected: "value compatible with the column type",
                actual: value.type_name().to_string(),
                column: Some(meta.column_name.clone()),
            }));
        }
        self.values.insert(field.to_string(), value);
        Ok(())
    }

    /// Scalar field values in field-name order.
    pub fn values(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn reference(&self, association: &str) -> Option<&EntityRef> {
        self.references.get(association).and_then(Option::as_ref)
    }

    /// Point a to-one association at `target`, or clear it with `None`.
    pub fn set_reference(&mut self, association: &str, target: Option<EntityRef>) -> Result<()> {
        let assoc = self.metadata.require_association(association)?;
        if !assoc.kind.is_to_one() {
            return Err(MappingError::new(
                MappingErrorKind::Invalid,
                self.metadata.name(),
                format!("'{}' is a collection, not a reference", association),
            )
            .into());
        }
        if let Some(target) = &target {
            let target_meta = target.metadata();
            let compatible = target_meta.name() == assoc.target_entity
                || target_meta
                    .discriminator()
                    .is_some_and(|d| d.root_entity == assoc.target_entity);
            if !compatible {
                return Err(MappingError::new(
                    MappingErrorKind::Invalid,
                    self.metadata.name(),
                    format!(
                        "'{}' expects '{}', got '{}'",
                        association,
                        assoc.target_entity,
                        target_meta.name()
                    ),
                )
                .into());
            }
        }
        self.references.insert(association.to_string(), target);
        Ok(())
    }

    /// All to-one references, including unset ones.
    pub fn references(&self) -> impl Iterator<Item = (&str, Option<&EntityRef>)> {
        self.references.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }

    pub fn collection(&self, association: &str) -> Option<&Collection> {
        self.collections.get(association)
    }

    pub fn collection_mut(&mut self, association: &str) -> Result<&mut Collection> {
        let entity = self.metadata.name().to_string();
        self.collections
            .get_mut(association)
            .ok_or_else(|| Error::unknown_field(&entity, association))
    }

    pub fn collections(&self) -> impl Iterator<Item = (&str, &Collection)> {
        self.collections.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub(crate) fn collections_mut(&mut self) -> impl Iterator<Item = &mut Collection> {
        self.collections.values_mut()
    }

    /// The identifier, if every identifier field holds a non-null value.
    pub fn identifier(&self) -> Option<Identifier> {
        self.metadata
            .identifier_from(|f| self.values.get(f))
            .map(Identifier)
    }

    pub fn set_identifier(&mut self, identifier: &Identifier) -> Result<()> {
        let fields = self.metadata.identifier().to_vec();
        if fields.len() != identifier.len() {
            return Err(MappingError::new(
                MappingErrorKind::Invalid,
                self.metadata.name(),
                format!(
                    "identifier has {} value(s), expected {}",
                    identifier.len(),
                    fields.len()
                ),
            )
            .into());
        }
        for (field, value) in fields.iter().zip(identifier.values()) {
            self.set(field, value.clone())?;
        }
        Ok(())
    }

    pub fn clear_identifier(&mut self) {
        for field in self.metadata.identifier() {
            self.values.insert(field.clone(), Value::Null);
        }
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // References are printed by description only; entity graphs may be cyclic.
        let references: BTreeMap<&str, Option<String>> = self
            .references
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_ref().map(EntityRef::describe)))
            .collect();
        let collections: BTreeMap<&str, usize> = self
            .collections
            .iter()
            .map(|(k, v)| (k.as_str(), v.len()))
            .collect();
        f.debug_struct("Entity")
            .field("type", &self.metadata.name())
            .field("values", &self.values)
            .field("references", &references)
            .field("collections", &collections)
            .finish()
    }
}

/// Shared handle to an [`Entity`].
#[derive(Clone)]
pub struct EntityRef(Arc<RwLock<Entity>>);

impl EntityRef {
    pub fn new(entity: Entity) -> Self {
        Self(Arc::new(RwLock::new(entity)))
    }

    /// Read access. A poisoned lock is recovered; entity data stays usable.
    pub fn read(&self) -> RwLockReadGuard<'_, Entity> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Entity> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn object_id(&self) -> ObjectId {
        ObjectId(Arc::as_ptr(&self.0) as usize)
    }

    pub fn ptr_eq(&self, other: &EntityRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn downgrade(&self) -> WeakEntityRef {
        WeakEntityRef(Arc::downgrade(&self.0))
    }

    pub fn metadata(&self) -> Arc<EntityMetadata> {
        Arc::clone(self.read().metadata())
    }

    pub fn entity_type(&self) -> String {
        self.read().entity_type().to_string()
    }

    pub fn identifier(&self) -> Option<Identifier> {
        self.read().identifier()
    }

    /// `Type#id` when identified, `Type@address` otherwise.
    pub fn describe(&self) -> String {
        let entity = self.read();
        match entity.identifier() {
            Some(id) => format!("{}#{}", entity.entity_type(), id),
            None => format!("{}@{:x}", entity.entity_type(), self.object_id().0),
        }
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityRef({})", self.describe())
    }
}

/// Non-owning handle; keeps the allocation (and so the [`ObjectId`]) reserved.
#[derive(Clone)]
pub struct WeakEntityRef(Weak<RwLock<Entity>>);

impl WeakEntityRef {
    pub fn upgrade(&self) -> Option<EntityRef> {
        self.0.upgrade().map(EntityRef)
    }

    pub fn object_id(&self) -> ObjectId {
        ObjectId(Weak::as_ptr(&self.0) as usize)
    }
}

impl fmt::Debug for WeakEntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WeakEntityRef({:?})", self.object_id())
    }
}

/// A to-many collection that remembers its membership as of the last commit.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    elements: Vec<EntityRef>,
    snapshot: Vec<EntityRef>,
    ordered: bool,
}

/// Pending membership changes of a collection.
#[derive(Debug, Clone, Default)]
pub struct CollectionChange {
    pub inserted: Vec<EntityRef>,
    pub deleted: Vec<EntityRef>,
    /// Membership of an ordered collection kept but its order changed.
    pub reordered: bool,
}

impl CollectionChange {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.deleted.is_empty() && !self.reordered
    }
}

fn contains_ref(list: &[EntityRef], entity: &EntityRef) -> bool {
    list.iter().any(|e| e.ptr_eq(entity))
}

impl Collection {
    pub fn new(ordered: bool) -> Self {
        Self {
            elements: Vec::new(),
            snapshot: Vec::new(),
            ordered,
        }
    }

    /// Add an element. Adding an element already present is a no-op.
    pub fn add(&mut self, entity: EntityRef) -> bool {
        if contains_ref(&self.elements, &entity) {
            return false;
        }
        self.elements.push(entity);
        true
    }

    pub fn remove(&mut self, entity: &EntityRef) -> bool {
        let before = self.elements.len();
        self.elements.retain(|e| !e.ptr_eq(entity));
        before != self.elements.len()
    }

    pub fn contains(&self, entity: &EntityRef) -> bool {
        contains_ref(&self.elements, entity)
    }

    pub fn clear(&mut self) {
        self.elements.clear();
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityRef> {
        self.elements.iter()
    }

    pub fn is_ordered(&self) -> bool {
        self.ordered
    }

    /// Elements present now but not at the last snapshot.
    pub fn insert_diff(&self) -> Vec<EntityRef> {
        self.elements
            .iter()
            .filter(|e| !contains_ref(&self.snapshot, e))
            .cloned()
            .collect()
    }

    /// Elements present at the last snapshot but not now.
    pub fn delete_diff(&self) -> Vec<EntityRef> {
        self.snapshot
            .iter()
            .filter(|e| !contains_ref(&self.elements, e))
            .cloned()
            .collect()
    }

    fn is_reordered(&self) -> bool {
        if !self.ordered {
            return false;
        }
        let kept_now = self
            .elements
            .iter()
            .filter(|e| contains_ref(&self.snapshot, e));
        let kept_before = self
            .snapshot
            .iter()
            .filter(|e| contains_ref(&self.elements, e));
        !kept_now.zip(kept_before).all(|(a, b)| a.ptr_eq(b))
    }

    /// Changes since the last snapshot. Does not modify the collection.
    pub fn change(&self) -> CollectionChange {
        CollectionChange {
            inserted: self.insert_diff(),
            deleted: self.delete_diff(),
            reordered: self.is_reordered(),
        }
    }

    pub fn is_dirty(&self) -> bool {
        !self.change().is_empty()
    }

    pub fn snapshot(&self) -> &[EntityRef] {
        &self.snapshot
    }

    /// Accept the current membership as committed.
    pub fn take_snapshot(&mut self) {
        self.snapshot = self.elements.clone();
    }
}

impl Entity {
    /// Accept every collection's current membership as committed.
    pub fn snapshot_collections(&mut self) {
        for collection in self.collections_mut() {
            collection.take_snapshot();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{AssociationMetadata, FieldMetadata};
    use crate::types::SqlType;
    use std::collections::HashSet;

    fn tag_meta() -> Arc<EntityMetadata> {
        Arc::new(
            EntityMetadata::builder("Tag")
                .id(FieldMetadata::new("id", SqlType::BigInt))
                .field(FieldMetadata::new("label", SqlType::Text))
                .build()
                .unwrap(),
        )
    }

    fn post_meta() -> Arc<EntityMetadata> {
        Arc::new(
            EntityMetadata::builder("Post")
                .id(FieldMetadata::new("id", SqlType::BigInt))
                .field(FieldMetadata::new("title", SqlType::Text))
                .association(AssociationMetadata::many_to_one("pinned", "Tag"))
                .association(AssociationMetadata::many_to_many("tags", "Tag").ordered())
                .build()
                .unwrap(),
        )
    }

    fn tag(label: &str) -> EntityRef {
        EntityRef::new(Entity::new(tag_meta()).with("label", label).unwrap())
    }

    #[test]
    fn test_new_entity_is_blank() {
        let post = Entity::new(post_meta());
        assert_eq!(post.get("title"), Some(&Value::Null));
        assert!(post.identifier().is_none());
        assert!(post.reference("pinned").is_none());
        assert!(post.collection("tags").unwrap().is_empty());
    }

    #[test]
    fn test_set_checks_field_and_type() {
        let mut post = Entity::new(post_meta());
        post.set("title", "Hello").unwrap();
        assert!(post.set("missing", 1i64).is_err());
        assert!(matches!(post.set("id", "abc"), Err(Error::Type(_))));
        post.set("id", 7i64).unwrap();
        assert_eq!(post.identifier(), Some(Identifier::single(7i64)));
        post.clear_identifier();
        assert!(post.identifier().is_none());
    }

    #[test]
    fn test_set_reference_checks_target_type() {
        let mut post = Entity::new(post_meta());
        let other_post = EntityRef::new(Entity::new(post_meta()));
        assert!(post.set_reference("pinned", Some(other_post)).is_err());
        assert!(post.set_reference("tags", None).is_err());
        let t = tag("rust");
        post.set_reference("pinned", Some(t.clone())).unwrap();
        assert!(post.reference("pinned").unwrap().ptr_eq(&t));
    }

    #[test]
    fn test_identity_is_pointer_identity() {
        let a = tag("a");
        let b = a.clone();
        let c = tag("a");
        assert!(a.ptr_eq(&b));
        assert_eq!(a.object_id(), b.object_id());
        assert!(!a.ptr_eq(&c));
        assert_eq!(a.downgrade().object_id(), a.object_id());
        assert!(a.downgrade().upgrade().unwrap().ptr_eq(&a));
    }

    #[test]
    fn test_identifier_hash_and_eq() {
        let mut set = HashSet::new();
        set.insert(Identifier::new(vec![Value::BigInt(1), Value::Text("x".into())]));
        assert!(set.contains(&Identifier::new(vec![Value::BigInt(1), Value::Text("x".into())])));
        assert!(!set.contains(&Identifier::new(vec![Value::Int(1), Value::Text("x".into())])));
        assert_eq!(Identifier::single(3i64).to_string(), "3");
        assert_eq!(
            Identifier::new(vec![Value::BigInt(1), Value::BigInt(2)]).to_string(),
            "(1, 2)"
        );
    }

    #[test]
    fn test_collection_diffs() {
        let (a, b, c) = (tag("a"), tag("b"), tag("c"));
        let mut tags = Collection::new(false);
        tags.add(a.clone());
        tags.add(b.clone());
        assert!(!tags.add(a.clone()));
        tags.take_snapshot();
        assert!(!tags.is_dirty());

        tags.remove(&a);
        tags.add(c.clone());
        let change = tags.change();
        assert_eq!(change.inserted.len(), 1);
        assert!(change.inserted[0].ptr_eq(&c));
        assert_eq!(change.deleted.len(), 1);
        assert!(change.deleted[0].ptr_eq(&a));
        assert!(!change.reordered);
        // Computing the change leaves the snapshot alone
        assert_eq!(tags.snapshot().len(), 2);
    }

    #[test]
    fn test_unordered_collection_ignores_order() {
        let (a, b) = (tag("a"), tag("b"));
        let mut tags = Collection::new(false);
        tags.add(a.clone());
        tags.add(b.clone());
        tags.take_snapshot();
        tags.clear();
        tags.add(b);
        tags.add(a);
        assert!(!tags.is_dirty());
    }

    #[test]
    fn test_ordered_collection_detects_reorder() {
        let (a, b) = (tag("a"), tag("b"));
        let mut tags = Collection::new(true);
        tags.add(a.clone());
        tags.add(b.clone());
        tags.take_snapshot();
        tags.clear();
        tags.add(b);
        tags.add(a);
        let change = tags.change();
        assert!(change.inserted.is_empty() && change.deleted.is_empty());
        assert!(change.reordered);
    }

    #[test]
    fn test_debug_does_not_recurse_through_cycles() {
        let meta = Arc::new(
            EntityMetadata::builder("Node")
                .id(FieldMetadata::new("id", SqlType::BigInt))
                .association(AssociationMetadata::many_to_one("next", "Node"))
                .build()
                .unwrap(),
        );
        let a = EntityRef::new(Entity::new(Arc::clone(&meta)));
        let b = EntityRef::new(Entity::new(meta));
        a.write().set_reference("next", Some(b.clone())).unwrap();
        b.write().set_reference("next", Some(a.clone())).unwrap();
        let text = format!("{:?}", *a.read());
        assert!(text.contains("Node@"));
    }
}
