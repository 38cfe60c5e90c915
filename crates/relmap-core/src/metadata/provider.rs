//! Metadata lookup by entity name.

use super::entity::EntityMetadata;
use crate::cache::{CacheProvider, fetch_json, save_json};
use crate::error::{Error, MappingError, MappingErrorKind, Result};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Resolves entity type names to their metadata.
///
/// Lookups are deterministic: the same name always yields equal metadata.
pub trait MetadataProvider: Send + Sync {
    fn metadata_for(&self, entity: &str) -> Result<Arc<EntityMetadata>>;

    /// Names of every entity this provider can resolve, if enumerable.
    fn entity_names(&self) -> Vec<String> {
        Vec::new()
    }
}

impl<P: MetadataProvider + ?Sized> MetadataProvider for Arc<P> {
    fn metadata_for(&self, entity: &str) -> Result<Arc<EntityMetadata>> {
        (**self).metadata_for(entity)
    }

    fn entity_names(&self) -> Vec<String> {
        (**self).entity_names()
    }
}

fn unknown_entity(entity: &str) -> Error {
    MappingError::new(
        MappingErrorKind::UnknownEntity,
        entity,
        format!("no metadata registered for entity '{entity}'"),
    )
    .into()
}

/// A fixed set of entity metadata, validated as a whole when built.
#[derive(Debug, Clone, Default)]
pub struct MetadataRegistry {
    entities: HashMap<String, Arc<EntityMetadata>>,
}

impl MetadataRegistry {
    pub fn builder() -> MetadataRegistryBuilder {
        MetadataRegistryBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn get(&self, entity: &str) -> Option<&Arc<EntityMetadata>> {
        self.entities.get(entity)
    }
}

impl MetadataProvider for MetadataRegistry {
    fn metadata_for(&self, entity: &str) -> Result<Arc<EntityMetadata>> {
        self.entities
            .get(entity)
            .cloned()
            .ok_or_else(|| unknown_entity(entity))
    }

    fn entity_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entities.keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Debug, Default)]
pub struct MetadataRegistryBuilder {
    entities: Vec<EntityMetadata>,
}

impl MetadataRegistryBuilder {
    pub fn entity(mut self, metadata: EntityMetadata) -> Self {
        self.entities.push(metadata);
        self
    }

    /// Cross-check associations between entities and freeze the registry.
    pub fn build(self) -> Result<MetadataRegistry> {
        let mut entities = HashMap::with_capacity(self.entities.len());
        for metadata in self.entities {
            let name = metadata.name().to_string();
            if entities.contains_key(&name) {
                return Err(MappingError::new(
                    MappingErrorKind::DuplicateField,
                    &name,
                    format!("entity '{name}' registered twice"),
                )
                .into());
            }
            entities.insert(name, Arc::new(metadata));
        }

        for metadata in entities.values() {
            for assoc in metadata.associations() {
                let target = entities
                    .get(&assoc.target_entity)
                    .ok_or_else(|| {
                        Error::from(MappingError::new(
                            MappingErrorKind::UnknownEntity,
                            metadata.name(),
                            format!(
                                "association '{}.{}' targets unknown entity '{}'",
                                metadata.name(),
                                assoc.name,
                                assoc.target_entity
                            ),
                        ))
                    })?;
                let target_ids = target.identifier().len();
                if assoc.has_join_columns() && assoc.join_columns.len() != target_ids {
                    return Err(MappingError::new(
                        MappingErrorKind::JoinColumnMismatch,
                        metadata.name(),
                        format!(
                            "association '{}.{}' declares {} join column(s) but '{}' has {} identifier column(s)",
                            metadata.name(),
                            assoc.name,
                            assoc.join_columns.len(),
                            target.name(),
                            target_ids
                        ),
                    )
                    .into());
                }
                if let Some(join_table) = &assoc.join_table {
                    join_table.validate_inverse_join_columns(
                        metadata.name(),
                        target.name(),
                        target_ids,
                    )?;
                }
                if let Some(mapped_by) = &assoc.mapped_by {
                    let owning = target.association(mapped_by).ok_or_else(|| {
                        Error::unknown_field(target.name(), mapped_by)
                    })?;
                    if owning.target_entity != metadata.name() {
                        return Err(MappingError::new(
                            MappingErrorKind::Invalid,
                            metadata.name(),
                            format!(
                                "'{}.{}' is mapped by '{}.{}', which targets '{}'",
                                metadata.name(),
                                assoc.name,
                                target.name(),
                                mapped_by,
                                owning.target_entity
                            ),
                        )
                        .into());
                    }
                }
            }
        }

        tracing::debug!(entities = entities.len(), "Metadata registry built");
        Ok(MetadataRegistry { entities })
    }
}

/// Serves metadata from a [`CacheProvider`] before consulting the inner provider.
///
/// Decoded metadata is memoized so every lookup of a type returns the same `Arc`.
pub struct CachedMetadataProvider<P> {
    inner: P,
    cache: Arc<dyn CacheProvider>,
    loaded: RwLock<HashMap<String, Arc<EntityMetadata>>>,
}

impl<P: MetadataProvider> CachedMetadataProvider<P> {
    pub fn new(inner: P, cache: Arc<dyn CacheProvider>) -> Self {
        Self {
            inner,
            cache,
            loaded: RwLock::new(HashMap::new()),
        }
    }

    fn cache_key(entity: &str) -> String {
        format!("metadata:{entity}")
    }
}

impl<P: MetadataProvider> MetadataProvider for CachedMetadataProvider<P> {
    fn metadata_for(&self, entity: &str) -> Result<Arc<EntityMetadata>> {
        {
            let loaded = self.loaded.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(metadata) = loaded.get(entity) {
                return Ok(Arc::clone(metadata));
            }
        }

        let key = Self::cache_key(entity);
        let metadata = match fetch_json::<EntityMetadata>(self.cache.as_ref(), &key) {
            Some(metadata) if metadata.name() == entity => {
                tracing::trace!(entity = entity, "Metadata cache hit");
                Arc::new(metadata)
            }
            _ => {
                let metadata = self.inner.metadata_for(entity)?;
                save_json(self.cache.as_ref(), &key, metadata.as_ref());
                metadata
            }
        };

        let mut loaded = self.loaded.write().unwrap_or_else(PoisonError::into_inner);
        Ok(Arc::clone(
            loaded.entry(entity.to_string()).or_insert(metadata),
        ))
    }

    fn entity_names(&self) -> Vec<String> {
        self.inner.entity_names()
    }
}
