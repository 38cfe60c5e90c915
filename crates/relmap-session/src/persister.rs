//! Entity persisters: the write side of the unit of work.
//!
//! The unit of work decides *what* to write and in which order; an
//! [`EntityPersister`] decides *how*. [`SqlEntityPersister`] turns each
//! operation into parameterized SQL run through a [`DatabaseExecutor`].

use crate::change_set::{ChangeSet, FieldChange};
use asupersync::{Cx, Outcome};
use relmap_core::{
    AssociationKind, AssociationMetadata, CollectionChange, DatabaseExecutor, Dialect, Entity,
    EntityRef, EntityState, Error, IdGenerator, Identifier, JoinColumnMetadata, JoinTableMetadata,
    MappingError, MappingErrorKind, MetadataProvider, Value,
};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Writes single entities and collection changes to storage.
///
/// Calls are issued sequentially by the unit of work; each future is awaited
/// before the next operation starts.
pub trait EntityPersister: Send + Sync {
    /// Insert `entity`. Associations named in `deferred` must be written as
    /// NULL; the unit of work sets them with a later update.
    ///
    /// Returns the storage-generated identifier, if any.
    fn insert(
        &self,
        cx: &Cx,
        entity: &EntityRef,
        deferred: &[String],
    ) -> impl Future<Output = Outcome<Option<Identifier>, Error>> + Send;

    /// Write the fields listed in `changes`.
    fn update(
        &self,
        cx: &Cx,
        entity: &EntityRef,
        changes: &ChangeSet,
    ) -> impl Future<Output = Outcome<(), Error>> + Send;

    fn delete(&self, cx: &Cx, entity: &EntityRef)
    -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Apply membership changes of an owning to-many collection.
    fn update_collection(
        &self,
        _cx: &Cx,
        _owner: &EntityRef,
        _association: &str,
        _change: &CollectionChange,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        async { Outcome::Ok(()) }
    }
}

/// SQL text plus its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    fn new(sql: String, params: Vec<Value>) -> Self {
        Self { sql, params }
    }
}

/// Values of `columns` (join columns) read from the entity they reference.
fn referenced_values(target: &Entity, columns: &[JoinColumnMetadata]) -> Result<Vec<Value>, Error> {
    let metadata = target.metadata();
    columns
        .iter()
        .map(|column| {
            let field = metadata
                .field_for_column(&column.referenced_column_name)
                .ok_or_else(|| {
                    Error::from(MappingError::new(
                        MappingErrorKind::UnknownField,
                        metadata.name(),
                        format!(
                            "join column '{}' references unknown column '{}'",
                            column.name, column.referenced_column_name
                        ),
                    ))
                })?;
            Ok(target.get(&field.name).cloned().unwrap_or(Value::Null))
        })
        .collect()
}

/// Run `f` on `other`, reusing `owner`'s guard when both are the same instance.
fn with_entity<T>(
    owner_ref: &EntityRef,
    owner: &Entity,
    other: &EntityRef,
    f: impl FnOnce(&Entity) -> T,
) -> T {
    if other.ptr_eq(owner_ref) {
        f(owner)
    } else {
        f(&other.read())
    }
}

/// Foreign key values of a to-one association pointing at `target`.
fn foreign_key_values(
    owner_ref: &EntityRef,
    owner: &Entity,
    assoc: &AssociationMetadata,
    target: Option<&EntityRef>,
) -> Result<Vec<Value>, Error> {
    match target {
        Some(target) => with_entity(owner_ref, owner, target, |t| {
            referenced_values(t, &assoc.join_columns)
        }),
        None => Ok(vec![Value::Null; assoc.join_columns.len()]),
    }
}

fn require_identifier(entity: &Entity, operation: &'static str) -> Result<Identifier, Error> {
    entity.identifier().ok_or_else(|| {
        Error::invalid_state(
            entity.entity_type(),
            EntityState::Managed,
            operation,
            "entity has no identifier",
        )
    })
}

/// Builds SQL for single-entity writes.
///
/// Deleting the inverse side of a many-to-many needs the owning side's join
/// table, which is looked up through the metadata provider.
#[derive(Clone)]
pub struct StatementBuilder {
    dialect: Dialect,
    metadata: Option<Arc<dyn MetadataProvider>>,
}

impl fmt::Debug for StatementBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatementBuilder")
            .field("dialect", &self.dialect)
            .field("has_metadata", &self.metadata.is_some())
            .finish()
    }
}

impl StatementBuilder {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            metadata: None,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Arc<dyn MetadataProvider>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Join table of the owning side of an inverse many-to-many, read from
    /// the target entity's metadata.
    fn inverse_join_table(
        &self,
        entity_type: &str,
        assoc: &AssociationMetadata,
        mapped_by: &str,
    ) -> Result<JoinTableMetadata, Error> {
        let provider = self.metadata.as_ref().ok_or_else(|| {
            Error::from(MappingError::new(
                MappingErrorKind::Invalid,
                entity_type,
                format!(
                    "deleting through inverse association '{}' requires a metadata provider",
                    assoc.name
                ),
            ))
        })?;
        let target = provider.metadata_for(&assoc.target_entity)?;
        let owning = target.require_association(mapped_by)?;
        owning.join_table.clone().ok_or_else(|| {
            Error::from(MappingError::new(
                MappingErrorKind::Invalid,
                entity_type,
                format!(
                    "association '{}' is mapped by '{}.{}', which has no join table",
                    assoc.name,
                    target.name(),
                    mapped_by
                ),
            ))
        })
    }

    fn join_table_delete(
        &self,
        entity: &Entity,
        join_table: &JoinTableMetadata,
        columns: &[JoinColumnMetadata],
    ) -> Result<Statement, Error> {
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        let sql = format!(
            "DELETE FROM {} WHERE {}",
            self.dialect
                .quote_table(join_table.schema.as_deref(), &join_table.name),
            self.where_clause(&names, 1)
        );
        Ok(Statement::new(sql, referenced_values(entity, columns)?))
    }

    fn table(&self, entity: &Entity) -> String {
        let metadata = entity.metadata();
        self.dialect
            .quote_table(metadata.schema(), metadata.table_name())
    }

    fn where_clause(&self, columns: &[&str], first_param: usize) -> String {
        columns
            .iter()
            .enumerate()
            .map(|(i, col)| {
                format!(
                    "{} = {}",
                    self.dialect.quote_identifier(col),
                    self.dialect.placeholder(first_param + i)
                )
            })
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    /// INSERT for `entity`; the flag tells whether storage generates the identifier.
    pub fn insert(&self, entity_ref: &EntityRef, deferred: &[String]) -> Result<(Statement, bool), Error> {
        let guard = entity_ref.read();
        let entity: &Entity = &guard;
        let metadata = entity.metadata();
        let generated = metadata.id_generator() == IdGenerator::Auto && entity.identifier().is_none();
        if generated && metadata.identifier().len() != 1 {
            return Err(MappingError::new(
                MappingErrorKind::InvalidIdentifier,
                metadata.name(),
                "generated identifiers require a single identifier column",
            )
            .into());
        }

        let mut columns = Vec::new();
        let mut params = Vec::new();
        for field in metadata.fields() {
            if generated && metadata.is_identifier(&field.name) {
                continue;
            }
            columns.push(field.column_name.clone());
            params.push(entity.get(&field.name).cloned().unwrap_or(Value::Null));
        }
        for assoc in metadata.owning_to_one() {
            let values = if deferred.contains(&assoc.name) {
                vec![Value::Null; assoc.join_columns.len()]
            } else {
                foreign_key_values(entity_ref, entity, assoc, entity.reference(&assoc.name))?
            };
            for (column, value) in assoc.join_columns.iter().zip(values) {
                columns.push(column.name.clone());
                params.push(value);
            }
        }
        if let Some(discriminator) = metadata.discriminator() {
            columns.push(discriminator.column.clone());
            params.push(Value::Text(discriminator.value.clone()));
        }

        let table = self.table(entity);
        let sql = if columns.is_empty() {
            match self.dialect {
                Dialect::Mysql => format!("INSERT INTO {table} () VALUES ()"),
                Dialect::Postgres | Dialect::Sqlite => format!("INSERT INTO {table} DEFAULT VALUES"),
            }
        } else {
            let col_list = columns
                .iter()
                .map(|c| self.dialect.quote_identifier(c))
                .collect::<Vec<_>>()
                .join(", ");
            let placeholders = (1..=params.len())
                .map(|i| self.dialect.placeholder(i))
                .collect::<Vec<_>>()
                .join(", ");
            format!("INSERT INTO {table} ({col_list}) VALUES ({placeholders})")
        };
        Ok((Statement::new(sql, params), generated))
    }

    /// UPDATE of the changed columns; `None` when nothing maps to a column.
    pub fn update(&self, entity_ref: &EntityRef, changes: &ChangeSet) -> Result<Option<Statement>, Error> {
        let guard = entity_ref.read();
        let entity: &Entity = &guard;
        let metadata = entity.metadata();
        let mut assignments: Vec<(String, Value)> = Vec::new();
        // Identifier changes are matched against the old key
        let mut key = require_identifier(entity, "update")?.into_values();

        for (name, change) in changes.iter() {
            match change {
                FieldChange::Scalar { old, new } => {
                    let field = metadata.require_field(name)?;
                    if let Some(pos) = metadata.identifier().iter().position(|f| f == name) {
                        key[pos] = old.clone();
                    }
                    assignments.push((field.column_name.clone(), new.clone()));
                }
                FieldChange::Reference { new, .. } => {
                    let assoc = metadata.require_association(name)?;
                    let values = foreign_key_values(entity_ref, entity, assoc, new.as_ref())?;
                    for (column, value) in assoc.join_columns.iter().zip(values) {
                        assignments.push((column.name.clone(), value));
                    }
                }
            }
        }
        if assignments.is_empty() {
            return Ok(None);
        }

        let set_clause = assignments
            .iter()
            .enumerate()
            .map(|(i, (col, _))| {
                format!(
                    "{} = {}",
                    self.dialect.quote_identifier(col),
                    self.dialect.placeholder(i + 1)
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        let id_columns = metadata.identifier_columns();
        let where_clause = self.where_clause(&id_columns, assignments.len() + 1);

        let mut params: Vec<Value> = assignments.into_iter().map(|(_, v)| v).collect();
        params.extend(key);
        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            self.table(entity),
            set_clause,
            where_clause
        );
        Ok(Some(Statement::new(sql, params)))
    }

    /// Join-table cleanup for both sides of many-to-many associations, then
    /// the row DELETE.
    pub fn delete(&self, entity_ref: &EntityRef) -> Result<Vec<Statement>, Error> {
        let guard = entity_ref.read();
        let entity: &Entity = &guard;
        let metadata = entity.metadata();
        let identifier = require_identifier(entity, "delete")?;
        let mut statements = Vec::new();

        for assoc in metadata.associations() {
            if assoc.kind != AssociationKind::ManyToMany {
                continue;
            }
            match (&assoc.join_table, &assoc.mapped_by) {
                (Some(join_table), None) => {
                    statements.push(self.join_table_delete(
                        entity,
                        join_table,
                        join_table.join_columns(),
                    )?);
                }
                (_, Some(mapped_by)) => {
                    let join_table = self.inverse_join_table(metadata.name(), assoc, mapped_by)?;
                    statements.push(self.join_table_delete(
                        entity,
                        &join_table,
                        join_table.inverse_join_columns(),
                    )?);
                }
                (None, None) => {}
            }
        }

        let id_columns = metadata.identifier_columns();
        let sql = format!(
            "DELETE FROM {} WHERE {}",
            self.table(entity),
            self.where_clause(&id_columns, 1)
        );
        statements.push(Statement::new(sql, identifier.into_values()));
        Ok(statements)
    }

    /// Join-table DELETEs for removed elements, then INSERTs for added ones.
    pub fn collection_update(
        &self,
        owner_ref: &EntityRef,
        association: &str,
        change: &CollectionChange,
    ) -> Result<Vec<Statement>, Error> {
        let guard = owner_ref.read();
        let owner: &Entity = &guard;
        let metadata = owner.metadata();
        let assoc = metadata.require_association(association)?;
        let Some(join_table) = assoc.join_table.as_ref().filter(|_| assoc.is_owning_side()) else {
            return Ok(Vec::new());
        };
        let table = self
            .dialect
            .quote_table(join_table.schema.as_deref(), &join_table.name);
        let owner_values = referenced_values(owner, join_table.join_columns())?;
        let columns: Vec<&str> = join_table
            .join_columns()
            .iter()
            .chain(join_table.inverse_join_columns())
            .map(|c| c.name.as_str())
            .collect();

        let mut statements = Vec::new();
        for element in &change.deleted {
            let mut params = owner_values.clone();
            params.extend(with_entity(owner_ref, owner, element, |e| {
                referenced_values(e, join_table.inverse_join_columns())
            })?);
            let sql = format!(
                "DELETE FROM {} WHERE {}",
                table,
                self.where_clause(&columns, 1)
            );
            statements.push(Statement::new(sql, params));
        }
        for element in &change.inserted {
            let mut params = owner_values.clone();
            params.extend(with_entity(owner_ref, owner, element, |e| {
                referenced_values(e, join_table.inverse_join_columns())
            })?);
            let col_list = columns
                .iter()
                .map(|c| self.dialect.quote_identifier(c))
                .collect::<Vec<_>>()
                .join(", ");
            let placeholders = (1..=params.len())
                .map(|i| self.dialect.placeholder(i))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!("INSERT INTO {table} ({col_list}) VALUES ({placeholders})");
            statements.push(Statement::new(sql, params));
        }
        Ok(statements)
    }
}

/// Persists entities as SQL through a [`DatabaseExecutor`].
#[derive(Debug)]
pub struct SqlEntityPersister<E> {
    executor: Arc<E>,
    builder: StatementBuilder,
}

impl<E: DatabaseExecutor> SqlEntityPersister<E> {
    pub fn new(executor: Arc<E>) -> Self {
        let builder = StatementBuilder::new(executor.dialect());
        Self { executor, builder }
    }

    /// Resolve inverse many-to-many join tables through `metadata` on delete.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Arc<dyn MetadataProvider>) -> Self {
        self.builder = self.builder.with_metadata(metadata);
        self
    }

    pub fn executor(&self) -> &Arc<E> {
        &self.executor
    }

    async fn execute_all(&self, cx: &Cx, statements: Vec<Statement>) -> Outcome<(), Error> {
        for statement in statements {
            tracing::debug!(sql = %statement.sql, params = statement.params.len(), "Executing statement");
            match self
                .executor
                .execute(cx, &statement.sql, &statement.params)
                .await
            {
                Outcome::Ok(_) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(())
    }
}

impl<E: DatabaseExecutor> EntityPersister for SqlEntityPersister<E> {
    fn insert(
        &self,
        cx: &Cx,
        entity: &EntityRef,
        deferred: &[String],
    ) -> impl Future<Output = Outcome<Option<Identifier>, Error>> + Send {
        let built = self.builder.insert(entity, deferred);
        async move {
            let (statement, generated) = match built {
                Ok(built) => built,
                Err(e) => return Outcome::Err(e),
            };
            tracing::debug!(sql = %statement.sql, generated, "Executing insert");
            if generated {
                match self
                    .executor
                    .insert(cx, &statement.sql, &statement.params)
                    .await
                {
                    Outcome::Ok(id) => Outcome::Ok(Some(Identifier::single(id))),
                    Outcome::Err(e) => Outcome::Err(e),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                }
            } else {
                match self
                    .executor
                    .execute(cx, &statement.sql, &statement.params)
                    .await
                {
                    Outcome::Ok(_) => Outcome::Ok(None),
                    Outcome::Err(e) => Outcome::Err(e),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                }
            }
        }
    }

    fn update(
        &self,
        cx: &Cx,
        entity: &EntityRef,
        changes: &ChangeSet,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let built = self.builder.update(entity, changes);
        async move {
            match built {
                Ok(Some(statement)) => self.execute_all(cx, vec![statement]).await,
                Ok(None) => Outcome::Ok(()),
                Err(e) => Outcome::Err(e),
            }
        }
    }

    fn delete(
        &self,
        cx: &Cx,
        entity: &EntityRef,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let built = self.builder.delete(entity);
        async move {
            match built {
                Ok(statements) => self.execute_all(cx, statements).await,
                Err(e) => Outcome::Err(e),
            }
        }
    }

    fn update_collection(
        &self,
        cx: &Cx,
        owner: &EntityRef,
        association: &str,
        change: &CollectionChange,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let built = self.builder.collection_update(owner, association, change);
        async move {
            match built {
                Ok(statements) => self.execute_all(cx, statements).await,
                Err(e) => Outcome::Err(e),
            }
        }
    }
}
