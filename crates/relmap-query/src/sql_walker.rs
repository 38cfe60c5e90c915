//! Terminal walker translating a parsed statement into SQL.
//!
//! Every table gets a deterministic alias (`t0_`, `t1_`, ... in declaration
//! order, link tables of many-to-many joins before their target) and every
//! selected column a result alias (`c0_`, `c1_`, ...). Values never reach the
//! SQL text: literals and parameters become positional placeholders whose
//! sources are returned alongside the SQL, in placeholder order.

use crate::ast::{
    Condition, DeleteStatement, Expression, Join, Literal, ParameterRef, PathExpression,
    RangeDeclaration, ScalarFunction, SelectItem, SelectStatement, SortDirection, Statement,
    UpdateStatement,
};
use crate::components::{COUNT_HINT, QueryComponents};
use crate::output::{
    EntityResult, FieldResult, ParameterSource, ResultSetMapping, ScalarResult, SqlOutput,
};
use crate::walker::{ConstructWalker, TreeWalker, WalkerInput};
use relmap_core::{
    AssociationMetadata, Dialect, DiscriminatorMetadata, EntityMetadata, Error,
    JoinColumnMetadata, JoinTableMetadata, MappingError, MappingErrorKind, QuerySyntaxError,
    Value,
};
use std::collections::HashMap;

fn unresolved(message: impl Into<String>, position: usize, token: impl Into<String>) -> Error {
    QuerySyntaxError::at_token(message, position, token).into()
}

/// How a joined association reaches its target table.
enum JoinPath<'m> {
    /// Foreign key on the parent's table.
    Owning(&'m [JoinColumnMetadata]),
    /// Foreign key on the joined table.
    Inverse(&'m [JoinColumnMetadata]),
    /// Through a link table. `inverse` is set when the parent is the
    /// association's target rather than its owner.
    LinkTable {
        table: &'m JoinTableMetadata,
        inverse: bool,
    },
}

fn resolve_join_path<'m>(
    parent: &'m EntityMetadata,
    association: &'m AssociationMetadata,
    target: &'m EntityMetadata,
) -> Result<JoinPath<'m>, Error> {
    if association.has_join_columns() {
        return Ok(JoinPath::Owning(&association.join_columns));
    }
    if let Some(table) = &association.join_table {
        return Ok(JoinPath::LinkTable {
            table,
            inverse: false,
        });
    }
    let owning = association
        .mapped_by
        .as_deref()
        .and_then(|mapped_by| target.association(mapped_by));
    match owning {
        Some(owning) if owning.has_join_columns() => Ok(JoinPath::Inverse(&owning.join_columns)),
        Some(owning) => match &owning.join_table {
            Some(table) => Ok(JoinPath::LinkTable {
                table,
                inverse: true,
            }),
            None => Err(invalid_join(parent, association)),
        },
        None => Err(invalid_join(parent, association)),
    }
}

fn invalid_join(parent: &EntityMetadata, association: &AssociationMetadata) -> Error {
    MappingError::new(
        MappingErrorKind::Invalid,
        parent.name(),
        format!(
            "association '{}.{}' has neither join columns nor a join table",
            parent.name(),
            association.name
        ),
    )
    .into()
}

/// Generates SELECT, UPDATE and DELETE SQL.
#[derive(Debug)]
pub struct SqlWalker {
    dialect: Dialect,
    /// Qualify columns with table aliases; off for UPDATE and DELETE.
    qualify: bool,
    table_aliases: HashMap<String, String>,
    link_table_aliases: HashMap<String, String>,
    table_count: usize,
    column_count: usize,
    result_variables: HashMap<String, String>,
    parameters: Vec<ParameterSource>,
    mapping: ResultSetMapping,
}

impl SqlWalker {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            qualify: true,
            table_aliases: HashMap::new(),
            link_table_aliases: HashMap::new(),
            table_count: 0,
            column_count: 0,
            result_variables: HashMap::new(),
            parameters: Vec::new(),
            mapping: ResultSetMapping::default(),
        }
    }

    fn reset(&mut self) {
        *self = Self::new(self.dialect);
    }

    fn quote(&self, identifier: &str) -> String {
        self.dialect.quote_identifier(identifier)
    }

    fn table(&self, metadata: &EntityMetadata) -> String {
        self.dialect
            .quote_table(metadata.schema(), metadata.table_name())
    }

    fn next_table_alias(&mut self) -> String {
        let alias = format!("t{}_", self.table_count);
        self.table_count += 1;
        alias
    }

    fn next_column_alias(&mut self) -> String {
        let alias = format!("c{}_", self.column_count);
        self.column_count += 1;
        alias
    }

    fn table_alias(&self, alias: &str, position: usize) -> Result<&str, Error> {
        self.table_aliases
            .get(alias)
            .map(String::as_str)
            .ok_or_else(|| unresolved(format!("unknown alias '{alias}'"), position, alias))
    }

    fn column(&self, alias: &str, column: &str, position: usize) -> Result<String, Error> {
        if self.qualify {
            Ok(format!(
                "{}.{}",
                self.table_alias(alias, position)?,
                self.quote(column)
            ))
        } else {
            Ok(self.quote(column))
        }
    }

    fn bind(&mut self, source: ParameterSource) -> String {
        self.parameters.push(source);
        self.dialect.placeholder(self.parameters.len())
    }

    /// Allocate table aliases for one FROM declaration and its joins.
    fn allocate_aliases(
        &mut self,
        declaration: &RangeDeclaration,
        components: &QueryComponents,
    ) -> Result<(), Error> {
        let alias = self.next_table_alias();
        self.table_aliases.insert(declaration.alias.clone(), alias);
        for join in &declaration.joins {
            let (parent, association, target) = join_parts(join, components)?;
            if matches!(
                resolve_join_path(parent, association, target)?,
                JoinPath::LinkTable { .. }
            ) {
                let link = self.next_table_alias();
                self.link_table_aliases.insert(join.alias.clone(), link);
            }
            let alias = self.next_table_alias();
            self.table_aliases.insert(join.alias.clone(), alias);
        }
        Ok(())
    }

    fn discriminator_restriction(
        &mut self,
        alias: &str,
        discriminator: &DiscriminatorMetadata,
        position: usize,
    ) -> Result<String, Error> {
        let column = self.column(alias, &discriminator.column, position)?;
        let placeholders: Vec<String> = discriminator
            .family_values
            .iter()
            .map(|value| self.bind(ParameterSource::Literal(Value::Text(value.clone()))))
            .collect();
        Ok(format!("{column} IN ({})", placeholders.join(", ")))
    }

    // ------------------------------------------------------------------
    // SELECT
    // ------------------------------------------------------------------

    fn walk_select(
        &mut self,
        select: &SelectStatement,
        components: &QueryComponents,
    ) -> Result<String, Error> {
        for declaration in &select.from {
            self.allocate_aliases(declaration, components)?;
        }
        let counting = components.hint(COUNT_HINT);

        let mut sql = String::from("SELECT ");
        if let Some(alias) = counting {
            sql.push_str(&self.count_item(alias, components)?);
        } else {
            if select.distinct {
                sql.push_str("DISTINCT ");
            }
            let mut items = Vec::with_capacity(select.items.len());
            for (index, item) in select.items.iter().enumerate() {
                items.push(self.select_item(item, index, components)?);
            }
            sql.push_str(&items.join(", "));
        }

        sql.push_str(" FROM ");
        let mut declarations = Vec::with_capacity(select.from.len());
        for declaration in &select.from {
            declarations.push(self.from_declaration(declaration, components)?);
        }
        sql.push_str(&declarations.join(", "));

        let roots: Vec<(&str, usize)> = select
            .from
            .iter()
            .map(|d| (d.alias.as_str(), d.position))
            .collect();
        self.push_where(&mut sql, select.where_clause.as_ref(), &roots, components)?;

        if !select.group_by.is_empty() {
            let mut groups = Vec::with_capacity(select.group_by.len());
            for expression in &select.group_by {
                groups.push(self.expression(expression, components)?);
            }
            sql.push_str(" GROUP BY ");
            sql.push_str(&groups.join(", "));
        }

        if let Some(having) = &select.having {
            sql.push_str(" HAVING ");
            sql.push_str(&self.condition(having, false, components)?);
        }

        // Ordering is meaningless for a count and rejected by some databases
        if counting.is_none() && !select.order_by.is_empty() {
            let mut orders = Vec::with_capacity(select.order_by.len());
            for item in &select.order_by {
                let direction = match item.direction {
                    SortDirection::Asc => "ASC",
                    SortDirection::Desc => "DESC",
                };
                orders.push(format!(
                    "{} {direction}",
                    self.expression(&item.expression, components)?
                ));
            }
            sql.push_str(" ORDER BY ");
            sql.push_str(&orders.join(", "));
        }
        Ok(sql)
    }

    fn count_item(&mut self, alias: &str, components: &QueryComponents) -> Result<String, Error> {
        let component = components
            .get(alias)
            .ok_or_else(|| unresolved(format!("unknown alias '{alias}'"), 0, alias))?;
        let columns = component.metadata.identifier_columns();
        let [id] = columns.as_slice() else {
            return Err(unresolved(
                format!(
                    "cannot count '{}': composite identifiers are not supported",
                    component.metadata.name()
                ),
                component.position,
                alias,
            ));
        };
        let id = self.column(alias, id, component.position)?;
        let column = self.next_column_alias();
        self.mapping.scalars.push(ScalarResult {
            column: column.clone(),
            name: "count".to_string(),
        });
        Ok(format!("COUNT(DISTINCT {id}) AS {column}"))
    }

    fn select_item(
        &mut self,
        item: &SelectItem,
        index: usize,
        components: &QueryComponents,
    ) -> Result<String, Error> {
        if let Expression::Path(PathExpression {
            alias, field: None, ..
        }) = &item.expression
        {
            if let Some(component) = components.get(alias) {
                let table = self.table_alias(alias, item.position)?.to_string();
                let metadata = component.metadata.clone();
                let mut columns = Vec::with_capacity(metadata.fields().len());
                let mut fields = Vec::with_capacity(metadata.fields().len());
                for field in metadata.fields() {
                    let column = self.next_column_alias();
                    columns.push(format!(
                        "{table}.{} AS {column}",
                        self.quote(&field.column_name)
                    ));
                    fields.push(FieldResult {
                        column,
                        field: field.name.clone(),
                    });
                }
                self.mapping.entities.push(EntityResult {
                    alias: alias.clone(),
                    entity: metadata.name().to_string(),
                    fields,
                });
                return Ok(columns.join(", "));
            }
        }

        let expression = self.expression(&item.expression, components)?;
        let column = self.next_column_alias();
        let name = item
            .alias
            .clone()
            .unwrap_or_else(|| format!("sclr{index}"));
        if item.alias.is_some() {
            self.result_variables.insert(name.clone(), column.clone());
        }
        self.mapping.scalars.push(ScalarResult {
            column: column.clone(),
            name,
        });
        Ok(format!("{expression} AS {column}"))
    }

    fn from_declaration(
        &mut self,
        declaration: &RangeDeclaration,
        components: &QueryComponents,
    ) -> Result<String, Error> {
        let component = components.get(&declaration.alias).ok_or_else(|| {
            unresolved(
                format!("unknown alias '{}'", declaration.alias),
                declaration.position,
                declaration.alias.as_str(),
            )
        })?;
        let mut sql = format!(
            "{} {}",
            self.table(&component.metadata),
            self.table_alias(&declaration.alias, declaration.position)?
        );
        for join in &declaration.joins {
            sql.push_str(&self.join(join, components)?);
        }
        Ok(sql)
    }

    fn join(&mut self, join: &Join, components: &QueryComponents) -> Result<String, Error> {
        let (parent, association, target) = join_parts(join, components)?;
        let parent_alias = self.table_alias(&join.path.alias, join.position)?.to_string();
        let target_alias = self.table_alias(&join.alias, join.position)?.to_string();
        let keyword = join.kind.as_sql();

        let mut sql = String::new();
        let mut on: Vec<String> = match resolve_join_path(parent, association, target)? {
            JoinPath::Owning(columns) => columns
                .iter()
                .map(|c| {
                    format!(
                        "{parent_alias}.{} = {target_alias}.{}",
                        self.quote(&c.name),
                        self.quote(&c.referenced_column_name)
                    )
                })
                .collect(),
            JoinPath::Inverse(columns) => columns
                .iter()
                .map(|c| {
                    format!(
                        "{target_alias}.{} = {parent_alias}.{}",
                        self.quote(&c.name),
                        self.quote(&c.referenced_column_name)
                    )
                })
                .collect(),
            JoinPath::LinkTable { table, inverse } => {
                let link_alias = self
                    .link_table_aliases
                    .get(&join.alias)
                    .cloned()
                    .ok_or_else(|| {
                        unresolved(
                            format!("no link table alias for '{}'", join.alias),
                            join.position,
                            join.alias.as_str(),
                        )
                    })?;
                // Join columns reference the owner, inverse join columns the target
                let (to_parent, to_target) = if inverse {
                    (table.inverse_join_columns(), table.join_columns())
                } else {
                    (table.join_columns(), table.inverse_join_columns())
                };
                let link_on: Vec<String> = to_parent
                    .iter()
                    .map(|c| {
                        format!(
                            "{link_alias}.{} = {parent_alias}.{}",
                            self.quote(&c.name),
                            self.quote(&c.referenced_column_name)
                        )
                    })
                    .collect();
                sql.push_str(&format!(
                    " {keyword} {} {link_alias} ON {}",
                    self.dialect
                        .quote_table(table.schema.as_deref(), &table.name),
                    link_on.join(" AND ")
                ));
                to_target
                    .iter()
                    .map(|c| {
                        format!(
                            "{target_alias}.{} = {link_alias}.{}",
                            self.quote(&c.referenced_column_name),
                            self.quote(&c.name)
                        )
                    })
                    .collect()
            }
        };

        if let Some(condition) = &join.condition {
            on.push(self.condition(condition, true, components)?);
        }
        if let Some(discriminator) = target.discriminator() {
            on.push(self.discriminator_restriction(&join.alias, discriminator, join.position)?);
        }
        sql.push_str(&format!(
            " {keyword} {} {target_alias} ON {}",
            self.table(target),
            on.join(" AND ")
        ));
        Ok(sql)
    }

    /// Append the WHERE clause, restricting every root with a discriminator.
    fn push_where(
        &mut self,
        sql: &mut String,
        condition: Option<&Condition>,
        roots: &[(&str, usize)],
        components: &QueryComponents,
    ) -> Result<(), Error> {
        let restricted: Vec<(&str, usize, DiscriminatorMetadata)> = roots
            .iter()
            .filter_map(|&(alias, position)| {
                components
                    .get(alias)
                    .and_then(|c| c.metadata.discriminator().cloned())
                    .map(|d| (alias, position, d))
            })
            .collect();

        let mut restrictions = Vec::new();
        if let Some(condition) = condition {
            restrictions.push(self.condition(condition, !restricted.is_empty(), components)?);
        }
        for (alias, position, discriminator) in &restricted {
            restrictions.push(self.discriminator_restriction(alias, discriminator, *position)?);
        }
        if !restrictions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&restrictions.join(" AND "));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // UPDATE / DELETE
    // ------------------------------------------------------------------

    fn root_metadata<'c>(
        components: &'c QueryComponents,
        alias: &str,
        position: usize,
    ) -> Result<&'c EntityMetadata, Error> {
        components
            .get(alias)
            .map(|c| c.metadata.as_ref())
            .ok_or_else(|| unresolved(format!("unknown alias '{alias}'"), position, alias))
    }

    fn walk_update(
        &mut self,
        update: &UpdateStatement,
        components: &QueryComponents,
    ) -> Result<String, Error> {
        self.qualify = false;
        let metadata = Self::root_metadata(components, &update.alias, update.position)?;
        let mut assignments = Vec::with_capacity(update.assignments.len());
        for assignment in &update.assignments {
            let column = self.path(&assignment.path, components)?;
            let value = self.expression(&assignment.value, components)?;
            assignments.push(format!("{column} = {value}"));
        }
        let mut sql = format!(
            "UPDATE {} SET {}",
            self.table(metadata),
            assignments.join(", ")
        );
        self.push_where(
            &mut sql,
            update.where_clause.as_ref(),
            &[(update.alias.as_str(), update.position)],
            components,
        )?;
        Ok(sql)
    }

    fn walk_delete(
        &mut self,
        delete: &DeleteStatement,
        components: &QueryComponents,
    ) -> Result<String, Error> {
        self.qualify = false;
        let metadata = Self::root_metadata(components, &delete.alias, delete.position)?;
        let mut sql = format!("DELETE FROM {}", self.table(metadata));
        self.push_where(
            &mut sql,
            delete.where_clause.as_ref(),
            &[(delete.alias.as_str(), delete.position)],
            components,
        )?;
        Ok(sql)
    }

    // ------------------------------------------------------------------
    // Expressions and conditions
    // ------------------------------------------------------------------

    fn path(&self, path: &PathExpression, components: &QueryComponents) -> Result<String, Error> {
        let Some(component) = components.get(&path.alias) else {
            if path.field.is_none() {
                if let Some(column) = self.result_variables.get(&path.alias) {
                    return Ok(column.clone());
                }
            }
            return Err(unresolved(
                format!("unknown alias '{}'", path.alias),
                path.position,
                path.to_string(),
            ));
        };
        let metadata = &component.metadata;
        let Some(field) = &path.field else {
            let columns = metadata.identifier_columns();
            let [id] = columns.as_slice() else {
                return Err(unresolved(
                    format!(
                        "'{}' has a composite identifier and cannot be used as a value",
                        metadata.name()
                    ),
                    path.position,
                    path.to_string(),
                ));
            };
            return self.column(&path.alias, id, path.position);
        };
        if let Some(field) = metadata.field(field) {
            return self.column(&path.alias, &field.column_name, path.position);
        }
        match metadata.association(field) {
            Some(association)
                if association.has_join_columns() && association.join_columns.len() == 1 =>
            {
                self.column(&path.alias, &association.join_columns[0].name, path.position)
            }
            _ => Err(unresolved(
                format!("'{field}' is not a column of '{}'", metadata.name()),
                path.position,
                path.to_string(),
            )),
        }
    }

    fn expression(
        &mut self,
        expression: &Expression,
        components: &QueryComponents,
    ) -> Result<String, Error> {
        Ok(match expression {
            Expression::Path(path) => self.path(path, components)?,
            Expression::Literal { value, .. } => {
                let value = match value {
                    Literal::Null => return Ok("NULL".to_string()),
                    Literal::Integer(i) => Value::BigInt(*i),
                    Literal::Float(f) => Value::Double(*f),
                    Literal::String(s) => Value::Text(s.clone()),
                    Literal::Boolean(b) => Value::Bool(*b),
                };
                self.bind(ParameterSource::Literal(value))
            }
            Expression::Parameter { parameter, .. } => {
                let source = match parameter {
                    ParameterRef::Named(name) => ParameterSource::Named(name.clone()),
                    ParameterRef::Positional(index) => ParameterSource::Positional(*index),
                };
                self.bind(source)
            }
            Expression::Binary { op, left, right } => {
                let left = self.operand(left, components)?;
                let right = self.operand(right, components)?;
                format!("{left} {} {right}", op.as_sql())
            }
            Expression::Negate(inner) => format!("-{}", self.operand(inner, components)?),
            Expression::Aggregate {
                function,
                distinct,
                argument,
                ..
            } => format!(
                "{}({}{})",
                function.as_sql(),
                if *distinct { "DISTINCT " } else { "" },
                self.expression(argument, components)?
            ),
            Expression::Function {
                function,
                arguments,
                ..
            } => {
                let mut rendered = Vec::with_capacity(arguments.len());
                for argument in arguments {
                    rendered.push(self.expression(argument, components)?);
                }
                if *function == ScalarFunction::Concat && self.dialect == Dialect::Sqlite {
                    format!("({})", rendered.join(" || "))
                } else {
                    format!("{}({})", function.as_sql(), rendered.join(", "))
                }
            }
        })
    }

    fn operand(
        &mut self,
        expression: &Expression,
        components: &QueryComponents,
    ) -> Result<String, Error> {
        let sql = self.expression(expression, components)?;
        Ok(match expression {
            Expression::Binary { .. } => format!("({sql})"),
            _ => sql,
        })
    }

    /// Render a condition. `nested` parenthesizes a disjunction so it can be
    /// combined with AND.
    fn condition(
        &mut self,
        condition: &Condition,
        nested: bool,
        components: &QueryComponents,
    ) -> Result<String, Error> {
        let not = |negated: bool| if negated { "NOT " } else { "" };
        Ok(match condition {
            Condition::Or(parts) => {
                let mut rendered = Vec::with_capacity(parts.len());
                for part in parts {
                    rendered.push(self.condition(part, false, components)?);
                }
                let sql = rendered.join(" OR ");
                if nested && parts.len() > 1 {
                    format!("({sql})")
                } else {
                    sql
                }
            }
            Condition::And(parts) => {
                let mut rendered = Vec::with_capacity(parts.len());
                for part in parts {
                    rendered.push(self.condition(part, true, components)?);
                }
                rendered.join(" AND ")
            }
            Condition::Not(inner) => format!("NOT ({})", self.condition(inner, false, components)?),
            Condition::Comparison { left, op, right } => {
                let left = self.expression(left, components)?;
                let right = self.expression(right, components)?;
                format!("{left} {} {right}", op.as_sql())
            }
            Condition::Between {
                expression,
                low,
                high,
                negated,
            } => {
                let expression = self.expression(expression, components)?;
                let low = self.expression(low, components)?;
                let high = self.expression(high, components)?;
                format!("{expression} {}BETWEEN {low} AND {high}", not(*negated))
            }
            Condition::In {
                expression,
                list,
                negated,
            } => {
                let expression = self.expression(expression, components)?;
                let mut items = Vec::with_capacity(list.len());
                for item in list {
                    items.push(self.expression(item, components)?);
                }
                format!("{expression} {}IN ({})", not(*negated), items.join(", "))
            }
            Condition::Like {
                expression,
                pattern,
                negated,
            } => {
                let expression = self.expression(expression, components)?;
                let pattern = self.expression(pattern, components)?;
                format!("{expression} {}LIKE {pattern}", not(*negated))
            }
            Condition::IsNull {
                expression,
                negated,
            } => format!(
                "{} IS {}NULL",
                self.expression(expression, components)?,
                not(*negated)
            ),
        })
    }
}

/// Parent metadata, joined association and target metadata of a join.
fn join_parts<'c>(
    join: &Join,
    components: &'c QueryComponents,
) -> Result<(&'c EntityMetadata, &'c AssociationMetadata, &'c EntityMetadata), Error> {
    let parent = components.get(&join.path.alias).ok_or_else(|| {
        unresolved(
            format!("unknown alias '{}'", join.path.alias),
            join.path.position,
            join.path.to_string(),
        )
    })?;
    let target = components.get(&join.alias).ok_or_else(|| {
        unresolved(
            format!("unknown alias '{}'", join.alias),
            join.position,
            join.alias.as_str(),
        )
    })?;
    let association = join
        .path
        .field
        .as_deref()
        .and_then(|field| parent.metadata.association(field))
        .ok_or_else(|| {
            unresolved(
                format!("'{}' is not an association", join.path),
                join.path.position,
                join.path.to_string(),
            )
        })?;
    Ok((parent.metadata.as_ref(), association, target.metadata.as_ref()))
}

impl TreeWalker for SqlWalker {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn walk(
        &mut self,
        statement: &Statement,
        components: &mut QueryComponents,
    ) -> Result<Option<SqlOutput>, Error> {
        self.reset();
        let components: &QueryComponents = components;
        let sql = match statement {
            Statement::Select(select) => self.walk_select(select, components)?,
            Statement::Update(update) => self.walk_update(update, components)?,
            Statement::Delete(delete) => self.walk_delete(delete, components)?,
        };
        tracing::debug!(
            dialect = self.dialect.as_str(),
            sql = %sql,
            parameters = self.parameters.len(),
            "Generated SQL"
        );
        Ok(Some(SqlOutput::new(
            sql,
            std::mem::take(&mut self.parameters),
            std::mem::take(&mut self.mapping),
        )))
    }
}

impl ConstructWalker for SqlWalker {
    const NAME: &'static str = "sql";

    fn construct(input: &WalkerInput<'_>) -> Self {
        Self::new(input.dialect)
    }
}

/// Rewrites a SELECT into a distinct count of its root entity.
///
/// Annotates the components context with [`COUNT_HINT`]; the SQL walker then
/// replaces the SELECT list and drops ORDER BY.
#[derive(Debug, Default)]
pub struct CountWalker;

impl TreeWalker for CountWalker {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn walk(
        &mut self,
        statement: &Statement,
        components: &mut QueryComponents,
    ) -> Result<Option<SqlOutput>, Error> {
        let Statement::Select(select) = statement else {
            return Err(unresolved(
                format!("cannot count a {} statement", statement.kind()),
                0,
                statement.kind(),
            ));
        };
        if let Some(group) = select.group_by.first() {
            let position = match group {
                Expression::Path(path) => path.position,
                _ => 0,
            };
            return Err(unresolved(
                "cannot count a query that uses GROUP BY",
                position,
                "GROUP BY",
            ));
        }
        let [root] = select.from.as_slice() else {
            let position = select.from.get(1).map_or(0, |d| d.position);
            return Err(unresolved(
                "cannot count a query with more than one root entity",
                position,
                select.from.get(1).map_or("", |d| d.alias.as_str()),
            ));
        };
        let component = components.get(&root.alias).ok_or_else(|| {
            unresolved(
                format!("unknown alias '{}'", root.alias),
                root.position,
                root.alias.as_str(),
            )
        })?;
        if component.metadata.identifier().len() != 1 {
            return Err(unresolved(
                format!(
                    "cannot count '{}': composite identifiers are not supported",
                    component.metadata.name()
                ),
                root.position,
                root.entity.as_str(),
            ));
        }
        tracing::trace!(alias = %root.alias, "Counting root entity");
        components.set_hint(COUNT_HINT, root.alias.clone());
        Ok(None)
    }
}

impl ConstructWalker for CountWalker {
    const NAME: &'static str = "count";

    fn construct(_input: &WalkerInput<'_>) -> Self {
        CountWalker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::TreeWalkerChain;
    use crate::parser::parse;
    use crate::walker::WalkerType;
    use relmap_core::{FieldMetadata, MetadataRegistry, SqlType};

    fn registry() -> MetadataRegistry {
        MetadataRegistry::builder()
            .entity(
                EntityMetadata::builder("User")
                    .table("users")
                    .id(FieldMetadata::new("id", SqlType::BigInt))
                    .field(FieldMetadata::new("name", SqlType::Text))
                    .field(FieldMetadata::new("age", SqlType::Integer))
                    .association(
                        AssociationMetadata::many_to_one("group", "Group")
                            .join_column(JoinColumnMetadata::new("group_id", "id")),
                    )
                    .association(AssociationMetadata::many_to_many("roles", "Role"))
                    .build()
                    .unwrap(),
            )
            .entity(
                EntityMetadata::builder("Group")
                    .table("groups")
                    .id(FieldMetadata::new("id", SqlType::BigInt))
                    .field(FieldMetadata::new("title", SqlType::Text))
                    .association(AssociationMetadata::one_to_many("members", "User", "group"))
                    .build()
                    .unwrap(),
            )
            .entity(
                EntityMetadata::builder("Role")
                    .table("roles")
                    .id(FieldMetadata::new("id", SqlType::BigInt))
                    .field(FieldMetadata::new("label", SqlType::Text))
                    .association(AssociationMetadata::many_to_many("users", "User").mapped_by("roles"))
                    .build()
                    .unwrap(),
            )
            .entity(
                EntityMetadata::builder("Manager")
                    .table("people")
                    .id(FieldMetadata::new("id", SqlType::BigInt))
                    .field(FieldMetadata::new("name", SqlType::Text))
                    .discriminator(
                        DiscriminatorMetadata::new("kind", "manager", "Person")
                            .subtype_value("director"),
                    )
                    .build()
                    .unwrap(),
            )
            .entity(
                EntityMetadata::builder("Membership")
                    .table("memberships")
                    .id(FieldMetadata::new("userId", SqlType::BigInt).column("user_id"))
                    .id(FieldMetadata::new("groupId", SqlType::BigInt).column("group_id"))
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap()
    }

    fn run(query: &str, dialect: Dialect, walkers: &[WalkerType]) -> Result<SqlOutput, Error> {
        let result = parse(query, &registry())?;
        let mut chain = TreeWalkerChain::new(result.components().clone());
        for walker in walkers {
            chain.push(*walker);
        }
        Ok(chain
            .walk(query, dialect, &result)?
            .expect("terminal walker produces output"))
    }

    fn sql(query: &str) -> SqlOutput {
        run(query, Dialect::Postgres, &[WalkerType::of::<SqlWalker>()]).unwrap()
    }

    fn count(query: &str) -> Result<SqlOutput, Error> {
        run(
            query,
            Dialect::Postgres,
            &[WalkerType::of::<CountWalker>(), WalkerType::of::<SqlWalker>()],
        )
    }

    fn text(value: &str) -> ParameterSource {
        ParameterSource::Literal(Value::Text(value.to_string()))
    }

    #[test]
    fn test_select_entity_with_literal_bound() {
        let output = sql("SELECT u FROM User u WHERE u.age > 18");
        assert_eq!(
            output.sql,
            "SELECT t0_.\"id\" AS c0_, t0_.\"name\" AS c1_, t0_.\"age\" AS c2_ \
             FROM \"users\" t0_ WHERE t0_.\"age\" > $1"
        );
        assert_eq!(
            output.parameters,
            vec![ParameterSource::Literal(Value::BigInt(18))]
        );
        let entity = output.result_set_mapping.entity("u").unwrap();
        assert_eq!(entity.entity, "User");
        assert_eq!(
            entity.fields,
            vec![
                FieldResult { column: "c0_".into(), field: "id".into() },
                FieldResult { column: "c1_".into(), field: "name".into() },
                FieldResult { column: "c2_".into(), field: "age".into() },
            ]
        );
    }

    #[test]
    fn test_owning_to_one_join_with_condition() {
        let output = sql("SELECT u.name, g.title FROM User u JOIN u.group g WITH g.title = :t");
        assert_eq!(
            output.sql,
            "SELECT t0_.\"name\" AS c0_, t1_.\"title\" AS c1_ FROM \"users\" t0_ \
             INNER JOIN \"groups\" t1_ ON t0_.\"group_id\" = t1_.\"id\" AND t1_.\"title\" = $1"
        );
        assert_eq!(output.parameters, vec![ParameterSource::Named("t".into())]);
        assert_eq!(output.result_set_mapping.scalar("sclr1").unwrap().column, "c1_");
    }

    #[test]
    fn test_inverse_one_to_many_join() {
        let output = sql("SELECT g FROM Group g LEFT JOIN g.members m WHERE m.age >= ?1");
        assert_eq!(
            output.sql,
            "SELECT t0_.\"id\" AS c0_, t0_.\"title\" AS c1_ FROM \"groups\" t0_ \
             LEFT JOIN \"users\" t1_ ON t1_.\"group_id\" = t0_.\"id\" WHERE t1_.\"age\" >= $1"
        );
        assert_eq!(output.parameters, vec![ParameterSource::Positional(1)]);
    }

    #[test]
    fn test_many_to_many_goes_through_link_table() {
        let output = sql("SELECT r.label FROM User u JOIN u.roles r");
        assert_eq!(
            output.sql,
            "SELECT t2_.\"label\" AS c0_ FROM \"users\" t0_ \
             INNER JOIN \"user_role\" t1_ ON t1_.\"user_id\" = t0_.\"id\" \
             INNER JOIN \"roles\" t2_ ON t2_.\"id\" = t1_.\"role_id\""
        );

        let output = sql("SELECT u.name FROM Role r JOIN r.users u");
        assert_eq!(
            output.sql,
            "SELECT t2_.\"name\" AS c0_ FROM \"roles\" t0_ \
             INNER JOIN \"user_role\" t1_ ON t1_.\"role_id\" = t0_.\"id\" \
             INNER JOIN \"users\" t2_ ON t2_.\"id\" = t1_.\"user_id\""
        );
    }

    #[test]
    fn test_discriminator_restricts_root() {
        let output = sql("SELECT m.name FROM Manager m WHERE m.name = 'x' OR m.name = 'y'");
        assert_eq!(
            output.sql,
            "SELECT t0_.\"name\" AS c0_ FROM \"people\" t0_ \
             WHERE (t0_.\"name\" = $1 OR t0_.\"name\" = $2) AND t0_.\"kind\" IN ($3, $4)"
        );
        assert_eq!(
            output.parameters,
            vec![text("x"), text("y"), text("manager"), text("director")]
        );

        let output = sql("SELECT m FROM Manager m");
        assert!(output.sql.ends_with("FROM \"people\" t0_ WHERE t0_.\"kind\" IN ($1, $2)"));
    }

    #[test]
    fn test_sqlite_placeholders_and_concat() {
        let output = run(
            "SELECT CONCAT(u.name, 'x') AS label FROM User u ORDER BY label",
            Dialect::Sqlite,
            &[WalkerType::of::<SqlWalker>()],
        )
        .unwrap();
        assert_eq!(
            output.sql,
            "SELECT (t0_.\"name\" || ?1) AS c0_ FROM \"users\" t0_ ORDER BY c0_ ASC"
        );
        assert_eq!(output.result_set_mapping.scalar("label").unwrap().column, "c0_");
    }

    #[test]
    fn test_mysql_conditions() {
        let output = run(
            "SELECT u.name FROM User u WHERE u.age BETWEEN 18 AND 30 AND u.name NOT LIKE :p \
             AND u.id IN (1, 2) AND NOT (u.age < 3)",
            Dialect::Mysql,
            &[WalkerType::of::<SqlWalker>()],
        )
        .unwrap();
        assert_eq!(
            output.sql,
            "SELECT t0_.`name` AS c0_ FROM `users` t0_ WHERE t0_.`age` BETWEEN ? AND ? \
             AND t0_.`name` NOT LIKE ? AND t0_.`id` IN (?, ?) AND NOT (t0_.`age` < ?)"
        );
        assert_eq!(output.parameters.len(), 6);
        assert_eq!(output.parameters[2], ParameterSource::Named("p".into()));
    }

    #[test]
    fn test_alias_as_value_uses_identifier() {
        let output = sql("SELECT u.name FROM User u WHERE u = :user AND u.group IS NOT NULL");
        assert_eq!(
            output.sql,
            "SELECT t0_.\"name\" AS c0_ FROM \"users\" t0_ \
             WHERE t0_.\"id\" = $1 AND t0_.\"group_id\" IS NOT NULL"
        );
    }

    #[test]
    fn test_aggregates_group_having_order() {
        let output = sql(
            "SELECT g.title, COUNT(u.id) AS total FROM User u JOIN u.group g \
             GROUP BY g.title HAVING COUNT(u.id) > 1 ORDER BY total DESC",
        );
        assert_eq!(
            output.sql,
            "SELECT t1_.\"title\" AS c0_, COUNT(t0_.\"id\") AS c1_ FROM \"users\" t0_ \
             INNER JOIN \"groups\" t1_ ON t0_.\"group_id\" = t1_.\"id\" \
             GROUP BY t1_.\"title\" HAVING COUNT(t0_.\"id\") > $1 ORDER BY c1_ DESC"
        );
    }

    #[test]
    fn test_update_and_delete_use_unqualified_columns() {
        let output = sql("UPDATE User u SET u.name = :name, u.age = u.age + 1 WHERE u.id = ?1");
        assert_eq!(
            output.sql,
            "UPDATE \"users\" SET \"name\" = $1, \"age\" = \"age\" + $2 WHERE \"id\" = $3"
        );
        assert_eq!(
            output.parameters,
            vec![
                ParameterSource::Named("name".into()),
                ParameterSource::Literal(Value::BigInt(1)),
                ParameterSource::Positional(1),
            ]
        );
        assert!(output.result_set_mapping.is_empty());

        let output = sql("DELETE FROM User u WHERE u.group IS NULL");
        assert_eq!(output.sql, "DELETE FROM \"users\" WHERE \"group_id\" IS NULL");

        let output = sql("DELETE FROM Manager m");
        assert_eq!(output.sql, "DELETE FROM \"people\" WHERE \"kind\" IN ($1, $2)");
    }

    #[test]
    fn test_count_walker_rewrites_select() {
        let output = count(
            "SELECT u FROM User u JOIN u.group g WHERE g.title = 'a' ORDER BY u.name",
        )
        .unwrap();
        assert_eq!(
            output.sql,
            "SELECT COUNT(DISTINCT t0_.\"id\") AS c0_ FROM \"users\" t0_ \
             INNER JOIN \"groups\" t1_ ON t0_.\"group_id\" = t1_.\"id\" WHERE t1_.\"title\" = $1"
        );
        assert_eq!(
            output.result_set_mapping.scalars,
            vec![ScalarResult { column: "c0_".into(), name: "count".into() }]
        );
    }

    #[test]
    fn test_count_walker_rejections() {
        for query in [
            "SELECT g.title FROM User u JOIN u.group g GROUP BY g.title",
            "SELECT m FROM Membership m",
            "DELETE FROM User u",
            "SELECT u, g FROM User u, Group g",
        ] {
            assert!(
                matches!(count(query), Err(Error::QuerySyntax(_))),
                "{query} should not be countable"
            );
        }
    }

    #[test]
    fn test_composite_identifier_as_value_rejected() {
        let result = run(
            "SELECT m.userId FROM Membership m WHERE m = :m",
            Dialect::Postgres,
            &[WalkerType::of::<SqlWalker>()],
        );
        assert!(matches!(result, Err(Error::QuerySyntax(_))));
    }
}
