//! The object query entry point.
//!
//! A [`Query`] holds the query text, bound parameters and the walker chain
//! configuration. Compilation runs the parser and the chain once per dialect
//! and stores the result in the query cache when one is configured; the
//! cache key covers the text, the dialect, the walker names and the mapped
//! tables of the metadata provider, never the parameter values.

use crate::chain::TreeWalkerChain;
use crate::output::{ParameterSource, SqlOutput};
use crate::parser::{ParserResult, parse};
use crate::sql_walker::SqlWalker;
use crate::walker::WalkerType;
use relmap_core::cache::{cache_key, fetch_json, save_json};
use relmap_core::{
    CacheProvider, Cx, DatabaseExecutor, Dialect, Error, MetadataProvider, Outcome, QueryError,
    QueryErrorKind, Row, Value,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Key of a bound parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParameterKey {
    Named(String),
    Positional(usize),
}

impl fmt::Display for ParameterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterKey::Named(name) => write!(f, ":{name}"),
            ParameterKey::Positional(index) => write!(f, "?{index}"),
        }
    }
}

/// Accepts `name`, `:name` and `?1`.
impl From<&str> for ParameterKey {
    fn from(key: &str) -> Self {
        if let Some(index) = key.strip_prefix('?').and_then(|i| i.parse().ok()) {
            return ParameterKey::Positional(index);
        }
        ParameterKey::Named(key.strip_prefix(':').unwrap_or(key).to_string())
    }
}

impl From<String> for ParameterKey {
    fn from(key: String) -> Self {
        ParameterKey::from(key.as_str())
    }
}

impl From<usize> for ParameterKey {
    fn from(index: usize) -> Self {
        ParameterKey::Positional(index)
    }
}

/// What executing a query produced.
#[derive(Debug, Clone)]
pub enum QueryResult {
    Rows(Vec<Row>),
    Affected(u64),
}

impl QueryResult {
    pub fn rows(&self) -> &[Row] {
        match self {
            QueryResult::Rows(rows) => rows,
            QueryResult::Affected(_) => &[],
        }
    }

    pub fn into_rows(self) -> Vec<Row> {
        match self {
            QueryResult::Rows(rows) => rows,
            QueryResult::Affected(_) => Vec::new(),
        }
    }

    pub fn affected(&self) -> u64 {
        match self {
            QueryResult::Rows(rows) => rows.len() as u64,
            QueryResult::Affected(count) => *count,
        }
    }
}

/// An object query with its parameters and translation settings.
pub struct Query {
    dql: String,
    metadata: Arc<dyn MetadataProvider>,
    dialect: Dialect,
    cache: Option<Arc<dyn CacheProvider>>,
    parameters: HashMap<ParameterKey, Value>,
    tree_walkers: Vec<WalkerType>,
    output_walker: WalkerType,
    parsed: Option<ParserResult>,
    compiled: Option<(Dialect, SqlOutput)>,
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("dql", &self.dql)
            .field("dialect", &self.dialect)
            .field("parameters", &self.parameters)
            .field("tree_walkers", &self.tree_walkers)
            .field("output_walker", &self.output_walker)
            .field("cached", &self.cache.is_some())
            .finish_non_exhaustive()
    }
}

impl Query {
    pub fn new(dql: impl Into<String>, metadata: Arc<dyn MetadataProvider>, dialect: Dialect) -> Self {
        Self {
            dql: dql.into(),
            metadata,
            dialect,
            cache: None,
            parameters: HashMap::new(),
            tree_walkers: Vec::new(),
            output_walker: WalkerType::of::<SqlWalker>(),
            parsed: None,
            compiled: None,
        }
    }

    /// Use `cache` for compiled SQL.
    pub fn with_cache(mut self, cache: Arc<dyn CacheProvider>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn dql(&self) -> &str {
        &self.dql
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn set_parameter(&mut self, key: impl Into<ParameterKey>, value: impl Into<Value>) -> &mut Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn parameter(&self, key: impl Into<ParameterKey>) -> Option<&Value> {
        self.parameters.get(&key.into())
    }

    /// Add an intermediate walker, run before the output walker.
    pub fn add_tree_walker(&mut self, walker: WalkerType) -> &mut Self {
        self.tree_walkers.push(walker);
        self.invalidate();
        self
    }

    /// Replace the terminal SQL-producing walker.
    pub fn set_output_walker(&mut self, walker: WalkerType) -> &mut Self {
        self.output_walker = walker;
        self.invalidate();
        self
    }

    fn invalidate(&mut self) {
        self.compiled = None;
    }

    fn walker_names(&self) -> Vec<&'static str> {
        self.tree_walkers
            .iter()
            .chain(std::iter::once(&self.output_walker))
            .map(WalkerType::name)
            .collect()
    }

    /// Entity names with their schema and table, so providers mapping the
    /// same names to different tables never share compiled SQL.
    fn metadata_fingerprint(&self) -> u64 {
        let mut tables: Vec<(String, Option<String>, String)> = self
            .metadata
            .entity_names()
            .into_iter()
            .filter_map(|name| {
                let metadata = self.metadata.metadata_for(&name).ok()?;
                Some((
                    name,
                    metadata.schema().map(str::to_string),
                    metadata.table_name().to_string(),
                ))
            })
            .collect();
        tables.sort();
        cache_key(&tables)
    }

    /// Cache key of this query's compiled form for `dialect`.
    pub fn cache_key(&self, dialect: Dialect) -> String {
        let hash = cache_key(&(
            self.dql.as_str(),
            dialect.as_str(),
            self.walker_names(),
            self.metadata_fingerprint(),
        ));
        format!("relmap.query.{hash:x}")
    }

    /// Parse the query, once.
    pub fn parse(&mut self) -> Result<&ParserResult, Error> {
        if self.parsed.is_none() {
            self.parsed = Some(parse(&self.dql, self.metadata.as_ref())?);
        }
        match &self.parsed {
            Some(parsed) => Ok(parsed),
            None => Err(Error::Custom("query was not parsed".to_string())),
        }
    }

    /// SQL for this query's own dialect.
    pub fn sql(&mut self) -> Result<String, Error> {
        let dialect = self.dialect;
        Ok(self.compile(dialect)?.sql)
    }

    /// Translate to SQL for `dialect`, consulting the query cache first.
    #[tracing::instrument(level = "debug", skip(self), fields(dql = %self.dql))]
    pub fn compile(&mut self, dialect: Dialect) -> Result<SqlOutput, Error> {
        if let Some((compiled_for, output)) = &self.compiled {
            if *compiled_for == dialect {
                return Ok(output.clone());
            }
        }

        let key = self.cache_key(dialect);
        if let Some(cache) = &self.cache {
            if let Some(output) = fetch_json::<SqlOutput>(cache.as_ref(), &key) {
                tracing::trace!(key = %key, "Query cache hit");
                self.compiled = Some((dialect, output.clone()));
                return Ok(output);
            }
        }

        let walkers: Vec<WalkerType> = self
            .tree_walkers
            .iter()
            .copied()
            .chain(std::iter::once(self.output_walker))
            .collect();
        let dql = self.dql.clone();
        let parsed = self.parse()?;
        let mut chain = TreeWalkerChain::new(parsed.components().clone());
        for walker in walkers {
            chain.push(walker);
        }
        let output = chain.walk(&dql, dialect, parsed)?.ok_or_else(|| {
            Error::Custom(format!(
                "output walker '{}' produced no SQL",
                self.output_walker.name()
            ))
        })?;

        if let Some(cache) = &self.cache {
            save_json(cache.as_ref(), &key, &output);
        }
        self.compiled = Some((dialect, output.clone()));
        Ok(output)
    }

    /// Resolve each placeholder of `output` to its value.
    pub fn bind(&self, output: &SqlOutput) -> Result<Vec<Value>, Error> {
        output
            .parameters
            .iter()
            .map(|source| {
                let key = match source {
                    ParameterSource::Literal(value) => return Ok(value.clone()),
                    ParameterSource::Named(name) => ParameterKey::Named(name.clone()),
                    ParameterSource::Positional(index) => ParameterKey::Positional(*index),
                };
                self.parameters.get(&key).cloned().ok_or_else(|| {
                    Error::Query(QueryError {
                        kind: QueryErrorKind::MissingParameter,
                        sql: Some(output.sql.clone()),
                        sqlstate: None,
                        message: format!("parameter {key} is not bound"),
                        source: None,
                    })
                })
            })
            .collect()
    }

    /// Compile for the executor's dialect, bind and run.
    ///
    /// SELECT statements return rows; UPDATE and DELETE return the number of
    /// affected rows.
    pub async fn execute<E: DatabaseExecutor>(
        &mut self,
        cx: &Cx,
        executor: &E,
    ) -> Outcome<QueryResult, Error> {
        let output = match self.compile(executor.dialect()) {
            Ok(output) => output,
            Err(e) => return Outcome::Err(e),
        };
        let params = match self.bind(&output) {
            Ok(params) => params,
            Err(e) => return Outcome::Err(e),
        };
        tracing::debug!(sql = %output.sql, parameters = params.len(), "Executing query");
        if output.sql.starts_with("SELECT") {
            match executor.query(cx, &output.sql, &params).await {
                Outcome::Ok(rows) => Outcome::Ok(QueryResult::Rows(rows)),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            }
        } else {
            match executor.execute(cx, &output.sql, &params).await {
                Outcome::Ok(count) => Outcome::Ok(QueryResult::Affected(count)),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            }
        }
    }
}
