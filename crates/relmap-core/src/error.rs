//! Error types for relmap operations.

use std::fmt;

/// The primary error type for all relmap operations.
#[derive(Debug)]
pub enum Error {
    /// Malformed or unresolvable object query
    QuerySyntax(QuerySyntaxError),
    /// Operation invalid for the entity's lifecycle state
    InvalidEntityState(InvalidEntityStateError),
    /// Unbreakable dependency cycle among pending operations
    CommitOrdering(CommitOrderingError),
    /// Storage error reported mid-commit or mid-query by a collaborator
    Persistence(PersistenceFailure),
    /// Invalid mapping metadata
    Mapping(MappingError),
    /// Query execution errors reported by the database executor
    Query(QueryError),
    /// Connection-related errors reported by the database executor
    Connection(ConnectionError),
    /// Type conversion errors
    Type(TypeError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

/// Lexing, parsing or resolution failure, pointing at the offending token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySyntaxError {
    pub message: String,
    /// Byte offset into the query text.
    pub position: usize,
    /// Text of the offending token, if any.
    pub token: Option<String>,
}

/// Lifecycle state of an entity, as seen by the unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityState {
    /// Never persisted and not tracked.
    New,
    /// Tracked by the unit of work.
    Managed,
    /// Scheduled for deletion.
    Removed,
    /// Previously tracked, no longer associated with the unit of work.
    Detached,
}

impl EntityState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            EntityState::New => "NEW",
            EntityState::Managed => "MANAGED",
            EntityState::Removed => "REMOVED",
            EntityState::Detached => "DETACHED",
        }
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidEntityStateError {
    pub entity_type: String,
    pub state: EntityState,
    /// The rejected operation (`persist`, `remove`, `change_set`, ...).
    pub operation: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOrderingError {
    /// Entity descriptions along the cycle, first node repeated at the end.
    pub cycle: Vec<String>,
}

#[derive(Debug)]
pub struct PersistenceFailure {
    /// `insert`, `update`, `delete`, `collection`, `query`, ...
    pub operation: &'static str,
    pub entity_type: Option<String>,
    /// Operations dispatched successfully before the failure.
    pub applied: usize,
    /// Operations never dispatched because of the failure.
    pub pending: usize,
    pub source: Box<Error>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingError {
    pub kind: MappingErrorKind,
    pub entity: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingErrorKind {
    /// Entity type not known to the metadata provider
    UnknownEntity,
    /// Field or association not declared on the entity
    UnknownField,
    /// Field or association declared twice
    DuplicateField,
    /// Name is not a valid identifier
    InvalidIdentifier,
    /// Entity declares no identifier
    MissingIdentifier,
    /// Join column counts do not match identifier column counts
    JoinColumnMismatch,
    /// Inconsistent association or inheritance configuration
    Invalid,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Statement timeout
    Timeout,
    /// A query parameter was referenced but never bound
    MissingParameter,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection lost during operation
    Disconnected,
    /// Connection pool exhausted
    PoolExhausted,
}

impl QuerySyntaxError {
    pub fn new(message: impl Into<String>, position: usize) -> Self {
        Self {
            message: message.into(),
            position,
            token: None,
        }
    }

    pub fn at_token(message: impl Into<String>, position: usize, token: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            position,
            token: Some(token.into()),
        }
    }
}

impl MappingError {
    pub fn new(kind: MappingErrorKind, entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            entity: entity.into(),
            message: message.into(),
        }
    }
}

impl Error {
    /// Is this a retryable error (deadlock, serialization, pool exhausted, timeouts)?
    ///
    /// Commit-level failures are judged by their underlying storage error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization | QueryErrorKind::Timeout
            ),
            Error::Connection(c) => matches!(c.kind, ConnectionErrorKind::PoolExhausted),
            Error::Persistence(p) => p.source.is_retryable(),
            _ => false,
        }
    }

    /// Get SQLSTATE if available (e.g., "23505" for unique violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            Error::Persistence(p) => p.source.sqlstate(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            Error::Persistence(p) => p.source.sql(),
            _ => None,
        }
    }

    pub fn invalid_state(
        entity_type: &str,
        state: EntityState,
        operation: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Error::InvalidEntityState(InvalidEntityStateError {
            entity_type: entity_type.to_string(),
            state,
            operation,
            message: message.into(),
        })
    }

    pub fn unknown_field(entity: &str, field: &str) -> Self {
        Error::Mapping(MappingError::new(
            MappingErrorKind::UnknownField,
            entity,
            format!("entity '{entity}' has no mapped field or association '{field}'"),
        ))
    }
}

impl QueryError {
    /// Is this a unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23505")
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23503")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::QuerySyntax(e) => write!(f, "Query syntax error: {}", e),
            Error::InvalidEntityState(e) => write!(f, "Invalid entity state: {}", e),
            Error::CommitOrdering(e) => write!(f, "Commit ordering error: {}", e),
            Error::Persistence(e) => write!(f, "Persistence failure: {}", e),
            Error::Mapping(e) => write!(f, "Mapping error: {}", e),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Persistence(e) => Some(e.source.as_ref()),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for QuerySyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.token {
            Some(token) => write!(
                f,
                "{} at position {} near '{}'",
                self.message, self.position, token
            ),
            None => write!(f, "{} at position {}", self.message, self.position),
        }
    }
}

impl fmt::Display for InvalidEntityStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot {} {} entity of type '{}': {}",
            self.operation, self.state, self.entity_type, self.message
        )
    }
}

impl fmt::Display for CommitOrderingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dependency cycle among non-nullable foreign keys: {}",
            self.cycle.join(" -> ")
        )
    }
}

impl fmt::Display for PersistenceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entity_type {
            Some(entity) => write!(
                f,
                "{} of '{}' failed after {} applied operation(s), {} pending: {}",
                self.operation, entity, self.applied, self.pending, self.source
            ),
            None => write!(
                f,
                "{} failed after {} applied operation(s), {} pending: {}",
                self.operation, self.applied, self.pending, self.source
            ),
        }
    }
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<QuerySyntaxError> for Error {
    fn from(err: QuerySyntaxError) -> Self {
        Error::QuerySyntax(err)
    }
}

impl From<InvalidEntityStateError> for Error {
    fn from(err: InvalidEntityStateError) -> Self {
        Error::InvalidEntityState(err)
    }
}

impl From<CommitOrderingError> for Error {
    fn from(err: CommitOrderingError) -> Self {
        Error::CommitOrdering(err)
    }
}

impl From<PersistenceFailure> for Error {
    fn from(err: PersistenceFailure) -> Self {
        Error::Persistence(err)
    }
}

impl From<MappingError> for Error {
    fn from(err: MappingError) -> Self {
        Error::Mapping(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for relmap operations.
pub type Result<T> = std::result::Result<T, Error>;
