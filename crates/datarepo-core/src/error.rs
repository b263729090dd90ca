//! Error types shared by every datarepo crate.

use std::time::Duration;

/// Result alias used across the workspace.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Lifecycle state reported by [`Error::UnitOfWorkClosed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedState {
    /// The unit of work committed.
    Committed,
    /// The unit of work rolled back.
    RolledBack,
}

impl std::fmt::Display for ClosedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClosedState::Committed => f.write_str("committed"),
            ClosedState::RolledBack => f.write_str("rolled back"),
        }
    }
}

/// Errors raised by the engine.
///
/// Derivation and parse errors are raised while repositories are built;
/// everything else is raised at execution time.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A repository method name does not follow the derivation grammar, or
    /// names a property the entity does not have.
    #[error("cannot derive a query for `{method}`: {reason}")]
    UnsupportedDerivation { method: String, reason: String },

    /// A hand-written query string could not be parsed.
    #[error("query parse error at offset {position}: {message}")]
    QueryParse { position: usize, message: String },

    /// A placeholder has no bound argument.
    #[error("no argument bound for parameter `{name}`")]
    UnboundParameter { name: String },

    /// A lock or write was requested without an active write transaction.
    #[error("{operation} requires an active write transaction")]
    NoTransaction { operation: &'static str },

    /// An operation was attempted after commit or rollback.
    #[error("unit of work is already {state}")]
    UnitOfWorkClosed { state: ClosedState },

    /// A single-result query matched more than one row.
    #[error("expected at most one result, found {found}")]
    NonUniqueResult { found: usize },

    /// The pool had no free connection within the configured timeout.
    #[error("timed out after {timeout:?} waiting for a pooled connection")]
    ConnectionAcquireTimeout { timeout: Duration },

    /// The store rejected a statement. `statement` is rendered with
    /// placeholders only; literal values are redacted.
    #[error("store execution failed: {source} [{statement}]")]
    StoreExecution {
        statement: String,
        #[source]
        source: StoreError,
    },

    /// An entity type was used before being registered in the catalog.
    #[error("entity `{0}` is not registered in the schema catalog")]
    UnknownEntity(String),

    /// The schema catalog is inconsistent.
    #[error("invalid schema catalog: {0}")]
    Catalog(String),

    /// A result column could not be mapped onto a Rust value.
    #[error("cannot map column `{column}`: {reason}")]
    Mapping { column: String, reason: String },

    /// A declared method was invoked in a way its declaration does not allow.
    #[error("invalid invocation of `{method}`: {reason}")]
    InvalidInvocation { method: String, reason: String },

    /// Settings could not be loaded.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Shorthand for [`Error::UnsupportedDerivation`].
    pub fn derivation(method: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::UnsupportedDerivation {
            method: method.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for [`Error::InvalidInvocation`].
    pub fn invocation(method: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidInvocation {
            method: method.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error was raised while building repositories.
    pub fn is_registration_error(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedDerivation { .. } | Error::QueryParse { .. } | Error::Catalog(_)
        )
    }
}

/// Failures reported by a store implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("no such table `{0}`")]
    NoSuchTable(String),

    #[error("no such column `{0}`")]
    NoSuchColumn(String),

    #[error("duplicate primary key {key} in `{table}`")]
    DuplicateKey { table: String, key: String },

    #[error("foreign key violation on `{table}.{column}`")]
    ForeignKeyViolation { table: String, column: String },

    #[error("null value in non-nullable column `{table}.{column}`")]
    NotNull { table: String, column: String },

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("missing value for parameter ${0}")]
    MissingParameter(usize),

    #[error("timed out after {0:?} waiting for a row lock")]
    LockTimeout(Duration),

    #[error("{0} requires an open transaction")]
    NotInTransaction(&'static str),

    #[error("a transaction is already open")]
    TransactionAlreadyOpen,

    #[error("unsupported statement: {0}")]
    Unsupported(String),
}
