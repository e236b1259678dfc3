//! Error types for the ETL core.

use thiserror::Error;

/// Distinguishes constraint violations from other driver failures.
///
/// Surge uses this to decide whether a batch failure is worth isolating
/// row by row: integrity errors usually affect individual rows, while
/// general errors (lost connection, bad SQL) affect the whole batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseErrorKind {
    /// Connection, syntax, or other driver-level failure.
    General,
    /// Primary key, unique, foreign key, or check constraint violation.
    Integrity,
}

impl std::fmt::Display for DatabaseErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseErrorKind::General => write!(f, "database"),
            DatabaseErrorKind::Integrity => write!(f, "integrity"),
        }
    }
}

/// Main error type for ETL operations.
#[derive(Error, Debug)]
pub enum EtlError {
    /// Canonical SQL could not be translated to the driver's style.
    #[error("Translation error: {0}")]
    Translate(String),

    /// A parameter payload could not be bound to a translated query.
    #[error("Bind error: {0}")]
    Bind(String),

    /// Invalid SQL identifier (table or column name).
    #[error("Invalid identifier: {0}")]
    Identifier(String),

    /// A table operation was executed without its required columns.
    #[error("Requirements not met for {operation} on {table}: missing {missing:?}")]
    Requirements {
        table: String,
        operation: String,
        missing: Vec<String>,
    },

    /// A column transform failed.
    #[error("Transform error on column {column}: {message}")]
    Transform { column: String, message: String },

    /// A lookup was invoked without its key columns, or its reference
    /// query failed.
    #[error("Lookup error on {table}: {message}")]
    Lookup { table: String, message: String },

    /// Driver error, propagated verbatim.
    #[error("{kind} error: {message}")]
    Database {
        kind: DatabaseErrorKind,
        message: String,
    },

    /// Temp-table creation or drop failed during a merge run.
    #[error("Resource error: {0}")]
    Resource(String),

    /// Configuration error (invalid table definition, unknown shorthand, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Entity-manager state file error.
    #[error("State error: {0}")]
    State(String),

    /// IO error (SQL files, state files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization/deserialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl EtlError {
    /// Create a general database error.
    pub fn database(message: impl Into<String>) -> Self {
        EtlError::Database {
            kind: DatabaseErrorKind::General,
            message: message.into(),
        }
    }

    /// Create an integrity (constraint violation) error.
    pub fn integrity(message: impl Into<String>) -> Self {
        EtlError::Database {
            kind: DatabaseErrorKind::Integrity,
            message: message.into(),
        }
    }

    /// Create a Transform error.
    pub fn transform(column: impl Into<String>, message: impl Into<String>) -> Self {
        EtlError::Transform {
            column: column.into(),
            message: message.into(),
        }
    }

    /// Create a Lookup error.
    pub fn lookup(table: impl Into<String>, message: impl Into<String>) -> Self {
        EtlError::Lookup {
            table: table.into(),
            message: message.into(),
        }
    }

    /// True if this is a database error carrying an integrity kind.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            EtlError::Database {
                kind: DatabaseErrorKind::Integrity,
                ..
            }
        )
    }
}

/// Result type alias for ETL operations.
pub type Result<T> = std::result::Result<T, EtlError>;
