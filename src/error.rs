//! Error types for codegraph.
//!
//! codegraph uses a hierarchical error system:
//! - `CodeGraphError` is the top-level error returned by all public APIs
//! - Domain error types (`StorageError`, `PoolError`, `ValidationError`,
//!   `RuntimeError`, `ProviderError`) provide detail
//!
//! # Error Handling Pattern
//! ```rust,ignore
//! use codegraph::{CodeGraph, Config, Result};
//!
//! fn example() -> Result<()> {
//!     let graph = CodeGraph::open("./codegraph.db", Config::default())?;
//!     // ... operations that may fail ...
//!     graph.close()?;
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// Result type alias for codegraph operations.
pub type Result<T> = std::result::Result<T, CodeGraphError>;

/// Top-level error enum for all codegraph operations.
///
/// This is the only error type returned by public APIs.
/// Use pattern matching to handle specific error cases.
#[derive(Debug, Error)]
pub enum CodeGraphError {
    /// Storage layer error (SQLite, schema, corruption).
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Connection pool error.
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    /// Input validation error.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Agent runtime error.
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// Embedding provider error.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Configuration error.
    #[error("Configuration error: {reason}")]
    Config {
        /// Description of what's wrong with the configuration.
        reason: String,
    },

    /// General I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Vector index error (HNSW operations, fallback scans).
    #[error("Vector index error: {0}")]
    Vector(String),

    /// The query processor's overall time budget was exceeded.
    #[error("Query budget exceeded after {elapsed_ms} ms")]
    QueryTimeout {
        /// How long the query ran before being cut off.
        elapsed_ms: u64,
    },
}

impl CodeGraphError {
    /// Creates a configuration error with the given reason.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Creates a vector index error with the given message.
    pub fn vector(msg: impl Into<String>) -> Self {
        Self::Vector(msg.into())
    }

    /// Returns true if this is a "not found" storage error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Storage(StorageError::NotFound { .. }))
    }

    /// Returns true if this is a validation error.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a storage error.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }

    /// Returns true if this is a pool error.
    pub fn is_pool(&self) -> bool {
        matches!(self, Self::Pool(_))
    }

    /// Returns true if this is a provider error.
    pub fn is_provider(&self) -> bool {
        matches!(self, Self::Provider(_))
    }
}

/// Storage-related errors.
///
/// These errors indicate problems with the underlying SQLite layer
/// or with the rows it holds.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The embedded store could not be opened or loaded.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Database file or data is corrupted.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// A recorded migration checksum does not match its embedded definition.
    #[error("Schema drift at version {version}: {reason}")]
    SchemaDrift {
        /// Migration version whose checksum mismatched.
        version: u32,
        /// Detail on the mismatch.
        reason: String,
    },

    /// Requested row not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Row kind ("entity", "relationship", "file", "embedding").
        kind: &'static str,
        /// Identifier that failed to resolve.
        id: String,
    },

    /// Vector length does not match the store's configured dimension.
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Configured dimension.
        expected: usize,
        /// Dimension of the offending vector.
        got: usize,
    },

    /// Serialization/deserialization of a stored value failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error surfaced by the SQLite engine.
    #[error("SQL error: {0}")]
    Sql(String),
}

impl StorageError {
    /// Creates an unavailable-store error with the given message.
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Creates an integrity error with the given message.
    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity(msg.into())
    }

    /// Creates a not-found error for the given row kind and id.
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Creates a serialization error with the given message.
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::DatabaseCorrupt
                    || code.code == rusqlite::ErrorCode::NotADatabase =>
            {
                StorageError::Integrity(err.to_string())
            }
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::CannotOpen =>
            {
                StorageError::Unavailable(err.to_string())
            }
            _ => StorageError::Sql(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

// Also allow direct conversion to CodeGraphError for convenience
impl From<rusqlite::Error> for CodeGraphError {
    fn from(err: rusqlite::Error) -> Self {
        CodeGraphError::Storage(StorageError::from(err))
    }
}

impl From<serde_json::Error> for CodeGraphError {
    fn from(err: serde_json::Error) -> Self {
        CodeGraphError::Storage(StorageError::from(err))
    }
}

/// Connection pool errors.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No connection became free within the acquire timeout.
    #[error("Connection acquire timed out after {waited_ms} ms")]
    AcquireTimeout {
        /// How long the caller waited, in milliseconds.
        waited_ms: u64,
    },

    /// The pool has been shut down; no further acquires are served.
    #[error("Connection pool is closed")]
    PoolClosed,

    /// A pooled connection failed its health check or broke mid-use.
    #[error("Pooled connection broken: {0}")]
    ConnectionBroken(String),
}

/// Validation errors for input data.
///
/// These errors indicate problems with data provided by the caller.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// An entity record failed validation.
    #[error("Invalid entity: {reason}")]
    InvalidEntity {
        /// Why the entity is invalid.
        reason: String,
    },

    /// A traversal depth is outside its allowed range.
    #[error("Invalid depth {got}: must be between {min} and {max}")]
    InvalidDepth {
        /// Provided depth.
        got: u32,
        /// Minimum allowed depth.
        min: u32,
        /// Maximum allowed depth.
        max: u32,
    },

    /// A query descriptor is malformed or unsupported.
    #[error("Invalid query: {reason}")]
    InvalidQuery {
        /// Why the query is invalid.
        reason: String,
    },

    /// A field has an invalid value.
    #[error("Invalid field '{field}': {reason}")]
    InvalidField {
        /// Name of the invalid field.
        field: String,
        /// Why the value is invalid.
        reason: String,
    },
}

impl ValidationError {
    /// Creates an invalid-entity error.
    pub fn invalid_entity(reason: impl Into<String>) -> Self {
        Self::InvalidEntity {
            reason: reason.into(),
        }
    }

    /// Creates an invalid-depth error.
    pub fn invalid_depth(got: u32, min: u32, max: u32) -> Self {
        Self::InvalidDepth { got, min, max }
    }

    /// Creates an invalid-query error.
    pub fn invalid_query(reason: impl Into<String>) -> Self {
        Self::InvalidQuery {
            reason: reason.into(),
        }
    }

    /// Creates an invalid field error.
    pub fn invalid_field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Agent runtime errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The agent cannot accept the task right now.
    #[error("Agent busy ({reason}), retry after {retry_after_ms} ms")]
    AgentBusy {
        /// Which acceptance check failed (status, queue, memory, task type).
        reason: String,
        /// Suggested delay before retrying.
        retry_after_ms: u64,
    },

    /// The agent does not handle this task type at all.
    #[error("Unsupported task type: {task_type}")]
    TaskUnsupported {
        /// The rejected task type.
        task_type: String,
    },

    /// The agent has been shut down.
    #[error("Agent is shut down")]
    AgentShutdown,
}

impl RuntimeError {
    /// Creates an agent-busy error.
    pub fn busy(reason: impl Into<String>, retry_after_ms: u64) -> Self {
        Self::AgentBusy {
            reason: reason.into(),
            retry_after_ms,
        }
    }

    /// Creates an unsupported-task error.
    pub fn unsupported(task_type: impl Into<String>) -> Self {
        Self::TaskUnsupported {
            task_type: task_type.into(),
        }
    }
}

/// Embedding provider errors.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider cannot be initialized or reached.
    #[error("Embedding provider unavailable: {0}")]
    Unavailable(String),

    /// The remote endpoint returned a non-success HTTP status.
    #[error("HTTP {status}: {body}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Response body (truncated).
        body: String,
    },

    /// The request exceeded its timeout or was cancelled.
    #[error("Embedding request timed out")]
    Timeout,
}

impl ProviderError {
    /// Creates an unavailable-provider error.
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Creates an HTTP error, truncating the body to a reasonable size.
    pub fn http(status: u16, body: impl Into<String>) -> Self {
        let mut body = body.into();
        if body.len() > 512 {
            body.truncate(512);
        }
        Self::Http { status, body }
    }
}
