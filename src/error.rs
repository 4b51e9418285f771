//! Error types for storage operations.

use thiserror::Error;

/// Errors that can occur while persisting or retrieving knowledge.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Named object or big map does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Stored payload cannot be read back as the requested type.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    /// Filesystem failure. The engine that produced it is no longer usable.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Paged store failure. Treated like [`StorageError::Io`].
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Unsupported map kind, storage hint, name or option.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Operation attempted on a closed engine or on a handle it issued.
    #[error("storage engine is closed: {0}")]
    AlreadyClosed(String),

    /// Value could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Bytes could not be decoded.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Operation not allowed in the current state (e.g. unbound map handle).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Target storage name is already in use.
    #[error("storage name already in use: {0}")]
    NameConflict(String),
}

impl StorageError {
    /// Whether this error came from the filesystem or the paged store.
    ///
    /// Engines close themselves after such a failure.
    pub fn is_io_failure(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Database(_))
    }

    pub(crate) fn closed(storage_name: &str) -> Self {
        Self::AlreadyClosed(storage_name.to_string())
    }

    pub(crate) fn type_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }
}

impl From<postcard::Error> for StorageError {
    fn from(e: postcard::Error) -> Self {
        Self::Serialization(format!("postcard error: {}", e))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(format!("manifest error: {}", e))
    }
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
