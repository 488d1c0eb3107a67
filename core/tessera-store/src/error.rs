//! Error types for the storage layer.

use thiserror::Error;

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Record not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A stored value could not be decoded.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// A row still carries the legacy "founders" tier and must be repaired.
    #[error("entitlement {0} stores legacy tier \"founders\"; run the founders repair")]
    LegacyTier(String),
}

impl From<tessera_types::Error> for StoreError {
    fn from(err: tessera_types::Error) -> Self {
        Self::InvalidData(err.to_string())
    }
}
