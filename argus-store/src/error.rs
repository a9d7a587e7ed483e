//! Store error type.

use thiserror::Error;

/// Errors from store operations.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying database rejected the operation.
    #[error("database error: {0}")]
    Database(String),

    /// A stored value could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The query exceeded the hard deadline.
    #[error("query deadline exceeded")]
    Deadline,

    /// A query window or spec was malformed.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// The store actor has shut down.
    #[error("store closed")]
    Closed,
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}
