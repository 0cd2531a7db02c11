//! Error types shared across the engine.
//!
//! Library components return these typed errors so callers can tell an
//! unavailable backend apart from an empty result. The CLI and config layer
//! wrap them in `anyhow`; the HTTP layer maps them onto status codes.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The database could not be reached (pool closed, timed out, I/O failure).
    #[error("document store unavailable: {0}")]
    Unavailable(String),

    #[error("document not found: {0}")]
    NotFound(i64),

    #[error("invalid document: {0}")]
    Invalid(String),

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                StoreError::Unavailable(err.to_string())
            }
            other => StoreError::Database(other),
        }
    }
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding provider is disabled")]
    Disabled,

    #[error("embedding request timed out after {0:?}")]
    Timeout(Duration),

    #[error("embedding provider returned {actual} vectors for {expected} inputs")]
    CountMismatch { expected: usize, actual: usize },

    #[error("embedding provider error: {0}")]
    Provider(String),
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("vector dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding model mismatch: index built with '{expected}', provider is '{actual}'")]
    ModelMismatch { expected: String, actual: String },

    #[error("index I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt index: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Every retrieval path failed because the document store is down.
    #[error("retrieval unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ReindexError {
    #[error("a reindex run is already in progress")]
    Busy,

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("reindex task failed: {0}")]
    Task(String),
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("language model is disabled")]
    Disabled,

    #[error("language model request failed: {0}")]
    Request(String),

    #[error("language model stream failed: {0}")]
    Stream(String),
}
