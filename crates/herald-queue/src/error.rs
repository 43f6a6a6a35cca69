use thiserror::Error;

/// Failures raised by a [`JobStore`](crate::store::JobStore) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A JSON column could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A row exists but holds a value the model cannot represent.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Errors surfaced to callers of the scheduler facade.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The scheduling request was rejected before anything was persisted.
    #[error("Validation error: {0}")]
    Validation(String),

    /// No email with the given ID exists in the store.
    #[error("Email not found: {id}")]
    NotFound { id: String },

    /// The store could not complete the operation. Not retried by the queue.
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueueError {
    /// Short machine-readable code for CLI output and logs.
    pub fn code(&self) -> &'static str {
        match self {
            QueueError::Validation(_) => "VALIDATION_ERROR",
            QueueError::NotFound { .. } => "NOT_FOUND",
            QueueError::Persistence(_) => "PERSISTENCE_ERROR",
            QueueError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
pub type StoreResult<T> = std::result::Result<T, StoreError>;
