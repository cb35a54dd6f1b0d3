//! Shared error types for storage operations.

/// Errors returned by repository implementations.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// Failed to connect to the underlying store.
    #[error("storage connection error: {0}")]
    Connection(String),

    /// A query failed to execute.
    #[error("storage query error: {0}")]
    Query(String),

    /// The requested record does not exist.
    #[error("record not found")]
    NotFound,

    /// A uniqueness or state conflict (e.g. duplicate idempotency key).
    #[error("storage conflict: {0}")]
    Conflict(String),
}
