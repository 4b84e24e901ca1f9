//! Client-facing error taxonomy.

use thiserror::Error;
use userd_database::DatabaseError;

/// Service error type.
///
/// `Validation`, `Conflict`, and `NotFound` are reported to the caller
/// and never retried by the service. `Store` means the atomic unit
/// failed entirely; nothing was persisted and the whole request is
/// safe to retry.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Malformed input
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Email uniqueness violation
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Operation target absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Store unavailable or write failed; nothing persisted
    #[error("Store error: {0}")]
    Store(DatabaseError),
}

impl From<DatabaseError> for ServiceError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::Conflict(msg) => Self::Conflict(msg),
            DatabaseError::NotFound(msg) => Self::NotFound(msg),
            other => Self::Store(other),
        }
    }
}

/// Result type alias using ServiceError.
pub type ServiceResult<T> = Result<T, ServiceError>;
