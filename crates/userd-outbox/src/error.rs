//! Outbox error types.

use thiserror::Error;
use userd_database::DatabaseError;

/// Publish failure at the event channel.
///
/// Every variant is retryable: the dispatcher releases its claim and
/// tries again with backoff. Nothing here is ever surfaced to the
/// caller that triggered the original mutation.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Redis error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Publish rejected or timed out
    #[error("Publish failed: {0}")]
    Publish(String),
}

/// Dispatcher error type.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Channel error
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// Result type alias using OutboxError.
pub type OutboxResult<T> = Result<T, OutboxError>;
