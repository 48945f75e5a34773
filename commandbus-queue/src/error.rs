//! Error taxonomy for the queue adapter.

use thiserror::Error;

/// Errors surfaced by [`crate::QueueAdapter`] operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to serialize message payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("connection pool exhausted acquiring a connection for queue '{queue}'")]
    PoolExhaustion { queue: String },

    #[error("listener for channel '{channel}' failed: {reason}")]
    ListenerFailed { channel: String, reason: String },

    #[error("message {msg_id} not found on queue '{queue}'")]
    MessageNotFound { queue: String, msg_id: i64 },

    /// The send/receive circuit breaker is open; the call was rejected
    /// without attempting the database round-trip.
    #[error("circuit breaker '{name}' is open, failing fast")]
    CircuitOpen { name: String },
}

pub type QueueResult<T> = Result<T, QueueError>;
