//! Error taxonomy for the worker (`spec.md` §7).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("core error: {0}")]
    Core(#[from] commandbus_core::CoreError),

    #[error("queue error: {0}")]
    Queue(#[from] commandbus_queue::QueueError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to (de)serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),

    /// `spec.md` §9: "handlers are declared by a static mapping
    /// `(domain, command_type) -> invocable`"; no match found.
    #[error("no handler registered for ({domain}, {command_type})")]
    HandlerMissing { domain: String, command_type: String },

    /// `spec.md` §7 `QueuePoolExhaustion`: connection pool acquisition
    /// timed out.
    #[error("connection pool exhausted while processing domain '{domain}'")]
    QueuePoolExhaustion { domain: String },
}

pub type WorkerResult<T> = Result<T, WorkerError>;
