//! Error taxonomy for the process manager engine (`spec.md` §7).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("core error: {0}")]
    Core(#[from] commandbus_core::CoreError),

    #[error("queue error: {0}")]
    Queue(#[from] commandbus_queue::QueueError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to (de)serialize process state: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("no process manager registered for process_type '{process_type}'")]
    ManagerNotFound { process_type: String },

    #[error("reply for command {command_id} has no matching process-audit entry")]
    UnknownStep { command_id: uuid::Uuid },
}

pub type ProcessResult<T> = Result<T, ProcessError>;
