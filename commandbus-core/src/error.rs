//! Error taxonomy for the command repository, batch engine and
//! troubleshooting queue (`spec.md` §7).

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by `commandbus-core` operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("queue error: {0}")]
    Queue(#[from] commandbus_queue::QueueError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to (de)serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] ::config::ConfigError),

    /// `send_command` called twice with the same `(domain, command_id)` while
    /// the first is still in flight or already resolved (`spec.md` §4.1).
    #[error("command {command_id} already exists in domain '{domain}'")]
    DuplicateCommand { domain: String, command_id: Uuid },

    #[error("command {command_id} not found in domain '{domain}'")]
    CommandNotFound { domain: String, command_id: Uuid },

    #[error("batch {batch_id} not found in domain '{domain}'")]
    BatchNotFound { domain: String, batch_id: Uuid },

    #[error("process {process_id} not found in domain '{domain}'")]
    ProcessNotFound { domain: String, process_id: Uuid },

    /// Attempted an operation the current state forbids, e.g. retrying a
    /// command that is not in the troubleshooting queue.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A CAS/optimistic-concurrency update matched zero rows because the
    /// row moved under the caller (`spec.md` §6, reply race).
    #[error("concurrent update conflict on {0}")]
    ConcurrentUpdate(String),

    /// A batch was declared with zero members.
    #[error("batch must contain at least one member")]
    EmptyBatch,

    #[error("handler for command type '{command_type}' is not registered")]
    HandlerMissing { command_type: String },

    /// `_sqlx_migrations` does not show the expected latest version applied
    /// (`spec.md` §6 "Schema versioning" — partial application is refused,
    /// not guessed at).
    #[error("expected schema version {expected}, found {found:?}; run migrations before starting")]
    SchemaVersionMissing { expected: i64, found: Option<i64> },
}

pub type CoreResult<T> = Result<T, CoreError>;
