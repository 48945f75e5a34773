//! Domain model, repositories, batch engine and troubleshooting queue for
//! the command bus (`spec.md` components C2-C5, C7).

mod audit;
mod batch;
mod bus;
mod config;
mod domain;
mod envelope;
mod error;
mod repository;
mod schema;
mod tsq;

pub use audit::AuditLog;
pub use batch::{BatchCallback, BatchEngine};
pub use bus::{parse_command_message, CommandBus, OutgoingCommand, SendBatchResult, SendResult};
pub use config::{BackoffSchedule, CommandBusConfig};
pub use domain::{
    AuditEvent, AuditEventType, Batch, BatchStatus, BatchType, Command, CommandStatus, ErrorDetail,
    ErrorKind, Process, ProcessAuditEntry, ProcessStatus, ReplyOutcome,
};
pub use envelope::{CommandEnvelope, ReplyEnvelope, ReplyError, ReplyOutcomeTag};
pub use error::{CoreError, CoreResult};
pub use repository::{CommandRepository, NewCommand};
pub use schema::{ensure_schema_version, EXPECTED_SCHEMA_VERSION};
pub use tsq::{TroubleshootingQueue, TsqItem};
