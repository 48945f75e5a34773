//! Core entities from `spec.md` §3.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Status of a [`Command`] row. Terminal states are `Completed` and
/// `Canceled` (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Pending,
    InProgress,
    Completed,
    Canceled,
    InTroubleshootingQueue,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CommandStatus::Completed | CommandStatus::Canceled)
    }
}

/// The kind of an error captured on a [`Command`] or reported by a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Transient,
    Permanent,
}

/// Structured error detail captured on terminal/TSQ transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
}

/// The primary operational record (`spec.md` §3 "Command").
///
/// Keyed by `(domain, command_id)`; `command_id` is the client-supplied
/// idempotency key.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Command {
    pub domain: String,
    pub command_id: Uuid,
    pub command_type: String,
    pub status: CommandStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub msg_id: Option<i64>,
    /// PGMQ msg_id the payload was archived under when this command was
    /// last routed to the troubleshooting queue. Distinct from `msg_id`,
    /// which is cleared on that same transition.
    pub archived_msg_id: Option<i64>,
    pub queue_name: String,
    pub reply_queue: Option<String>,
    pub correlation_id: Option<Uuid>,
    pub last_error_kind: Option<ErrorKind>,
    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub batch_id: Option<Uuid>,
}

impl Command {
    pub fn last_error(&self) -> Option<ErrorDetail> {
        Some(ErrorDetail {
            kind: self.last_error_kind?,
            code: self.last_error_code.clone()?,
            message: self.last_error_message.clone().unwrap_or_default(),
        })
    }
}

/// Lifecycle event kinds recorded in the append-only audit log
/// (`spec.md` §3 "Audit Event").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    Sent,
    Received,
    Completed,
    Failed,
    RetryScheduled,
    MovedToTsq,
    OperatorRetry,
    OperatorComplete,
    OperatorCancel,
    BatchStarted,
    BatchCompleted,
    ProcessStarted,
    ProcessStep,
    ProcessCompleted,
    ProcessCompensated,
}

/// An append-only audit row, keyed to either a command or a process.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct AuditEvent {
    pub id: i64,
    pub domain: String,
    pub command_id: Option<Uuid>,
    pub process_id: Option<Uuid>,
    pub event_type: AuditEventType,
    pub timestamp: DateTime<Utc>,
    pub details: Value,
}

/// Whether a [`Batch`] aggregates commands or process instances
/// (`spec.md` §3 "Batch").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchType {
    Command,
    Process,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Pending,
    InProgress,
    Completed,
    CompletedWithFailures,
}

/// A set of commands (or processes) created together for aggregate tracking.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Batch {
    pub domain: String,
    pub batch_id: Uuid,
    pub batch_type: BatchType,
    pub name: Option<String>,
    pub custom_data: Option<Value>,
    pub status: BatchStatus,
    pub total_count: i32,
    pub completed_count: i32,
    pub failed_count: i32,
    pub canceled_count: i32,
    pub in_troubleshooting_count: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Batch {
    /// `spec.md` §8 quantified invariant: once terminal, terminal counts sum
    /// to `total_count` and nothing remains in troubleshooting.
    pub fn is_fully_accounted(&self) -> bool {
        self.completed_count + self.failed_count + self.canceled_count == self.total_count
            && self.in_troubleshooting_count == 0
    }

    /// The status a fully-accounted batch should transition to: `Completed`
    /// if nothing failed or was canceled, else `CompletedWithFailures`
    /// (`spec.md` §4.4).
    pub fn terminal_status(&self) -> BatchStatus {
        if self.failed_count == 0 && self.canceled_count == 0 {
            BatchStatus::Completed
        } else {
            BatchStatus::CompletedWithFailures
        }
    }
}

/// Status of a [`Process`] instance (`spec.md` §3 "Process").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStatus {
    Pending,
    InProgress,
    WaitingForReply,
    WaitingForTsq,
    Compensating,
    Completed,
    Compensated,
    Failed,
    Canceled,
}

impl ProcessStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessStatus::Completed
                | ProcessStatus::Compensated
                | ProcessStatus::Failed
                | ProcessStatus::Canceled
        )
    }
}

/// An instance of a concrete process manager, keyed by `(domain,
/// process_id)`. `process_id` doubles as the `correlation_id` of every
/// command it emits.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Process {
    pub domain: String,
    pub process_id: Uuid,
    pub process_type: String,
    pub status: ProcessStatus,
    pub current_step: String,
    pub state: Value,
    /// Remaining compensation step names, most-recent-first. Only
    /// meaningful while `compensating` is set.
    pub compensation_queue: Value,
    /// Persisted independently of `status` so a detour through
    /// `WAITING_FOR_TSQ` (which overwrites `status` generically) doesn't
    /// lose whether the process was running forward steps or undoing them.
    pub compensating: bool,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub batch_id: Option<Uuid>,
}

/// Outcome recorded against a process audit entry once the reply arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplyOutcome {
    Success,
    Canceled,
    Failed,
}

/// One step of a process's execution, paired with its eventual reply
/// (`spec.md` §3 "Process Audit Entry").
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ProcessAuditEntry {
    pub id: i64,
    pub domain: String,
    pub process_id: Uuid,
    pub command_id: Uuid,
    pub step_name: String,
    pub command_type: String,
    pub command_data: Value,
    pub sent_at: DateTime<Utc>,
    pub reply_outcome: Option<ReplyOutcome>,
    pub reply_data: Option<Value>,
    pub received_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(total: i32, completed: i32, failed: i32, canceled: i32, tsq: i32) -> Batch {
        Batch {
            domain: "payments".into(),
            batch_id: Uuid::new_v4(),
            batch_type: BatchType::Command,
            name: None,
            custom_data: None,
            status: BatchStatus::InProgress,
            total_count: total,
            completed_count: completed,
            failed_count: failed,
            canceled_count: canceled,
            in_troubleshooting_count: tsq,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn fully_accounted_requires_zero_in_troubleshooting() {
        let b = batch(3, 2, 1, 0, 0);
        assert!(b.is_fully_accounted());
        assert_eq!(b.terminal_status(), BatchStatus::CompletedWithFailures);

        let stuck = batch(3, 2, 0, 0, 1);
        assert!(!stuck.is_fully_accounted());
    }

    #[test]
    fn terminal_status_is_completed_only_when_nothing_failed_or_canceled() {
        let clean = batch(2, 2, 0, 0, 0);
        assert_eq!(clean.terminal_status(), BatchStatus::Completed);
    }

    #[test]
    fn command_status_terminal_set() {
        assert!(CommandStatus::Completed.is_terminal());
        assert!(CommandStatus::Canceled.is_terminal());
        assert!(!CommandStatus::Pending.is_terminal());
        assert!(!CommandStatus::InTroubleshootingQueue.is_terminal());
    }
}
