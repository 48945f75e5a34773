//! Troubleshooting Queue (`spec.md` §4.7 component C7): operator-mediated
//! retry/complete/cancel over commands that exceeded retries or failed
//! permanently.

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use commandbus_queue::QueueAdapter;

use crate::audit::AuditLog;
use crate::batch::BatchEngine;
use crate::domain::{AuditEventType, Command, CommandStatus};
use crate::envelope::ReplyEnvelope;
use crate::error::{CoreError, CoreResult};
use crate::repository::CommandRepository;

/// A command parked in the troubleshooting queue, joined with its
/// archived payload (`spec.md` §4.7 `list`).
#[derive(Debug, Clone)]
pub struct TsqItem {
    pub command: Command,
    pub payload: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct TroubleshootingQueue {
    queue: QueueAdapter,
    repository: CommandRepository,
    audit: AuditLog,
    batches: BatchEngine,
}

impl TroubleshootingQueue {
    pub fn new(
        queue: QueueAdapter,
        repository: CommandRepository,
        audit: AuditLog,
        batches: BatchEngine,
    ) -> Self {
        Self {
            queue,
            repository,
            audit,
            batches,
        }
    }

    pub async fn list(
        &self,
        domain: &str,
        command_type: Option<&str>,
        limit: i64,
        offset: i64,
        created_after: Option<DateTime<Utc>>,
        created_before: Option<DateTime<Utc>>,
    ) -> CoreResult<Vec<TsqItem>> {
        let commands = self
            .repository
            .list_tsq(domain, command_type, created_after, created_before, limit, offset)
            .await?;

        self.hydrate_payloads(commands).await
    }

    /// `spec.md` §4.7 `list_all`: cross-domain TSQ listing for operator
    /// UIs that don't scope to a single domain. `domain = None` lists
    /// across every domain.
    pub async fn list_all(
        &self,
        domain: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> CoreResult<Vec<TsqItem>> {
        let commands = self.repository.list_tsq_all(domain, limit, offset).await?;
        self.hydrate_payloads(commands).await
    }

    async fn hydrate_payloads(&self, commands: Vec<Command>) -> CoreResult<Vec<TsqItem>> {
        let mut items = Vec::with_capacity(commands.len());
        for command in commands {
            let payload = if let Some(msg_id) = command.archived_msg_id {
                self.queue.read_archived_payload(&command.queue_name, msg_id).await?
            } else {
                None
            };
            items.push(TsqItem { command, payload });
        }
        Ok(items)
    }

    pub async fn list_domains(&self) -> CoreResult<Vec<String>> {
        Ok(self.repository.list_domains().await?)
    }

    /// `spec.md` §4.7 `retry`: re-send the archived payload under the
    /// same `command_id`, reset `attempts` to 0, audit OPERATOR_RETRY.
    pub async fn retry(&self, domain: &str, command_id: Uuid, operator: &str) -> CoreResult<Command> {
        let command = self.repository.get(domain, command_id).await?;
        require_tsq_status(&command)?;

        let archived_msg_id = command.archived_msg_id.ok_or_else(|| {
            CoreError::InvalidOperation(format!(
                "command {command_id} has no archived message id to retry"
            ))
        })?;
        let payload = self
            .queue
            .read_archived_payload(&command.queue_name, archived_msg_id)
            .await?
            .ok_or_else(|| {
                CoreError::InvalidOperation(format!(
                    "no archived payload found for command {command_id}"
                ))
            })?;

        let new_msg_id = self.queue.send(&command.queue_name, &payload).await?;

        let mut tx = self.repository.pool().begin().await?;
        let updated = self
            .repository
            .sp_tsq_retry(&mut tx, domain, command_id, new_msg_id)
            .await?;
        self.audit
            .append_in_tx(
                &mut tx,
                domain,
                Some(command_id),
                None,
                AuditEventType::OperatorRetry,
                serde_json::json!({ "operator": operator, "msg_id": new_msg_id }),
            )
            .await?;
        tx.commit().await?;

        Ok(updated)
    }

    /// `spec.md` §4.7 `complete`: mark COMPLETED, send a SUCCESS reply
    /// carrying `result_data` if a reply queue is configured, audit
    /// OPERATOR_COMPLETE, refresh batch counters.
    pub async fn complete(
        &self,
        domain: &str,
        command_id: Uuid,
        operator: &str,
        result_data: Option<Value>,
    ) -> CoreResult<Command> {
        let command = self.repository.get(domain, command_id).await?;
        require_tsq_status(&command)?;

        let mut tx = self.repository.pool().begin().await?;
        let updated = self
            .repository
            .sp_tsq_complete(&mut tx, domain, command_id)
            .await?;
        self.audit
            .append_in_tx(
                &mut tx,
                domain,
                Some(command_id),
                None,
                AuditEventType::OperatorComplete,
                serde_json::json!({ "operator": operator }),
            )
            .await?;
        tx.commit().await?;

        if let Some(reply_queue) = &updated.reply_queue {
            if !reply_queue.is_empty() {
                let reply = ReplyEnvelope::success(command_id, updated.correlation_id, result_data);
                let payload = serde_json::to_value(&reply)?;
                self.queue.send(reply_queue, &payload).await?;
            }
        }

        if let Some(batch_id) = updated.batch_id {
            self.batches.refresh(domain, batch_id).await?;
        }

        Ok(updated)
    }

    /// `spec.md` §4.7 `cancel`: mark CANCELED, send a CANCELED reply
    /// including `reason` if a reply queue is configured, audit
    /// OPERATOR_CANCEL.
    pub async fn cancel(
        &self,
        domain: &str,
        command_id: Uuid,
        operator: &str,
        reason: &str,
    ) -> CoreResult<Command> {
        let command = self.repository.get(domain, command_id).await?;
        require_tsq_status(&command)?;

        let mut tx = self.repository.pool().begin().await?;
        let updated = self
            .repository
            .sp_tsq_cancel(&mut tx, domain, command_id)
            .await?;
        self.audit
            .append_in_tx(
                &mut tx,
                domain,
                Some(command_id),
                None,
                AuditEventType::OperatorCancel,
                serde_json::json!({ "operator": operator, "reason": reason }),
            )
            .await?;
        tx.commit().await?;

        if let Some(reply_queue) = &updated.reply_queue {
            if !reply_queue.is_empty() {
                let reply =
                    ReplyEnvelope::canceled(command_id, updated.correlation_id, reason.to_string());
                let payload = serde_json::to_value(&reply)?;
                self.queue.send(reply_queue, &payload).await?;
            }
        }

        if let Some(batch_id) = updated.batch_id {
            self.batches.refresh(domain, batch_id).await?;
        }

        Ok(updated)
    }
}

fn require_tsq_status(command: &Command) -> CoreResult<()> {
    if command.status != CommandStatus::InTroubleshootingQueue {
        return Err(CoreError::InvalidOperation(format!(
            "command {} is in status {:?}, not IN_TROUBLESHOOTING_QUEUE",
            command.command_id, command.status
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_with_status(status: CommandStatus) -> Command {
        Command {
            domain: "payments".into(),
            command_id: Uuid::nil(),
            command_type: "Debit".into(),
            status,
            attempts: 1,
            max_attempts: 3,
            msg_id: None,
            archived_msg_id: None,
            queue_name: "payments__commands".into(),
            reply_queue: None,
            correlation_id: None,
            last_error_kind: None,
            last_error_code: None,
            last_error_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            batch_id: None,
        }
    }

    #[test]
    fn require_tsq_status_rejects_completed_command() {
        let command = command_with_status(CommandStatus::Completed);
        assert!(require_tsq_status(&command).is_err());
    }

    #[test]
    fn require_tsq_status_accepts_tsq_command() {
        let command = command_with_status(CommandStatus::InTroubleshootingQueue);
        assert!(require_tsq_status(&command).is_ok());
    }
}
