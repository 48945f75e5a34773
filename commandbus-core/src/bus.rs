//! Command Bus (`spec.md` §4.5 component C5): the public `send`/
//! `send_batch` surface, composing the queue adapter, repository, audit
//! log and batch engine in one transaction.

use chrono::Utc;
use serde_json::Value;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use commandbus_queue::{Message, QueueAdapter, QueueNames};

use crate::audit::AuditLog;
use crate::batch::BatchEngine;
use crate::domain::{AuditEventType, BatchType};
use crate::envelope::CommandEnvelope;
use crate::error::{CoreError, CoreResult};
use crate::repository::{CommandRepository, NewCommand};

/// One command to send, before it has a queue message or audit trail.
pub struct OutgoingCommand {
    pub domain: String,
    pub command_id: Uuid,
    pub command_type: String,
    pub data: Value,
    pub reply_to: Option<String>,
    pub correlation_id: Option<Uuid>,
    pub max_attempts: i32,
}

pub struct SendResult {
    pub command_id: Uuid,
    pub msg_id: i64,
}

pub struct SendBatchResult {
    pub batch_id: Uuid,
    pub results: Vec<SendResult>,
}

#[derive(Debug, Clone)]
pub struct CommandBus {
    queue: QueueAdapter,
    repository: CommandRepository,
    audit: AuditLog,
    batches: BatchEngine,
}

impl CommandBus {
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

    /// `spec.md` §4.5 `send`: one transaction covering save + enqueue +
    /// audit, committed before the post-send `NOTIFY`.
    pub async fn send(&self, command: OutgoingCommand) -> CoreResult<SendResult> {
        let mut tx = self.repository.pool().begin().await?;
        let result = self.send_in_tx(&mut tx, &command, None).await?;
        tx.commit().await?;
        self.queue.notify(&command.domain).await?;
        Ok(result)
    }

    /// Shared by [`CommandBus::send`] and [`CommandBus::send_batch`]:
    /// save, enqueue, and audit a single command inside an already-open
    /// transaction, optionally tagging it with a batch.
    async fn send_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        command: &OutgoingCommand,
        batch_id: Option<Uuid>,
    ) -> CoreResult<SendResult> {
        let queue_name = QueueNames::commands(&command.domain);

        self.repository
            .save(
                tx,
                &NewCommand {
                    domain: command.domain.clone(),
                    command_id: command.command_id,
                    command_type: command.command_type.clone(),
                    max_attempts: command.max_attempts,
                    queue_name: queue_name.clone(),
                    reply_queue: command.reply_to.clone(),
                    correlation_id: command.correlation_id,
                    batch_id,
                },
            )
            .await?;

        let envelope = CommandEnvelope {
            command_id: command.command_id,
            domain: command.domain.clone(),
            command_type: command.command_type.clone(),
            data: command.data.clone(),
            reply_to: command.reply_to.clone(),
            correlation_id: command.correlation_id,
            created_at: Utc::now(),
        };
        let payload = serde_json::to_value(&envelope)?;
        let msg_id = self.queue.send_in_tx(tx, &queue_name, &payload).await?;

        self.repository
            .set_msg_id(tx, &command.domain, command.command_id, msg_id)
            .await?;

        self.audit
            .append_in_tx(
                tx,
                &command.domain,
                Some(command.command_id),
                None,
                AuditEventType::Sent,
                serde_json::json!({ "msg_id": msg_id, "command_type": command.command_type }),
            )
            .await?;

        Ok(SendResult {
            command_id: command.command_id,
            msg_id,
        })
    }

    /// `spec.md` §4.5 `send_batch`: all-or-nothing across a single
    /// domain; an empty list is rejected before anything is opened.
    pub async fn send_batch(
        &self,
        domain: &str,
        commands: Vec<OutgoingCommand>,
        name: Option<&str>,
        custom_data: Option<&Value>,
    ) -> CoreResult<SendBatchResult> {
        validate_batch_domains(domain, &commands)?;

        let batch_id = Uuid::now_v7();
        let mut tx = self.repository.pool().begin().await?;

        self.batches
            .create_batch(
                &mut tx,
                domain,
                batch_id,
                BatchType::Command,
                commands.len() as i32,
                name,
                custom_data,
            )
            .await?;

        let mut results = Vec::with_capacity(commands.len());
        for command in &commands {
            results.push(self.send_in_tx(&mut tx, command, Some(batch_id)).await?);
        }

        tx.commit().await?;
        self.queue.notify(domain).await?;

        Ok(SendBatchResult { batch_id, results })
    }

    pub fn queue(&self) -> &QueueAdapter {
        &self.queue
    }

    pub fn repository(&self) -> &CommandRepository {
        &self.repository
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn batches(&self) -> &BatchEngine {
        &self.batches
    }
}

/// `spec.md` §4.5 `send_batch` precondition: non-empty, single domain.
/// Pulled out of [`CommandBus::send_batch`] so it can be exercised
/// directly without standing up a live bus.
fn validate_batch_domains(domain: &str, commands: &[OutgoingCommand]) -> CoreResult<()> {
    if commands.is_empty() {
        return Err(CoreError::EmptyBatch);
    }
    if commands.iter().any(|c| c.domain != domain) {
        return Err(CoreError::InvalidOperation(
            "all commands in a batch must belong to the same domain".into(),
        ));
    }
    Ok(())
}

/// Parse an incoming queue [`Message`] into its [`CommandEnvelope`] —
/// used by the worker, kept here so both sender and receiver agree on
/// wire shape.
pub fn parse_command_message(message: &Message) -> CoreResult<CommandEnvelope> {
    Ok(serde_json::from_value(message.payload.clone())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(domain: &str, command_type: &str) -> OutgoingCommand {
        OutgoingCommand {
            domain: domain.into(),
            command_id: Uuid::now_v7(),
            command_type: command_type.into(),
            data: serde_json::json!({}),
            reply_to: None,
            correlation_id: None,
            max_attempts: 3,
        }
    }

    #[test]
    fn send_batch_rejects_empty_list() {
        let err = validate_batch_domains("payments", &[]).unwrap_err();
        assert!(matches!(err, CoreError::EmptyBatch));
    }

    #[test]
    fn send_batch_rejects_mixed_domains() {
        let commands = vec![command("payments", "Debit"), command("reporting", "Render")];
        let err = validate_batch_domains("payments", &commands).unwrap_err();
        assert!(matches!(err, CoreError::InvalidOperation(_)));
    }

    #[test]
    fn send_batch_accepts_single_domain_batch() {
        let commands = vec![command("payments", "Debit"), command("payments", "Credit")];
        assert!(validate_batch_domains("payments", &commands).is_ok());
    }
}
