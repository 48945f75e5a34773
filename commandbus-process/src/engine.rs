//! Process Manager engine (`spec.md` §4.8 component C8): drives
//! multi-step command/reply flows and their compensation.

use std::sync::Arc;

use serde_json::Value;
use tracing::{error, warn};
use uuid::Uuid;

use commandbus_core::{
    AuditEventType, AuditLog, BatchEngine, CommandBus, OutgoingCommand, Process, ProcessStatus,
    ReplyEnvelope, ReplyOutcome, ReplyOutcomeTag,
};
use commandbus_queue::QueueNames;

use crate::error::{ProcessError, ProcessResult};
use crate::manager::{ManagerRegistry, ProcessManager};
use crate::repository::{NewProcess, ProcessRepository};

pub struct ProcessEngine {
    domain: String,
    reply_queue: String,
    max_attempts: i32,
    bus: CommandBus,
    repository: ProcessRepository,
    audit: AuditLog,
    batches: BatchEngine,
    managers: Arc<ManagerRegistry>,
}

impl ProcessEngine {
    pub fn new(
        domain: impl Into<String>,
        max_attempts: i32,
        bus: CommandBus,
        repository: ProcessRepository,
        audit: AuditLog,
        batches: BatchEngine,
        managers: Arc<ManagerRegistry>,
    ) -> Self {
        let domain = domain.into();
        Self {
            reply_queue: QueueNames::process_replies(&domain),
            domain,
            max_attempts,
            bus,
            repository,
            audit,
            batches,
            managers,
        }
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    fn manager(&self, process_type: &str) -> ProcessResult<Arc<dyn ProcessManager>> {
        self.managers
            .get(process_type)
            .ok_or_else(|| ProcessError::ManagerNotFound {
                process_type: process_type.to_string(),
            })
    }

    /// `spec.md` §4.8 `start`.
    pub async fn start(
        &self,
        process_type: &str,
        input: Value,
        batch_id: Option<Uuid>,
    ) -> ProcessResult<Uuid> {
        let manager = self.manager(process_type)?;
        let process_id = Uuid::now_v7();
        let state = manager.create_initial_state(input);
        let first_step = manager.get_first_step(&state);

        let mut tx = self.repository.pool().begin().await.map_err(commandbus_core::CoreError::from)?;
        self.repository
            .create(
                &mut tx,
                &NewProcess {
                    domain: self.domain.clone(),
                    process_id,
                    process_type: process_type.to_string(),
                    current_step: first_step.clone(),
                    state: state.clone(),
                    batch_id,
                },
            )
            .await?;
        self.audit
            .append_in_tx(
                &mut tx,
                &self.domain,
                None,
                Some(process_id),
                AuditEventType::ProcessStarted,
                serde_json::json!({"process_type": process_type, "first_step": first_step}),
            )
            .await?;
        tx.commit().await.map_err(commandbus_core::CoreError::from)?;

        self.execute_step(
            manager.as_ref(),
            process_id,
            &first_step,
            &state,
            ProcessStatus::Pending,
            ProcessStatus::WaitingForReply,
        )
        .await?;

        Ok(process_id)
    }

    /// `spec.md` §4.8 "Step execution": send the step's command, record
    /// the process-audit pairing, and move the process into
    /// `after_send_status` (`WaitingForReply` normally, `Compensating`
    /// while undoing).
    async fn execute_step(
        &self,
        manager: &dyn ProcessManager,
        process_id: Uuid,
        step: &str,
        state: &Value,
        expected_status: ProcessStatus,
        after_send_status: ProcessStatus,
    ) -> ProcessResult<()> {
        let built = manager.build_command(step, state);
        let command_id = Uuid::now_v7();

        self.bus
            .send(OutgoingCommand {
                domain: self.domain.clone(),
                command_id,
                command_type: built.command_type.clone(),
                data: built.data.clone(),
                reply_to: Some(self.reply_queue.clone()),
                correlation_id: Some(process_id),
                max_attempts: self.max_attempts,
            })
            .await?;

        let mut tx = self.repository.pool().begin().await.map_err(commandbus_core::CoreError::from)?;
        self.repository
            .record_step(&mut tx, &self.domain, process_id, command_id, step, &built.command_type, &built.data)
            .await?;
        self.audit
            .append_in_tx(
                &mut tx,
                &self.domain,
                None,
                Some(process_id),
                AuditEventType::ProcessStep,
                serde_json::json!({"step": step, "command_id": command_id, "command_type": built.command_type}),
            )
            .await?;
        self.repository
            .transition(
                &mut tx,
                &self.domain,
                process_id,
                step,
                expected_status,
                step,
                after_send_status,
                None,
                None,
                None,
                None,
            )
            .await?;
        tx.commit().await.map_err(commandbus_core::CoreError::from)?;

        Ok(())
    }

    /// `spec.md` §4.8 `handle_reply`, driven by the reply router.
    pub async fn handle_reply(&self, reply: ReplyEnvelope) -> ProcessResult<()> {
        let Some(process_id) = reply.correlation_id else {
            return Err(ProcessError::UnknownStep {
                command_id: reply.command_id,
            });
        };
        let process = self.repository.get(&self.domain, process_id).await?;
        let manager = self.manager(&process.process_type)?;

        let outcome = match reply.outcome {
            ReplyOutcomeTag::Success => ReplyOutcome::Success,
            ReplyOutcomeTag::Canceled => ReplyOutcome::Canceled,
            ReplyOutcomeTag::Failed => ReplyOutcome::Failed,
        };

        let mut tx = self.repository.pool().begin().await.map_err(commandbus_core::CoreError::from)?;
        self.repository
            .record_reply(&mut tx, &self.domain, process_id, reply.command_id, outcome, reply.data.as_ref())
            .await?;
        tx.commit().await.map_err(commandbus_core::CoreError::from)?;

        if process.compensating {
            if !matches!(outcome, ReplyOutcome::Success) {
                warn!(
                    domain = %self.domain,
                    process_id = %process_id,
                    step = %process.current_step,
                    "compensation step did not succeed; logged, continuing chain"
                );
            }
            return self.advance_compensation(manager.as_ref(), &process).await;
        }

        match outcome {
            ReplyOutcome::Failed => self.fail(&process, &reply).await,
            ReplyOutcome::Canceled => self.begin_compensation(manager.as_ref(), &process).await,
            ReplyOutcome::Success => self.advance_forward(manager.as_ref(), &process, &reply).await,
        }
    }

    async fn fail(&self, process: &Process, reply: &ReplyEnvelope) -> ProcessResult<()> {
        let error = reply.error.as_ref();
        let code = error.map(|e| e.code.as_str()).unwrap_or("UNKNOWN");
        let message = error.map(|e| e.message.as_str()).unwrap_or("");

        let mut tx = self.repository.pool().begin().await.map_err(commandbus_core::CoreError::from)?;
        self.repository
            .transition(
                &mut tx,
                &self.domain,
                process.process_id,
                &process.current_step,
                ProcessStatus::WaitingForReply,
                &process.current_step,
                ProcessStatus::Failed,
                None,
                None,
                None,
                Some((code, message)),
            )
            .await?;
        self.audit
            .append_in_tx(
                &mut tx,
                &self.domain,
                None,
                Some(process.process_id),
                AuditEventType::ProcessCompleted,
                serde_json::json!({"outcome": "FAILED", "code": code, "message": message}),
            )
            .await?;
        tx.commit().await.map_err(commandbus_core::CoreError::from)?;

        self.maybe_refresh_batch(process).await;
        Ok(())
    }

    async fn advance_forward(
        &self,
        manager: &dyn ProcessManager,
        process: &Process,
        reply: &ReplyEnvelope,
    ) -> ProcessResult<()> {
        let mut state = process.state.clone();
        manager.update_state(&mut state, &process.current_step, reply);
        let next = manager.get_next_step(&process.current_step, reply, &state);

        match next {
            None => {
                let mut tx = self.repository.pool().begin().await.map_err(commandbus_core::CoreError::from)?;
                self.repository
                    .transition(
                        &mut tx,
                        &self.domain,
                        process.process_id,
                        &process.current_step,
                        ProcessStatus::WaitingForReply,
                        &process.current_step,
                        ProcessStatus::Completed,
                        Some(&state),
                        None,
                        None,
                        None,
                    )
                    .await?;
                self.audit
                    .append_in_tx(
                        &mut tx,
                        &self.domain,
                        None,
                        Some(process.process_id),
                        AuditEventType::ProcessCompleted,
                        serde_json::json!({"outcome": "SUCCESS"}),
                    )
                    .await?;
                tx.commit().await.map_err(commandbus_core::CoreError::from)?;
                self.maybe_refresh_batch(process).await;
                Ok(())
            }
            Some(next_step) => {
                let mut tx = self.repository.pool().begin().await.map_err(commandbus_core::CoreError::from)?;
                let updated = self
                    .repository
                    .transition(
                        &mut tx,
                        &self.domain,
                        process.process_id,
                        &process.current_step,
                        ProcessStatus::WaitingForReply,
                        &next_step,
                        ProcessStatus::InProgress,
                        Some(&state),
                        None,
                        None,
                        None,
                    )
                    .await?;
                tx.commit().await.map_err(commandbus_core::CoreError::from)?;

                self.execute_step(
                    manager,
                    process.process_id,
                    &next_step,
                    &updated.state,
                    ProcessStatus::InProgress,
                    ProcessStatus::WaitingForReply,
                )
                .await
            }
        }
    }

    /// `spec.md` §4.8 "Compensation": compute the reverse-order
    /// compensation chain from completed steps and start executing it.
    async fn begin_compensation(&self, manager: &dyn ProcessManager, process: &Process) -> ProcessResult<()> {
        let completed = self
            .repository
            .successful_steps_reverse(&self.domain, process.process_id)
            .await?;
        let queue: Vec<String> = completed
            .into_iter()
            .filter_map(|entry| manager.get_compensation_step(&entry.step_name))
            .collect();
        let queue_value = serde_json::to_value(&queue)?;

        let mut tx = self.repository.pool().begin().await.map_err(commandbus_core::CoreError::from)?;
        let updated = self
            .repository
            .transition(
                &mut tx,
                &self.domain,
                process.process_id,
                &process.current_step,
                ProcessStatus::WaitingForReply,
                &process.current_step,
                ProcessStatus::Compensating,
                None,
                Some(&queue_value),
                Some(true),
                None,
            )
            .await?;
        tx.commit().await.map_err(commandbus_core::CoreError::from)?;

        self.advance_compensation(manager, &updated).await
    }

    /// Pop the next compensation step and execute it, or finish
    /// compensating once the queue is empty.
    async fn advance_compensation(&self, manager: &dyn ProcessManager, process: &Process) -> ProcessResult<()> {
        let mut queue: Vec<String> = serde_json::from_value(process.compensation_queue.clone())?;

        if queue.is_empty() {
            let mut tx = self.repository.pool().begin().await.map_err(commandbus_core::CoreError::from)?;
            self.repository
                .transition(
                    &mut tx,
                    &self.domain,
                    process.process_id,
                    &process.current_step,
                    ProcessStatus::Compensating,
                    &process.current_step,
                    ProcessStatus::Compensated,
                    None,
                    None,
                    Some(false),
                    None,
                )
                .await?;
            self.audit
                .append_in_tx(
                    &mut tx,
                    &self.domain,
                    None,
                    Some(process.process_id),
                    AuditEventType::ProcessCompensated,
                    serde_json::json!({}),
                )
                .await?;
            tx.commit().await.map_err(commandbus_core::CoreError::from)?;
            self.maybe_refresh_batch(process).await;
            return Ok(());
        }

        let step = queue.remove(0);
        let queue_value = serde_json::to_value(&queue)?;

        let mut tx = self.repository.pool().begin().await.map_err(commandbus_core::CoreError::from)?;
        let updated = self
            .repository
            .transition(
                &mut tx,
                &self.domain,
                process.process_id,
                &process.current_step,
                ProcessStatus::Compensating,
                &step,
                ProcessStatus::Compensating,
                None,
                Some(&queue_value),
                None,
                None,
            )
            .await?;
        tx.commit().await.map_err(commandbus_core::CoreError::from)?;

        self.execute_step(
            manager,
            process.process_id,
            &step,
            &updated.state,
            ProcessStatus::Compensating,
            ProcessStatus::Compensating,
        )
        .await
    }

    async fn maybe_refresh_batch(&self, process: &Process) {
        if let Some(batch_id) = process.batch_id {
            if let Err(e) = self.batches.refresh(&self.domain, batch_id).await {
                error!(domain = %self.domain, batch_id = %batch_id, error = %e, "batch refresh failed after process completion");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_queue_follows_domain_convention() {
        assert_eq!(QueueNames::process_replies("reporting"), "reporting__process_replies");
    }
}
