//! Main dispatch loop (`spec.md` §4.6 component C6): tight drain with a
//! long wake, one transaction per message, retry/TSQ routing on failure.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, error, info, warn};

use commandbus_core::{
    AuditEventType, AuditLog, BatchEngine, Command, CommandRepository, CommandStatus,
    CommandBusConfig, ErrorDetail, ErrorKind, ReplyEnvelope,
};
use commandbus_queue::QueueAdapter;

use crate::error::WorkerError;
use crate::health::HealthCounters;
use crate::outcome::{HandlerContext, HandlerRegistry, Outcome};
use crate::policy::{RetryDecision, RetryPolicy};

/// Wait between drain-loop checks while every concurrency slot is taken.
const SLOT_WAIT: Duration = Duration::from_millis(50);
/// Grace period past `visibility_timeout` before a task is declared
/// abandoned (`spec.md` §4.6 "Thread/task abandonment").
const ABANDONMENT_GRACE: Duration = Duration::from_secs(5);
/// How long to wait for a pool connection before declaring
/// `QueuePoolExhaustion` (`spec.md` §7).
const POOL_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// One worker process for a single domain's command queue.
pub struct Worker {
    domain: String,
    queue_name: String,
    queue: QueueAdapter,
    repository: CommandRepository,
    audit: AuditLog,
    batches: BatchEngine,
    handlers: Arc<HandlerRegistry>,
    retry_policy: RetryPolicy,
    health: Arc<HealthCounters>,
    concurrency: usize,
    poll_interval: Duration,
    visibility_timeout: i32,
    statement_timeout_ms: u64,
}

impl Worker {
    pub fn new(
        domain: impl Into<String>,
        queue: QueueAdapter,
        repository: CommandRepository,
        audit: AuditLog,
        batches: BatchEngine,
        handlers: Arc<HandlerRegistry>,
        config: &CommandBusConfig,
    ) -> Self {
        let domain = domain.into();
        Self {
            queue_name: commandbus_queue::QueueNames::commands(&domain),
            domain,
            queue,
            repository,
            audit,
            batches,
            handlers,
            retry_policy: RetryPolicy::new(config.max_attempts as i32, config.backoff_schedule.clone()),
            health: Arc::new(HealthCounters::default()),
            concurrency: config.concurrency,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            visibility_timeout: config.visibility_timeout,
            statement_timeout_ms: config.statement_timeout_ms,
        }
    }

    pub fn health(&self) -> Arc<HealthCounters> {
        self.health.clone()
    }

    /// Runs until `stop` fires. `spec.md` §4.6 "Main loop".
    pub async fn run(self: Arc<Self>, mut stop: tokio::sync::watch::Receiver<bool>) {
        let mut wake = self.queue.subscribe(&self.domain);
        let semaphore = Arc::new(Semaphore::new(self.concurrency));

        info!(domain = %self.domain, concurrency = self.concurrency, "worker started");

        loop {
            self.clone().drain(&semaphore).await;

            tokio::select! {
                _ = wake.recv() => { debug!(domain = %self.domain, "woke on NOTIFY"); }
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = stop.changed() => {
                    if *stop.borrow() {
                        info!(domain = %self.domain, "worker stopping");
                        return;
                    }
                }
            }
        }
    }

    /// Inner drain loop: keep receiving and spawning until the queue is
    /// empty or every slot is occupied and none frees up.
    async fn drain(self: &Arc<Self>, semaphore: &Arc<Semaphore>) {
        loop {
            let available = semaphore.available_permits();
            if available == 0 {
                tokio::time::sleep(SLOT_WAIT).await;
                // Re-check rather than looping forever if nothing ever frees;
                // the outer loop's NOTIFY/poll_interval wait bounds total wait.
                if semaphore.available_permits() == 0 {
                    return;
                }
                continue;
            }

            let received = match self
                .repository
                .sp_receive(&self.domain, &self.queue_name, available as i32, self.visibility_timeout)
                .await
            {
                Ok(rows) => rows,
                Err(e) => {
                    error!(domain = %self.domain, error = %e, "sp_receive_command failed");
                    self.health.record_failure();
                    return;
                }
            };

            if received.is_empty() {
                return;
            }

            for (command, payload) in received {
                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => break,
                };
                self.clone().spawn_tracked(command, payload, permit);
            }
        }
    }

    /// Spawn the handler invocation in its own task and a supervisor task
    /// that frees the slot either on completion or on abandonment. The
    /// inner task is never aborted once abandoned — only unwatched.
    fn spawn_tracked(
        self: Arc<Self>,
        command: Command,
        payload: Value,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        let (done_tx, done_rx) = oneshot::channel();
        let worker = self.clone();
        tokio::spawn(async move {
            worker.process_one(command, payload).await;
            let _ = done_tx.send(());
        });

        let deadline = Duration::from_secs(self.visibility_timeout as u64) + ABANDONMENT_GRACE;
        let health = self.health.clone();
        let domain = self.domain.clone();
        tokio::spawn(async move {
            if tokio::time::timeout(deadline, done_rx).await.is_err() {
                health.record_stuck_thread();
                warn!(domain = %domain, "processing task exceeded abandonment deadline; slot freed, task left running");
            }
            drop(permit);
        });
    }

    /// Wait up to [`POOL_ACQUIRE_TIMEOUT`] for a pool connection, bumping
    /// the `QueuePoolExhaustion` health counter (`spec.md` §7) on timeout
    /// rather than treating it as a generic failure.
    async fn begin_tx(&self, domain: &str) -> Result<sqlx::Transaction<'static, sqlx::Postgres>, WorkerError> {
        match tokio::time::timeout(POOL_ACQUIRE_TIMEOUT, self.repository.pool().begin()).await {
            Ok(Ok(tx)) => Ok(tx),
            Ok(Err(e)) => Err(WorkerError::Database(e)),
            Err(_) => Err(WorkerError::QueuePoolExhaustion {
                domain: domain.to_string(),
            }),
        }
    }

    /// Per-message processing (`spec.md` §4.6 "Per-message processing").
    async fn process_one(&self, command: Command, payload: Value) {
        let handler = match self.handlers.get(&command.domain, &command.command_type) {
            Some(h) => h,
            None => {
                let err = WorkerError::HandlerMissing {
                    domain: command.domain.clone(),
                    command_type: command.command_type.clone(),
                };
                error!(domain = %command.domain, command_type = %command.command_type, error = %err, "routing to troubleshooting queue");
                self.move_to_tsq(
                    &command,
                    ErrorDetail {
                        kind: ErrorKind::Permanent,
                        code: "HANDLER_MISSING".into(),
                        message: err.to_string(),
                    },
                    "PERMANENT",
                )
                .await;
                return;
            }
        };

        let mut tx = match self.begin_tx(&command.domain).await {
            Ok(tx) => tx,
            Err(e @ WorkerError::QueuePoolExhaustion { .. }) => {
                error!(domain = %command.domain, error = %e, "failed to open handler transaction");
                self.health.record_pool_exhaustion();
                return;
            }
            Err(e) => {
                error!(domain = %command.domain, error = %e, "failed to open handler transaction");
                self.health.record_failure();
                return;
            }
        };

        // SET LOCAL does not accept bind parameters; statement_timeout_ms
        // is operator configuration, not user input.
        if let Err(e) = sqlx::query(&format!(
            "SET LOCAL statement_timeout = {}",
            self.statement_timeout_ms
        ))
        .execute(tx.as_mut())
        .await
        {
            error!(domain = %command.domain, error = %e, "failed to apply statement_timeout");
            self.health.record_failure();
            return;
        }

        let outcome = {
            let mut ctx = HandlerContext {
                command: &command,
                attempt: command.attempts,
                max_attempts: command.max_attempts,
                msg_id: command.msg_id.unwrap_or_default(),
                tx: &mut tx,
            };
            handler.handle(payload, &mut ctx).await
        };

        match outcome {
            Outcome::Success(data) => self.finish_success(tx, &command, data).await,
            Outcome::Transient { code, message } => {
                let _ = tx.rollback().await;
                self.handle_transient(&command, code, message).await;
            }
            Outcome::Permanent { code, message } => {
                let _ = tx.rollback().await;
                self.move_to_tsq(
                    &command,
                    ErrorDetail {
                        kind: ErrorKind::Permanent,
                        code,
                        message,
                    },
                    "PERMANENT",
                )
                .await;
            }
        }
    }

    async fn finish_success(
        &self,
        mut tx: sqlx::Transaction<'static, sqlx::Postgres>,
        command: &Command,
        data: Option<Value>,
    ) {
        let finished = match self
            .repository
            .sp_finish(&mut tx, &command.domain, command.command_id, CommandStatus::Completed, None)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                error!(domain = %command.domain, command_id = %command.command_id, error = %e, "sp_finish_command failed");
                let _ = tx.rollback().await;
                self.health.record_failure();
                return;
            }
        };

        if let Some(msg_id) = command.msg_id {
            if let Err(e) = self.queue.delete_in_tx(&mut tx, &command.queue_name, msg_id).await {
                error!(domain = %command.domain, error = %e, "failed to delete completed message");
                let _ = tx.rollback().await;
                self.health.record_failure();
                return;
            }
        }

        if let Some(reply_queue) = command.reply_queue.clone() {
            let reply = ReplyEnvelope::success(command.command_id, command.correlation_id, data);
            match serde_json::to_value(&reply) {
                Ok(payload) => {
                    if let Err(e) = self.queue.send_in_tx(&mut tx, &reply_queue, &payload).await {
                        error!(domain = %command.domain, error = %e, "failed to enqueue success reply");
                        let _ = tx.rollback().await;
                        self.health.record_failure();
                        return;
                    }
                }
                Err(e) => {
                    error!(domain = %command.domain, error = %e, "failed to serialize success reply");
                    let _ = tx.rollback().await;
                    self.health.record_failure();
                    return;
                }
            }
        }

        if let Err(e) = self
            .audit
            .append_in_tx(
                &mut tx,
                &command.domain,
                Some(command.command_id),
                None,
                AuditEventType::Completed,
                serde_json::json!({"attempt": command.attempts}),
            )
            .await
        {
            warn!(domain = %command.domain, error = %e, "failed to append COMPLETED audit event");
        }

        if let Err(e) = tx.commit().await {
            error!(domain = %command.domain, command_id = %command.command_id, error = %e, "failed to commit completion");
            self.health.record_failure();
            return;
        }

        if let Err(e) = self.queue.notify(&command.domain).await {
            warn!(domain = %command.domain, error = %e, "post-commit NOTIFY failed");
        }

        if let Some(batch_id) = finished.batch_id {
            if let Err(e) = self.batches.refresh(&command.domain, batch_id).await {
                warn!(domain = %command.domain, batch_id = %batch_id, error = %e, "batch refresh failed after completion");
            }
        }

        self.health.record_success(Utc::now());
    }

    /// `spec.md` §4.6 step 4: backoff or exhaustion-to-TSQ.
    async fn handle_transient(&self, command: &Command, code: String, message: String) {
        let error = ErrorDetail {
            kind: ErrorKind::Transient,
            code: code.clone(),
            message: message.clone(),
        };

        if let Err(e) = self
            .repository
            .note_transient_failure(&command.domain, command.command_id, &error)
            .await
        {
            warn!(domain = %command.domain, error = %e, "failed to record transient failure metadata");
        }

        if let Err(e) = self
            .audit
            .append(
                &command.domain,
                Some(command.command_id),
                None,
                AuditEventType::Failed,
                serde_json::json!({"attempt": command.attempts, "kind": "TRANSIENT", "code": code, "message": message}),
            )
            .await
        {
            warn!(domain = %command.domain, error = %e, "failed to append FAILED audit event");
        }

        match self.retry_policy.decide(command.attempts) {
            RetryDecision::Backoff(delay) => {
                if let Some(msg_id) = command.msg_id {
                    if let Err(e) = self.queue.set_vt(&command.queue_name, msg_id, delay as i32).await {
                        warn!(domain = %command.domain, error = %e, "failed to extend visibility timeout");
                    }
                }
                if let Err(e) = self
                    .audit
                    .append(
                        &command.domain,
                        Some(command.command_id),
                        None,
                        AuditEventType::RetryScheduled,
                        serde_json::json!({"attempt": command.attempts, "delay_s": delay, "code": code}),
                    )
                    .await
                {
                    warn!(domain = %command.domain, error = %e, "failed to append RETRY_SCHEDULED audit event");
                }
                self.health.record_failure();
            }
            RetryDecision::Exhausted => {
                self.move_to_tsq(command, error, "EXHAUSTED").await;
            }
        }
    }

    /// `spec.md` §4.6 steps 4-5: archive the message and mark the command
    /// parked for operator review.
    async fn move_to_tsq(&self, command: &Command, error: ErrorDetail, reason: &str) {
        let mut tx = match self.begin_tx(&command.domain).await {
            Ok(tx) => tx,
            Err(e @ WorkerError::QueuePoolExhaustion { .. }) => {
                error!(domain = %command.domain, error = %e, "failed to open TSQ transition transaction");
                self.health.record_pool_exhaustion();
                return;
            }
            Err(e) => {
                error!(domain = %command.domain, error = %e, "failed to open TSQ transition transaction");
                self.health.record_failure();
                return;
            }
        };

        if let Some(msg_id) = command.msg_id {
            if let Err(e) = self.queue.archive_in_tx(&mut tx, &command.queue_name, msg_id).await {
                error!(domain = %command.domain, error = %e, "failed to archive message for TSQ");
                let _ = tx.rollback().await;
                self.health.record_failure();
                return;
            }
        }

        let updated = match self
            .repository
            .sp_finish(
                &mut tx,
                &command.domain,
                command.command_id,
                CommandStatus::InTroubleshootingQueue,
                Some(error.clone()),
            )
            .await
        {
            Ok(c) => c,
            Err(e) => {
                error!(domain = %command.domain, error = %e, "sp_finish_command (TSQ) failed");
                let _ = tx.rollback().await;
                self.health.record_failure();
                return;
            }
        };

        if let Some(correlation_id) = command.correlation_id {
            if let Err(e) = self
                .repository
                .mark_process_waiting_for_tsq(&mut tx, &command.domain, correlation_id)
                .await
            {
                warn!(domain = %command.domain, error = %e, "failed to mark owning process WAITING_FOR_TSQ");
            }
        }

        if let Err(e) = self
            .audit
            .append_in_tx(
                &mut tx,
                &command.domain,
                Some(command.command_id),
                None,
                AuditEventType::MovedToTsq,
                serde_json::json!({"reason": reason, "code": error.code, "message": error.message}),
            )
            .await
        {
            warn!(domain = %command.domain, error = %e, "failed to append MOVED_TO_TSQ audit event");
        }

        if let Err(e) = tx.commit().await {
            error!(domain = %command.domain, command_id = %command.command_id, error = %e, "failed to commit TSQ transition");
            self.health.record_failure();
            return;
        }

        self.health.record_failure();

        if let Some(batch_id) = updated.batch_id {
            if let Err(e) = self.batches.refresh(&command.domain, batch_id).await {
                warn!(domain = %command.domain, batch_id = %batch_id, error = %e, "batch refresh failed after TSQ transition");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> CommandBusConfig {
        CommandBusConfig {
            database_url: "postgres://localhost/commandbus".into(),
            max_attempts: 3,
            backoff_schedule: commandbus_core::BackoffSchedule(vec![10, 60]),
            visibility_timeout: 30,
            statement_timeout_ms: 15_000,
            concurrency: 4,
            poll_interval_ms: 500,
            pool_min: 2,
            pool_max: 20,
            router_concurrency: 4,
        }
    }

    #[test]
    fn retry_policy_built_from_config_matches_config_values() {
        let config = sample_config();
        let policy = RetryPolicy::new(config.max_attempts as i32, config.backoff_schedule.clone());
        assert_eq!(policy.max_attempts(), 3);
    }
}
