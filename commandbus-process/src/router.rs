//! Reply Router (`spec.md` §4.9 component C9): drains a domain's
//! `<domain>__process_replies` queue and feeds each reply to the engine.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, error, info, warn};

use commandbus_core::{CoreError, ReplyEnvelope};
use commandbus_queue::QueueAdapter;

use crate::engine::ProcessEngine;
use crate::error::ProcessError;

/// How many replies to pull per poll.
const BATCH_SIZE: i32 = 20;
/// Visibility timeout for reply messages; generous since `handle_reply`
/// opens at most a couple of short transactions.
const REPLY_VT_S: i32 = 30;
/// Wait between drain-loop checks while every concurrency slot is taken,
/// mirroring the command worker's drain loop.
const SLOT_WAIT: Duration = Duration::from_millis(50);
/// Grace period past the reply visibility timeout before a task is
/// declared abandoned.
const ABANDONMENT_GRACE: Duration = Duration::from_secs(5);

pub struct ReplyRouter {
    domain: String,
    queue_name: String,
    queue: QueueAdapter,
    engine: Arc<ProcessEngine>,
    poll_interval: Duration,
    concurrency: usize,
}

impl ReplyRouter {
    pub fn new(
        domain: impl Into<String>,
        queue: QueueAdapter,
        engine: Arc<ProcessEngine>,
        poll_interval_ms: u64,
        concurrency: usize,
    ) -> Self {
        let domain = domain.into();
        let queue_name = commandbus_queue::QueueNames::process_replies(&domain);
        Self {
            domain,
            queue_name,
            queue,
            engine,
            poll_interval: Duration::from_millis(poll_interval_ms),
            concurrency,
        }
    }

    /// Runs until `stop` fires. Mirrors the command worker's tight-drain,
    /// long-wake loop and its concurrency-bounded task pool
    /// (`spec.md` §4.9).
    pub async fn run(self: Arc<Self>, mut stop: tokio::sync::watch::Receiver<bool>) {
        let mut wake = self.queue.subscribe(&self.domain);
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        info!(domain = %self.domain, queue = %self.queue_name, concurrency = self.concurrency, "reply router started");

        loop {
            self.clone().drain(&semaphore).await;

            tokio::select! {
                _ = wake.recv() => { debug!(domain = %self.domain, "reply router woke on NOTIFY"); }
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = stop.changed() => {
                    if *stop.borrow() {
                        info!(domain = %self.domain, "reply router stopping");
                        return;
                    }
                }
            }
        }
    }

    async fn drain(self: &Arc<Self>, semaphore: &Arc<Semaphore>) {
        loop {
            let available = semaphore.available_permits();
            if available == 0 {
                tokio::time::sleep(SLOT_WAIT).await;
                if semaphore.available_permits() == 0 {
                    return;
                }
                continue;
            }

            let messages = match self
                .queue
                .read(&self.queue_name, REPLY_VT_S, available.min(BATCH_SIZE as usize) as i32)
                .await
            {
                Ok(m) => m,
                Err(e) => {
                    error!(domain = %self.domain, error = %e, "failed to read process replies");
                    return;
                }
            };
            if messages.is_empty() {
                return;
            }

            let drained = messages.len();
            for message in messages {
                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => break,
                };
                self.clone().spawn_tracked(message, permit);
            }

            if drained < BATCH_SIZE as usize {
                return;
            }
        }
    }

    /// Spawn the reply handling in its own task and a supervisor task
    /// that frees the slot either on completion or on abandonment, same
    /// pattern as `Worker::spawn_tracked`.
    fn spawn_tracked(self: Arc<Self>, message: commandbus_queue::Message, permit: tokio::sync::OwnedSemaphorePermit) {
        let (done_tx, done_rx) = oneshot::channel();
        let router = self.clone();
        tokio::spawn(async move {
            router.handle_message(message).await;
            let _ = done_tx.send(());
        });

        let deadline = Duration::from_secs(REPLY_VT_S as u64) + ABANDONMENT_GRACE;
        let domain = self.domain.clone();
        tokio::spawn(async move {
            if tokio::time::timeout(deadline, done_rx).await.is_err() {
                warn!(domain = %domain, "reply processing task exceeded abandonment deadline; slot freed, task left running");
            }
            drop(permit);
        });
    }

    async fn handle_message(&self, message: commandbus_queue::Message) {
        let reply: ReplyEnvelope = match serde_json::from_value(message.payload.clone()) {
            Ok(r) => r,
            Err(e) => {
                error!(domain = %self.domain, msg_id = message.msg_id, error = %e, "unparseable reply payload; leaving for operator inspection");
                return;
            }
        };

        match self.engine.handle_reply(reply).await {
            Ok(()) => {
                if let Err(e) = self.queue.delete(&self.queue_name, message.msg_id).await {
                    warn!(domain = %self.domain, msg_id = message.msg_id, error = %e, "failed to delete processed reply");
                }
            }
            Err(e) if is_unroutable(&e) => {
                // Unknown correlation id or no manager registered: the
                // reply can never be resolved by redelivery, so log and
                // drop it instead of letting read_ct climb forever
                // (`spec.md` §4.9 steps 2-4).
                warn!(domain = %self.domain, msg_id = message.msg_id, error = %e, "reply unroutable; dropping");
                if let Err(e) = self.queue.delete(&self.queue_name, message.msg_id).await {
                    warn!(domain = %self.domain, msg_id = message.msg_id, error = %e, "failed to delete unroutable reply");
                }
            }
            Err(e) => {
                // Left in place; VT expiry redelivers it.
                warn!(domain = %self.domain, msg_id = message.msg_id, error = %e, "handle_reply failed; leaving message for redelivery");
            }
        }
    }
}

/// A reply that can never succeed no matter how many times it is
/// redelivered: the correlation id names no process, or no manager is
/// registered for its process type.
fn is_unroutable(err: &ProcessError) -> bool {
    matches!(
        err,
        ProcessError::ManagerNotFound { .. }
            | ProcessError::UnknownStep { .. }
            | ProcessError::Core(CoreError::ProcessNotFound { .. })
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_queue_name_matches_domain_convention() {
        let queue_name = commandbus_queue::QueueNames::process_replies("reporting");
        assert_eq!(queue_name, "reporting__process_replies");
    }

    #[test]
    fn manager_not_found_is_unroutable() {
        let err = ProcessError::ManagerNotFound {
            process_type: "StatementReportProcess".into(),
        };
        assert!(is_unroutable(&err));
    }

    #[test]
    fn core_process_not_found_is_unroutable() {
        let err = ProcessError::Core(CoreError::ProcessNotFound {
            domain: "reporting".into(),
            process_id: uuid::Uuid::nil(),
        });
        assert!(is_unroutable(&err));
    }

    #[test]
    fn database_error_is_left_for_redelivery() {
        let err = ProcessError::Database(sqlx::Error::PoolClosed);
        assert!(!is_unroutable(&err));
    }
}
