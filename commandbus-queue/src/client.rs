//! `QueueAdapter` — the thin, typed surface over PGMQ primitives described in
//! `spec.md` §4.1.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgmq::{errors::PgmqError, PGMQueueExt};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};

use std::sync::Arc;
use std::time::Duration;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::error::{QueueError, QueueResult};
use crate::listener::SharedListenerManager;
use crate::message::{Message, QueueNames};

fn map_pgmq_err(e: PgmqError) -> QueueError {
    QueueError::Database(sqlx::Error::Protocol(e.to_string()))
}

/// PGMQ-backed implementation of the queue adapter.
///
/// Wraps `pgmq::PGMQueueExt` for the queue primitives and a
/// [`SharedListenerManager`] for `LISTEN`/`NOTIFY` wake-ups, following the
/// host project's `PgmqMessagingService` design.
#[derive(Debug, Clone)]
pub struct QueueAdapter {
    pool: PgPool,
    queues: PGMQueueExt,
    listener: SharedListenerManager,
    breaker: Arc<CircuitBreaker>,
}

impl QueueAdapter {
    pub async fn new(database_url: &str) -> QueueResult<Self> {
        let queues = PGMQueueExt::new(database_url.to_string(), 5)
            .await
            .map_err(map_pgmq_err)?;
        let pool = queues.connection.clone();
        let listener = SharedListenerManager::new(pool.clone());
        Ok(Self {
            pool,
            queues,
            listener,
            breaker: default_breaker(),
        })
    }

    pub async fn new_with_pool(pool: PgPool) -> QueueResult<Self> {
        let queues = PGMQueueExt::new_with_pool(pool.clone()).await;
        let listener = SharedListenerManager::new(pool.clone());
        Ok(Self {
            pool,
            queues,
            listener,
            breaker: default_breaker(),
        })
    }

    /// Snapshot of the send/receive circuit breaker's state, for health
    /// reporting alongside [`crate::QueueAdapter`]'s other counters.
    pub fn circuit_metrics(&self) -> crate::circuit_breaker::CircuitBreakerMetrics {
        self.breaker.metrics()
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Ensure the named queue (and its PGMQ archive table) exist.
    pub async fn ensure_queue(&self, queue: &str) -> QueueResult<()> {
        self.queues
            .create(queue)
            .await
            .map(|_| ())
            .map_err(map_pgmq_err)
    }

    /// Create the per-domain command queue and its process-reply queue.
    pub async fn ensure_domain_queues(&self, domain: &str) -> QueueResult<()> {
        self.ensure_queue(&QueueNames::commands(domain)).await?;
        self.ensure_queue(&QueueNames::process_replies(domain)).await
    }

    pub async fn send(&self, queue: &str, payload: &Value) -> QueueResult<i64> {
        if !self.breaker.should_allow() {
            return Err(QueueError::CircuitOpen {
                name: self.breaker.name().to_string(),
            });
        }
        let result = self.queues.send(queue, payload).await.map_err(map_pgmq_err);
        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(_) => self.breaker.record_failure(),
        }
        let msg_id = result?;
        self.notify_after_send(queue).await;
        Ok(msg_id)
    }

    /// Send inside an ambient transaction. The `NOTIFY` is deferred until the
    /// caller commits — PostgreSQL only delivers `NOTIFY` after the issuing
    /// transaction commits, so callers must invoke [`QueueAdapter::notify`]
    /// themselves once their transaction has committed.
    pub async fn send_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        queue: &str,
        payload: &Value,
    ) -> QueueResult<i64> {
        let (msg_id,): (i64,) = sqlx::query_as("SELECT * FROM pgmq.send($1, $2, 0)")
            .bind(queue)
            .bind(payload)
            .fetch_one(tx.as_mut())
            .await?;
        Ok(msg_id)
    }

    pub async fn send_delayed(
        &self,
        queue: &str,
        payload: &Value,
        delay_seconds: i32,
    ) -> QueueResult<i64> {
        let msg_id = self
            .queues
            .send_delay(queue, payload, delay_seconds)
            .await
            .map_err(map_pgmq_err)?;
        self.notify_after_send(queue).await;
        Ok(msg_id)
    }

    pub async fn read(
        &self,
        queue: &str,
        visibility_timeout_s: i32,
        limit: i32,
    ) -> QueueResult<Vec<Message>> {
        if !self.breaker.should_allow() {
            return Err(QueueError::CircuitOpen {
                name: self.breaker.name().to_string(),
            });
        }
        let result = self
            .queues
            .read_batch_with_poll(queue, visibility_timeout_s, limit, None, None)
            .await
            .map_err(map_pgmq_err);
        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(_) => self.breaker.record_failure(),
        }
        let batch: Option<Vec<pgmq::Message<Value>>> = result?;
        Ok(batch
            .unwrap_or_default()
            .into_iter()
            .map(from_pgmq_message)
            .collect())
    }

    pub async fn delete(&self, queue: &str, msg_id: i64) -> QueueResult<bool> {
        self.queues.delete(queue, msg_id).await.map_err(map_pgmq_err)
    }

    /// Archive preserves the payload in PGMQ's archive table so an operator
    /// can later re-send it via [`QueueAdapter::read_archived_payload`].
    pub async fn archive(&self, queue: &str, msg_id: i64) -> QueueResult<bool> {
        self.queues.archive(queue, msg_id).await.map_err(map_pgmq_err)
    }

    /// Delete inside an ambient transaction, so a command's completion
    /// bookkeeping and its queue-message removal commit or roll back
    /// together (`spec.md` §4.6 step 3).
    pub async fn delete_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        queue: &str,
        msg_id: i64,
    ) -> QueueResult<bool> {
        let table = format!("pgmq.q_{queue}");
        let result = sqlx::query(&format!("DELETE FROM {table} WHERE msg_id = $1"))
            .bind(msg_id)
            .execute(tx.as_mut())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Archive inside an ambient transaction (`spec.md` §4.6 steps 4-5:
    /// moving a command to the troubleshooting queue archives its
    /// message atomically with the status transition).
    pub async fn archive_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        queue: &str,
        msg_id: i64,
    ) -> QueueResult<bool> {
        let (archived,): (bool,) = sqlx::query_as("SELECT * FROM pgmq.archive($1, $2)")
            .bind(queue)
            .bind(msg_id)
            .fetch_one(tx.as_mut())
            .await?;
        Ok(archived)
    }

    pub async fn set_vt(
        &self,
        queue: &str,
        msg_id: i64,
        new_vt_s: i32,
    ) -> QueueResult<DateTime<Utc>> {
        let updated: Option<pgmq::Message<Value>> = Some(
            self.queues
                .set_vt(queue, msg_id, new_vt_s)
                .await
                .map_err(map_pgmq_err)?,
        );
        updated
            .map(|m| m.vt)
            .ok_or_else(|| QueueError::MessageNotFound {
                queue: queue.to_string(),
                msg_id,
            })
    }

    pub async fn pop(&self, queue: &str) -> QueueResult<Option<Message>> {
        let popped: Option<pgmq::Message<Value>> =
            self.queues.pop(queue).await.map_err(map_pgmq_err)?;
        Ok(popped.map(from_pgmq_message))
    }

    /// Read the archived payload for an operator-retry (`spec.md` §4.7).
    pub async fn read_archived_payload(
        &self,
        queue: &str,
        msg_id: i64,
    ) -> QueueResult<Option<Value>> {
        let archive_table = format!("pgmq.a_{queue}");
        let row: Option<(Value,)> = sqlx::query_as(&format!(
            "SELECT message FROM {archive_table} WHERE msg_id = $1"
        ))
        .bind(msg_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(message,)| message))
    }

    /// Emit a `NOTIFY` on the domain channel. Must be called after the
    /// enclosing transaction commits, per `spec.md` §4.1.
    pub async fn notify(&self, domain: &str) -> QueueResult<()> {
        let channel = QueueNames::notify_channel(domain);
        sqlx::query("SELECT pg_notify($1, '')")
            .bind(&channel)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn notify_after_send(&self, queue: &str) {
        if let Some(domain) = queue.strip_suffix("__commands") {
            if let Err(e) = self.notify(domain).await {
                tracing::warn!(queue = %queue, error = %e, "failed to emit post-send NOTIFY");
            }
        }
    }

    /// Subscribe to wake-ups for a domain's command queue.
    pub fn subscribe(&self, domain: &str) -> tokio::sync::mpsc::Receiver<()> {
        self.listener.subscribe(&QueueNames::notify_channel(domain))
    }
}

fn default_breaker() -> Arc<CircuitBreaker> {
    Arc::new(CircuitBreaker::new(
        "queue_adapter".to_string(),
        CircuitBreakerConfig {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            success_threshold: 2,
        },
    ))
}

fn from_pgmq_message(m: pgmq::Message<Value>) -> Message {
    Message {
        msg_id: m.msg_id,
        read_ct: m.read_ct,
        enqueued_at: m.enqueued_at,
        vt: m.vt,
        payload: m.message,
    }
}

/// Object-safe facade used by higher layers that need to swap the queue
/// implementation in tests (an in-memory fake, say) without depending on
/// PGMQ directly.
#[async_trait]
pub trait QueueOperations: Send + Sync {
    async fn send(&self, queue: &str, payload: &Value) -> QueueResult<i64>;
    async fn read(&self, queue: &str, vt_s: i32, limit: i32) -> QueueResult<Vec<Message>>;
    async fn delete(&self, queue: &str, msg_id: i64) -> QueueResult<bool>;
    async fn archive(&self, queue: &str, msg_id: i64) -> QueueResult<bool>;
    async fn set_vt(&self, queue: &str, msg_id: i64, new_vt_s: i32) -> QueueResult<DateTime<Utc>>;
}

#[async_trait]
impl QueueOperations for QueueAdapter {
    async fn send(&self, queue: &str, payload: &Value) -> QueueResult<i64> {
        QueueAdapter::send(self, queue, payload).await
    }

    async fn read(&self, queue: &str, vt_s: i32, limit: i32) -> QueueResult<Vec<Message>> {
        QueueAdapter::read(self, queue, vt_s, limit).await
    }

    async fn delete(&self, queue: &str, msg_id: i64) -> QueueResult<bool> {
        QueueAdapter::delete(self, queue, msg_id).await
    }

    async fn archive(&self, queue: &str, msg_id: i64) -> QueueResult<bool> {
        QueueAdapter::archive(self, queue, msg_id).await
    }

    async fn set_vt(&self, queue: &str, msg_id: i64, new_vt_s: i32) -> QueueResult<DateTime<Utc>> {
        QueueAdapter::set_vt(self, queue, msg_id, new_vt_s).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_names_used_for_notify_channel_match_commands_suffix() {
        let domain = "payments__commands".strip_suffix("__commands");
        assert_eq!(domain, Some("payments"));
    }
}
