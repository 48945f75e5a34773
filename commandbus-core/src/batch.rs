//! Batch Engine (`spec.md` §4.4 component C4): counter discipline, status
//! transitions, and the ephemeral completion-callback registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::domain::{Batch, BatchStatus, BatchType};
use crate::error::{CoreError, CoreResult};

/// Invoked once, outside any DB transaction, when a batch reaches a
/// terminal status. Exceptions are logged and swallowed by the caller; a
/// process restart loses unregistered callbacks (`spec.md` §4.4).
pub type BatchCallback = Box<dyn FnOnce(Batch) + Send>;

#[derive(Clone)]
pub struct BatchEngine {
    pool: PgPool,
    callbacks: Arc<Mutex<HashMap<(String, Uuid), BatchCallback>>>,
}

impl std::fmt::Debug for BatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchEngine")
            .field(
                "pending_callbacks",
                &self
                    .callbacks
                    .lock()
                    .map(|c| c.len())
                    .unwrap_or_default(),
            )
            .finish()
    }
}

impl BatchEngine {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            callbacks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Insert a new batch row inside the caller's transaction. Per-command
    /// sends still go through [`crate::bus::CommandBus`]; this only owns
    /// the aggregate row.
    pub async fn create_batch(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        domain: &str,
        batch_id: Uuid,
        batch_type: BatchType,
        total_count: i32,
        name: Option<&str>,
        custom_data: Option<&Value>,
    ) -> CoreResult<()> {
        if total_count == 0 {
            return Err(CoreError::EmptyBatch);
        }
        sqlx::query(
            "INSERT INTO commandbus.batch
                (domain, batch_id, batch_type, name, custom_data, status, total_count)
             VALUES ($1, $2, $3, $4, $5, 'PENDING', $6)",
        )
        .bind(domain)
        .bind(batch_id)
        .bind(batch_type)
        .bind(name)
        .bind(custom_data)
        .bind(total_count)
        .execute(tx.as_mut())
        .await?;
        Ok(())
    }

    /// Register a completion callback, keyed by `(domain, batch_id)`. A
    /// second registration for the same key replaces the first.
    pub fn register_callback(&self, domain: &str, batch_id: Uuid, callback: BatchCallback) {
        self.callbacks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert((domain.to_string(), batch_id), callback);
    }

    /// Recompute counters via `sp_refresh_batch_stats` and, if the batch
    /// just became terminal, fire and remove its callback. Called after
    /// every command/process terminal transition that carries a
    /// `batch_id` (`spec.md` §4.4 "Counter discipline").
    pub async fn refresh(&self, domain: &str, batch_id: Uuid) -> CoreResult<Batch> {
        let batch: Batch =
            sqlx::query_as("SELECT * FROM commandbus.sp_refresh_batch_stats($1, $2)")
                .bind(domain)
                .bind(batch_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| CoreError::BatchNotFound {
                    domain: domain.to_string(),
                    batch_id,
                })?;

        if matches!(
            batch.status,
            BatchStatus::Completed | BatchStatus::CompletedWithFailures
        ) {
            self.fire_callback(domain, batch_id, batch.clone());
        }

        Ok(batch)
    }

    /// Remove and invoke the callback for `(domain, batch_id)` exactly
    /// once, regardless of whether it panics — the registry entry is
    /// gone either way.
    fn fire_callback(&self, domain: &str, batch_id: Uuid, batch: Batch) {
        let callback = self
            .callbacks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&(domain.to_string(), batch_id));
        if let Some(callback) = callback {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(batch)));
            if result.is_err() {
                tracing::warn!(
                    domain = %domain,
                    batch_id = %batch_id,
                    "batch completion callback panicked; swallowed"
                );
            }
        }
    }

    pub async fn get(&self, domain: &str, batch_id: Uuid) -> CoreResult<Batch> {
        sqlx::query_as::<_, Batch>(
            "SELECT * FROM commandbus.batch WHERE domain = $1 AND batch_id = $2",
        )
        .bind(domain)
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CoreError::BatchNotFound {
            domain: domain.to_string(),
            batch_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_batch(status: BatchStatus) -> Batch {
        Batch {
            domain: "payments".into(),
            batch_id: Uuid::nil(),
            batch_type: BatchType::Command,
            name: None,
            custom_data: None,
            status,
            total_count: 2,
            completed_count: 2,
            failed_count: 0,
            canceled_count: 0,
            in_troubleshooting_count: 0,
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn fire_callback_removes_entry_and_invokes_once() {
        let engine = BatchEngine::new_for_test();
        let calls = Arc::new(Mutex::new(0));
        let calls_clone = calls.clone();
        let batch_id = Uuid::nil();
        engine.register_callback(
            "payments",
            batch_id,
            Box::new(move |_batch| {
                *calls_clone.lock().unwrap() += 1;
            }),
        );
        engine.fire_callback("payments", batch_id, sample_batch(BatchStatus::Completed));
        engine.fire_callback("payments", batch_id, sample_batch(BatchStatus::Completed));
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    impl BatchEngine {
        /// Test-only constructor: callback-registry behavior does not
        /// require a live pool.
        fn new_for_test() -> Self {
            Self {
                pool: sqlx::postgres::PgPoolOptions::new()
                    .max_connections(1)
                    .connect_lazy("postgres://localhost/nonexistent")
                    .expect("lazy pool construction never touches the network"),
                callbacks: Arc::new(Mutex::new(HashMap::new())),
            }
        }
    }
}
