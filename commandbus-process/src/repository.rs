//! Process & process-audit persistence, including the optimistic
//! `(process_id, current_step, status)` CAS that keeps the engine
//! single-writer-per-step (`spec.md` §4.8 "Concurrency discipline").

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use commandbus_core::{CoreError, CoreResult, Process, ProcessAuditEntry, ProcessStatus, ReplyOutcome};

pub struct NewProcess {
    pub domain: String,
    pub process_id: Uuid,
    pub process_type: String,
    pub current_step: String,
    pub state: Value,
    pub batch_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct ProcessRepository {
    pool: PgPool,
}

impl ProcessRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn create(&self, tx: &mut Transaction<'_, Postgres>, new: &NewProcess) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO commandbus.process
                (domain, process_id, process_type, status, current_step, state, batch_id)
             VALUES ($1, $2, $3, 'PENDING', $4, $5, $6)",
        )
        .bind(&new.domain)
        .bind(new.process_id)
        .bind(&new.process_type)
        .bind(&new.current_step)
        .bind(&new.state)
        .bind(new.batch_id)
        .execute(tx.as_mut())
        .await?;
        Ok(())
    }

    pub async fn get(&self, domain: &str, process_id: Uuid) -> CoreResult<Process> {
        sqlx::query_as::<_, Process>(
            "SELECT * FROM commandbus.process WHERE domain = $1 AND process_id = $2",
        )
        .bind(domain)
        .bind(process_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CoreError::ProcessNotFound {
            domain: domain.to_string(),
            process_id,
        })
    }

    /// Atomic `(process_id, current_step, status)` CAS. Zero rows
    /// affected means something else already advanced the process;
    /// callers surface [`CoreError::ConcurrentUpdate`] and let the
    /// at-least-once redelivery of the triggering reply retry.
    #[allow(clippy::too_many_arguments)]
    pub async fn transition(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        domain: &str,
        process_id: Uuid,
        expected_step: &str,
        expected_status: ProcessStatus,
        new_step: &str,
        new_status: ProcessStatus,
        state: Option<&Value>,
        compensation_queue: Option<&Value>,
        compensating: Option<bool>,
        error: Option<(&str, &str)>,
    ) -> CoreResult<Process> {
        let (error_code, error_message) = match error {
            Some((code, message)) => (Some(code), Some(message)),
            None => (None, None),
        };
        let terminal = new_status.is_terminal();

        sqlx::query_as::<_, Process>(
            "UPDATE commandbus.process
             SET current_step = $5,
                 status = $6,
                 state = COALESCE($7, state),
                 compensation_queue = COALESCE($8, compensation_queue),
                 compensating = COALESCE($9, compensating),
                 error_code = COALESCE($10, error_code),
                 error_message = COALESCE($11, error_message),
                 completed_at = CASE WHEN $12 THEN now() ELSE completed_at END,
                 updated_at = now()
             WHERE domain = $1 AND process_id = $2
               AND current_step = $3 AND status = $4
             RETURNING *",
        )
        .bind(domain)
        .bind(process_id)
        .bind(expected_step)
        .bind(expected_status)
        .bind(new_step)
        .bind(new_status)
        .bind(state)
        .bind(compensation_queue)
        .bind(compensating)
        .bind(error_code)
        .bind(error_message)
        .bind(terminal)
        .fetch_optional(tx.as_mut())
        .await?
        .ok_or_else(|| {
            CoreError::ConcurrentUpdate(format!(
                "process {process_id} in domain '{domain}' was not in the expected state \
                 (step '{expected_step}', status {expected_status:?})"
            ))
        })
    }

    /// Record that a step's command was sent (`spec.md` §4.8 "Step
    /// execution" step 3).
    pub async fn record_step(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        domain: &str,
        process_id: Uuid,
        command_id: Uuid,
        step_name: &str,
        command_type: &str,
        command_data: &Value,
    ) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO commandbus.process_audit
                (domain, process_id, command_id, step_name, command_type, command_data)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(domain)
        .bind(process_id)
        .bind(command_id)
        .bind(step_name)
        .bind(command_type)
        .bind(command_data)
        .execute(tx.as_mut())
        .await?;
        Ok(())
    }

    /// Pair an incoming reply with its step (`spec.md` §4.8 "handle_reply"
    /// step 1).
    pub async fn record_reply(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        domain: &str,
        process_id: Uuid,
        command_id: Uuid,
        outcome: ReplyOutcome,
        reply_data: Option<&Value>,
    ) -> CoreResult<ProcessAuditEntry> {
        sqlx::query_as::<_, ProcessAuditEntry>(
            "UPDATE commandbus.process_audit
             SET reply_outcome = $4, reply_data = $5, received_at = now()
             WHERE domain = $1 AND process_id = $2 AND command_id = $3
             RETURNING *",
        )
        .bind(domain)
        .bind(process_id)
        .bind(command_id)
        .bind(outcome)
        .bind(reply_data)
        .fetch_optional(tx.as_mut())
        .await?
        .ok_or_else(|| CoreError::InvalidOperation(format!(
            "no process-audit entry for command {command_id} in process {process_id}"
        )))
    }

    /// Completed steps in reverse order, for compensation (`spec.md`
    /// §4.8 "Compensation").
    pub async fn successful_steps_reverse(
        &self,
        domain: &str,
        process_id: Uuid,
    ) -> CoreResult<Vec<ProcessAuditEntry>> {
        let rows = sqlx::query_as::<_, ProcessAuditEntry>(
            "SELECT * FROM commandbus.process_audit
             WHERE domain = $1 AND process_id = $2 AND reply_outcome = 'SUCCESS'
             ORDER BY sent_at DESC",
        )
        .bind(domain)
        .bind(process_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn for_process(&self, domain: &str, process_id: Uuid) -> CoreResult<Vec<ProcessAuditEntry>> {
        let rows = sqlx::query_as::<_, ProcessAuditEntry>(
            "SELECT * FROM commandbus.process_audit
             WHERE domain = $1 AND process_id = $2
             ORDER BY sent_at ASC",
        )
        .bind(domain)
        .bind(process_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_by_status(
        &self,
        domain: &str,
        status: ProcessStatus,
        created_before: Option<DateTime<Utc>>,
        limit: i64,
    ) -> CoreResult<Vec<Process>> {
        let rows = sqlx::query_as::<_, Process>(
            "SELECT * FROM commandbus.process
             WHERE domain = $1 AND status = $2
               AND ($3::timestamptz IS NULL OR created_at <= $3)
             ORDER BY created_at ASC
             LIMIT $4",
        )
        .bind(domain)
        .bind(status)
        .bind(created_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_process_captures_domain_and_first_step() {
        let new = NewProcess {
            domain: "reporting".into(),
            process_id: Uuid::nil(),
            process_type: "StatementReportProcess".into(),
            current_step: "StatementQuery".into(),
            state: serde_json::json!({}),
            batch_id: None,
        };
        assert_eq!(new.current_step, "StatementQuery");
        assert_eq!(new.domain, "reporting");
    }
}
