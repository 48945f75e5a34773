//! Command Repository (`spec.md` §4.2 component C2): CRUD plus the
//! stored-procedure wrappers that own the atomic receive/finish/TSQ
//! transitions.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::domain::{Command, CommandStatus, ErrorDetail};
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone)]
pub struct CommandRepository {
    pool: PgPool,
}

/// Row shape returned by `sp_receive_command`: a [`Command`] paired with
/// the original message payload pulled off the queue.
#[derive(Debug, Clone, sqlx::FromRow)]
struct ReceivedRow {
    domain: String,
    command_id: Uuid,
    command_type: String,
    status: CommandStatus,
    attempts: i32,
    max_attempts: i32,
    msg_id: Option<i64>,
    archived_msg_id: Option<i64>,
    queue_name: String,
    reply_queue: Option<String>,
    correlation_id: Option<Uuid>,
    last_error_kind: Option<crate::domain::ErrorKind>,
    last_error_code: Option<String>,
    last_error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    batch_id: Option<Uuid>,
    payload: Value,
}

impl From<ReceivedRow> for (Command, Value) {
    fn from(r: ReceivedRow) -> Self {
        (
            Command {
                domain: r.domain,
                command_id: r.command_id,
                command_type: r.command_type,
                status: r.status,
                attempts: r.attempts,
                max_attempts: r.max_attempts,
                msg_id: r.msg_id,
                archived_msg_id: r.archived_msg_id,
                queue_name: r.queue_name,
                reply_queue: r.reply_queue,
                correlation_id: r.correlation_id,
                last_error_kind: r.last_error_kind,
                last_error_code: r.last_error_code,
                last_error_message: r.last_error_message,
                created_at: r.created_at,
                updated_at: r.updated_at,
                batch_id: r.batch_id,
            },
            r.payload,
        )
    }
}

/// Attributes needed to insert a new command row. `command_id` is the
/// caller-supplied idempotency key.
pub struct NewCommand {
    pub domain: String,
    pub command_id: Uuid,
    pub command_type: String,
    pub max_attempts: i32,
    pub queue_name: String,
    pub reply_queue: Option<String>,
    pub correlation_id: Option<Uuid>,
    pub batch_id: Option<Uuid>,
}

impl CommandRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a new command row inside the caller's transaction.
    /// `spec.md` §4.2: rejected with [`CoreError::DuplicateCommand`] on a
    /// `(domain, command_id)` uniqueness violation.
    pub async fn save(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        cmd: &NewCommand,
    ) -> CoreResult<()> {
        let result = sqlx::query(
            "INSERT INTO commandbus.command
                (domain, command_id, command_type, status, attempts, max_attempts,
                 queue_name, reply_queue, correlation_id, batch_id)
             VALUES ($1, $2, $3, 'PENDING', 0, $4, $5, $6, $7, $8)",
        )
        .bind(&cmd.domain)
        .bind(cmd.command_id)
        .bind(&cmd.command_type)
        .bind(cmd.max_attempts)
        .bind(&cmd.queue_name)
        .bind(&cmd.reply_queue)
        .bind(cmd.correlation_id)
        .bind(cmd.batch_id)
        .execute(tx.as_mut())
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(CoreError::DuplicateCommand {
                    domain: cmd.domain.clone(),
                    command_id: cmd.command_id,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, domain: &str, command_id: Uuid) -> CoreResult<Command> {
        sqlx::query_as::<_, Command>(
            "SELECT domain, command_id, command_type, status, attempts, max_attempts,
                    msg_id, archived_msg_id, queue_name, reply_queue, correlation_id,
                    last_error_kind, last_error_code, last_error_message,
                    created_at, updated_at, batch_id
             FROM commandbus.command WHERE domain = $1 AND command_id = $2",
        )
        .bind(domain)
        .bind(command_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CoreError::CommandNotFound {
            domain: domain.to_string(),
            command_id,
        })
    }

    /// Record the queue message id assigned on send, inside the same
    /// transaction as [`CommandRepository::save`].
    pub async fn set_msg_id(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        domain: &str,
        command_id: Uuid,
        msg_id: i64,
    ) -> CoreResult<()> {
        sqlx::query(
            "UPDATE commandbus.command SET msg_id = $3, updated_at = now()
             WHERE domain = $1 AND command_id = $2",
        )
        .bind(domain)
        .bind(command_id)
        .bind(msg_id)
        .execute(tx.as_mut())
        .await?;
        Ok(())
    }

    /// Atomic receive+increment via `sp_receive_command` (`spec.md` §4.2,
    /// §6). Returns each received command paired with its original
    /// payload; stale/terminal messages are archived server-side and
    /// never appear here.
    pub async fn sp_receive(
        &self,
        domain: &str,
        queue: &str,
        limit: i32,
        vt: i32,
    ) -> CoreResult<Vec<(Command, Value)>> {
        let rows: Vec<ReceivedRow> = sqlx::query_as(
            "SELECT * FROM commandbus.sp_receive_command($1, $2, $3, $4)",
        )
        .bind(domain)
        .bind(queue)
        .bind(limit)
        .bind(vt)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Atomic terminal write via `sp_finish_command`. Batch/audit
    /// bookkeeping is the caller's responsibility so it can run in the
    /// same transaction.
    pub async fn sp_finish(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        domain: &str,
        command_id: Uuid,
        status: CommandStatus,
        error: Option<ErrorDetail>,
    ) -> CoreResult<Command> {
        let (kind, code, message) = match error {
            Some(e) => (Some(e.kind), Some(e.code), Some(e.message)),
            None => (None, None, None),
        };
        sqlx::query_as::<_, Command>(
            "SELECT * FROM commandbus.sp_finish_command($1, $2, $3, $4, $5, $6)",
        )
        .bind(domain)
        .bind(command_id)
        .bind(status)
        .bind(kind)
        .bind(code)
        .bind(message)
        .fetch_optional(tx.as_mut())
        .await?
        .ok_or_else(|| CoreError::CommandNotFound {
            domain: domain.to_string(),
            command_id,
        })
    }

    /// Extend backoff on a transient failure without changing status —
    /// the message's visibility is adjusted separately by the worker via
    /// the queue adapter; this only clears the in-flight lock fields so a
    /// later read can see the row again.
    pub async fn note_transient_failure(
        &self,
        domain: &str,
        command_id: Uuid,
        error: &ErrorDetail,
    ) -> CoreResult<()> {
        sqlx::query(
            "UPDATE commandbus.command
             SET last_error_kind = $3, last_error_code = $4, last_error_message = $5,
                 updated_at = now()
             WHERE domain = $1 AND command_id = $2",
        )
        .bind(domain)
        .bind(command_id)
        .bind(error.kind)
        .bind(&error.code)
        .bind(&error.message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn sp_tsq_retry(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        domain: &str,
        command_id: Uuid,
        new_msg_id: i64,
    ) -> CoreResult<Command> {
        sqlx::query_as::<_, Command>(
            "SELECT * FROM commandbus.sp_tsq_retry($1, $2, $3)",
        )
        .bind(domain)
        .bind(command_id)
        .bind(new_msg_id)
        .fetch_optional(tx.as_mut())
        .await?
        .ok_or_else(|| {
            CoreError::InvalidOperation(format!(
                "command {command_id} in domain '{domain}' is not in the troubleshooting queue"
            ))
        })
    }

    pub async fn sp_tsq_complete(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        domain: &str,
        command_id: Uuid,
    ) -> CoreResult<Command> {
        sqlx::query_as::<_, Command>("SELECT * FROM commandbus.sp_tsq_complete($1, $2)")
            .bind(domain)
            .bind(command_id)
            .fetch_optional(tx.as_mut())
            .await?
            .ok_or_else(|| {
                CoreError::InvalidOperation(format!(
                    "command {command_id} in domain '{domain}' is not in the troubleshooting queue"
                ))
            })
    }

    pub async fn sp_tsq_cancel(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        domain: &str,
        command_id: Uuid,
    ) -> CoreResult<Command> {
        sqlx::query_as::<_, Command>("SELECT * FROM commandbus.sp_tsq_cancel($1, $2)")
            .bind(domain)
            .bind(command_id)
            .fetch_optional(tx.as_mut())
            .await?
            .ok_or_else(|| {
                CoreError::InvalidOperation(format!(
                    "command {command_id} in domain '{domain}' is not in the troubleshooting queue"
                ))
            })
    }

    /// `spec.md` §4.7 `list`: commands parked in TSQ for a domain, newest
    /// first, optionally filtered by type and creation window.
    pub async fn list_tsq(
        &self,
        domain: &str,
        command_type: Option<&str>,
        created_after: Option<DateTime<Utc>>,
        created_before: Option<DateTime<Utc>>,
        limit: i64,
        offset: i64,
    ) -> CoreResult<Vec<Command>> {
        let rows = sqlx::query_as::<_, Command>(
            "SELECT * FROM commandbus.command
             WHERE domain = $1 AND status = 'IN_TROUBLESHOOTING_QUEUE'
               AND ($2::text IS NULL OR command_type = $2)
               AND ($3::timestamptz IS NULL OR created_at >= $3)
               AND ($4::timestamptz IS NULL OR created_at <= $4)
             ORDER BY created_at DESC
             LIMIT $5 OFFSET $6",
        )
        .bind(domain)
        .bind(command_type)
        .bind(created_after)
        .bind(created_before)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// `spec.md` §4.8 "TSQ interaction": when a command carrying a
    /// `correlation_id` is moved to the troubleshooting queue, the owning
    /// process (if any, and if not already terminal) is nudged into
    /// `WAITING_FOR_TSQ` in the same transaction.
    pub async fn mark_process_waiting_for_tsq(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        domain: &str,
        process_id: Uuid,
    ) -> CoreResult<()> {
        sqlx::query(
            "UPDATE commandbus.process
             SET status = 'WAITING_FOR_TSQ', updated_at = now()
             WHERE domain = $1 AND process_id = $2
               AND status NOT IN ('COMPLETED', 'COMPENSATED', 'FAILED', 'CANCELED')",
        )
        .bind(domain)
        .bind(process_id)
        .execute(tx.as_mut())
        .await?;
        Ok(())
    }

    /// `spec.md` §4.7 `list_all`: TSQ items across every domain, for
    /// cross-domain operator UIs. `domain = NULL` drops the domain filter
    /// entirely rather than matching nothing.
    pub async fn list_tsq_all(
        &self,
        domain: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> CoreResult<Vec<Command>> {
        let rows = sqlx::query_as::<_, Command>(
            "SELECT * FROM commandbus.command
             WHERE status = 'IN_TROUBLESHOOTING_QUEUE'
               AND ($1::text IS NULL OR domain = $1)
             ORDER BY created_at DESC
             LIMIT $2 OFFSET $3",
        )
        .bind(domain)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_domains(&self) -> CoreResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT domain FROM commandbus.command
             WHERE status = 'IN_TROUBLESHOOTING_QUEUE' ORDER BY domain",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(d,)| d).collect())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn received_row_converts_into_command_and_payload() {
        let row = ReceivedRow {
            domain: "payments".into(),
            command_id: Uuid::nil(),
            command_type: "Debit".into(),
            status: CommandStatus::InProgress,
            attempts: 1,
            max_attempts: 5,
            msg_id: Some(7),
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
            payload: serde_json::json!({"amount": 100}),
        };
        let (command, payload): (Command, Value) = row.into();
        assert_eq!(command.attempts, 1);
        assert_eq!(payload["amount"], 100);
    }
}
