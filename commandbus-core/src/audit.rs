//! Append-only Audit Log (`spec.md` §4.3 component C3).

use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::domain::{AuditEvent, AuditEventType};
use crate::error::CoreResult;

#[derive(Debug, Clone)]
pub struct AuditLog {
    pool: PgPool,
}

impl AuditLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append one event inside the caller's transaction. Audit rows are
    /// never updated once written.
    pub async fn append_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        domain: &str,
        command_id: Option<Uuid>,
        process_id: Option<Uuid>,
        event_type: AuditEventType,
        details: Value,
    ) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO commandbus.audit (domain, command_id, process_id, event_type, details)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(domain)
        .bind(command_id)
        .bind(process_id)
        .bind(event_type)
        .bind(details)
        .execute(tx.as_mut())
        .await?;
        Ok(())
    }

    /// Append outside any ambient transaction — used for events that
    /// happen after a commit (e.g. batch callback invocation failures).
    pub async fn append(
        &self,
        domain: &str,
        command_id: Option<Uuid>,
        process_id: Option<Uuid>,
        event_type: AuditEventType,
        details: Value,
    ) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO commandbus.audit (domain, command_id, process_id, event_type, details)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(domain)
        .bind(command_id)
        .bind(process_id)
        .bind(event_type)
        .bind(details)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Chronological trail for one command.
    pub async fn for_command(&self, domain: &str, command_id: Uuid) -> CoreResult<Vec<AuditEvent>> {
        let rows = sqlx::query_as::<_, AuditEvent>(
            "SELECT id, domain, command_id, process_id, event_type, \"timestamp\", details
             FROM commandbus.audit
             WHERE domain = $1 AND command_id = $2
             ORDER BY \"timestamp\" ASC",
        )
        .bind(domain)
        .bind(command_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Chronological trail for one process.
    pub async fn for_process(&self, domain: &str, process_id: Uuid) -> CoreResult<Vec<AuditEvent>> {
        let rows = sqlx::query_as::<_, AuditEvent>(
            "SELECT id, domain, command_id, process_id, event_type, \"timestamp\", details
             FROM commandbus.audit
             WHERE domain = $1 AND process_id = $2
             ORDER BY \"timestamp\" ASC",
        )
        .bind(domain)
        .bind(process_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_serializes_screaming_snake_case() {
        let v = serde_json::to_value(AuditEventType::MovedToTsq).unwrap();
        assert_eq!(v, "MOVED_TO_TSQ");
    }
}
