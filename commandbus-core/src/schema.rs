//! Schema-version guard (`spec.md` §6 "Schema versioning").
//!
//! `commandbus-core` does not run migrations itself — `sqlx migrate` owns
//! that, against the files under `commandbus-core/migrations`. At startup we
//! only check that `sqlx`'s own `_sqlx_migrations` tracking table records the
//! expected latest version, so a deployment that forgot to migrate fails
//! fast instead of hitting "relation does not exist" mid-request.

use sqlx::PgPool;

use crate::error::{CoreError, CoreResult};

/// The version suffix of the newest file under `commandbus-core/migrations`
/// (`0002_functions.sql`). Bump this alongside adding a migration.
pub const EXPECTED_SCHEMA_VERSION: i64 = 2;

/// Fails with [`CoreError::SchemaVersionMissing`] if `_sqlx_migrations` does
/// not show [`EXPECTED_SCHEMA_VERSION`] applied. Partial application (a
/// migration run that didn't reach the expected version) is treated the
/// same as no migration at all — we never guess at a schema's shape.
pub async fn ensure_schema_version(pool: &PgPool) -> CoreResult<()> {
    let applied: Option<(i64,)> = sqlx::query_as(
        "SELECT version FROM _sqlx_migrations WHERE success ORDER BY version DESC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;

    match applied {
        Some((version,)) if version >= EXPECTED_SCHEMA_VERSION => Ok(()),
        Some((version,)) => Err(CoreError::SchemaVersionMissing {
            expected: EXPECTED_SCHEMA_VERSION,
            found: Some(version),
        }),
        None => Err(CoreError::SchemaVersionMissing {
            expected: EXPECTED_SCHEMA_VERSION,
            found: None,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_version_matches_migration_count() {
        assert_eq!(EXPECTED_SCHEMA_VERSION, 2);
    }
}
