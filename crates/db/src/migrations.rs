use sqlx::migrate::{MigrateError, Migrator};

use crate::DbPool;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn run_pending(pool: &DbPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await?;
    tracing::debug!(
        event_name = "db.migrations.applied",
        known_migrations = MIGRATOR.iter().count(),
        "migrations up to date"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use sqlx::Row;

    use super::run_pending;
    use crate::{connect_with_settings, migrations::MIGRATOR};

    const MANAGED_TABLES: &[&str] = &[
        "booking",
        "booking_service",
        "client",
        "crm_event",
        "import_run",
        "staged_contact",
        "staged_lead",
        "sync_attempt",
        "vehicle",
    ];

    async fn table_names(pool: &sqlx::SqlitePool) -> Vec<String> {
        let mut names: Vec<String> = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE '\\_%' ESCAPE '\\'
             AND name NOT LIKE 'sqlite%'",
        )
        .fetch_all(pool)
        .await
        .expect("list tables")
        .into_iter()
        .map(|row| row.get::<String, _>("name"))
        .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn migrations_create_every_managed_table() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        assert_eq!(table_names(&pool).await, MANAGED_TABLES);
    }

    #[tokio::test]
    async fn migrations_up_down_up_restores_schema() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        MIGRATOR.undo(&pool, 0).await.expect("undo migrations");
        assert!(table_names(&pool).await.is_empty(), "undo should drop every managed table");

        run_pending(&pool).await.expect("re-run migrations");
        assert_eq!(table_names(&pool).await, MANAGED_TABLES);
    }

    #[tokio::test]
    async fn open_outbox_entries_are_unique_per_idempotency_key() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("run migrations");

        let insert = "INSERT INTO sync_attempt (
                id, target, event_type, booking_id, idempotency_key, payload_json, status,
                attempt_count, created_at, updated_at
             ) VALUES (?, 'accounting', 'order.create', 'B-1', 'order.create:B-1', '{}', ?, 0,
                '2026-03-01T10:00:00Z', '2026-03-01T10:00:00Z')";

        sqlx::query(insert).bind("ATT-1").bind("completed").execute(&pool).await.expect("first");
        sqlx::query(insert).bind("ATT-2").bind("failed").execute(&pool).await.expect("second");
        let duplicate = sqlx::query(insert).bind("ATT-3").bind("pending").execute(&pool).await;

        assert!(duplicate.is_err(), "a second open entry for the same key must be rejected");
    }
}
