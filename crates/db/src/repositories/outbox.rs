use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use fleetsync_core::domain::booking::BookingId;
use fleetsync_core::domain::outbox::{
    AttemptId, AttemptStatus, ErrorClass, OperationKey, SyncAttempt, TargetSystem,
};

use super::{
    optional_timestamp, parse_optional_timestamp, parse_timestamp, parse_u32, timestamp, to_u64,
    OutboxRepository, OutboxStats, RepositoryError,
};
use crate::DbPool;

const ATTEMPT_COLUMNS: &str = "id, target, event_type, booking_id, idempotency_key, payload_json,
    status, attempt_count, next_retry_at, last_error, error_class, created_at, updated_at,
    completed_at";

pub struct SqlOutboxRepository {
    pool: DbPool,
}

impl SqlOutboxRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl OutboxRepository for SqlOutboxRepository {
    async fn save(&self, attempt: &SyncAttempt) -> Result<(), RepositoryError> {
        sqlx::query(&format!(
            "INSERT INTO sync_attempt ({ATTEMPT_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                payload_json = excluded.payload_json,
                status = excluded.status,
                attempt_count = excluded.attempt_count,
                next_retry_at = excluded.next_retry_at,
                last_error = excluded.last_error,
                error_class = excluded.error_class,
                updated_at = excluded.updated_at,
                completed_at = excluded.completed_at"
        ))
        .bind(&attempt.id.0)
        .bind(attempt.target.as_str())
        .bind(&attempt.event_type)
        .bind(&attempt.booking_id.0)
        .bind(&attempt.idempotency_key.0)
        .bind(&attempt.payload_json)
        .bind(attempt.status.as_str())
        .bind(i64::from(attempt.attempt_count))
        .bind(optional_timestamp(attempt.next_retry_at))
        .bind(attempt.last_error.as_deref())
        .bind(attempt.error_class.map(|class| class.as_str()))
        .bind(timestamp(attempt.created_at))
        .bind(timestamp(attempt.updated_at))
        .bind(optional_timestamp(attempt.completed_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find(&self, id: &AttemptId) -> Result<Option<SyncAttempt>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {ATTEMPT_COLUMNS} FROM sync_attempt WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(attempt_from_row).transpose()
    }

    async fn find_open_by_key(
        &self,
        key: &OperationKey,
    ) -> Result<Option<SyncAttempt>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM sync_attempt
             WHERE idempotency_key = ? AND status <> 'completed'"
        ))
        .bind(&key.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(attempt_from_row).transpose()
    }

    async fn list(
        &self,
        status: Option<AttemptStatus>,
        limit: u32,
    ) -> Result<Vec<SyncAttempt>, RepositoryError> {
        let rows = if let Some(status) = status {
            sqlx::query(&format!(
                "SELECT {ATTEMPT_COLUMNS} FROM sync_attempt
                 WHERE status = ?
                 ORDER BY updated_at DESC, id ASC
                 LIMIT ?"
            ))
            .bind(status.as_str())
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                "SELECT {ATTEMPT_COLUMNS} FROM sync_attempt
                 ORDER BY updated_at DESC, id ASC
                 LIMIT ?"
            ))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?
        };

        rows.into_iter().map(attempt_from_row).collect()
    }

    async fn list_for_booking(
        &self,
        booking_id: &BookingId,
    ) -> Result<Vec<SyncAttempt>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM sync_attempt
             WHERE booking_id = ?
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(&booking_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(attempt_from_row).collect()
    }

    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<SyncAttempt>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM sync_attempt
             WHERE status = 'failed'
               AND next_retry_at IS NOT NULL
               AND next_retry_at <= ?
             ORDER BY next_retry_at ASC, id ASC
             LIMIT ?"
        ))
        .bind(timestamp(now))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(attempt_from_row).collect()
    }

    async fn stats(&self, failed_since: DateTime<Utc>) -> Result<OutboxStats, RepositoryError> {
        let mut stats = OutboxStats::default();

        let by_status = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM sync_attempt GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;
        for row in by_status {
            stats
                .by_status
                .insert(row.try_get("status")?, to_u64(row.try_get::<i64, _>("count")?));
        }

        let by_target = sqlx::query(
            "SELECT target, COUNT(*) AS count FROM sync_attempt GROUP BY target ORDER BY target",
        )
        .fetch_all(&self.pool)
        .await?;
        for row in by_target {
            stats
                .by_target
                .insert(row.try_get("target")?, to_u64(row.try_get::<i64, _>("count")?));
        }

        let failed = sqlx::query(
            "SELECT COUNT(*) AS count FROM sync_attempt WHERE status = 'failed' AND updated_at >= ?",
        )
        .bind(timestamp(failed_since))
        .fetch_one(&self.pool)
        .await?;
        stats.failed_since = to_u64(failed.try_get::<i64, _>("count")?);

        Ok(stats)
    }
}

fn attempt_from_row(row: SqliteRow) -> Result<SyncAttempt, RepositoryError> {
    let target_raw = row.try_get::<String, _>("target")?;
    let target = TargetSystem::parse(&target_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown target system `{target_raw}`")))?;

    let status_raw = row.try_get::<String, _>("status")?;
    let status = AttemptStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown attempt status `{status_raw}`")))?;

    let error_class = row
        .try_get::<Option<String>, _>("error_class")?
        .map(|value| {
            ErrorClass::parse(&value)
                .ok_or_else(|| RepositoryError::Decode(format!("unknown error class `{value}`")))
        })
        .transpose()?;

    Ok(SyncAttempt {
        id: AttemptId(row.try_get("id")?),
        target,
        event_type: row.try_get("event_type")?,
        booking_id: BookingId(row.try_get("booking_id")?),
        idempotency_key: OperationKey(row.try_get("idempotency_key")?),
        payload_json: row.try_get("payload_json")?,
        status,
        attempt_count: parse_u32("attempt_count", row.try_get("attempt_count")?)?,
        next_retry_at: parse_optional_timestamp("next_retry_at", row.try_get("next_retry_at")?)?,
        last_error: row.try_get("last_error")?,
        error_class,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
        completed_at: parse_optional_timestamp("completed_at", row.try_get("completed_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use fleetsync_core::domain::booking::BookingId;
    use fleetsync_core::domain::outbox::{
        AttemptStatus, ErrorClass, OperationKey, SyncAttempt, TargetSystem,
    };
    use fleetsync_core::outbox_engine::OutboxEngine;

    use super::SqlOutboxRepository;
    use crate::repositories::test_support::{parse_ts, setup_pool};
    use crate::repositories::OutboxRepository;

    fn open(engine: &OutboxEngine, key: &str, target: TargetSystem) -> SyncAttempt {
        engine.open(
            target,
            "order.create",
            BookingId("B-1".to_string()),
            OperationKey(key.to_string()),
            "{\"booking_id\":\"B-1\"}",
            parse_ts("2026-03-01T10:00:00Z"),
        )
    }

    #[tokio::test]
    async fn failed_transient_entry_becomes_due_after_backoff() {
        let repo = SqlOutboxRepository::new(setup_pool().await);
        let engine = OutboxEngine::default();
        let now = parse_ts("2026-03-01T10:00:00Z");

        let attempt = open(&engine, "order.create:B-1", TargetSystem::Accounting);
        let started = engine.start(attempt, now).expect("start");
        let failed = engine.fail(started, "timeout", ErrorClass::Transient, now).expect("fail");
        repo.save(&failed).await.expect("save");

        assert!(repo.list_due(now, 10).await.expect("not yet due").is_empty());
        let due = repo.list_due(now + Duration::minutes(5), 10).await.expect("due");
        assert_eq!(due, vec![failed.clone()]);

        let open = repo.find_open_by_key(&failed.idempotency_key).await.expect("open by key");
        assert_eq!(open.map(|entry| entry.id), Some(failed.id));
    }

    #[tokio::test]
    async fn completed_entries_are_not_open_and_stats_group_them() {
        let repo = SqlOutboxRepository::new(setup_pool().await);
        let engine = OutboxEngine::default();
        let now = parse_ts("2026-03-01T10:00:00Z");

        let done = engine
            .complete(
                engine.start(open(&engine, "crm.status.update:B-1", TargetSystem::Crm), now).expect("start"),
                now,
            )
            .expect("complete");
        repo.save(&done).await.expect("save done");

        let failed = engine
            .fail(
                engine.start(open(&engine, "order.create:B-1", TargetSystem::Accounting), now).expect("start"),
                "422 rejected",
                ErrorClass::Permanent,
                now,
            )
            .expect("fail");
        repo.save(&failed).await.expect("save failed");

        assert!(repo.find_open_by_key(&done.idempotency_key).await.expect("find").is_none());
        assert_eq!(
            repo.list(Some(AttemptStatus::Failed), 50).await.expect("list failed"),
            vec![failed.clone()]
        );
        assert_eq!(repo.list_for_booking(&BookingId("B-1".to_string())).await.expect("list").len(), 2);

        let stats = repo.stats(now - Duration::hours(24)).await.expect("stats");
        assert_eq!(stats.by_status.get("completed"), Some(&1));
        assert_eq!(stats.by_status.get("failed"), Some(&1));
        assert_eq!(stats.by_target.get("crm"), Some(&1));
        assert_eq!(stats.failed_since, 1);
        assert!(repo.list_due(now + Duration::days(30), 10).await.expect("due").is_empty());
    }
}
