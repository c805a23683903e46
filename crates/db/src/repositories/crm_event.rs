use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use fleetsync_core::domain::crm_event::{CrmEvent, CrmEventStatus, EventKey};

use super::{parse_timestamp, timestamp, CrmEventRepository, RepositoryError};
use crate::DbPool;

const EVENT_COLUMNS: &str = "event_key, lead_id, old_stage_id, new_stage_id, pipeline_id, status,
    last_error, received_at, updated_at";

pub struct SqlCrmEventRepository {
    pool: DbPool,
}

impl SqlCrmEventRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl CrmEventRepository for SqlCrmEventRepository {
    async fn find(&self, key: &EventKey) -> Result<Option<CrmEvent>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {EVENT_COLUMNS} FROM crm_event WHERE event_key = ?"))
            .bind(&key.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(event_from_row).transpose()
    }

    async fn record(&self, event: &CrmEvent) -> Result<bool, RepositoryError> {
        // The conditional DO UPDATE leaves processed rows untouched, so
        // `rows_affected() == 0` identifies a processed duplicate.
        let result = sqlx::query(&format!(
            "INSERT INTO crm_event ({EVENT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(event_key) DO UPDATE SET
                status = CASE WHEN crm_event.status = 'failed' THEN 'pending' ELSE crm_event.status END,
                updated_at = excluded.updated_at
             WHERE crm_event.status <> 'processed'"
        ))
        .bind(&event.key.0)
        .bind(&event.lead_id)
        .bind(event.old_stage_id.as_deref())
        .bind(&event.new_stage_id)
        .bind(event.pipeline_id.as_deref())
        .bind(event.status.as_str())
        .bind(event.last_error.as_deref())
        .bind(timestamp(event.received_at))
        .bind(timestamp(event.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark(
        &self,
        key: &EventKey,
        status: CrmEventStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE crm_event SET status = ?, last_error = ?, updated_at = ? WHERE event_key = ?",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(timestamp(now))
        .bind(&key.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn event_from_row(row: SqliteRow) -> Result<CrmEvent, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = CrmEventStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown crm event status `{status_raw}`")))?;

    Ok(CrmEvent {
        key: EventKey(row.try_get("event_key")?),
        lead_id: row.try_get("lead_id")?,
        old_stage_id: row.try_get("old_stage_id")?,
        new_stage_id: row.try_get("new_stage_id")?,
        pipeline_id: row.try_get("pipeline_id")?,
        status,
        last_error: row.try_get("last_error")?,
        received_at: parse_timestamp("received_at", row.try_get("received_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
