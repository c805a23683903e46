use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

use fleetsync_core::domain::booking::{Booking, BookingId, BookingService, SyncStatus};
use fleetsync_core::domain::client::{Client, ClientId};
use fleetsync_core::domain::crm_event::{CrmEvent, CrmEventStatus, EventKey};
use fleetsync_core::domain::import::{ImportRun, ImportRunId, StagedContact, StagedLead};
use fleetsync_core::domain::outbox::{AttemptId, AttemptStatus, OperationKey, SyncAttempt};

pub mod booking;
pub mod client;
pub mod crm_event;
pub mod outbox;
pub mod staging;

pub use booking::SqlBookingRepository;
pub use client::SqlClientRepository;
pub use crm_event::SqlCrmEventRepository;
pub use outbox::SqlOutboxRepository;
pub use staging::SqlStagingRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl RepositoryError {
    /// A concurrent writer won a unique constraint, e.g. the open-entry index of the outbox.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Database(error)) => error.is_unique_violation(),
            _ => false,
        }
    }
}

#[async_trait]
pub trait BookingRepository: Send + Sync {
    async fn find_by_id(&self, id: &BookingId) -> Result<Option<Booking>, RepositoryError>;

    async fn find_by_external_ref(
        &self,
        external_ref: &str,
    ) -> Result<Option<Booking>, RepositoryError>;

    /// Upserts business fields. Sync status and order references are owned by
    /// the lock methods below and are only written on first insert.
    async fn save(&self, booking: &Booking) -> Result<(), RepositoryError>;

    /// Inserts the booking unless one already exists for its external reference.
    /// Returns `true` when this call created the row.
    async fn insert_if_absent(&self, booking: &Booking) -> Result<bool, RepositoryError>;

    /// Atomic `pending | failed | NULL -> in_progress`. Exactly one concurrent
    /// caller observes `true`.
    async fn try_acquire_sync(
        &self,
        id: &BookingId,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    /// `in_progress -> synced`, recording the created order.
    async fn complete_sync(
        &self,
        id: &BookingId,
        order_id: &str,
        order_url: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    /// Records an order whose lock was reset while the order call was in
    /// flight. Only applies while the booking has no order; returns `false`
    /// when another one is already recorded.
    async fn record_orphaned_order(
        &self,
        id: &BookingId,
        order_id: &str,
        order_url: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    /// `in_progress -> pending | failed`.
    async fn release_sync(
        &self,
        id: &BookingId,
        to: SyncStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    /// Resets `in_progress` locks taken before `older_than` back to `pending`.
    async fn release_stale_locks(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<BookingId>, RepositoryError>;

    /// Bookings still `in_progress` whose lock was taken before `started_before`.
    async fn count_held_locks(&self, started_before: DateTime<Utc>) -> Result<u64, RepositoryError>;

    async fn list_services(&self, id: &BookingId) -> Result<Vec<BookingService>, RepositoryError>;
}

#[async_trait]
pub trait ClientRepository: Send + Sync {
    async fn find_by_id(&self, id: &ClientId) -> Result<Option<Client>, RepositoryError>;

    async fn find_by_external_ref(
        &self,
        external_ref: &str,
    ) -> Result<Option<Client>, RepositoryError>;

    /// Upserts by external reference and returns the stored row, which keeps
    /// its original id when the contact was already known.
    async fn upsert_by_external_ref(&self, client: &Client) -> Result<Client, RepositoryError>;

    async fn save(&self, client: &Client) -> Result<(), RepositoryError>;

    async fn set_accounting_customer_id(
        &self,
        id: &ClientId,
        customer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait CrmEventRepository: Send + Sync {
    async fn find(&self, key: &EventKey) -> Result<Option<CrmEvent>, RepositoryError>;

    /// Records the event unless the key was already processed. Returns `false`
    /// for a processed duplicate. A previously failed event is reset to `pending`.
    async fn record(&self, event: &CrmEvent) -> Result<bool, RepositoryError>;

    async fn mark(
        &self,
        key: &EventKey,
        status: CrmEventStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub by_status: BTreeMap<String, u64>,
    pub by_target: BTreeMap<String, u64>,
    pub failed_since: u64,
}

#[async_trait]
pub trait OutboxRepository: Send + Sync {
    async fn save(&self, attempt: &SyncAttempt) -> Result<(), RepositoryError>;

    async fn find(&self, id: &AttemptId) -> Result<Option<SyncAttempt>, RepositoryError>;

    /// The single non-completed entry for `key`, if any.
    async fn find_open_by_key(
        &self,
        key: &OperationKey,
    ) -> Result<Option<SyncAttempt>, RepositoryError>;

    async fn list(
        &self,
        status: Option<AttemptStatus>,
        limit: u32,
    ) -> Result<Vec<SyncAttempt>, RepositoryError>;

    async fn list_for_booking(
        &self,
        booking_id: &BookingId,
    ) -> Result<Vec<SyncAttempt>, RepositoryError>;

    /// Failed entries whose `next_retry_at` is at or before `now`, oldest first.
    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<SyncAttempt>, RepositoryError>;

    async fn stats(&self, failed_since: DateTime<Utc>) -> Result<OutboxStats, RepositoryError>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StagedCounts {
    pub leads: u32,
    pub contacts: u32,
    pub rejected: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    pub bookings: u32,
    pub clients: u32,
    pub vehicles: u32,
}

#[async_trait]
pub trait StagingRepository: Send + Sync {
    async fn save_run(&self, run: &ImportRun) -> Result<(), RepositoryError>;

    async fn find_run(&self, id: &ImportRunId) -> Result<Option<ImportRun>, RepositoryError>;

    /// Write-once per `(run_id, external_lead_id)`; returns `false` for a re-staged row.
    async fn stage_lead(&self, lead: &StagedLead) -> Result<bool, RepositoryError>;

    /// Write-once per `(run_id, external_contact_id)`.
    async fn stage_contact(&self, contact: &StagedContact) -> Result<bool, RepositoryError>;

    async fn staged_counts(&self, id: &ImportRunId) -> Result<StagedCounts, RepositoryError>;

    async fn list_staged_leads(&self, id: &ImportRunId) -> Result<Vec<StagedLead>, RepositoryError>;

    /// Upserts staged rows into `client`, `vehicle` and `booking` by external id
    /// inside one transaction. Rows with a parse error are skipped.
    async fn merge_run(
        &self,
        id: &ImportRunId,
        now: DateTime<Utc>,
    ) -> Result<MergeSummary, RepositoryError>;

    async fn purge_staged(&self, id: &ImportRunId) -> Result<u64, RepositoryError>;
}

/// Fixed-width RFC 3339 so that stored timestamps compare correctly as text.
pub(crate) fn timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn optional_timestamp(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(timestamp)
}

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}

pub(crate) fn parse_decimal(column: &str, value: String) -> Result<Decimal, RepositoryError> {
    Decimal::from_str(&value).map_err(|error| {
        RepositoryError::Decode(format!("invalid decimal in `{column}`: `{value}` ({error})"))
    })
}

pub(crate) fn parse_optional_decimal(
    column: &str,
    value: Option<String>,
) -> Result<Option<Decimal>, RepositoryError> {
    value.map(|amount| parse_decimal(column, amount)).transpose()
}

pub(crate) fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

pub(crate) fn to_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{DateTime, Utc};

    use crate::{connect_with_settings, migrations, DbPool};

    pub async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    pub fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }
}
