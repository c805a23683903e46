//! Sync Lock Manager.
//!
//! The lock is the booking's `sync_status` column. [`RowSyncLock`] takes it
//! with one conditional update; a deployment with a sharded store can put a
//! distributed lock behind the same trait.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use fleetsync_core::domain::booking::{Booking, BookingId, SyncStatus};
use fleetsync_core::domain::order::ProvisionedOrder;
use fleetsync_db::BookingRepository;

use crate::errors::SyncError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockAttempt {
    pub acquired: bool,
    /// State re-read after the attempt, so losers can tell "synced" from "busy".
    pub booking: Booking,
}

#[async_trait]
pub trait SyncLock: Send + Sync {
    async fn try_acquire(&self, id: &BookingId, now: DateTime<Utc>)
        -> Result<LockAttempt, SyncError>;

    /// `in_progress -> synced`. If the lock was reset meanwhile, the order is
    /// still recorded as long as the booking has none. Returns `false` only
    /// when a different order is already recorded.
    async fn complete(
        &self,
        id: &BookingId,
        order: &ProvisionedOrder,
        now: DateTime<Utc>,
    ) -> Result<bool, SyncError>;

    /// `in_progress -> pending | failed`.
    async fn release(
        &self,
        id: &BookingId,
        to: SyncStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, SyncError>;

    async fn release_stale(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<BookingId>, SyncError>;
}

pub struct RowSyncLock {
    bookings: Arc<dyn BookingRepository>,
}

impl RowSyncLock {
    pub fn new(bookings: Arc<dyn BookingRepository>) -> Self {
        Self { bookings }
    }
}

#[async_trait]
impl SyncLock for RowSyncLock {
    async fn try_acquire(
        &self,
        id: &BookingId,
        now: DateTime<Utc>,
    ) -> Result<LockAttempt, SyncError> {
        let acquired = self.bookings.try_acquire_sync(id, now).await?;
        let booking = self
            .bookings
            .find_by_id(id)
            .await?
            .ok_or_else(|| SyncError::BookingNotFound(id.clone()))?;

        if acquired {
            info!(event_name = "sync.lock.acquired", booking_id = %id, "sync lock acquired");
        } else {
            info!(
                event_name = "sync.lock.contended",
                booking_id = %id,
                sync_status = booking.sync_status.as_str(),
                "sync lock not acquired"
            );
        }
        Ok(LockAttempt { acquired, booking })
    }

    async fn complete(
        &self,
        id: &BookingId,
        order: &ProvisionedOrder,
        now: DateTime<Utc>,
    ) -> Result<bool, SyncError> {
        if self.bookings.complete_sync(id, &order.order_id, &order.order_url, now).await? {
            return Ok(true);
        }

        let recorded = self
            .bookings
            .record_orphaned_order(id, &order.order_id, &order.order_url, now)
            .await?;
        warn!(
            event_name = "sync.lock.lost",
            booking_id = %id,
            order_id = %order.order_id,
            recorded,
            "lock was released before the order could be recorded"
        );
        Ok(recorded)
    }

    async fn release(
        &self,
        id: &BookingId,
        to: SyncStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, SyncError> {
        let released = self.bookings.release_sync(id, to, now).await?;
        info!(
            event_name = "sync.lock.released",
            booking_id = %id,
            to = to.as_str(),
            released,
            "sync lock released"
        );
        Ok(released)
    }

    async fn release_stale(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<BookingId>, SyncError> {
        let released = self.bookings.release_stale_locks(older_than, now).await?;
        for id in &released {
            warn!(
                event_name = "sync.lock.stale_released",
                booking_id = %id,
                older_than = %older_than,
                "stale sync lock reset to pending"
            );
        }
        Ok(released)
    }
}
