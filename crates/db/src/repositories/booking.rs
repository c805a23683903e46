use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use fleetsync_core::domain::booking::{
    Booking, BookingId, BookingService, BookingStatus, SyncStatus,
};
use fleetsync_core::domain::client::ClientId;

use super::{
    optional_timestamp, parse_decimal, parse_optional_decimal, parse_optional_timestamp,
    parse_timestamp, timestamp, BookingRepository, RepositoryError,
};
use crate::DbPool;

const BOOKING_COLUMNS: &str = "id, external_ref, code, client_id, vehicle_plate, status, sync_status,
    sync_started_at, currency, daily_rate, total_amount, advance_payment, delivery_fee,
    deposit_amount, deposit_label, cdw_fee, external_order_id, external_order_url, start_at,
    end_at, pickup_location, dropoff_location, created_at, updated_at";

const INSERT_BOOKING: &str = "INSERT INTO booking (
        id, external_ref, code, client_id, vehicle_plate, status, sync_status, sync_started_at,
        currency, daily_rate, total_amount, advance_payment, delivery_fee, deposit_amount,
        deposit_label, cdw_fee, external_order_id, external_order_url, start_at, end_at,
        pickup_location, dropoff_location, created_at, updated_at
     ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

pub struct SqlBookingRepository {
    pool: DbPool,
}

impl SqlBookingRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn bind_booking<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    booking: &'q Booking,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(&booking.id.0)
        .bind(booking.external_ref.as_deref())
        .bind(&booking.code)
        .bind(booking.client_id.as_ref().map(|id| id.0.as_str()))
        .bind(booking.vehicle_plate.as_deref())
        .bind(booking.status.as_str())
        .bind(booking.sync_status.as_str())
        .bind(optional_timestamp(booking.sync_started_at))
        .bind(&booking.currency)
        .bind(booking.daily_rate.to_string())
        .bind(booking.total_amount.to_string())
        .bind(booking.advance_payment.to_string())
        .bind(booking.delivery_fee.map(|value| value.to_string()))
        .bind(booking.deposit_amount.map(|value| value.to_string()))
        .bind(booking.deposit_label.as_deref())
        .bind(booking.cdw_fee.map(|value| value.to_string()))
        .bind(booking.external_order_id.as_deref())
        .bind(booking.external_order_url.as_deref())
        .bind(optional_timestamp(booking.start_at))
        .bind(optional_timestamp(booking.end_at))
        .bind(booking.pickup_location.as_deref())
        .bind(booking.dropoff_location.as_deref())
        .bind(timestamp(booking.created_at))
        .bind(timestamp(booking.updated_at))
}

#[async_trait::async_trait]
impl BookingRepository for SqlBookingRepository {
    async fn find_by_id(&self, id: &BookingId) -> Result<Option<Booking>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {BOOKING_COLUMNS} FROM booking WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(booking_from_row).transpose()
    }

    async fn find_by_external_ref(
        &self,
        external_ref: &str,
    ) -> Result<Option<Booking>, RepositoryError> {
        let row =
            sqlx::query(&format!("SELECT {BOOKING_COLUMNS} FROM booking WHERE external_ref = ?"))
                .bind(external_ref)
                .fetch_optional(&self.pool)
                .await?;

        row.map(booking_from_row).transpose()
    }

    async fn save(&self, booking: &Booking) -> Result<(), RepositoryError> {
        let sql = format!(
            "{INSERT_BOOKING}
             ON CONFLICT(id) DO UPDATE SET
                external_ref = excluded.external_ref,
                code = excluded.code,
                client_id = excluded.client_id,
                vehicle_plate = excluded.vehicle_plate,
                status = excluded.status,
                currency = excluded.currency,
                daily_rate = excluded.daily_rate,
                total_amount = excluded.total_amount,
                advance_payment = excluded.advance_payment,
                delivery_fee = excluded.delivery_fee,
                deposit_amount = excluded.deposit_amount,
                deposit_label = excluded.deposit_label,
                cdw_fee = excluded.cdw_fee,
                start_at = excluded.start_at,
                end_at = excluded.end_at,
                pickup_location = excluded.pickup_location,
                dropoff_location = excluded.dropoff_location,
                updated_at = excluded.updated_at"
        );
        bind_booking(sqlx::query(&sql), booking).execute(&self.pool).await?;

        Ok(())
    }

    async fn insert_if_absent(&self, booking: &Booking) -> Result<bool, RepositoryError> {
        let sql = format!("{INSERT_BOOKING} ON CONFLICT DO NOTHING");
        let result = bind_booking(sqlx::query(&sql), booking).execute(&self.pool).await?;

        Ok(result.rows_affected() == 1)
    }

    async fn try_acquire_sync(
        &self,
        id: &BookingId,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE booking
             SET sync_status = 'in_progress', sync_started_at = ?, updated_at = ?
             WHERE id = ?
               AND (sync_status IS NULL OR sync_status IN ('pending', 'failed'))",
        )
        .bind(timestamp(now))
        .bind(timestamp(now))
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn complete_sync(
        &self,
        id: &BookingId,
        order_id: &str,
        order_url: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE booking
             SET sync_status = 'synced',
                 sync_started_at = NULL,
                 external_order_id = ?,
                 external_order_url = ?,
                 updated_at = ?
             WHERE id = ? AND sync_status = 'in_progress'",
        )
        .bind(order_id)
        .bind(order_url)
        .bind(timestamp(now))
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_orphaned_order(
        &self,
        id: &BookingId,
        order_id: &str,
        order_url: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE booking
             SET sync_status = 'synced',
                 sync_started_at = NULL,
                 external_order_id = ?,
                 external_order_url = ?,
                 updated_at = ?
             WHERE id = ? AND external_order_id IS NULL",
        )
        .bind(order_id)
        .bind(order_url)
        .bind(timestamp(now))
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_sync(
        &self,
        id: &BookingId,
        to: SyncStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        if !SyncStatus::InProgress.can_transition_to(to) || to == SyncStatus::Synced {
            return Err(RepositoryError::Decode(format!(
                "sync lock can only be released to pending or failed, not `{}`",
                to.as_str()
            )));
        }

        let result = sqlx::query(
            "UPDATE booking
             SET sync_status = ?, sync_started_at = NULL, updated_at = ?
             WHERE id = ? AND sync_status = 'in_progress'",
        )
        .bind(to.as_str())
        .bind(timestamp(now))
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_stale_locks(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<BookingId>, RepositoryError> {
        let rows = sqlx::query(
            "UPDATE booking
             SET sync_status = 'pending', sync_started_at = NULL, updated_at = ?
             WHERE sync_status = 'in_progress'
               AND (sync_started_at IS NULL OR sync_started_at < ?)
             RETURNING id",
        )
        .bind(timestamp(now))
        .bind(timestamp(older_than))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| Ok(BookingId(row.try_get::<String, _>("id")?)))
            .collect()
    }

    async fn count_held_locks(&self, started_before: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM booking
             WHERE sync_status = 'in_progress'
               AND (sync_started_at IS NULL OR sync_started_at < ?)",
        )
        .bind(timestamp(started_before))
        .fetch_one(&self.pool)
        .await?;

        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn list_services(&self, id: &BookingId) -> Result<Vec<BookingService>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT name, quantity, unit_price
             FROM booking_service
             WHERE booking_id = ?
             ORDER BY position ASC",
        )
        .bind(&id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(BookingService {
                    name: row.try_get("name")?,
                    quantity: parse_decimal("quantity", row.try_get("quantity")?)?,
                    unit_price: parse_decimal("unit_price", row.try_get("unit_price")?)?,
                })
            })
            .collect()
    }
}

fn booking_from_row(row: SqliteRow) -> Result<Booking, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = BookingStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown booking status `{status_raw}`")))?;

    let sync_raw = row.try_get::<Option<String>, _>("sync_status")?;
    let sync_status = SyncStatus::parse(sync_raw.as_deref()).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown sync status `{}`", sync_raw.unwrap_or_default()))
    })?;

    Ok(Booking {
        id: BookingId(row.try_get("id")?),
        external_ref: row.try_get("external_ref")?,
        code: row.try_get("code")?,
        client_id: row.try_get::<Option<String>, _>("client_id")?.map(ClientId),
        vehicle_plate: row.try_get("vehicle_plate")?,
        status,
        sync_status,
        sync_started_at: parse_optional_timestamp(
            "sync_started_at",
            row.try_get("sync_started_at")?,
        )?,
        currency: row.try_get("currency")?,
        daily_rate: parse_decimal("daily_rate", row.try_get("daily_rate")?)?,
        total_amount: parse_decimal("total_amount", row.try_get("total_amount")?)?,
        advance_payment: parse_decimal("advance_payment", row.try_get("advance_payment")?)?,
        delivery_fee: parse_optional_decimal("delivery_fee", row.try_get("delivery_fee")?)?,
        deposit_amount: parse_optional_decimal("deposit_amount", row.try_get("deposit_amount")?)?,
        deposit_label: row.try_get("deposit_label")?,
        cdw_fee: parse_optional_decimal("cdw_fee", row.try_get("cdw_fee")?)?,
        external_order_id: row.try_get("external_order_id")?,
        external_order_url: row.try_get("external_order_url")?,
        start_at: parse_optional_timestamp("start_at", row.try_get("start_at")?)?,
        end_at: parse_optional_timestamp("end_at", row.try_get("end_at")?)?,
        pickup_location: row.try_get("pickup_location")?,
        dropoff_location: row.try_get("dropoff_location")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}
