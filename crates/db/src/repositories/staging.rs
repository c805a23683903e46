use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use fleetsync_core::domain::booking::BookingStatus;
use fleetsync_core::domain::import::{
    DateRange, ImportCounts, ImportRun, ImportRunId, ImportRunStatus, StagedContact, StagedLead,
};

use super::{
    optional_timestamp, parse_decimal, parse_optional_timestamp, parse_timestamp, parse_u32,
    timestamp, to_u32, MergeSummary, RepositoryError, StagedCounts, StagingRepository,
};
use crate::DbPool;

const RUN_COLUMNS: &str = "id, status, range_from, range_to, leads_count, contacts_count,
    vehicles_count, rejected_count, pages_fetched, error, started_at, finished_at";

const LEAD_COLUMNS: &str = "run_id, external_lead_id, stage_id, status, contact_id, vehicle_plate,
    currency, daily_rate, total_amount, advance_payment, start_at, end_at, pickup_location,
    dropoff_location, payload_json, parse_error";

const MERGE_CLIENTS: &str = "INSERT INTO client (
        id, external_ref, name, email, phone, document_type, document_number, address,
        accounting_customer_id, created_at, updated_at
     )
     SELECT 'CL-' || lower(hex(randomblob(8))), sc.external_contact_id, sc.name, sc.email,
            sc.phone, sc.document_type, sc.document_number, sc.address, NULL, ?1, ?1
     FROM staged_contact sc
     WHERE sc.run_id = ?2
     ON CONFLICT(external_ref) DO UPDATE SET
        name = excluded.name,
        email = COALESCE(excluded.email, client.email),
        phone = COALESCE(excluded.phone, client.phone),
        document_type = COALESCE(excluded.document_type, client.document_type),
        document_number = COALESCE(excluded.document_number, client.document_number),
        address = COALESCE(excluded.address, client.address),
        updated_at = excluded.updated_at";

const MERGE_VEHICLES: &str = "INSERT INTO vehicle (plate, created_at, updated_at)
     SELECT DISTINCT sl.vehicle_plate, ?1, ?1
     FROM staged_lead sl
     WHERE sl.run_id = ?2 AND sl.parse_error IS NULL AND sl.vehicle_plate IS NOT NULL
     ON CONFLICT(plate) DO UPDATE SET updated_at = excluded.updated_at";

/// Booking upsert shared by mapped and unmapped leads. `{status_update}` decides
/// whether the CRM stage may move an existing booking's status. Financial fields
/// of a synced booking belong to its order and are left alone.
const MERGE_BOOKINGS: &str = "INSERT INTO booking (
        id, external_ref, code, client_id, vehicle_plate, status, sync_status, currency,
        daily_rate, total_amount, advance_payment, start_at, end_at, pickup_location,
        dropoff_location, created_at, updated_at
     )
     SELECT 'BK-' || lower(hex(randomblob(8))), sl.external_lead_id, 'CRM-' || sl.external_lead_id,
            (SELECT c.id FROM client c WHERE c.external_ref = sl.contact_id),
            sl.vehicle_plate, COALESCE(sl.status, 'new'), 'pending', sl.currency,
            sl.daily_rate, sl.total_amount, sl.advance_payment, sl.start_at, sl.end_at,
            sl.pickup_location, sl.dropoff_location, ?1, ?1
     FROM staged_lead sl
     WHERE sl.run_id = ?2 AND sl.parse_error IS NULL AND {lead_filter}
     ON CONFLICT(external_ref) DO UPDATE SET
        client_id = COALESCE(excluded.client_id, booking.client_id),
        vehicle_plate = COALESCE(excluded.vehicle_plate, booking.vehicle_plate),
        {status_update}
        currency = CASE WHEN booking.sync_status = 'synced'
                        THEN booking.currency ELSE excluded.currency END,
        daily_rate = CASE WHEN booking.sync_status = 'synced'
                          THEN booking.daily_rate ELSE excluded.daily_rate END,
        total_amount = CASE WHEN booking.sync_status = 'synced'
                            THEN booking.total_amount ELSE excluded.total_amount END,
        advance_payment = CASE WHEN booking.sync_status = 'synced'
                               THEN booking.advance_payment ELSE excluded.advance_payment END,
        start_at = COALESCE(excluded.start_at, booking.start_at),
        end_at = COALESCE(excluded.end_at, booking.end_at),
        pickup_location = COALESCE(excluded.pickup_location, booking.pickup_location),
        dropoff_location = COALESCE(excluded.dropoff_location, booking.dropoff_location),
        updated_at = excluded.updated_at";

pub struct SqlStagingRepository {
    pool: DbPool,
}

impl SqlStagingRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn merge_bookings_sql(mapped: bool) -> String {
    let (lead_filter, status_update) = if mapped {
        ("sl.status IS NOT NULL", "status = excluded.status,")
    } else {
        ("sl.status IS NULL", "")
    };
    MERGE_BOOKINGS.replace("{lead_filter}", lead_filter).replace("{status_update}", status_update)
}

#[async_trait::async_trait]
impl StagingRepository for SqlStagingRepository {
    async fn save_run(&self, run: &ImportRun) -> Result<(), RepositoryError> {
        sqlx::query(&format!(
            "INSERT INTO import_run ({RUN_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                leads_count = excluded.leads_count,
                contacts_count = excluded.contacts_count,
                vehicles_count = excluded.vehicles_count,
                rejected_count = excluded.rejected_count,
                pages_fetched = excluded.pages_fetched,
                error = excluded.error,
                finished_at = excluded.finished_at"
        ))
        .bind(&run.id.0)
        .bind(run.status.as_str())
        .bind(timestamp(run.range.from))
        .bind(timestamp(run.range.to))
        .bind(i64::from(run.counts.leads))
        .bind(i64::from(run.counts.contacts))
        .bind(i64::from(run.counts.vehicles))
        .bind(i64::from(run.counts.rejected))
        .bind(i64::from(run.pages_fetched))
        .bind(run.error.as_deref())
        .bind(timestamp(run.started_at))
        .bind(optional_timestamp(run.finished_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_run(&self, id: &ImportRunId) -> Result<Option<ImportRun>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM import_run WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.map(run_from_row).transpose()
    }

    async fn stage_lead(&self, lead: &StagedLead) -> Result<bool, RepositoryError> {
        let result = sqlx::query(&format!(
            "INSERT INTO staged_lead ({LEAD_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(run_id, external_lead_id) DO NOTHING"
        ))
        .bind(&lead.run_id.0)
        .bind(&lead.external_lead_id)
        .bind(&lead.stage_id)
        .bind(lead.status.map(|status| status.as_str()))
        .bind(lead.contact_id.as_deref())
        .bind(lead.vehicle_plate.as_deref())
        .bind(&lead.currency)
        .bind(lead.daily_rate.to_string())
        .bind(lead.total_amount.to_string())
        .bind(lead.advance_payment.to_string())
        .bind(optional_timestamp(lead.start_at))
        .bind(optional_timestamp(lead.end_at))
        .bind(lead.pickup_location.as_deref())
        .bind(lead.dropoff_location.as_deref())
        .bind(&lead.payload_json)
        .bind(lead.parse_error.as_deref())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn stage_contact(&self, contact: &StagedContact) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO staged_contact (
                run_id, external_contact_id, name, email, phone, document_type,
                document_number, address, payload_json
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(run_id, external_contact_id) DO NOTHING",
        )
        .bind(&contact.run_id.0)
        .bind(&contact.external_contact_id)
        .bind(&contact.name)
        .bind(contact.email.as_deref())
        .bind(contact.phone.as_deref())
        .bind(contact.document_type.as_deref())
        .bind(contact.document_number.as_deref())
        .bind(contact.address.as_deref())
        .bind(&contact.payload_json)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn staged_counts(&self, id: &ImportRunId) -> Result<StagedCounts, RepositoryError> {
        let leads = sqlx::query(
            "SELECT COUNT(CASE WHEN parse_error IS NULL THEN 1 END) AS accepted,
                    COUNT(CASE WHEN parse_error IS NOT NULL THEN 1 END) AS rejected
             FROM staged_lead WHERE run_id = ?",
        )
        .bind(&id.0)
        .fetch_one(&self.pool)
        .await?;

        let contacts =
            sqlx::query("SELECT COUNT(*) AS count FROM staged_contact WHERE run_id = ?")
                .bind(&id.0)
                .fetch_one(&self.pool)
                .await?;

        Ok(StagedCounts {
            leads: parse_u32("accepted", leads.try_get("accepted")?)?,
            rejected: parse_u32("rejected", leads.try_get("rejected")?)?,
            contacts: parse_u32("count", contacts.try_get("count")?)?,
        })
    }

    async fn list_staged_leads(&self, id: &ImportRunId) -> Result<Vec<StagedLead>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {LEAD_COLUMNS} FROM staged_lead WHERE run_id = ? ORDER BY external_lead_id"
        ))
        .bind(&id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(lead_from_row).collect()
    }

    async fn merge_run(
        &self,
        id: &ImportRunId,
        now: DateTime<Utc>,
    ) -> Result<MergeSummary, RepositoryError> {
        let now = timestamp(now);
        let mut tx = self.pool.begin().await?;

        let clients =
            sqlx::query(MERGE_CLIENTS).bind(&now).bind(&id.0).execute(&mut *tx).await?;
        let vehicles =
            sqlx::query(MERGE_VEHICLES).bind(&now).bind(&id.0).execute(&mut *tx).await?;

        let mut bookings = 0;
        for mapped in [true, false] {
            let sql = merge_bookings_sql(mapped);
            let result = sqlx::query(&sql).bind(&now).bind(&id.0).execute(&mut *tx).await?;
            bookings += result.rows_affected();
        }

        tx.commit().await?;

        Ok(MergeSummary {
            bookings: to_u32(bookings),
            clients: to_u32(clients.rows_affected()),
            vehicles: to_u32(vehicles.rows_affected()),
        })
    }

    async fn purge_staged(&self, id: &ImportRunId) -> Result<u64, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let leads =
            sqlx::query("DELETE FROM staged_lead WHERE run_id = ?").bind(&id.0).execute(&mut *tx).await?;
        let contacts = sqlx::query("DELETE FROM staged_contact WHERE run_id = ?")
            .bind(&id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(leads.rows_affected() + contacts.rows_affected())
    }
}

fn run_from_row(row: SqliteRow) -> Result<ImportRun, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = ImportRunStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown import run status `{status_raw}`")))?;

    Ok(ImportRun {
        id: ImportRunId(row.try_get("id")?),
        status,
        range: DateRange {
            from: parse_timestamp("range_from", row.try_get("range_from")?)?,
            to: parse_timestamp("range_to", row.try_get("range_to")?)?,
        },
        counts: ImportCounts {
            leads: parse_u32("leads_count", row.try_get("leads_count")?)?,
            contacts: parse_u32("contacts_count", row.try_get("contacts_count")?)?,
            vehicles: parse_u32("vehicles_count", row.try_get("vehicles_count")?)?,
            rejected: parse_u32("rejected_count", row.try_get("rejected_count")?)?,
        },
        pages_fetched: parse_u32("pages_fetched", row.try_get("pages_fetched")?)?,
        error: row.try_get("error")?,
        started_at: parse_timestamp("started_at", row.try_get("started_at")?)?,
        finished_at: parse_optional_timestamp("finished_at", row.try_get("finished_at")?)?,
    })
}

fn lead_from_row(row: SqliteRow) -> Result<StagedLead, RepositoryError> {
    let status = row
        .try_get::<Option<String>, _>("status")?
        .map(|value| {
            BookingStatus::parse(&value)
                .ok_or_else(|| RepositoryError::Decode(format!("unknown booking status `{value}`")))
        })
        .transpose()?;

    Ok(StagedLead {
        run_id: ImportRunId(row.try_get("run_id")?),
        external_lead_id: row.try_get("external_lead_id")?,
        stage_id: row.try_get("stage_id")?,
        status,
        contact_id: row.try_get("contact_id")?,
        vehicle_plate: row.try_get("vehicle_plate")?,
        currency: row.try_get("currency")?,
        daily_rate: parse_decimal("daily_rate", row.try_get("daily_rate")?)?,
        total_amount: parse_decimal("total_amount", row.try_get("total_amount")?)?,
        advance_payment: parse_decimal("advance_payment", row.try_get("advance_payment")?)?,
        start_at: parse_optional_timestamp("start_at", row.try_get("start_at")?)?,
        end_at: parse_optional_timestamp("end_at", row.try_get("end_at")?)?,
        pickup_location: row.try_get("pickup_location")?,
        dropoff_location: row.try_get("dropoff_location")?,
        payload_json: row.try_get("payload_json")?,
        parse_error: row.try_get("parse_error")?,
    })
}
