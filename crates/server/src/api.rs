//! JSON API: CRM webhook intake, operator sync actions, outbox inspection and
//! bulk import control.
//!
//! Every response uses the `{ "success": bool, "data" | "error": ... }` envelope.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use fleetsync_core::domain::booking::BookingId;
use fleetsync_core::domain::import::{DateRange, ImportRun, ImportRunId};
use fleetsync_core::domain::outbox::{AttemptId, AttemptStatus, SyncAttempt};
use fleetsync_db::OutboxStats;
use fleetsync_engine::{
    parse_webhook_batch, BulkImportError, BulkImporter, IngestOutcome, ProvisionOutcome,
    RefreshedOrder, SyncEngine, SyncError, SyncReport,
};

const WEBHOOK_SECRET_HEADER: &str = "x-webhook-secret";
const DEFAULT_OUTBOX_LIMIT: u32 = 50;
const MAX_OUTBOX_LIMIT: u32 = 500;

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<SyncEngine>,
    pub importer: Arc<BulkImporter>,
    pub webhook_secret: Option<SecretString>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/crm/webhook", post(crm_webhook))
        .route("/api/v1/bookings/{booking_id}/sync", post(sync_booking))
        .route("/api/v1/bookings/{booking_id}/order/refresh", post(refresh_order))
        .route("/api/v1/bookings/{booking_id}/outbox", get(booking_outbox))
        .route("/api/v1/outbox", get(list_outbox))
        .route("/api/v1/outbox/stats", get(outbox_stats))
        .route("/api/v1/outbox/{attempt_id}/replay", post(replay_attempt))
        .route("/api/v1/import/runs", post(start_import))
        .route("/api/v1/import/runs/{run_id}", get(import_run))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct Envelope<T> {
    success: bool,
    data: T,
}

type ApiResult<T> = Result<(StatusCode, Json<Envelope<T>>), ApiError>;

fn respond<T: Serialize>(status: StatusCode, data: T) -> ApiResult<T> {
    Ok((status, Json(Envelope { success: true, data })))
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    fn internal(cause: &dyn std::fmt::Display) -> Self {
        error!(event_name = "api.internal_error", error = %cause, "request failed on an internal error");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "an internal error occurred")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "success": false, "error": self.message }))).into_response()
    }
}

impl From<SyncError> for ApiError {
    fn from(cause: SyncError) -> Self {
        match &cause {
            SyncError::BookingNotFound(_)
            | SyncError::EventNotFound(_)
            | SyncError::AttemptNotFound(_) => Self::new(StatusCode::NOT_FOUND, cause.to_string()),
            SyncError::InFlight(_)
            | SyncError::NotReplayable(_)
            | SyncError::NotSynced(_)
            | SyncError::OrderConflict { .. }
            | SyncError::Outbox(_) => Self::new(StatusCode::CONFLICT, cause.to_string()),
            SyncError::Incomplete { .. } | SyncError::Domain(_) => {
                Self::new(StatusCode::BAD_REQUEST, cause.to_string())
            }
            SyncError::Gateway(_) => Self::new(StatusCode::BAD_GATEWAY, cause.to_string()),
            SyncError::Repository(_)
            | SyncError::Payload(_)
            | SyncError::Template(_)
            | SyncError::Aborted(_) => Self::internal(&cause),
        }
    }
}

impl From<BulkImportError> for ApiError {
    fn from(cause: BulkImportError) -> Self {
        match &cause {
            BulkImportError::Disabled => Self::new(StatusCode::FORBIDDEN, cause.to_string()),
            BulkImportError::InvalidRange(_) | BulkImportError::Domain(_) => {
                Self::new(StatusCode::BAD_REQUEST, cause.to_string())
            }
            BulkImportError::RunNotFound(_) => Self::new(StatusCode::NOT_FOUND, cause.to_string()),
            BulkImportError::Gateway(_) => Self::new(StatusCode::BAD_GATEWAY, cause.to_string()),
            BulkImportError::Repository(_) | BulkImportError::Payload(_) => Self::internal(&cause),
        }
    }
}

fn check_webhook_secret(headers: &HeaderMap, expected: Option<&SecretString>) -> Result<(), ApiError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    match headers.get(WEBHOOK_SECRET_HEADER).and_then(|value| value.to_str().ok()) {
        Some(provided) if provided == expected.expose_secret() => Ok(()),
        Some(_) => Err(ApiError::new(StatusCode::UNAUTHORIZED, "invalid webhook secret")),
        None => Err(ApiError::new(StatusCode::UNAUTHORIZED, "missing webhook secret")),
    }
}

#[derive(Debug, Default, Serialize)]
struct WebhookReceipt {
    received: usize,
    accepted: usize,
    duplicates: usize,
    rejected: Vec<String>,
    events: Vec<IngestOutcome>,
}

/// Records the batch and answers; processing continues in the background.
/// Only a failed write of the event log is reported as an error, so the CRM
/// redelivers exactly when nothing was recorded.
async fn crm_webhook(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<WebhookReceipt> {
    check_webhook_secret(&headers, state.webhook_secret.as_ref())?;

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(cause) => {
            warn!(event_name = "crm.webhook.malformed", error = %cause, "webhook body dropped");
            let receipt = WebhookReceipt {
                rejected: vec![format!("body is not valid JSON: {cause}")],
                ..WebhookReceipt::default()
            };
            return respond(StatusCode::OK, receipt);
        }
    };

    let batch = parse_webhook_batch(&payload);
    for reason in &batch.rejected {
        warn!(event_name = "crm.webhook.rejected_entry", reason = %reason, "webhook entry dropped");
    }

    let mut receipt = WebhookReceipt {
        received: batch.events.len() + batch.rejected.len(),
        rejected: batch.rejected,
        ..WebhookReceipt::default()
    };
    for event in &batch.events {
        let outcome = state.engine.ingest(event).await.map_err(|cause| {
            error!(
                event_name = "crm.webhook.ingest_failed",
                lead_id = %event.lead_id,
                error = %cause,
                "event log write failed"
            );
            ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "event could not be recorded; retry later")
        })?;

        if outcome.accepted {
            receipt.accepted += 1;
            let engine = state.engine.clone();
            let key = outcome.event_key.clone();
            tokio::spawn(async move {
                match engine.process_event(&key).await {
                    Ok(result) => debug!(event_key = %key, outcome = ?result, "crm event processed"),
                    Err(cause) => debug!(event_key = %key, error = %cause, "crm event processing ended with error"),
                }
            });
        } else {
            receipt.duplicates += 1;
        }
        receipt.events.push(outcome);
    }

    info!(
        event_name = "crm.webhook.received",
        received = receipt.received,
        accepted = receipt.accepted,
        duplicates = receipt.duplicates,
        rejected = receipt.rejected.len(),
        "webhook batch recorded"
    );
    respond(StatusCode::OK, receipt)
}

async fn sync_booking(
    State(state): State<ApiState>,
    Path(booking_id): Path<String>,
) -> ApiResult<SyncReport> {
    let report = state.engine.sync_booking(&BookingId(booking_id)).await?;
    if matches!(report.provision, ProvisionOutcome::InProgressElsewhere) {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("booking `{}` is being synchronized by another request", report.booking_id),
        ));
    }
    respond(StatusCode::OK, report)
}

async fn refresh_order(
    State(state): State<ApiState>,
    Path(booking_id): Path<String>,
) -> ApiResult<RefreshedOrder> {
    let refreshed = state.engine.refresh_order(&BookingId(booking_id)).await?;
    respond(StatusCode::OK, refreshed)
}

async fn booking_outbox(
    State(state): State<ApiState>,
    Path(booking_id): Path<String>,
) -> ApiResult<Vec<SyncAttempt>> {
    let entries = state.engine.outbox_for_booking(&BookingId(booking_id)).await?;
    respond(StatusCode::OK, entries)
}

#[derive(Debug, Deserialize)]
struct OutboxQuery {
    status: Option<String>,
    limit: Option<u32>,
}

async fn list_outbox(
    State(state): State<ApiState>,
    Query(query): Query<OutboxQuery>,
) -> ApiResult<Vec<SyncAttempt>> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(AttemptStatus::parse(raw).ok_or_else(|| {
            ApiError::new(
                StatusCode::BAD_REQUEST,
                format!("unknown status `{raw}`; use pending, processing, completed or failed"),
            )
        })?),
        None => None,
    };
    let limit = query.limit.unwrap_or(DEFAULT_OUTBOX_LIMIT).clamp(1, MAX_OUTBOX_LIMIT);
    let entries = state.engine.list_outbox(status, limit).await?;
    respond(StatusCode::OK, entries)
}

async fn outbox_stats(State(state): State<ApiState>) -> ApiResult<OutboxStats> {
    let stats = state.engine.outbox_stats().await?;
    respond(StatusCode::OK, stats)
}

async fn replay_attempt(
    State(state): State<ApiState>,
    Path(attempt_id): Path<String>,
) -> ApiResult<SyncAttempt> {
    let attempt = state.engine.replay(&AttemptId(attempt_id)).await?;
    respond(StatusCode::OK, attempt)
}

/// Either a calendar `year` or an explicit `from`/`to` pair.
#[derive(Debug, Default, Deserialize)]
struct ImportRequest {
    year: Option<i32>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

impl ImportRequest {
    fn range(&self) -> Result<DateRange, ApiError> {
        let range = match (self.year, self.from, self.to) {
            (Some(year), None, None) => DateRange::for_year(year),
            (None, Some(from), Some(to)) => DateRange::new(from, to),
            _ => {
                return Err(ApiError::new(
                    StatusCode::BAD_REQUEST,
                    "provide either `year` or both `from` and `to`",
                ))
            }
        };
        range.map_err(|cause| ApiError::new(StatusCode::BAD_REQUEST, cause.to_string()))
    }
}

/// Records the run and answers `202`; poll the run resource for the result.
async fn start_import(
    State(state): State<ApiState>,
    Json(request): Json<ImportRequest>,
) -> ApiResult<ImportRun> {
    let range = request.range()?;
    let run = state.importer.start(range).await?;

    let importer = state.importer.clone();
    let started = run.clone();
    tokio::spawn(async move {
        let run_id = started.id.clone();
        if let Err(cause) = importer.execute(started).await {
            error!(
                event_name = "bulk.run.persist_failed",
                run_id = %run_id,
                error = %cause,
                "final run state could not be saved"
            );
        }
    });

    respond(StatusCode::ACCEPTED, run)
}

async fn import_run(
    State(state): State<ApiState>,
    Path(run_id): Path<String>,
) -> ApiResult<ImportRun> {
    let run = state.importer.find_run(&ImportRunId(run_id)).await?;
    respond(StatusCode::OK, run)
}
