//! `GET /health`. Readiness follows the database alone; held sync locks and
//! recent outbox failures are reported next to it for operators.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::{Duration, Utc};
use fleetsync_core::config::SyncConfig;
use fleetsync_db::{ping, DbPool};
use fleetsync_engine::SyncEngine;
use serde::Serialize;

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    engine: Arc<SyncEngine>,
    /// A lock older than this outlived every call a provisioning attempt makes.
    lock_budget: Duration,
}

impl HealthState {
    pub fn new(db_pool: DbPool, engine: Arc<SyncEngine>, sync: &SyncConfig) -> Self {
        let lock_budget = i64::try_from(sync.provisioning_budget_secs())
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or_else(|| Duration::hours(1));
        Self { db_pool, engine, lock_budget }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Ok,
    Attention,
    Unavailable,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Check {
    pub status: CheckStatus,
    pub detail: String,
}

impl Check {
    fn new(status: CheckStatus, detail: impl Into<String>) -> Self {
        Self { status, detail: detail.into() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: Check,
    pub sync_locks: Check,
    pub outbox: Check,
    pub checked_at: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = match ping(&state.db_pool).await {
        Ok(()) => Check::new(CheckStatus::Ok, "database query succeeded"),
        Err(error) => Check::new(CheckStatus::Unavailable, format!("database query failed: {error}")),
    };
    let ready = database.status == CheckStatus::Ok;
    let (sync_locks, outbox) = if ready {
        (lock_check(&state).await, outbox_check(&state.engine).await)
    } else {
        let skipped = || Check::new(CheckStatus::Unavailable, "skipped: database unavailable");
        (skipped(), skipped())
    };

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        database,
        sync_locks,
        outbox,
        checked_at: Utc::now().to_rfc3339(),
    };
    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn lock_check(state: &HealthState) -> Check {
    let budget_secs = state.lock_budget.num_seconds();
    match state.engine.held_lock_count(state.lock_budget).await {
        Ok(0) => Check::new(CheckStatus::Ok, format!("no booking held in_progress past {budget_secs}s")),
        Ok(held) => Check::new(
            CheckStatus::Attention,
            format!("{held} booking(s) held in_progress past {budget_secs}s; see `fleetsync release-locks`"),
        ),
        Err(error) => Check::new(CheckStatus::Unavailable, format!("lock query failed: {error}")),
    }
}

async fn outbox_check(engine: &SyncEngine) -> Check {
    match engine.outbox_stats().await {
        Ok(stats) if stats.failed_since == 0 => {
            Check::new(CheckStatus::Ok, "no failed outbound call in the last 24h")
        }
        Ok(stats) => Check::new(
            CheckStatus::Attention,
            format!("{} outbound call(s) failed in the last 24h", stats.failed_since),
        ),
        Err(error) => Check::new(CheckStatus::Unavailable, format!("outbox query failed: {error}")),
    }
}
