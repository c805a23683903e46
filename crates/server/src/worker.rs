//! Background replay of outbox entries whose backoff has elapsed, plus the
//! opt-in release of stale sync locks.

use std::sync::Arc;
use std::time::Duration;

use fleetsync_core::config::SyncConfig;
use fleetsync_engine::{ReplaySummary, SyncEngine, SyncError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const REPLAY_BATCH: u32 = 25;

#[derive(Clone, Debug)]
pub struct WorkerSettings {
    pub interval: Duration,
    pub batch_size: u32,
    pub stale_lock_after: Option<chrono::Duration>,
}

impl WorkerSettings {
    pub fn from_config(sync: &SyncConfig) -> Self {
        Self {
            interval: Duration::from_secs(sync.retry_worker_interval_secs.max(1)),
            batch_size: REPLAY_BATCH,
            stale_lock_after: sync
                .stale_lock_after_secs
                .and_then(|secs| i64::try_from(secs).ok())
                .map(chrono::Duration::seconds),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkerPass {
    pub replay: ReplaySummary,
    pub released_locks: usize,
}

/// One pass: stale locks first so their bookings can be replayed in the same pass.
pub async fn run_once(engine: &SyncEngine, settings: &WorkerSettings) -> Result<WorkerPass, SyncError> {
    let mut pass = WorkerPass::default();
    if let Some(older_than) = settings.stale_lock_after {
        pass.released_locks = engine.release_stale_locks(older_than).await?.len();
    }
    pass.replay = engine.replay_due(settings.batch_size).await?;
    Ok(pass)
}

pub fn spawn(
    engine: Arc<SyncEngine>,
    settings: WorkerSettings,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            event_name = "outbox.worker.started",
            interval_secs = settings.interval.as_secs(),
            stale_lock_release = settings.stale_lock_after.is_some(),
            "retry worker started"
        );
        let mut ticker = tokio::time::interval(settings.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match run_once(&engine, &settings).await {
                Ok(pass) if pass.replay.attempted > 0 || pass.released_locks > 0 => info!(
                    event_name = "outbox.worker.pass",
                    attempted = pass.replay.attempted,
                    succeeded = pass.replay.succeeded,
                    failed = pass.replay.failed,
                    released_locks = pass.released_locks,
                    "retry worker pass finished"
                ),
                Ok(_) => {}
                Err(cause) => warn!(
                    event_name = "outbox.worker.error",
                    error = %cause,
                    "retry worker pass failed"
                ),
            }
        }
        info!(event_name = "outbox.worker.stopped", "retry worker stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use fleetsync_core::config::AppConfig;
    use fleetsync_core::domain::booking::SyncStatus;
    use fleetsync_db::{BookingRepository, SqlBookingRepository};
    use fleetsync_engine::InboundEvent;
    use tokio::sync::watch;

    use super::{run_once, spawn, WorkerSettings};
    use crate::testing::{lead, StubAccounting, StubCrm, TestApp};

    fn immediate_retry_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.sync.retry_base_delay_secs = 0;
        config.sync.retry_max_delay_secs = 0;
        config
    }

    async fn failed_first_order(config: AppConfig) -> TestApp {
        let accounting = StubAccounting::default();
        accounting.failures_left.store(1, Ordering::SeqCst);
        let test = TestApp::new(
            config,
            StubCrm::default().with_lead(lead("L-3", "sales_order_requested")),
            accounting,
        )
        .await;
        let event = InboundEvent {
            source_event_id: Some("e-1".to_string()),
            lead_id: "L-3".to_string(),
            new_stage_id: "sales_order_requested".to_string(),
            old_stage_id: None,
            pipeline_id: None,
        };
        assert!(test.app.engine.handle(&event).await.is_err());
        test
    }

    #[test]
    fn settings_keep_stale_release_off_unless_configured() {
        let mut config = AppConfig::default();
        assert!(WorkerSettings::from_config(&config.sync).stale_lock_after.is_none());

        config.sync.stale_lock_after_secs = Some(600);
        let settings = WorkerSettings::from_config(&config.sync);
        assert_eq!(settings.stale_lock_after, Some(chrono::Duration::seconds(600)));
    }

    #[tokio::test]
    async fn pass_replays_due_order_creation() {
        let test = failed_first_order(immediate_retry_config()).await;
        let settings = WorkerSettings::from_config(&test.app.config.sync);

        let pass = run_once(&test.app.engine, &settings).await.expect("pass");

        assert_eq!(pass.replay.attempted, 1);
        assert_eq!(pass.replay.succeeded, 1);
        assert_eq!(test.accounting.orders.load(Ordering::SeqCst), 1);

        let again = run_once(&test.app.engine, &settings).await.expect("second pass");
        assert_eq!(again.replay.attempted, 0);
    }

    #[tokio::test]
    async fn pass_leaves_entries_alone_until_backoff_elapses() {
        let test = failed_first_order(AppConfig::default()).await;
        let settings = WorkerSettings::from_config(&test.app.config.sync);

        let pass = run_once(&test.app.engine, &settings).await.expect("pass");

        assert_eq!(pass.replay.attempted, 0);
        assert_eq!(test.accounting.orders.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pass_releases_stale_locks_when_enabled() {
        let test = TestApp::new(AppConfig::default(), StubCrm::default(), StubAccounting::default()).await;
        let bookings = SqlBookingRepository::new(test.app.db_pool.clone());
        let started = chrono::Utc::now() - chrono::Duration::hours(2);
        let booking = fleetsync_core::domain::booking::Booking::new(
            fleetsync_core::domain::booking::BookingId("BK-stuck".to_string()),
            "CRM-stuck",
            started,
        );
        bookings.save(&booking).await.expect("save");
        assert!(bookings.try_acquire_sync(&booking.id, started).await.expect("acquire"));

        let settings = WorkerSettings {
            interval: Duration::from_secs(60),
            batch_size: 10,
            stale_lock_after: Some(chrono::Duration::minutes(30)),
        };
        let pass = run_once(&test.app.engine, &settings).await.expect("pass");

        assert_eq!(pass.released_locks, 1);
        let stored = bookings.find_by_id(&booking.id).await.expect("find").expect("booking");
        assert_ne!(stored.sync_status, SyncStatus::InProgress);
    }

    #[tokio::test]
    async fn spawned_worker_stops_on_shutdown_signal() {
        let test = TestApp::new(AppConfig::default(), StubCrm::default(), StubAccounting::default()).await;
        let (tx, rx) = watch::channel(false);
        let handle = spawn(
            test.app.engine.clone(),
            WorkerSettings::from_config(&test.app.config.sync),
            rx,
        );

        tx.send(true).expect("signal");
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker should stop")
            .expect("worker task");
    }
}
