//! Funnels outbound calls through the outbox ledger.
//!
//! Each call is keyed by an [`OperationKey`]. A retry or replay with the same
//! key reuses the open ledger entry, so the attempt count and last error of an
//! operation accumulate on one row.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use fleetsync_core::domain::booking::BookingId;
use fleetsync_core::domain::outbox::{OperationKey, SyncAttempt, TargetSystem};
use fleetsync_core::outbox_engine::{OutboxEngine, OutboxError};
use fleetsync_db::OutboxRepository;

use crate::errors::SyncError;
use crate::ports::GatewayError;

#[derive(Clone, Debug)]
pub struct OutboundCall {
    pub target: TargetSystem,
    pub event_type: String,
    pub booking_id: BookingId,
    pub key: OperationKey,
    pub payload_json: String,
}

impl OutboundCall {
    pub fn new(
        target: TargetSystem,
        event_type: &str,
        booking_id: &BookingId,
        key: impl Into<String>,
        payload_json: impl Into<String>,
    ) -> Self {
        Self {
            target,
            event_type: event_type.to_string(),
            booking_id: booking_id.clone(),
            key: OperationKey(key.into()),
            payload_json: payload_json.into(),
        }
    }
}

pub struct OutboxRecorder {
    repo: Arc<dyn OutboxRepository>,
    engine: OutboxEngine,
    call_timeout: Duration,
}

impl OutboxRecorder {
    pub fn new(repo: Arc<dyn OutboxRepository>, engine: OutboxEngine, call_timeout: Duration) -> Self {
        Self { repo, engine, call_timeout }
    }

    pub fn engine(&self) -> &OutboxEngine {
        &self.engine
    }

    pub fn repository(&self) -> &Arc<dyn OutboxRepository> {
        &self.repo
    }

    /// Bounds an external call by the configured timeout. A timed-out call is
    /// a failure; nothing is assumed about its effect on the far side.
    pub async fn call<T, Fut>(&self, operation: &str, future: Fut) -> Result<T, GatewayError>
    where
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        match tokio::time::timeout(self.call_timeout, future).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout {
                operation: operation.to_string(),
                seconds: self.call_timeout.as_secs(),
            }),
        }
    }

    /// Runs `future` as the ledger entry for `call`.
    pub async fn run<T, Fut>(&self, call: OutboundCall, future: Fut) -> Result<T, SyncError>
    where
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let attempt = self.begin(&call).await?;

        match self.call(&call.event_type, future).await {
            Ok(value) => {
                self.finish_success(attempt).await;
                Ok(value)
            }
            Err(gateway_error) => {
                self.finish_failure(attempt, &gateway_error).await;
                Err(gateway_error.into())
            }
        }
    }

    /// Closes an open entry whose effect was achieved by another path, e.g. an
    /// order that exists because a concurrent attempt created it.
    pub async fn resolve(&self, attempt: SyncAttempt) -> Result<SyncAttempt, SyncError> {
        let now = Utc::now();
        let started = self.engine.start(attempt, now)?;
        let completed = self.engine.complete(started, now)?;
        self.repo.save(&completed).await?;

        info!(
            event_name = "outbox.attempt.resolved",
            attempt_id = %completed.id,
            booking_id = %completed.booking_id,
            idempotency_key = %completed.idempotency_key,
            "outbox entry closed without a new call"
        );
        Ok(completed)
    }

    async fn begin(&self, call: &OutboundCall) -> Result<SyncAttempt, SyncError> {
        let now = Utc::now();
        let entry = match self.repo.find_open_by_key(&call.key).await? {
            Some(mut existing) => {
                existing.payload_json = call.payload_json.clone();
                existing
            }
            None => self.engine.open(
                call.target,
                call.event_type.clone(),
                call.booking_id.clone(),
                call.key.clone(),
                call.payload_json.clone(),
                now,
            ),
        };

        let started = match self.engine.start(entry, now) {
            Ok(started) => started,
            Err(OutboxError::InvalidTransition { .. }) => {
                return Err(SyncError::InFlight(call.key.clone()));
            }
            Err(other) => return Err(other.into()),
        };

        match self.repo.save(&started).await {
            Ok(()) => Ok(started),
            Err(repo_error) if repo_error.is_unique_violation() => {
                Err(SyncError::InFlight(call.key.clone()))
            }
            Err(repo_error) => Err(repo_error.into()),
        }
    }

    // The external effect already happened; a ledger write failure must not
    // turn it into an error. The entry stays `processing` and becomes
    // replayable once abandoned.
    async fn finish_success(&self, attempt: SyncAttempt) {
        let completed = match self.engine.complete(attempt, Utc::now()) {
            Ok(completed) => completed,
            Err(transition) => {
                error!(event_name = "outbox.attempt.transition_failed", error = %transition);
                return;
            }
        };
        if let Err(repo_error) = self.repo.save(&completed).await {
            error!(
                event_name = "outbox.attempt.save_failed",
                attempt_id = %completed.id,
                error = %repo_error,
                "completed call could not be recorded"
            );
            return;
        }

        info!(
            event_name = "outbox.attempt.completed",
            attempt_id = %completed.id,
            booking_id = %completed.booking_id,
            target = completed.target.as_str(),
            event_type = %completed.event_type,
            attempt_count = completed.attempt_count,
            "outbound call completed"
        );
    }

    async fn finish_failure(&self, attempt: SyncAttempt, gateway_error: &GatewayError) {
        let failed = match self.engine.fail(
            attempt,
            gateway_error.to_string(),
            gateway_error.class(),
            Utc::now(),
        ) {
            Ok(failed) => failed,
            Err(transition) => {
                error!(event_name = "outbox.attempt.transition_failed", error = %transition);
                return;
            }
        };
        if let Err(repo_error) = self.repo.save(&failed).await {
            error!(
                event_name = "outbox.attempt.save_failed",
                attempt_id = %failed.id,
                error = %repo_error,
                "failed call could not be recorded"
            );
            return;
        }

        warn!(
            event_name = "outbox.attempt.failed",
            attempt_id = %failed.id,
            booking_id = %failed.booking_id,
            target = failed.target.as_str(),
            event_type = %failed.event_type,
            attempt_count = failed.attempt_count,
            error_class = gateway_error.class().as_str(),
            next_retry_at = ?failed.next_retry_at,
            error = %gateway_error,
            "outbound call failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use fleetsync_core::domain::booking::BookingId;
    use fleetsync_core::domain::outbox::{AttemptStatus, ErrorClass, TargetSystem, EVENT_ORDER_CREATE};
    use fleetsync_core::outbox_engine::OutboxEngine;
    use fleetsync_db::{OutboxRepository, SqlOutboxRepository};

    use super::{OutboundCall, OutboxRecorder};
    use crate::errors::SyncError;
    use crate::ports::GatewayError;
    use crate::testing::setup_pool;

    fn call() -> OutboundCall {
        OutboundCall::new(
            TargetSystem::Accounting,
            EVENT_ORDER_CREATE,
            &BookingId("B-1".to_string()),
            "order.create:B-1",
            "{}",
        )
    }

    fn unavailable() -> GatewayError {
        GatewayError::Status {
            operation: "order.create".to_string(),
            status: 503,
            body: "maintenance".to_string(),
        }
    }

    #[tokio::test]
    async fn retries_reuse_the_open_entry_until_completion() {
        let repo = Arc::new(SqlOutboxRepository::new(setup_pool().await));
        let recorder =
            OutboxRecorder::new(repo.clone(), OutboxEngine::default(), Duration::from_secs(5));

        let first = recorder.run(call(), async { Err::<(), _>(unavailable()) }).await;
        assert!(matches!(first, Err(SyncError::Gateway(_))));

        let open = repo.find_open_by_key(&call().key).await.expect("find").expect("open entry");
        assert_eq!(open.status, AttemptStatus::Failed);
        assert_eq!(open.attempt_count, 1);
        assert_eq!(open.error_class, Some(ErrorClass::Transient));
        assert!(open.next_retry_at.is_some());

        let value = recorder.run(call(), async { Ok::<_, GatewayError>(42) }).await.expect("retry");
        assert_eq!(value, 42);

        let entries = repo.list_for_booking(&BookingId("B-1".to_string())).await.expect("list");
        assert_eq!(entries.len(), 1, "the retry reused the failed entry");
        assert_eq!(entries[0].id, open.id);
        assert_eq!(entries[0].status, AttemptStatus::Completed);
        assert_eq!(entries[0].attempt_count, 1);
    }

    #[tokio::test]
    async fn timed_out_call_is_recorded_as_transient_failure() {
        let repo = Arc::new(SqlOutboxRepository::new(setup_pool().await));
        let recorder =
            OutboxRecorder::new(repo.clone(), OutboxEngine::default(), Duration::from_millis(20));

        let result = recorder
            .run(call(), async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok::<_, GatewayError>(())
            })
            .await;

        assert!(matches!(result, Err(SyncError::Gateway(GatewayError::Timeout { .. }))));
        let entry = repo.find_open_by_key(&call().key).await.expect("find").expect("open entry");
        assert_eq!(entry.error_class, Some(ErrorClass::Transient));
    }

    #[tokio::test]
    async fn permanent_failure_is_not_scheduled_for_retry() {
        let repo = Arc::new(SqlOutboxRepository::new(setup_pool().await));
        let recorder =
            OutboxRecorder::new(repo.clone(), OutboxEngine::default(), Duration::from_secs(5));

        let rejected = GatewayError::Status {
            operation: "order.create".to_string(),
            status: 422,
            body: "unknown customer".to_string(),
        };
        let _ = recorder.run(call(), async move { Err::<(), _>(rejected) }).await;

        let entry = repo.find_open_by_key(&call().key).await.expect("find").expect("open entry");
        assert_eq!(entry.error_class, Some(ErrorClass::Permanent));
        assert_eq!(entry.next_retry_at, None);
        assert!(entry.last_error.as_deref().is_some_and(|error| error.contains("422")));

        let resolved = recorder.resolve(entry).await.expect("resolve");
        assert_eq!(resolved.status, AttemptStatus::Completed);
    }
}
