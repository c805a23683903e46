//! Outbox ledger state machine.
//!
//! Pure transition logic for [`SyncAttempt`] records: every outbound call is
//! opened as `pending`, moves to `processing` while in flight and ends
//! `completed` or `failed`. Failures bump the attempt count and schedule the
//! next retry with capped exponential backoff; permanent failures and
//! exhausted attempts get no retry time and wait for an operator replay.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::booking::BookingId;
use crate::domain::outbox::{
    AttemptId, AttemptStatus, ErrorClass, OperationKey, SyncAttempt, TargetSystem,
};

#[derive(Clone, Debug)]
pub struct OutboxEngineConfig {
    pub retry_base_delay_seconds: i64,
    pub retry_backoff_multiplier: u32,
    pub retry_max_delay_seconds: i64,
    /// Automatic retries stop once this many failures are recorded.
    pub max_attempts: u32,
    /// A `processing` entry older than this is considered abandoned.
    pub processing_timeout_seconds: i64,
}

impl Default for OutboxEngineConfig {
    fn default() -> Self {
        Self {
            retry_base_delay_seconds: 30,
            retry_backoff_multiplier: 2,
            retry_max_delay_seconds: 3600,
            max_attempts: 5,
            processing_timeout_seconds: 300,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum OutboxError {
    #[error("invalid outbox transition from {from:?} to {to:?}")]
    InvalidTransition { from: AttemptStatus, to: AttemptStatus },
    #[error("outbox entry {0} is already completed")]
    AlreadyCompleted(AttemptId),
}

#[derive(Clone, Debug, Default)]
pub struct OutboxEngine {
    config: OutboxEngineConfig,
}

impl OutboxEngine {
    pub fn new(config: OutboxEngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OutboxEngineConfig {
        &self.config
    }

    pub fn open(
        &self,
        target: TargetSystem,
        event_type: impl Into<String>,
        booking_id: BookingId,
        idempotency_key: OperationKey,
        payload_json: impl Into<String>,
        now: DateTime<Utc>,
    ) -> SyncAttempt {
        SyncAttempt {
            id: AttemptId(format!("ATT-{}", Uuid::new_v4().simple())),
            target,
            event_type: event_type.into(),
            booking_id,
            idempotency_key,
            payload_json: payload_json.into(),
            status: AttemptStatus::Pending,
            attempt_count: 0,
            next_retry_at: None,
            last_error: None,
            error_class: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// `pending | failed -> processing`. An abandoned `processing` entry may be
    /// restarted once it is older than the processing timeout.
    pub fn start(
        &self,
        mut attempt: SyncAttempt,
        now: DateTime<Utc>,
    ) -> Result<SyncAttempt, OutboxError> {
        match attempt.status {
            AttemptStatus::Pending | AttemptStatus::Failed => {}
            AttemptStatus::Processing if self.is_abandoned(&attempt, now) => {}
            AttemptStatus::Completed => {
                return Err(OutboxError::AlreadyCompleted(attempt.id.clone()));
            }
            AttemptStatus::Processing => {
                return Err(OutboxError::InvalidTransition {
                    from: attempt.status,
                    to: AttemptStatus::Processing,
                });
            }
        }

        attempt.status = AttemptStatus::Processing;
        attempt.next_retry_at = None;
        attempt.updated_at = now;
        Ok(attempt)
    }

    pub fn complete(
        &self,
        mut attempt: SyncAttempt,
        now: DateTime<Utc>,
    ) -> Result<SyncAttempt, OutboxError> {
        self.require_processing(&attempt, AttemptStatus::Completed)?;

        attempt.status = AttemptStatus::Completed;
        attempt.next_retry_at = None;
        attempt.completed_at = Some(now);
        attempt.updated_at = now;
        Ok(attempt)
    }

    pub fn fail(
        &self,
        mut attempt: SyncAttempt,
        error: impl Into<String>,
        class: ErrorClass,
        now: DateTime<Utc>,
    ) -> Result<SyncAttempt, OutboxError> {
        self.require_processing(&attempt, AttemptStatus::Failed)?;

        attempt.attempt_count = attempt.attempt_count.saturating_add(1);
        let retry = class == ErrorClass::Transient && attempt.attempt_count < self.config.max_attempts;

        attempt.status = AttemptStatus::Failed;
        attempt.last_error = Some(error.into());
        attempt.error_class = Some(class);
        attempt.next_retry_at =
            if retry { Some(now + self.backoff_delay(attempt.attempt_count)) } else { None };
        attempt.updated_at = now;
        Ok(attempt)
    }

    /// Delay before retry number `attempt_count` (1-based), capped.
    pub fn backoff_delay(&self, attempt_count: u32) -> Duration {
        let exponent = attempt_count.saturating_sub(1).min(30);
        let factor = i64::from(self.config.retry_backoff_multiplier.max(1))
            .checked_pow(exponent)
            .unwrap_or(i64::MAX);
        let seconds = self
            .config
            .retry_base_delay_seconds
            .max(0)
            .saturating_mul(factor)
            .min(self.config.retry_max_delay_seconds.max(0));
        Duration::seconds(seconds)
    }

    /// Failed transient entries whose retry time has arrived.
    pub fn is_due(&self, attempt: &SyncAttempt, now: DateTime<Utc>) -> bool {
        attempt.status == AttemptStatus::Failed
            && attempt.next_retry_at.is_some_and(|next_retry_at| next_retry_at <= now)
    }

    /// Operators may replay anything that has not completed and is not
    /// currently in flight.
    pub fn is_replayable(&self, attempt: &SyncAttempt, now: DateTime<Utc>) -> bool {
        match attempt.status {
            AttemptStatus::Pending | AttemptStatus::Failed => true,
            AttemptStatus::Processing => self.is_abandoned(attempt, now),
            AttemptStatus::Completed => false,
        }
    }

    fn is_abandoned(&self, attempt: &SyncAttempt, now: DateTime<Utc>) -> bool {
        attempt.status == AttemptStatus::Processing
            && attempt.updated_at + Duration::seconds(self.config.processing_timeout_seconds) < now
    }

    fn require_processing(
        &self,
        attempt: &SyncAttempt,
        to: AttemptStatus,
    ) -> Result<(), OutboxError> {
        match attempt.status {
            AttemptStatus::Processing => Ok(()),
            AttemptStatus::Completed => Err(OutboxError::AlreadyCompleted(attempt.id.clone())),
            from => Err(OutboxError::InvalidTransition { from, to }),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;

    fn open(engine: &OutboxEngine) -> SyncAttempt {
        engine.open(
            TargetSystem::Accounting,
            "order.create",
            BookingId("B-1".to_string()),
            OperationKey("order.create:B-1".to_string()),
            "{}",
            Utc::now(),
        )
    }

    #[test]
    fn open_entry_starts_pending_without_attempts() {
        let engine = OutboxEngine::default();
        let attempt = open(&engine);

        assert_eq!(attempt.status, AttemptStatus::Pending);
        assert_eq!(attempt.attempt_count, 0);
        assert!(attempt.next_retry_at.is_none());
    }

    #[test]
    fn success_does_not_increment_attempt_count() {
        let engine = OutboxEngine::default();
        let now = Utc::now();
        let started = engine.start(open(&engine), now).expect("start");
        let completed = engine.complete(started, now).expect("complete");

        assert_eq!(completed.status, AttemptStatus::Completed);
        assert_eq!(completed.attempt_count, 0);
        assert!(completed.completed_at.is_some());
    }

    #[test]
    fn transient_failures_back_off_until_max_attempts() {
        let engine = OutboxEngine::new(OutboxEngineConfig {
            retry_base_delay_seconds: 10,
            retry_backoff_multiplier: 2,
            retry_max_delay_seconds: 25,
            max_attempts: 3,
            processing_timeout_seconds: 300,
        });
        let now = Utc::now();

        let first = engine
            .fail(engine.start(open(&engine), now).expect("start"), "timeout", ErrorClass::Transient, now)
            .expect("fail");
        assert_eq!(first.attempt_count, 1);
        assert_eq!(first.next_retry_at, Some(now + Duration::seconds(10)));

        let second = engine
            .fail(engine.start(first, now).expect("start"), "timeout", ErrorClass::Transient, now)
            .expect("fail");
        assert_eq!(second.next_retry_at, Some(now + Duration::seconds(20)));

        let third = engine
            .fail(engine.start(second, now).expect("start"), "timeout", ErrorClass::Transient, now)
            .expect("fail");
        assert_eq!(third.attempt_count, 3);
        assert!(third.next_retry_at.is_none(), "attempts exhausted");
        assert!(engine.is_replayable(&third, now), "operators can still replay");
    }

    #[test]
    fn backoff_is_capped() {
        let engine = OutboxEngine::default();
        assert_eq!(engine.backoff_delay(1), Duration::seconds(30));
        assert_eq!(engine.backoff_delay(3), Duration::seconds(120));
        assert_eq!(engine.backoff_delay(40), Duration::seconds(3600));
    }

    #[test]
    fn permanent_failure_is_never_scheduled() {
        let engine = OutboxEngine::default();
        let now = Utc::now();
        let failed = engine
            .fail(
                engine.start(open(&engine), now).expect("start"),
                "422 validation rejected",
                ErrorClass::Permanent,
                now,
            )
            .expect("fail");

        assert!(failed.next_retry_at.is_none());
        assert!(!engine.is_due(&failed, now + Duration::days(1)));
    }

    #[test]
    fn completed_entries_are_terminal() {
        let engine = OutboxEngine::default();
        let now = Utc::now();
        let completed =
            engine.complete(engine.start(open(&engine), now).expect("start"), now).expect("done");

        assert!(matches!(engine.start(completed.clone(), now), Err(OutboxError::AlreadyCompleted(_))));
        assert!(!engine.is_replayable(&completed, now));
    }

    #[test]
    fn in_flight_entry_is_restartable_only_after_timeout() {
        let engine = OutboxEngine::default();
        let now = Utc::now();
        let started = engine.start(open(&engine), now).expect("start");

        assert!(engine.start(started.clone(), now + Duration::seconds(10)).is_err());
        assert!(engine.start(started, now + Duration::seconds(301)).is_ok());
    }
}
