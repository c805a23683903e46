//! Event pipeline: turns a recorded CRM event into booking state and, when
//! the stage asks for it, an accounting order plus the CRM follow-up.
//!
//! Each stage has its own failure mode. A failed provisioning attempt leaves
//! the committed booking status alone, and a failed propagation or
//! notification never unwinds a created order.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use fleetsync_core::config::AppConfig;
use fleetsync_core::domain::booking::{Booking, BookingId};
use fleetsync_core::domain::client::{Client, ClientId};
use fleetsync_core::domain::crm_event::{CrmEventStatus, EventKey};
use fleetsync_core::domain::outbox::{
    AttemptId, AttemptStatus, SyncAttempt, TargetSystem, EVENT_CRM_STATUS_UPDATE,
    EVENT_CUSTOMER_CREATE, EVENT_NOTIFICATION_SEND, EVENT_ORDER_CREATE, EVENT_ORDER_UPDATE,
    EVENT_TASK_CREATE,
};
use fleetsync_core::fields::{LeadFieldMap, LeadSnapshot};
use fleetsync_core::lifecycle::{BookingAction, BookingLifecycle, TransitionOutcome};
use fleetsync_core::line_items::rental_days;
use fleetsync_core::outbox_engine::OutboxEngine;
use fleetsync_core::stages::{StageMapper, StageMapping};
use fleetsync_db::{
    BookingRepository, ClientRepository, DbPool, OutboxRepository, OutboxStats, RepositoryError,
    SqlBookingRepository, SqlClientRepository, SqlCrmEventRepository, SqlOutboxRepository,
};

use crate::errors::SyncError;
use crate::http::{HttpAccountingGateway, HttpCrmGateway, WebhookNotifier};
use crate::ingest::{EventLog, InboundEvent, IngestOutcome};
use crate::lock::{RowSyncLock, SyncLock};
use crate::notify::Notifications;
use crate::ports::{AccountingGateway, CrmGateway, CrmLead, Notifier, TaskGateway, TaskRequest};
use crate::propagator::{PropagationOutcome, StatusPropagator};
use crate::provisioner::{OrderProvisioner, ProvisionOutcome, RefreshedOrder};
use crate::recorder::{OutboundCall, OutboxRecorder};

/// External systems the engine talks to.
#[derive(Clone)]
pub struct Gateways {
    pub crm: Arc<dyn CrmGateway>,
    pub accounting: Arc<dyn AccountingGateway>,
    pub tasks: Arc<dyn TaskGateway>,
    pub notifier: Option<Arc<dyn Notifier>>,
}

impl Gateways {
    pub fn http(config: &AppConfig) -> Result<Self, reqwest::Error> {
        let crm = Arc::new(HttpCrmGateway::new(&config.crm)?);
        let notifier = match &config.notifications.webhook_url {
            Some(url) => Some(Arc::new(WebhookNotifier::new(url.clone(), config.crm.timeout_secs)?)
                as Arc<dyn Notifier>),
            None => None,
        };
        Ok(Self {
            crm: crm.clone(),
            accounting: Arc::new(HttpAccountingGateway::new(&config.accounting)?),
            tasks: crm,
            notifier,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub booking_id: BookingId,
    pub provision: ProvisionOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub propagation: Option<PropagationOutcome>,
    pub notified: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EventOutcome {
    /// The key was already processed.
    Duplicate { event_key: EventKey },
    Ignored { event_key: EventKey, reason: String },
    Applied {
        event_key: EventKey,
        booking_id: BookingId,
        transition: TransitionOutcome,
        #[serde(skip_serializing_if = "Option::is_none")]
        sync: Option<SyncReport>,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub attempted: u32,
    pub succeeded: u32,
    pub failed: u32,
}

pub struct SyncEngine {
    bookings: Arc<dyn BookingRepository>,
    clients: Arc<dyn ClientRepository>,
    outbox: Arc<dyn OutboxRepository>,
    events: EventLog,
    gateways: Gateways,
    mapper: StageMapper,
    lifecycle: BookingLifecycle,
    lock: Arc<dyn SyncLock>,
    recorder: Arc<OutboxRecorder>,
    provisioner: Arc<OrderProvisioner>,
    propagator: StatusPropagator,
    notifications: Option<Notifications>,
}

impl SyncEngine {
    pub fn new(pool: DbPool, config: &AppConfig, gateways: Gateways) -> Result<Self, SyncError> {
        let bookings: Arc<dyn BookingRepository> = Arc::new(SqlBookingRepository::new(pool.clone()));
        let clients: Arc<dyn ClientRepository> = Arc::new(SqlClientRepository::new(pool.clone()));
        let outbox: Arc<dyn OutboxRepository> = Arc::new(SqlOutboxRepository::new(pool.clone()));
        let bucket_secs = i64::try_from(config.sync.event_bucket_secs).unwrap_or(i64::MAX);
        let events = EventLog::new(Arc::new(SqlCrmEventRepository::new(pool)), bucket_secs);

        let recorder = Arc::new(OutboxRecorder::new(
            outbox.clone(),
            OutboxEngine::new(config.sync.outbox_engine_config()),
            StdDuration::from_secs(config.sync.call_timeout_secs.max(1)),
        ));
        let lock: Arc<dyn SyncLock> = Arc::new(RowSyncLock::new(bookings.clone()));
        let provisioner = Arc::new(OrderProvisioner::new(
            bookings.clone(),
            clients.clone(),
            gateways.accounting.clone(),
            lock.clone(),
            recorder.clone(),
            config.accounting.fee_rules(),
        ));
        let propagator = StatusPropagator::new(
            gateways.crm.clone(),
            recorder.clone(),
            config.crm.fields.clone(),
            config.crm.payment_pending_stage_id.clone(),
            config.crm.confirmed_stage_id.clone(),
        );
        let notifications = match &gateways.notifier {
            Some(notifier) => Some(Notifications::new(notifier.clone(), recorder.clone())?),
            None => None,
        };

        Ok(Self {
            bookings,
            clients,
            outbox,
            events,
            gateways,
            mapper: config.crm.stage_mapper(),
            lifecycle: BookingLifecycle,
            lock,
            recorder,
            provisioner,
            propagator,
            notifications,
        })
    }

    pub fn fields(&self) -> &LeadFieldMap {
        self.mapper.fields()
    }

    /// Records the event; the caller decides when to process it.
    pub async fn ingest(&self, event: &InboundEvent) -> Result<IngestOutcome, RepositoryError> {
        self.events.ingest(event, Utc::now()).await
    }

    /// Ingest followed by inline processing.
    pub async fn handle(&self, event: &InboundEvent) -> Result<EventOutcome, SyncError> {
        let ingested = self.ingest(event).await?;
        if !ingested.accepted {
            return Ok(EventOutcome::Duplicate { event_key: ingested.event_key });
        }
        self.process_event(&ingested.event_key).await
    }

    pub async fn process_event(&self, key: &EventKey) -> Result<EventOutcome, SyncError> {
        let repo = self.events.repository();
        let event =
            repo.find(key).await?.ok_or_else(|| SyncError::EventNotFound(key.to_string()))?;
        if event.status == CrmEventStatus::Processed {
            return Ok(EventOutcome::Duplicate { event_key: key.clone() });
        }
        repo.mark(key, CrmEventStatus::Processing, None, Utc::now()).await?;

        let inbound = InboundEvent {
            source_event_id: None,
            lead_id: event.lead_id.clone(),
            new_stage_id: event.new_stage_id.clone(),
            old_stage_id: event.old_stage_id.clone(),
            pipeline_id: event.pipeline_id.clone(),
        };
        let result = self.apply_event(key, &inbound).await;

        match &result {
            Ok(_) => repo.mark(key, CrmEventStatus::Processed, None, Utc::now()).await?,
            Err(cause) => {
                warn!(
                    event_name = "crm.event.failed",
                    event_key = %key,
                    lead_id = %event.lead_id,
                    error_class = cause.class().as_str(),
                    error = %cause,
                    "crm event processing failed"
                );
                let message = cause.to_string();
                if let Err(mark_error) =
                    repo.mark(key, CrmEventStatus::Failed, Some(&message), Utc::now()).await
                {
                    error!(
                        event_name = "crm.event.mark_failed",
                        event_key = %key,
                        error = %mark_error
                    );
                }
            }
        }
        result
    }

    async fn apply_event(
        &self,
        key: &EventKey,
        event: &InboundEvent,
    ) -> Result<EventOutcome, SyncError> {
        let lead = self.recorder.call("crm.get_lead", self.gateways.crm.get_lead(&event.lead_id)).await?;
        let pipeline_id = event.pipeline_id.as_deref().or(lead.pipeline_id.as_deref());

        let (status, derived) =
            match self.mapper.map_stage(pipeline_id, &event.new_stage_id, &lead.custom_fields) {
                StageMapping::NoOp { reason } => {
                    info!(
                        event_name = "crm.event.ignored",
                        event_key = %key,
                        lead_id = %event.lead_id,
                        reason = %reason,
                        "stage change does not affect bookings"
                    );
                    return Ok(EventOutcome::Ignored { event_key: key.clone(), reason });
                }
                StageMapping::Transition { status, derived } => (status, derived),
            };

        let mut booking = self.ensure_booking(&lead).await?;
        if !booking.is_synced() {
            apply_snapshot(&mut booking, &LeadSnapshot::extract(&lead.custom_fields, self.fields()), lead.price);
        }

        let now = Utc::now();
        let transition = self.lifecycle.apply(&mut booking, status, &derived, now);
        booking.updated_at = now;
        self.bookings.save(&booking).await?;

        info!(
            event_name = "booking.transition.applied",
            event_key = %key,
            booking_id = %booking.id,
            from = transition.from.as_str(),
            to = transition.to.as_str(),
            changed = transition.changed,
            backward = transition.backward,
            noop = transition.is_noop(),
            "booking status applied"
        );
        if transition.backward {
            warn!(
                event_name = "booking.transition.backward",
                booking_id = %booking.id,
                from = transition.from.as_str(),
                to = transition.to.as_str(),
                "crm moved the booking backwards"
            );
        }

        for action in &transition.actions {
            if let Err(cause) = self.create_task(&booking, *action, key).await {
                warn!(
                    event_name = "booking.task.failed",
                    booking_id = %booking.id,
                    action = action.as_str(),
                    error = %cause,
                    "follow-up task not created; it stays on the outbox for replay"
                );
            }
        }

        let sync = if derived.requires_provisioning {
            Some(self.sync_booking(&booking.id).await?)
        } else {
            None
        };

        Ok(EventOutcome::Applied {
            event_key: key.clone(),
            booking_id: booking.id,
            transition,
            sync,
        })
    }

    /// Finds the booking linked to `lead`, creating it (and its client) on first sight.
    async fn ensure_booking(&self, lead: &CrmLead) -> Result<Booking, SyncError> {
        if let Some(existing) = self.bookings.find_by_external_ref(&lead.id).await? {
            return Ok(existing);
        }

        let now = Utc::now();
        let client_id = match &lead.contact_id {
            Some(contact_id) => Some(self.upsert_client(contact_id).await?.id),
            None => None,
        };

        let mut booking = Booking::new(
            BookingId(format!("BK-{}", Uuid::new_v4().simple())),
            format!("CRM-{}", lead.id),
            lead.created_at.unwrap_or(now),
        );
        booking.external_ref = Some(lead.id.clone());
        booking.client_id = client_id;
        booking.updated_at = now;
        apply_snapshot(&mut booking, &LeadSnapshot::extract(&lead.custom_fields, self.fields()), lead.price);

        if self.bookings.insert_if_absent(&booking).await? {
            info!(
                event_name = "booking.created",
                booking_id = %booking.id,
                lead_id = %lead.id,
                "booking created from crm lead"
            );
        }
        // A concurrent delivery may have inserted first; its row wins.
        self.bookings
            .find_by_external_ref(&lead.id)
            .await?
            .ok_or_else(|| SyncError::BookingNotFound(booking.id.clone()))
    }

    async fn upsert_client(&self, contact_id: &str) -> Result<Client, SyncError> {
        let contact =
            self.recorder.call("crm.get_contact", self.gateways.crm.get_contact(contact_id)).await?;
        let now = Utc::now();
        let client = Client {
            id: ClientId(format!("CL-{}", Uuid::new_v4().simple())),
            external_ref: Some(contact.id),
            name: contact.name,
            email: contact.email,
            phone: contact.phone,
            document_type: contact.document_type,
            document_number: contact.document_number,
            address: contact.address,
            accounting_customer_id: None,
            created_at: now,
            updated_at: now,
        };
        Ok(self.clients.upsert_by_external_ref(&client).await?)
    }

    async fn create_task(
        &self,
        booking: &Booking,
        action: BookingAction,
        key: &EventKey,
    ) -> Result<(), SyncError> {
        let task = task_for(booking, action);
        let call = OutboundCall::new(
            TargetSystem::Tasks,
            EVENT_TASK_CREATE,
            &booking.id,
            format!("{EVENT_TASK_CREATE}:{}:{}:{key}", booking.id, action.as_str()),
            serde_json::to_string(&task)?,
        );
        self.recorder.run(call, self.gateways.tasks.create_task(&task)).await
    }

    /// Lock, provision, then propagate. Also the operator-triggered retry.
    pub async fn sync_booking(&self, booking_id: &BookingId) -> Result<SyncReport, SyncError> {
        let provision = self.provisioner.provision(booking_id).await?;

        let (propagation, notified) = match &provision {
            ProvisionOutcome::Created { order } => {
                let booking = self.load_booking(booking_id).await?;
                let propagation = self.propagate_logged(&booking, &order.order_url).await;
                let notified = match &self.notifications {
                    Some(notifications) => {
                        let client_name = self.client_name(&booking).await;
                        notifications.order_created(&booking, order, client_name.as_deref()).await
                    }
                    None => false,
                };
                (propagation, notified)
            }
            ProvisionOutcome::AlreadySynced { order } => {
                let booking = self.load_booking(booking_id).await?;
                (self.propagate_logged(&booking, &order.order_url).await, false)
            }
            ProvisionOutcome::InProgressElsewhere => (None, false),
        };

        Ok(SyncReport { booking_id: booking_id.clone(), provision, propagation, notified })
    }

    pub async fn refresh_order(&self, booking_id: &BookingId) -> Result<RefreshedOrder, SyncError> {
        self.provisioner.refresh_order(booking_id).await
    }

    async fn propagate_logged(&self, booking: &Booking, order_url: &str) -> Option<PropagationOutcome> {
        match self.propagator.propagate(booking, order_url).await {
            Ok(outcome) => Some(outcome),
            Err(cause) => {
                warn!(
                    event_name = "sync.propagate.failed",
                    booking_id = %booking.id,
                    error_class = cause.class().as_str(),
                    error = %cause,
                    "crm update failed; the order stands and the update stays on the outbox"
                );
                None
            }
        }
    }

    async fn client_name(&self, booking: &Booking) -> Option<String> {
        let client_id = booking.client_id.as_ref()?;
        match self.clients.find_by_id(client_id).await {
            Ok(client) => client.map(|client| client.name),
            Err(cause) => {
                warn!(booking_id = %booking.id, error = %cause, "client lookup for notification failed");
                None
            }
        }
    }

    async fn load_booking(&self, booking_id: &BookingId) -> Result<Booking, SyncError> {
        self.bookings
            .find_by_id(booking_id)
            .await?
            .ok_or_else(|| SyncError::BookingNotFound(booking_id.clone()))
    }

    /// Re-runs the operation behind one outbox entry and closes the entry
    /// when its effect is in place.
    pub async fn replay(&self, attempt_id: &AttemptId) -> Result<SyncAttempt, SyncError> {
        let attempt = self
            .outbox
            .find(attempt_id)
            .await?
            .ok_or_else(|| SyncError::AttemptNotFound(attempt_id.clone()))?;
        if !self.recorder.engine().is_replayable(&attempt, Utc::now()) {
            return Err(SyncError::NotReplayable(attempt_id.clone()));
        }

        info!(
            event_name = "outbox.replay.started",
            attempt_id = %attempt.id,
            event_type = %attempt.event_type,
            booking_id = %attempt.booking_id,
            attempt_count = attempt.attempt_count,
            "replaying outbox entry"
        );
        self.dispatch(&attempt).await?;

        if let Some(open) = self.outbox.find_open_by_key(&attempt.idempotency_key).await? {
            self.recorder.resolve(open).await?;
        }
        self.outbox
            .find(attempt_id)
            .await?
            .ok_or_else(|| SyncError::AttemptNotFound(attempt_id.clone()))
    }

    async fn dispatch(&self, attempt: &SyncAttempt) -> Result<(), SyncError> {
        match attempt.event_type.as_str() {
            EVENT_ORDER_CREATE | EVENT_CUSTOMER_CREATE => {
                match self.sync_booking(&attempt.booking_id).await?.provision {
                    ProvisionOutcome::InProgressElsewhere => {
                        Err(SyncError::InFlight(attempt.idempotency_key.clone()))
                    }
                    _ => Ok(()),
                }
            }
            EVENT_ORDER_UPDATE => self.refresh_order(&attempt.booking_id).await.map(|_| ()),
            EVENT_CRM_STATUS_UPDATE => {
                let booking = self.load_booking(&attempt.booking_id).await?;
                let order_url = booking.external_order_url.clone().unwrap_or_default();
                self.propagator.propagate(&booking, &order_url).await.map(|_| ())
            }
            EVENT_TASK_CREATE => {
                let task: TaskRequest = serde_json::from_str(&attempt.payload_json)?;
                let call = OutboundCall::new(
                    attempt.target,
                    &attempt.event_type,
                    &attempt.booking_id,
                    attempt.idempotency_key.0.clone(),
                    attempt.payload_json.clone(),
                );
                self.recorder.run(call, self.gateways.tasks.create_task(&task)).await
            }
            EVENT_NOTIFICATION_SEND => match &self.notifications {
                Some(notifications) => notifications.resend(attempt).await,
                None => Err(SyncError::NotReplayable(attempt.id.clone())),
            },
            _ => Err(SyncError::NotReplayable(attempt.id.clone())),
        }
    }

    /// Replays failed entries whose backoff has elapsed.
    pub async fn replay_due(&self, limit: u32) -> Result<ReplaySummary, SyncError> {
        let due = self.outbox.list_due(Utc::now(), limit).await?;
        let mut summary = ReplaySummary::default();
        for attempt in due {
            summary.attempted += 1;
            match self.replay(&attempt.id).await {
                Ok(_) => summary.succeeded += 1,
                Err(cause) => {
                    summary.failed += 1;
                    warn!(
                        event_name = "outbox.replay.failed",
                        attempt_id = %attempt.id,
                        event_type = %attempt.event_type,
                        error = %cause,
                        "scheduled replay failed"
                    );
                }
            }
        }
        Ok(summary)
    }

    pub async fn release_stale_locks(&self, older_than: Duration) -> Result<Vec<BookingId>, SyncError> {
        let now = Utc::now();
        self.lock.release_stale(now - older_than, now).await
    }

    /// Bookings held `in_progress` for longer than `older_than`.
    pub async fn held_lock_count(&self, older_than: Duration) -> Result<u64, SyncError> {
        Ok(self.bookings.count_held_locks(Utc::now() - older_than).await?)
    }

    pub async fn list_outbox(
        &self,
        status: Option<AttemptStatus>,
        limit: u32,
    ) -> Result<Vec<SyncAttempt>, SyncError> {
        Ok(self.outbox.list(status, limit).await?)
    }

    pub async fn outbox_for_booking(&self, booking_id: &BookingId) -> Result<Vec<SyncAttempt>, SyncError> {
        Ok(self.outbox.list_for_booking(booking_id).await?)
    }

    /// Counts by status and target plus failures of the last 24 hours.
    pub async fn outbox_stats(&self) -> Result<OutboxStats, SyncError> {
        Ok(self.outbox.stats(Utc::now() - Duration::hours(24)).await?)
    }
}

/// Copies lead values onto a booking that has no order yet. Missing values
/// keep what the booking already has.
fn apply_snapshot(booking: &mut Booking, snapshot: &LeadSnapshot, price: Option<Decimal>) {
    if let Some(currency) = &snapshot.currency {
        booking.currency = currency.clone();
    }
    if let Some(rate) = snapshot.daily_rate {
        booking.daily_rate = rate;
    }
    if snapshot.start_at.is_some() {
        booking.start_at = snapshot.start_at;
    }
    if snapshot.end_at.is_some() {
        booking.end_at = snapshot.end_at;
    }
    if snapshot.pickup_location.is_some() {
        booking.pickup_location = snapshot.pickup_location.clone();
    }
    if snapshot.dropoff_location.is_some() {
        booking.dropoff_location = snapshot.dropoff_location.clone();
    }
    if snapshot.vehicle_plate.is_some() {
        booking.vehicle_plate = snapshot.vehicle_plate.clone();
    }
    booking.delivery_fee = snapshot.delivery_fee;
    booking.deposit_amount = snapshot.deposit_amount;
    booking.deposit_label = snapshot.deposit_label.clone();
    booking.cdw_fee = snapshot.cdw_fee;

    let days = Decimal::from(rental_days(booking.start_at, booking.end_at));
    booking.total_amount = match price.filter(|value| *value > Decimal::ZERO) {
        Some(price) => price,
        None => booking.daily_rate * days,
    };
}

fn task_for(booking: &Booking, action: BookingAction) -> TaskRequest {
    let vehicle = booking.vehicle_plate.as_deref().unwrap_or("vehicle");
    let (text, due_at) = match action {
        BookingAction::CreateDeliveryTask => (
            format!(
                "Deliver {vehicle} for booking {} at {}",
                booking.code,
                booking.pickup_location.as_deref().unwrap_or("the agreed location")
            ),
            booking.start_at,
        ),
        BookingAction::CreateReturnInspectionTask => (
            format!("Inspect returned {vehicle} for booking {}", booking.code),
            booking.end_at,
        ),
    };
    TaskRequest {
        action,
        lead_id: booking.external_ref.clone(),
        booking_code: booking.code.clone(),
        text,
        due_at: due_at.unwrap_or_else(|| Utc::now() + Duration::days(1)),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use chrono::Utc;
    use futures::future::join_all;
    use rust_decimal::Decimal;

    use fleetsync_core::config::AppConfig;
    use fleetsync_core::domain::booking::{BookingStatus, SyncStatus};
    use fleetsync_core::domain::outbox::AttemptStatus;
    use fleetsync_core::lifecycle::BookingAction;
    use fleetsync_db::{BookingRepository, DbPool, SqlBookingRepository};

    use super::{EventOutcome, Gateways, SyncEngine};
    use crate::ingest::InboundEvent;
    use crate::ports::GatewayError;
    use crate::provisioner::ProvisionOutcome;
    use crate::testing::{lead, setup_pool, FakeAccounting, FakeCrm, FakeNotifier, FakeTasks};

    struct Harness {
        engine: Arc<SyncEngine>,
        pool: DbPool,
        crm: Arc<FakeCrm>,
        accounting: Arc<FakeAccounting>,
        tasks: Arc<FakeTasks>,
        notifier: Arc<FakeNotifier>,
    }

    async fn harness(crm: FakeCrm, accounting: FakeAccounting) -> Harness {
        let pool = setup_pool().await;
        let crm = Arc::new(crm);
        let accounting = Arc::new(accounting);
        let tasks = Arc::new(FakeTasks::default());
        let notifier = Arc::new(FakeNotifier::default());
        let gateways = Gateways {
            crm: crm.clone(),
            accounting: accounting.clone(),
            tasks: tasks.clone(),
            notifier: Some(notifier.clone()),
        };
        let engine =
            Arc::new(SyncEngine::new(pool.clone(), &AppConfig::default(), gateways).expect("engine"));
        Harness { engine, pool, crm, accounting, tasks, notifier }
    }

    fn event(source: &str, lead_id: &str, stage: &str) -> InboundEvent {
        InboundEvent {
            source_event_id: Some(source.to_string()),
            lead_id: lead_id.to_string(),
            new_stage_id: stage.to_string(),
            old_stage_id: None,
            pipeline_id: None,
        }
    }

    fn sync_of(outcome: &EventOutcome) -> &super::SyncReport {
        match outcome {
            EventOutcome::Applied { sync: Some(sync), .. } => sync,
            other => panic!("expected a provisioning outcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sales_order_stage_creates_order_and_moves_lead_to_payment_pending() {
        let h = harness(
            FakeCrm::default().with_lead(lead("L-1", "sales_order_requested", Some(500))),
            FakeAccounting::default(),
        )
        .await;

        let outcome =
            h.engine.handle(&event("e-1", "L-1", "sales_order_requested")).await.expect("handle");

        let sync = sync_of(&outcome);
        assert!(matches!(sync.provision, ProvisionOutcome::Created { .. }));
        assert!(sync.notified);

        let bookings = SqlBookingRepository::new(h.pool.clone());
        let booking = bookings.find_by_external_ref("L-1").await.expect("find").expect("booking");
        assert_eq!(booking.status, BookingStatus::Preparation);
        assert_eq!(booking.sync_status, SyncStatus::Synced);
        assert_eq!(booking.advance_payment, Decimal::new(500, 0));
        assert_eq!(booking.total_amount, Decimal::new(135, 0));
        assert_eq!(booking.vehicle_plate.as_deref(), Some("AB123CD"));
        assert_eq!(booking.external_order_id.as_deref(), Some("SO-1"));

        let updates = h.crm.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0, "L-1");
        assert_eq!(updates[0].1.stage_id, "payment_pending");
        assert_eq!(h.notifier.messages.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn second_event_reruns_propagation_without_a_second_order() {
        let h = harness(
            FakeCrm::default().with_lead(lead("L-1", "sales_order_requested", Some(500))),
            FakeAccounting::default(),
        )
        .await;

        h.engine.handle(&event("e-1", "L-1", "sales_order_requested")).await.expect("first");
        let second =
            h.engine.handle(&event("e-2", "L-1", "sales_order_requested")).await.expect("second");

        match &second {
            EventOutcome::Applied { transition, sync: Some(sync), .. } => {
                assert!(!transition.changed);
                assert!(matches!(sync.provision, ProvisionOutcome::AlreadySynced { .. }));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(h.accounting.orders().len(), 1);
        let updates = h.crm.updates();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].1, updates[1].1);
    }

    #[tokio::test]
    async fn redelivered_event_is_a_duplicate() {
        let h = harness(
            FakeCrm::default().with_lead(lead("L-1", "sales_order_requested", Some(500))),
            FakeAccounting::default(),
        )
        .await;

        h.engine.handle(&event("e-1", "L-1", "sales_order_requested")).await.expect("first");
        let again = h.engine.handle(&event("e-1", "L-1", "sales_order_requested")).await.expect("again");

        assert!(matches!(again, EventOutcome::Duplicate { .. }));
        assert_eq!(h.accounting.orders().len(), 1);
        assert_eq!(h.crm.updates().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_deliveries_create_exactly_one_order() {
        let h = harness(
            FakeCrm::default().with_lead(lead("L-1", "sales_order_requested", Some(0))),
            FakeAccounting { order_delay: Some(StdDuration::from_millis(30)), ..FakeAccounting::default() },
        )
        .await;
        // Create the booking first so both deliveries race on the lock only.
        h.engine.handle(&event("e-0", "L-1", "qualified")).await.expect("seed");

        let outcomes = join_all((1..=4).map(|index| {
            let engine = h.engine.clone();
            async move { engine.handle(&event(&format!("e-{index}"), "L-1", "sales_order_requested")).await }
        }))
        .await;

        let created = outcomes
            .iter()
            .filter(|outcome| {
                matches!(
                    outcome,
                    Ok(EventOutcome::Applied { sync: Some(sync), .. })
                        if matches!(sync.provision, ProvisionOutcome::Created { .. })
                )
            })
            .count();
        assert_eq!(created, 1);
        assert_eq!(h.accounting.orders().len(), 1);
        assert!(h.crm.updates().iter().all(|(_, update)| update.stage_id == "confirmed"));
    }

    #[tokio::test]
    async fn unmapped_stage_is_ignored_without_touching_bookings() {
        let h = harness(
            FakeCrm::default().with_lead(lead("L-1", "lost", None)),
            FakeAccounting::default(),
        )
        .await;

        let outcome = h.engine.handle(&event("e-1", "L-1", "lost")).await.expect("handle");

        assert!(matches!(outcome, EventOutcome::Ignored { .. }));
        let bookings = SqlBookingRepository::new(h.pool.clone());
        assert!(bookings.find_by_external_ref("L-1").await.expect("find").is_none());
    }

    #[tokio::test]
    async fn entering_delivery_creates_one_task() {
        let h = harness(
            FakeCrm::default().with_lead(lead("L-1", "vehicle_delivery", None)),
            FakeAccounting::default(),
        )
        .await;

        h.engine.handle(&event("e-1", "L-1", "vehicle_delivery")).await.expect("first");
        h.engine.handle(&event("e-2", "L-1", "vehicle_delivery")).await.expect("second");

        let tasks = h.tasks.tasks.lock().expect("lock").clone();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].action, BookingAction::CreateDeliveryTask);
        assert_eq!(tasks[0].lead_id.as_deref(), Some("L-1"));
    }

    #[tokio::test]
    async fn failed_propagation_keeps_the_order_and_replay_completes_it() {
        let crm = FakeCrm::default().with_lead(lead("L-1", "sales_order_requested", Some(500)));
        crm.failing_updates.lock().expect("lock").push_back(GatewayError::Status {
            operation: "crm.update_lead_status".to_string(),
            status: 503,
            body: String::new(),
        });
        let h = harness(crm, FakeAccounting::default()).await;

        let outcome =
            h.engine.handle(&event("e-1", "L-1", "sales_order_requested")).await.expect("handle");
        let sync = sync_of(&outcome);
        assert!(matches!(sync.provision, ProvisionOutcome::Created { .. }));
        assert!(sync.propagation.is_none());

        let failed = h.engine.list_outbox(Some(AttemptStatus::Failed), 10).await.expect("list");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].event_type, "crm.status.update");

        let replayed = h.engine.replay(&failed[0].id).await.expect("replay");
        assert_eq!(replayed.status, AttemptStatus::Completed);
        assert_eq!(h.crm.updates().len(), 1);
        assert_eq!(h.accounting.orders().len(), 1);
    }

    #[tokio::test]
    async fn transient_order_failure_releases_lock_and_event_redelivery_retries() {
        let accounting = FakeAccounting::default();
        accounting.fail_next_order(GatewayError::Timeout {
            operation: "accounting.create_order".to_string(),
            seconds: 5,
        });
        let h = harness(
            FakeCrm::default().with_lead(lead("L-1", "sales_order_requested", Some(500))),
            accounting,
        )
        .await;

        let first = h.engine.handle(&event("e-1", "L-1", "sales_order_requested")).await;
        assert!(first.is_err());

        let bookings = SqlBookingRepository::new(h.pool.clone());
        let booking = bookings.find_by_external_ref("L-1").await.expect("find").expect("booking");
        assert_eq!(booking.status, BookingStatus::Preparation, "status survives the failure");
        assert_eq!(booking.sync_status, SyncStatus::Pending);

        let retried =
            h.engine.handle(&event("e-1", "L-1", "sales_order_requested")).await.expect("redelivery");
        assert!(matches!(sync_of(&retried).provision, ProvisionOutcome::Created { .. }));
        let orders = h.accounting.orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].1, format!("order.create:{}", booking.id));
    }

    #[tokio::test]
    async fn stale_locks_are_released_on_request() {
        let h = harness(
            FakeCrm::default().with_lead(lead("L-1", "qualified", None)),
            FakeAccounting::default(),
        )
        .await;
        h.engine.handle(&event("e-1", "L-1", "qualified")).await.expect("seed");
        let bookings = SqlBookingRepository::new(h.pool.clone());
        let booking = bookings.find_by_external_ref("L-1").await.expect("find").expect("booking");
        let taken_at = Utc::now() - chrono::Duration::hours(2);
        assert!(bookings.try_acquire_sync(&booking.id, taken_at).await.expect("acquire"));

        let released = h.engine.release_stale_locks(chrono::Duration::minutes(30)).await.expect("release");

        assert_eq!(released, vec![booking.id.clone()]);
        let booking = bookings.find_by_id(&booking.id).await.expect("find").expect("booking");
        assert_eq!(booking.sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn outbox_stats_group_entries() {
        let h = harness(
            FakeCrm::default().with_lead(lead("L-1", "sales_order_requested", Some(500))),
            FakeAccounting::default(),
        )
        .await;
        h.engine.handle(&event("e-1", "L-1", "sales_order_requested")).await.expect("handle");

        let stats = h.engine.outbox_stats().await.expect("stats");

        assert_eq!(stats.by_status.get("completed").copied(), Some(4));
        assert_eq!(stats.by_target.get("accounting").copied(), Some(2));
        assert_eq!(stats.failed_since, 0);
    }
}
