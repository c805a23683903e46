//! Order Provisioner.
//!
//! Creates the accounting order for a booking at most once. The lock is taken
//! first; every exit after that either records the order (`synced`) or
//! releases the lock. Transient failures go back to `pending` so the next
//! event retries immediately, permanent ones to `failed` for operator review.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info, warn};

use fleetsync_core::domain::booking::{Booking, BookingId, SyncStatus};
use fleetsync_core::domain::client::Client;
use fleetsync_core::domain::order::{CustomerProfile, OrderPayload, ProvisionedOrder};
use fleetsync_core::domain::outbox::{
    ErrorClass, TargetSystem, EVENT_CUSTOMER_CREATE, EVENT_ORDER_CREATE, EVENT_ORDER_UPDATE,
};
use fleetsync_core::line_items::{build_order_payload, FeeRules};
use fleetsync_db::{BookingRepository, ClientRepository};

use crate::errors::SyncError;
use crate::lock::SyncLock;
use crate::ports::{AccountingCustomer, AccountingGateway, GatewayError};
use crate::recorder::{OutboundCall, OutboxRecorder};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProvisionOutcome {
    Created { order: ProvisionedOrder },
    AlreadySynced { order: ProvisionedOrder },
    /// Another caller holds the lock.
    InProgressElsewhere,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RefreshedOrder {
    pub order_id: String,
    pub line_count: usize,
    pub total: Decimal,
}

pub fn order_create_key(booking_id: &BookingId) -> String {
    format!("{EVENT_ORDER_CREATE}:{booking_id}")
}

pub struct OrderProvisioner {
    bookings: Arc<dyn BookingRepository>,
    clients: Arc<dyn ClientRepository>,
    accounting: Arc<dyn AccountingGateway>,
    lock: Arc<dyn SyncLock>,
    recorder: Arc<OutboxRecorder>,
    fee_rules: FeeRules,
}

impl OrderProvisioner {
    pub fn new(
        bookings: Arc<dyn BookingRepository>,
        clients: Arc<dyn ClientRepository>,
        accounting: Arc<dyn AccountingGateway>,
        lock: Arc<dyn SyncLock>,
        recorder: Arc<OutboxRecorder>,
        fee_rules: FeeRules,
    ) -> Self {
        Self { bookings, clients, accounting, lock, recorder, fee_rules }
    }

    /// Runs on a detached task, so a caller dropped after the lock is taken
    /// (client disconnect, timeout) cannot leave the booking `in_progress`.
    pub async fn provision(
        self: &Arc<Self>,
        booking_id: &BookingId,
    ) -> Result<ProvisionOutcome, SyncError> {
        let provisioner = Arc::clone(self);
        let booking_id = booking_id.clone();
        tokio::spawn(async move { provisioner.provision_locked(&booking_id).await })
            .await
            .map_err(|join_error| SyncError::Aborted(join_error.to_string()))?
    }

    async fn provision_locked(&self, booking_id: &BookingId) -> Result<ProvisionOutcome, SyncError> {
        let attempt = self.lock.try_acquire(booking_id, Utc::now()).await?;
        if !attempt.acquired {
            return Ok(contended(attempt.booking));
        }

        let booking = attempt.booking;
        let order = match self.create_order(&booking).await {
            Ok(order) => order,
            Err(cause) => {
                self.release_after_failure(&booking.id, &cause).await;
                return Err(cause);
            }
        };

        match self.lock.complete(&booking.id, &order, Utc::now()).await {
            Ok(false) => {
                error!(
                    event_name = "sync.provision.order_conflict",
                    booking_id = %booking.id,
                    order_id = %order.order_id,
                    "order created while another order is already recorded on the booking"
                );
                Err(SyncError::OrderConflict { booking_id: booking.id, order_id: order.order_id })
            }
            Ok(true) => {
                info!(
                    event_name = "sync.provision.completed",
                    booking_id = %booking.id,
                    order_id = %order.order_id,
                    "accounting order created"
                );
                Ok(ProvisionOutcome::Created { order })
            }
            Err(cause) => {
                // The order exists; a replay reuses its idempotency key.
                error!(
                    event_name = "sync.provision.record_failed",
                    booking_id = %booking.id,
                    order_id = %order.order_id,
                    error = %cause,
                    "order created but could not be recorded on the booking"
                );
                if let Err(release_error) =
                    self.lock.release(&booking.id, SyncStatus::Failed, Utc::now()).await
                {
                    error!(
                        event_name = "sync.lock.release_failed",
                        booking_id = %booking.id,
                        error = %release_error
                    );
                }
                Err(cause)
            }
        }
    }

    /// Rebuilds the lines of an existing order and replaces them. Neither the
    /// customer nor any side effect is touched.
    pub async fn refresh_order(&self, booking_id: &BookingId) -> Result<RefreshedOrder, SyncError> {
        let booking = self
            .bookings
            .find_by_id(booking_id)
            .await?
            .ok_or_else(|| SyncError::BookingNotFound(booking_id.clone()))?;
        let order_id = match (&booking.external_order_id, booking.is_synced()) {
            (Some(order_id), true) => order_id.clone(),
            _ => return Err(SyncError::NotSynced(booking.id.clone())),
        };

        let client = self.client_for(&booking).await?;
        let customer_id = client.accounting_customer_id.clone().ok_or_else(|| {
            SyncError::Incomplete {
                booking_id: booking.id.clone(),
                reason: format!("client `{}` has no accounting customer", client.id),
            }
        })?;

        let payload = self.payload_for(&booking, &customer_id).await?;
        let call = OutboundCall::new(
            TargetSystem::Accounting,
            EVENT_ORDER_UPDATE,
            &booking.id,
            format!("{EVENT_ORDER_UPDATE}:{}", booking.id),
            serde_json::to_string(&payload)?,
        );
        self.recorder.run(call, self.accounting.update_order(&order_id, &payload)).await?;

        info!(
            event_name = "sync.order.refreshed",
            booking_id = %booking.id,
            order_id = %order_id,
            line_count = payload.lines.len(),
            "accounting order lines replaced"
        );
        Ok(RefreshedOrder { order_id, line_count: payload.lines.len(), total: payload.total() })
    }

    async fn create_order(&self, booking: &Booking) -> Result<ProvisionedOrder, SyncError> {
        let client = self.client_for(booking).await?;
        let customer_id = self.resolve_customer(booking, &client).await?;
        let payload = self.payload_for(booking, &customer_id).await?;

        let key = order_create_key(&booking.id);
        let call = OutboundCall::new(
            TargetSystem::Accounting,
            EVENT_ORDER_CREATE,
            &booking.id,
            key.clone(),
            serde_json::to_string(&payload)?,
        );
        self.recorder.run(call, self.accounting.create_order(&payload, &key)).await
    }

    async fn payload_for(
        &self,
        booking: &Booking,
        customer_id: &str,
    ) -> Result<OrderPayload, SyncError> {
        let services = self.bookings.list_services(&booking.id).await?;
        let payload = build_order_payload(booking, customer_id, &services, &self.fee_rules);
        if payload.lines.is_empty() {
            return Err(SyncError::Incomplete {
                booking_id: booking.id.clone(),
                reason: "no billable amount".to_string(),
            });
        }
        Ok(payload)
    }

    async fn client_for(&self, booking: &Booking) -> Result<Client, SyncError> {
        let incomplete = |reason: String| SyncError::Incomplete { booking_id: booking.id.clone(), reason };
        let client_id =
            booking.client_id.clone().ok_or_else(|| incomplete("no client linked".to_string()))?;
        self.clients
            .find_by_id(&client_id)
            .await?
            .ok_or_else(|| incomplete(format!("client `{client_id}` does not exist")))
    }

    /// Lookup before create: a retry after "customer created, order failed"
    /// finds the stored link, or at worst the customer by email.
    async fn resolve_customer(&self, booking: &Booking, client: &Client) -> Result<String, SyncError> {
        if let Some(customer_id) = &client.accounting_customer_id {
            return Ok(customer_id.clone());
        }

        let profile = CustomerProfile {
            name: client.name.clone(),
            email: client.normalized_email(),
            phone: client.phone.clone(),
            tax_id: client.document_number.clone(),
            tax_id_type: client.document_type.clone(),
            address: client.address.clone(),
        };
        let call = OutboundCall::new(
            TargetSystem::Accounting,
            EVENT_CUSTOMER_CREATE,
            &booking.id,
            format!("{EVENT_CUSTOMER_CREATE}:{}", client.id),
            serde_json::to_string(&profile)?,
        );

        let customer = self
            .recorder
            .run(call, async {
                if let Some(email) = profile.email.as_deref() {
                    if let Some(found) = self.accounting.find_customer_by_email(email).await? {
                        return Ok::<AccountingCustomer, GatewayError>(found);
                    }
                }
                self.accounting.create_customer(&profile).await
            })
            .await?;

        self.clients.set_accounting_customer_id(&client.id, &customer.id, Utc::now()).await?;
        info!(
            event_name = "sync.customer.linked",
            booking_id = %booking.id,
            client_id = %client.id,
            customer_id = %customer.id,
            "accounting customer linked to client"
        );
        Ok(customer.id)
    }

    async fn release_after_failure(&self, booking_id: &BookingId, cause: &SyncError) {
        let to = match cause.class() {
            ErrorClass::Transient => SyncStatus::Pending,
            ErrorClass::Permanent => SyncStatus::Failed,
        };
        warn!(
            event_name = "sync.provision.failed",
            booking_id = %booking_id,
            error_class = cause.class().as_str(),
            release_to = to.as_str(),
            error = %cause,
            "order provisioning failed"
        );
        if let Err(release_error) = self.lock.release(booking_id, to, Utc::now()).await {
            error!(
                event_name = "sync.lock.release_failed",
                booking_id = %booking_id,
                error = %release_error,
                "lock could not be released; the stale-lock sweep will reset it"
            );
        }
    }
}

fn contended(booking: Booking) -> ProvisionOutcome {
    match (booking.sync_status, booking.external_order_id) {
        (SyncStatus::Synced, Some(order_id)) => ProvisionOutcome::AlreadySynced {
            order: ProvisionedOrder {
                order_id,
                order_url: booking.external_order_url.unwrap_or_default(),
            },
        },
        _ => ProvisionOutcome::InProgressElsewhere,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use futures::future::join_all;
    use rust_decimal::Decimal;

    use fleetsync_core::domain::booking::{Booking, BookingId, SyncStatus};
    use fleetsync_core::domain::client::{Client, ClientId};
    use fleetsync_core::line_items::FeeRules;
    use fleetsync_core::outbox_engine::OutboxEngine;
    use fleetsync_db::{
        BookingRepository, ClientRepository, DbPool, SqlBookingRepository, SqlClientRepository,
        SqlOutboxRepository,
    };

    use super::{OrderProvisioner, ProvisionOutcome};
    use crate::errors::SyncError;
    use crate::lock::RowSyncLock;
    use crate::ports::GatewayError;
    use crate::recorder::OutboxRecorder;
    use crate::testing::{setup_pool, ts, FakeAccounting};

    struct Fixture {
        provisioner: Arc<OrderProvisioner>,
        bookings: Arc<SqlBookingRepository>,
        clients: Arc<SqlClientRepository>,
        accounting: Arc<FakeAccounting>,
    }

    fn fixture(pool: DbPool, accounting: FakeAccounting) -> Fixture {
        let bookings = Arc::new(SqlBookingRepository::new(pool.clone()));
        let clients = Arc::new(SqlClientRepository::new(pool.clone()));
        let accounting = Arc::new(accounting);
        let recorder = Arc::new(OutboxRecorder::new(
            Arc::new(SqlOutboxRepository::new(pool)),
            OutboxEngine::default(),
            Duration::from_secs(5),
        ));
        let provisioner = Arc::new(OrderProvisioner::new(
            bookings.clone(),
            clients.clone(),
            accounting.clone(),
            Arc::new(RowSyncLock::new(bookings.clone())),
            recorder,
            FeeRules::default(),
        ));
        Fixture { provisioner, bookings, clients, accounting }
    }

    async fn seed(fixture: &Fixture) -> BookingId {
        let now = Utc::now();
        let client = Client {
            id: ClientId("C-1".to_string()),
            external_ref: Some("CT-1".to_string()),
            name: "Ana Petrovic".to_string(),
            email: Some("Ana@Example.com".to_string()),
            phone: None,
            document_type: Some("passport".to_string()),
            document_number: Some("P1234567".to_string()),
            address: None,
            accounting_customer_id: None,
            created_at: now,
            updated_at: now,
        };
        fixture.clients.save(&client).await.expect("save client");

        let mut booking = Booking::new(BookingId("B-1".to_string()), "CRM-L-1", now);
        booking.external_ref = Some("L-1".to_string());
        booking.client_id = Some(client.id);
        booking.daily_rate = Decimal::new(4500, 2);
        booking.start_at = Some(ts("2026-06-01T10:00:00Z"));
        booking.end_at = Some(ts("2026-06-04T10:00:00Z"));
        fixture.bookings.save(&booking).await.expect("save booking");
        booking.id
    }

    async fn sync_status(fixture: &Fixture, id: &BookingId) -> SyncStatus {
        fixture.bookings.find_by_id(id).await.expect("find").expect("exists").sync_status
    }

    #[tokio::test]
    async fn second_provision_of_synced_booking_creates_no_order() {
        let fixture = fixture(setup_pool().await, FakeAccounting::default());
        let id = seed(&fixture).await;

        let first = fixture.provisioner.provision(&id).await.expect("first");
        let second = fixture.provisioner.provision(&id).await.expect("second");

        let ProvisionOutcome::Created { order } = first else { panic!("expected a new order") };
        assert_eq!(second, ProvisionOutcome::AlreadySynced { order: order.clone() });
        assert_eq!(fixture.accounting.orders().len(), 1);
        assert_eq!(fixture.accounting.orders()[0].1, "order.create:B-1");
        assert_eq!(sync_status(&fixture, &id).await, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn concurrent_provisioning_creates_exactly_one_order() {
        let accounting =
            FakeAccounting { order_delay: Some(Duration::from_millis(30)), ..FakeAccounting::default() };
        let fixture = fixture(setup_pool().await, accounting);
        let id = seed(&fixture).await;

        let outcomes = join_all((0..5).map(|_| {
            let provisioner = fixture.provisioner.clone();
            let id = id.clone();
            async move { provisioner.provision(&id).await.expect("provision") }
        }))
        .await;

        let created = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, ProvisionOutcome::Created { .. }))
            .count();
        assert_eq!(created, 1);
        assert_eq!(fixture.accounting.orders().len(), 1);
    }

    async fn wait_for_status(fixture: &Fixture, id: &BookingId, expected: SyncStatus) -> SyncStatus {
        let mut status = sync_status(fixture, id).await;
        for _ in 0..100 {
            if status == expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            status = sync_status(fixture, id).await;
        }
        status
    }

    #[tokio::test]
    async fn dropped_caller_does_not_leave_the_lock_held() {
        let accounting =
            FakeAccounting { order_delay: Some(Duration::from_millis(200)), ..FakeAccounting::default() };
        let fixture = fixture(setup_pool().await, accounting);
        let id = seed(&fixture).await;

        let abandoned =
            tokio::time::timeout(Duration::from_millis(20), fixture.provisioner.provision(&id)).await;
        assert!(abandoned.is_err(), "the caller gives up before the order call returns");

        assert_eq!(wait_for_status(&fixture, &id, SyncStatus::Synced).await, SyncStatus::Synced);
        let again = fixture.provisioner.provision(&id).await.expect("again");
        assert!(matches!(again, ProvisionOutcome::AlreadySynced { .. }));
        assert_eq!(fixture.accounting.orders().len(), 1);
    }

    #[tokio::test]
    async fn order_created_after_stale_release_is_still_recorded() {
        let accounting =
            FakeAccounting { order_delay: Some(Duration::from_millis(100)), ..FakeAccounting::default() };
        let fixture = fixture(setup_pool().await, accounting);
        let id = seed(&fixture).await;

        let running = tokio::spawn({
            let provisioner = fixture.provisioner.clone();
            let id = id.clone();
            async move { provisioner.provision(&id).await }
        });
        assert_eq!(
            wait_for_status(&fixture, &id, SyncStatus::InProgress).await,
            SyncStatus::InProgress
        );
        let now = Utc::now();
        let released = fixture
            .bookings
            .release_stale_locks(now + chrono::Duration::seconds(1), now)
            .await
            .expect("release");
        assert_eq!(released, vec![id.clone()]);

        let outcome = running.await.expect("join").expect("provision");
        assert!(matches!(outcome, ProvisionOutcome::Created { .. }));
        let booking = fixture.bookings.find_by_id(&id).await.expect("find").expect("exists");
        assert_eq!(booking.sync_status, SyncStatus::Synced);
        assert_eq!(booking.external_order_id.as_deref(), Some("SO-1"));

        let again = fixture.provisioner.provision(&id).await.expect("again");
        assert!(matches!(again, ProvisionOutcome::AlreadySynced { .. }));
        assert_eq!(fixture.accounting.orders().len(), 1);
    }

    #[tokio::test]
    async fn transient_failure_releases_lock_and_retry_reuses_customer() {
        let fixture = fixture(setup_pool().await, FakeAccounting::default());
        let id = seed(&fixture).await;
        fixture.accounting.fail_next_order(GatewayError::Timeout {
            operation: "order.create".to_string(),
            seconds: 10,
        });

        let failed = fixture.provisioner.provision(&id).await;
        assert!(matches!(failed, Err(SyncError::Gateway(GatewayError::Timeout { .. }))));
        assert_eq!(sync_status(&fixture, &id).await, SyncStatus::Pending);

        let client = fixture
            .clients
            .find_by_id(&ClientId("C-1".to_string()))
            .await
            .expect("find client")
            .expect("client exists");
        assert_eq!(client.accounting_customer_id.as_deref(), Some("CUST-1"));

        let retried = fixture.provisioner.provision(&id).await.expect("retry");
        assert!(matches!(retried, ProvisionOutcome::Created { .. }));
        assert_eq!(fixture.accounting.customers_created.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.accounting.customer_lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn permanent_failure_marks_failed_but_stays_replayable() {
        let fixture = fixture(setup_pool().await, FakeAccounting::default());
        let id = seed(&fixture).await;
        fixture.accounting.fail_next_order(GatewayError::Status {
            operation: "order.create".to_string(),
            status: 422,
            body: "tax id rejected".to_string(),
        });

        assert!(fixture.provisioner.provision(&id).await.is_err());
        assert_eq!(sync_status(&fixture, &id).await, SyncStatus::Failed);

        let replayed = fixture.provisioner.provision(&id).await.expect("replay");
        assert!(matches!(replayed, ProvisionOutcome::Created { .. }));
    }

    #[tokio::test]
    async fn existing_accounting_customer_is_found_by_email() {
        let accounting = FakeAccounting::default();
        accounting
            .customers_by_email
            .lock()
            .expect("lock")
            .insert("ana@example.com".to_string(), "CUST-77".to_string());
        let fixture = fixture(setup_pool().await, accounting);
        let id = seed(&fixture).await;

        fixture.provisioner.provision(&id).await.expect("provision");

        assert_eq!(fixture.accounting.customers_created.load(Ordering::SeqCst), 0);
        assert_eq!(fixture.accounting.orders()[0].0.customer_id, "CUST-77");
    }

    #[tokio::test]
    async fn booking_without_client_is_released_as_failed() {
        let fixture = fixture(setup_pool().await, FakeAccounting::default());
        let booking = Booking::new(BookingId("B-9".to_string()), "CRM-L-9", Utc::now());
        fixture.bookings.save(&booking).await.expect("save");

        let result = fixture.provisioner.provision(&booking.id).await;

        assert!(matches!(result, Err(SyncError::Incomplete { .. })));
        assert_eq!(sync_status(&fixture, &booking.id).await, SyncStatus::Failed);
    }

    #[tokio::test]
    async fn refresh_replaces_lines_without_creating_anything() {
        let fixture = fixture(setup_pool().await, FakeAccounting::default());
        let id = seed(&fixture).await;
        assert!(matches!(
            fixture.provisioner.refresh_order(&id).await,
            Err(SyncError::NotSynced(_))
        ));
        fixture.provisioner.provision(&id).await.expect("provision");

        let mut booking = fixture.bookings.find_by_id(&id).await.expect("find").expect("exists");
        booking.cdw_fee = Some(Decimal::new(1500, 2));
        fixture.bookings.save(&booking).await.expect("save");

        let refreshed = fixture.provisioner.refresh_order(&id).await.expect("refresh");

        assert_eq!(refreshed.order_id, "SO-1");
        assert_eq!(refreshed.line_count, 2);
        assert_eq!(refreshed.total, Decimal::new(15000, 2));
        assert_eq!(fixture.accounting.orders().len(), 1);
        assert_eq!(fixture.accounting.customers_created.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.accounting.updates.lock().expect("lock").len(), 1);
    }
}
