//! Post-commit chat notifications. Best effort: a failure is logged and
//! recorded on the outbox but never changes the outcome of a sync.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tera::{Context, Tera};
use tracing::warn;

use fleetsync_core::domain::booking::Booking;
use fleetsync_core::domain::order::ProvisionedOrder;
use fleetsync_core::domain::outbox::{SyncAttempt, TargetSystem, EVENT_NOTIFICATION_SEND};

use crate::errors::SyncError;
use crate::ports::Notifier;
use crate::recorder::{OutboundCall, OutboxRecorder};

const ORDER_CREATED: &str = "order_created";
const ORDER_CREATED_TEMPLATE: &str = "New order {{ order_id }} for booking {{ booking_code }}\
{% if client_name %} ({{ client_name }}){% endif %}: {{ total }} {{ currency }}\
{% if vehicle_plate %}, vehicle {{ vehicle_plate }}{% endif %}. {{ order_url }}";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub text: String,
}

pub struct Notifications {
    templates: Tera,
    notifier: Arc<dyn Notifier>,
    recorder: Arc<OutboxRecorder>,
}

impl Notifications {
    pub fn new(notifier: Arc<dyn Notifier>, recorder: Arc<OutboxRecorder>) -> Result<Self, SyncError> {
        let mut templates = Tera::default();
        templates
            .add_raw_template(ORDER_CREATED, ORDER_CREATED_TEMPLATE)
            .map_err(|error| SyncError::Template(error.to_string()))?;
        Ok(Self { templates, notifier, recorder })
    }

    pub fn render_order_created(
        &self,
        booking: &Booking,
        order: &ProvisionedOrder,
        client_name: Option<&str>,
    ) -> Result<String, SyncError> {
        let mut context = Context::new();
        context.insert("order_id", &order.order_id);
        context.insert("order_url", &order.order_url);
        context.insert("booking_code", &booking.code);
        context.insert("client_name", &client_name);
        context.insert("total", &booking.total_amount.to_string());
        context.insert("currency", &booking.currency);
        context.insert("vehicle_plate", &booking.vehicle_plate);
        self.templates
            .render(ORDER_CREATED, &context)
            .map_err(|error| SyncError::Template(error.to_string()))
    }

    pub async fn order_created(
        &self,
        booking: &Booking,
        order: &ProvisionedOrder,
        client_name: Option<&str>,
    ) -> bool {
        let result = match self.render_order_created(booking, order, client_name) {
            Ok(text) => self.send(booking, format!("order_created:{}", order.order_id), text).await,
            Err(error) => Err(error),
        };
        if let Err(error) = &result {
            warn!(
                event_name = "sync.notify.failed",
                booking_id = %booking.id,
                order_id = %order.order_id,
                error = %error,
                "order notification not delivered"
            );
        }
        result.is_ok()
    }

    /// Sends `text` under the ledger key `notification.send:<suffix>`.
    pub async fn send(&self, booking: &Booking, suffix: String, text: String) -> Result<(), SyncError> {
        let payload = NotificationPayload { text };
        let call = OutboundCall::new(
            TargetSystem::Chat,
            EVENT_NOTIFICATION_SEND,
            &booking.id,
            format!("{EVENT_NOTIFICATION_SEND}:{suffix}"),
            serde_json::to_string(&payload)?,
        );
        self.recorder.run(call, self.notifier.send(&payload.text)).await
    }

    /// Re-sends the stored message of a ledger entry under its original key.
    pub async fn resend(&self, attempt: &SyncAttempt) -> Result<(), SyncError> {
        let payload: NotificationPayload = serde_json::from_str(&attempt.payload_json)?;
        let call = OutboundCall::new(
            TargetSystem::Chat,
            EVENT_NOTIFICATION_SEND,
            &attempt.booking_id,
            attempt.idempotency_key.0.clone(),
            attempt.payload_json.clone(),
        );
        self.recorder.run(call, self.notifier.send(&payload.text)).await
    }
}
