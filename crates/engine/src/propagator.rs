//! Status Propagator: pushes the order reference and the follow-up stage back to the CRM.

use std::collections::BTreeMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};

use fleetsync_core::domain::booking::Booking;
use fleetsync_core::domain::outbox::{TargetSystem, EVENT_CRM_STATUS_UPDATE};
use fleetsync_core::fields::LeadFieldMap;

use crate::errors::SyncError;
use crate::ports::{CrmGateway, LeadStatusUpdate};
use crate::recorder::{OutboundCall, OutboxRecorder};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PropagationOutcome {
    Updated { lead_id: String, stage_id: String },
    /// The booking is not linked to a lead.
    Skipped,
}

pub struct StatusPropagator {
    crm: Arc<dyn CrmGateway>,
    recorder: Arc<OutboxRecorder>,
    fields: LeadFieldMap,
    payment_pending_stage_id: String,
    confirmed_stage_id: String,
}

impl StatusPropagator {
    pub fn new(
        crm: Arc<dyn CrmGateway>,
        recorder: Arc<OutboxRecorder>,
        fields: LeadFieldMap,
        payment_pending_stage_id: impl Into<String>,
        confirmed_stage_id: impl Into<String>,
    ) -> Self {
        Self {
            crm,
            recorder,
            fields,
            payment_pending_stage_id: payment_pending_stage_id.into(),
            confirmed_stage_id: confirmed_stage_id.into(),
        }
    }

    pub fn target_stage(&self, booking: &Booking) -> &str {
        if booking.advance_payment > Decimal::ZERO {
            &self.payment_pending_stage_id
        } else {
            &self.confirmed_stage_id
        }
    }

    pub fn status_update(&self, booking: &Booking, order_url: &str) -> LeadStatusUpdate {
        let mut custom_fields = BTreeMap::new();
        if !order_url.is_empty() {
            custom_fields.insert(self.fields.order_url.clone(), order_url.to_string());
        }
        custom_fields.insert(self.fields.booking_code.clone(), booking.code.clone());
        LeadStatusUpdate { stage_id: self.target_stage(booking).to_string(), custom_fields }
    }

    /// Sends the same update for the same booking state, so repeating it is harmless.
    pub async fn propagate(
        &self,
        booking: &Booking,
        order_url: &str,
    ) -> Result<PropagationOutcome, SyncError> {
        let Some(lead_id) = booking.external_ref.as_deref() else {
            warn!(
                event_name = "sync.propagate.skipped",
                booking_id = %booking.id,
                "booking has no crm lead to update"
            );
            return Ok(PropagationOutcome::Skipped);
        };

        let update = self.status_update(booking, order_url);
        let call = OutboundCall::new(
            TargetSystem::Crm,
            EVENT_CRM_STATUS_UPDATE,
            &booking.id,
            format!("{EVENT_CRM_STATUS_UPDATE}:{}:{}", booking.id, update.stage_id),
            serde_json::to_string(&update)?,
        );
        self.recorder.run(call, self.crm.update_lead_status(lead_id, &update)).await?;

        info!(
            event_name = "sync.propagate.completed",
            booking_id = %booking.id,
            lead_id = %lead_id,
            stage_id = %update.stage_id,
            "crm lead updated"
        );
        Ok(PropagationOutcome::Updated { lead_id: lead_id.to_string(), stage_id: update.stage_id })
    }
}
