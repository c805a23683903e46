//! Event Log: webhook decoding and deduplicated recording.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use fleetsync_core::domain::crm_event::{CrmEvent, CrmEventStatus, EventKey};
use fleetsync_db::{CrmEventRepository, RepositoryError};

/// One stage-change notification as delivered by the CRM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundEvent {
    pub source_event_id: Option<String>,
    pub lead_id: String,
    pub new_stage_id: String,
    pub old_stage_id: Option<String>,
    pub pipeline_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    pub event_key: EventKey,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WebhookBatch {
    pub events: Vec<InboundEvent>,
    /// Entries that could not be decoded; they are logged and dropped.
    pub rejected: Vec<String>,
}

/// Decodes `{ "events": [...] }` or a bare array. Each entry needs a lead id
/// and a new stage id; ids may be strings or numbers.
pub fn parse_webhook_batch(body: &Value) -> WebhookBatch {
    let entries = match body {
        Value::Array(entries) => entries.as_slice(),
        Value::Object(object) => match object.get("events") {
            Some(Value::Array(entries)) => entries.as_slice(),
            _ => std::slice::from_ref(body),
        },
        _ => {
            return WebhookBatch {
                events: Vec::new(),
                rejected: vec!["webhook body is not a JSON object or array".to_string()],
            };
        }
    };

    let mut batch = WebhookBatch::default();
    for (index, entry) in entries.iter().enumerate() {
        match parse_event(entry) {
            Ok(event) => batch.events.push(event),
            Err(reason) => batch.rejected.push(format!("event #{index}: {reason}")),
        }
    }
    batch
}

fn parse_event(entry: &Value) -> Result<InboundEvent, &'static str> {
    let lead_id = id_field(entry, &["lead_id", "id"]).ok_or("missing lead id")?;
    let new_stage_id =
        id_field(entry, &["new_stage_id", "status_id", "stage_id"]).ok_or("missing stage id")?;

    Ok(InboundEvent {
        source_event_id: id_field(entry, &["event_id", "uuid"]),
        lead_id,
        new_stage_id,
        old_stage_id: id_field(entry, &["old_stage_id", "old_status_id"]),
        pipeline_id: id_field(entry, &["pipeline_id"]),
    })
}

fn id_field(entry: &Value, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| match entry.get(*name)? {
        Value::String(raw) => Some(raw.trim().to_string()).filter(|value| !value.is_empty()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    })
}

pub struct EventLog {
    repo: Arc<dyn CrmEventRepository>,
    bucket_secs: i64,
}

impl EventLog {
    pub fn new(repo: Arc<dyn CrmEventRepository>, bucket_secs: i64) -> Self {
        Self { repo, bucket_secs }
    }

    pub fn repository(&self) -> &Arc<dyn CrmEventRepository> {
        &self.repo
    }

    /// One durable write. An error here means nothing was recorded and the
    /// delivery must be retried by the sender.
    pub async fn ingest(
        &self,
        event: &InboundEvent,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome, RepositoryError> {
        let key = EventKey::derive(
            event.source_event_id.as_deref(),
            &event.lead_id,
            &event.new_stage_id,
            event.old_stage_id.as_deref(),
            now,
            self.bucket_secs,
        );

        let record = CrmEvent {
            key: key.clone(),
            lead_id: event.lead_id.clone(),
            old_stage_id: event.old_stage_id.clone(),
            new_stage_id: event.new_stage_id.clone(),
            pipeline_id: event.pipeline_id.clone(),
            status: CrmEventStatus::Pending,
            last_error: None,
            received_at: now,
            updated_at: now,
        };

        if self.repo.record(&record).await? {
            info!(
                event_name = "crm.event.accepted",
                event_key = %key,
                lead_id = %event.lead_id,
                new_stage_id = %event.new_stage_id,
                "crm event recorded"
            );
            Ok(IngestOutcome { event_key: key, accepted: true, reason: None })
        } else {
            warn!(
                event_name = "crm.event.duplicate",
                event_key = %key,
                lead_id = %event.lead_id,
                "crm event already processed"
            );
            Ok(IngestOutcome { event_key: key, accepted: false, reason: Some("duplicate") })
        }
    }
}
