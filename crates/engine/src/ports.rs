//! Capabilities the engine consumes from external systems.
//!
//! Implementations live in [`crate::http`]; tests substitute in-process fakes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

use fleetsync_core::domain::import::DateRange;
use fleetsync_core::domain::order::{CustomerProfile, OrderPayload, ProvisionedOrder};
use fleetsync_core::domain::outbox::ErrorClass;
use fleetsync_core::lifecycle::BookingAction;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },
    #[error("{operation} could not reach the remote system: {message}")]
    Transport { operation: String, message: String },
    #[error("{operation} returned HTTP {status}: {body}")]
    Status { operation: String, status: u16, body: String },
    #[error("{operation} returned an unreadable response: {message}")]
    Decode { operation: String, message: String },
    #[error("{operation} was rejected: {message}")]
    Rejected { operation: String, message: String },
}

impl GatewayError {
    /// Timeouts, connection failures, rate limits and 5xx are retried; every
    /// other response means the request itself is wrong.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout { .. } | Self::Transport { .. } => ErrorClass::Transient,
            Self::Status { status, .. } if is_transient_status(*status) => ErrorClass::Transient,
            Self::Status { .. } | Self::Decode { .. } | Self::Rejected { .. } => {
                ErrorClass::Permanent
            }
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 425 | 429) || (500..=599).contains(&status)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrmLead {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "optional_string_or_number")]
    pub pipeline_id: Option<String>,
    #[serde(deserialize_with = "string_or_number")]
    pub stage_id: String,
    #[serde(default, deserialize_with = "optional_string_or_number")]
    pub contact_id: Option<String>,
    /// Total deal value as entered in the CRM.
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub custom_fields: Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmContact {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub document_type: Option<String>,
    #[serde(default)]
    pub document_number: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LeadPage {
    #[serde(default)]
    pub leads: Vec<CrmLead>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadStatusUpdate {
    pub stage_id: String,
    /// Custom field id to text value.
    pub custom_fields: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountingCustomer {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub action: BookingAction,
    pub lead_id: Option<String>,
    pub booking_code: String,
    pub text: String,
    pub due_at: DateTime<Utc>,
}

#[async_trait]
pub trait CrmGateway: Send + Sync {
    async fn get_lead(&self, lead_id: &str) -> Result<CrmLead, GatewayError>;

    async fn update_lead_status(
        &self,
        lead_id: &str,
        update: &LeadStatusUpdate,
    ) -> Result<(), GatewayError>;

    async fn get_contact(&self, contact_id: &str) -> Result<CrmContact, GatewayError>;

    /// One page (1-based) of leads created inside `range`.
    async fn list_leads(
        &self,
        range: &DateRange,
        page: u32,
        page_size: u32,
    ) -> Result<LeadPage, GatewayError>;
}

#[async_trait]
pub trait AccountingGateway: Send + Sync {
    async fn find_customer_by_email(
        &self,
        email: &str,
    ) -> Result<Option<AccountingCustomer>, GatewayError>;

    async fn create_customer(
        &self,
        profile: &CustomerProfile,
    ) -> Result<AccountingCustomer, GatewayError>;

    /// `idempotency_key` is forwarded so the far side can drop a replayed create.
    async fn create_order(
        &self,
        payload: &OrderPayload,
        idempotency_key: &str,
    ) -> Result<ProvisionedOrder, GatewayError>;

    async fn update_order(&self, order_id: &str, payload: &OrderPayload) -> Result<(), GatewayError>;
}

#[async_trait]
pub trait TaskGateway: Send + Sync {
    async fn create_task(&self, task: &TaskRequest) -> Result<(), GatewayError>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str) -> Result<(), GatewayError>;
}

pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(value) => Ok(value),
        Value::Number(value) => Ok(value.to_string()),
        other => Err(serde::de::Error::custom(format!("expected string or number, got {other}"))),
    }
}

pub(crate) fn optional_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(value) if value.trim().is_empty() => Ok(None),
        Value::String(value) => Ok(Some(value)),
        Value::Number(value) => Ok(Some(value.to_string())),
        other => Err(serde::de::Error::custom(format!("expected string or number, got {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use fleetsync_core::domain::outbox::ErrorClass;
    use serde_json::json;

    use super::{CrmLead, GatewayError};

    fn status(code: u16) -> GatewayError {
        GatewayError::Status { operation: "order.create".to_string(), status: code, body: String::new() }
    }

    #[test]
    fn rate_limits_and_server_errors_are_transient() {
        assert_eq!(status(429).class(), ErrorClass::Transient);
        assert_eq!(status(503).class(), ErrorClass::Transient);
        assert_eq!(status(422).class(), ErrorClass::Permanent);
        assert_eq!(status(404).class(), ErrorClass::Permanent);
        assert!(GatewayError::Timeout { operation: "crm.get_lead".to_string(), seconds: 10 }
            .is_transient());
    }

    #[test]
    fn lead_ids_may_arrive_as_numbers() {
        let lead: CrmLead = serde_json::from_value(json!({
            "id": 4410,
            "stage_id": 142,
            "contact_id": null,
            "custom_fields": []
        }))
        .expect("lead decodes");

        assert_eq!(lead.id, "4410");
        assert_eq!(lead.stage_id, "142");
        assert_eq!(lead.contact_id, None);
        assert_eq!(lead.price, None);
    }
}
