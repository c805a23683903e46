use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::client::ClientId;
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BookingId(pub String);

impl std::fmt::Display for BookingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Business lifecycle of a rental booking, driven by the CRM pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    New,
    Preparation,
    Delivery,
    InRent,
    Settlement,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Preparation => "preparation",
            Self::Delivery => "delivery",
            Self::InRent => "in_rent",
            Self::Settlement => "settlement",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "new" => Some(Self::New),
            "preparation" => Some(Self::Preparation),
            "delivery" => Some(Self::Delivery),
            "in_rent" | "in-rent" => Some(Self::InRent),
            "settlement" => Some(Self::Settlement),
            _ => None,
        }
    }

    /// Position in the forward lifecycle, used to detect backward CRM moves.
    pub fn rank(&self) -> u8 {
        match self {
            Self::New => 0,
            Self::Preparation => 1,
            Self::Delivery => 2,
            Self::InRent => 3,
            Self::Settlement => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Settlement)
    }
}

/// Lock / idempotency flag guarding order provisioning. Distinct from [`BookingStatus`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    InProgress,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }

    /// Storage decoding. A NULL column is the legacy spelling of `pending`.
    pub fn parse(value: Option<&str>) -> Option<Self> {
        let Some(value) = value else {
            return Some(Self::Pending);
        };
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "synced" => Some(Self::Synced),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// States from which a provisioning attempt may take the lock.
    pub fn is_acquirable(&self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }

    pub fn can_transition_to(&self, next: SyncStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending | Self::Failed, Self::InProgress)
                | (Self::InProgress, Self::Synced)
                | (Self::InProgress, Self::Failed)
                | (Self::InProgress, Self::Pending)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingService {
    pub name: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    /// CRM lead id; `None` until the booking is linked to a lead.
    pub external_ref: Option<String>,
    pub code: String,
    pub client_id: Option<ClientId>,
    pub vehicle_plate: Option<String>,
    pub status: BookingStatus,
    pub sync_status: SyncStatus,
    pub sync_started_at: Option<DateTime<Utc>>,
    pub currency: String,
    pub daily_rate: Decimal,
    pub total_amount: Decimal,
    pub advance_payment: Decimal,
    pub delivery_fee: Option<Decimal>,
    pub deposit_amount: Option<Decimal>,
    pub deposit_label: Option<String>,
    pub cdw_fee: Option<Decimal>,
    pub external_order_id: Option<String>,
    pub external_order_url: Option<String>,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub pickup_location: Option<String>,
    pub dropoff_location: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn new(id: BookingId, code: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            external_ref: None,
            code: code.into(),
            client_id: None,
            vehicle_plate: None,
            status: BookingStatus::New,
            sync_status: SyncStatus::Pending,
            sync_started_at: None,
            currency: "EUR".to_string(),
            daily_rate: Decimal::ZERO,
            total_amount: Decimal::ZERO,
            advance_payment: Decimal::ZERO,
            delivery_fee: None,
            deposit_amount: None,
            deposit_label: None,
            cdw_fee: None,
            external_order_id: None,
            external_order_url: None,
            start_at: None,
            end_at: None,
            pickup_location: None,
            dropoff_location: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_synced(&self) -> bool {
        self.sync_status == SyncStatus::Synced
    }

    /// Records the created order. Refuses to overwrite an order reference that
    /// is already set to a different value.
    pub fn attach_order(
        &mut self,
        order_id: impl Into<String>,
        order_url: impl Into<String>,
    ) -> Result<(), DomainError> {
        let order_id = order_id.into();
        if let Some(existing) = &self.external_order_id {
            if existing != &order_id {
                return Err(DomainError::InvariantViolation(format!(
                    "booking {} already references order {existing}",
                    self.id
                )));
            }
        }
        self.external_order_id = Some(order_id);
        self.external_order_url = Some(order_url.into());
        Ok(())
    }
}
