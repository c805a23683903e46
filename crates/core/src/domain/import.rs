//! Bulk re-import runs and the rows they stage.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::booking::BookingStatus;
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImportRunId(pub String);

impl std::fmt::Display for ImportRunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportRunStatus {
    Running,
    Succeeded,
    Failed,
    NeedsReview,
}

impl ImportRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::NeedsReview => "needs_review",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "needs_review" => Some(Self::NeedsReview),
            _ => None,
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportCounts {
    pub leads: u32,
    pub contacts: u32,
    pub vehicles: u32,
    pub rejected: u32,
}

/// Half-open interval `[from, to)` of lead creation times.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl DateRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self, DomainError> {
        if to <= from {
            return Err(DomainError::InvariantViolation(format!(
                "import range end {to} must be after start {from}"
            )));
        }
        Ok(Self { from, to })
    }

    pub fn for_year(year: i32) -> Result<Self, DomainError> {
        let start = NaiveDate::from_ymd_opt(year, 1, 1)
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .ok_or_else(|| DomainError::InvariantViolation(format!("invalid year {year}")))?;
        let end = NaiveDate::from_ymd_opt(year + 1, 1, 1)
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .ok_or_else(|| DomainError::InvariantViolation(format!("invalid year {year}")))?;
        Self::new(Utc.from_utc_datetime(&start), Utc.from_utc_datetime(&end))
    }

    pub fn days(&self) -> i64 {
        (self.to - self.from).num_days()
    }

    pub fn label(&self) -> String {
        if self.from.month() == 1
            && self.from.day() == 1
            && self.to.year() == self.from.year() + 1
            && self.to.ordinal() == 1
        {
            return self.from.year().to_string();
        }
        format!("{}..{}", self.from.date_naive(), self.to.date_naive())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRun {
    pub id: ImportRunId,
    pub status: ImportRunStatus,
    pub range: DateRange,
    pub counts: ImportCounts,
    pub pages_fetched: u32,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Lead row written once per run; consumed by the merge step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedLead {
    pub run_id: ImportRunId,
    pub external_lead_id: String,
    pub stage_id: String,
    pub status: Option<BookingStatus>,
    pub contact_id: Option<String>,
    pub vehicle_plate: Option<String>,
    pub currency: String,
    pub daily_rate: Decimal,
    pub total_amount: Decimal,
    pub advance_payment: Decimal,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub pickup_location: Option<String>,
    pub dropoff_location: Option<String>,
    pub payload_json: String,
    /// Set when the payload lacked fields the merge needs; such rows are not merged.
    pub parse_error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedContact {
    pub run_id: ImportRunId,
    pub external_contact_id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub document_type: Option<String>,
    pub document_number: Option<String>,
    pub address: Option<String>,
    pub payload_json: String,
}
