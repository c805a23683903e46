use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Stable deduplication key of an inbound CRM notification.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventKey(pub String);

impl std::fmt::Display for EventKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl EventKey {
    /// Prefers the envelope id supplied by the CRM. Without one, the key is a
    /// digest of the stage change and the coarse time bucket it was received
    /// in, so millisecond-apart redeliveries collapse onto the same key.
    pub fn derive(
        source_event_id: Option<&str>,
        lead_id: &str,
        new_stage_id: &str,
        old_stage_id: Option<&str>,
        received_at: DateTime<Utc>,
        bucket_secs: i64,
    ) -> Self {
        if let Some(source) = source_event_id.map(str::trim).filter(|value| !value.is_empty()) {
            return Self(format!("src:{source}"));
        }

        let bucket = received_at.timestamp().div_euclid(bucket_secs.max(1));
        let mut hasher = Sha256::new();
        hasher.update(lead_id.trim().as_bytes());
        hasher.update(b"|");
        hasher.update(new_stage_id.trim().as_bytes());
        hasher.update(b"|");
        hasher.update(old_stage_id.unwrap_or_default().trim().as_bytes());
        hasher.update(b"|");
        hasher.update(bucket.to_string().as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        Self(format!("syn:{}", &digest[..32]))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrmEventStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl CrmEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "processed" => Some(Self::Processed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmEvent {
    pub key: EventKey,
    pub lead_id: String,
    pub old_stage_id: Option<String>,
    pub new_stage_id: String,
    pub pipeline_id: Option<String>,
    pub status: CrmEventStatus,
    pub last_error: Option<String>,
    pub received_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
