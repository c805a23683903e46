use thiserror::Error;

use fleetsync_core::domain::booking::BookingId;
use fleetsync_core::domain::import::ImportRunId;
use fleetsync_core::domain::outbox::{AttemptId, ErrorClass, OperationKey};
use fleetsync_core::errors::DomainError;
use fleetsync_core::outbox_engine::OutboxError;
use fleetsync_db::RepositoryError;

use crate::ports::GatewayError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Outbox(#[from] OutboxError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("booking `{0}` not found")]
    BookingNotFound(BookingId),
    #[error("crm event `{0}` not found")]
    EventNotFound(String),
    #[error("outbox entry `{0}` not found")]
    AttemptNotFound(AttemptId),
    #[error("outbox entry `{0}` cannot be replayed")]
    NotReplayable(AttemptId),
    #[error("operation `{0}` is already in flight")]
    InFlight(OperationKey),
    #[error("booking `{0}` has no accounting order yet")]
    NotSynced(BookingId),
    #[error("booking `{booking_id}` cannot be provisioned: {reason}")]
    Incomplete { booking_id: BookingId, reason: String },
    #[error("could not encode payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("notification template error: {0}")]
    Template(String),
    #[error("booking `{booking_id}` already records another order; order `{order_id}` needs review")]
    OrderConflict { booking_id: BookingId, order_id: String },
    #[error("provisioning task ended abnormally: {0}")]
    Aborted(String),
}

impl SyncError {
    /// Retry classification recorded on the outbox and used to pick the
    /// state a released lock returns to.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Gateway(error) => error.class(),
            Self::Repository(_) | Self::InFlight(_) => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        }
    }
}

#[derive(Debug, Error)]
pub enum BulkImportError {
    #[error("bulk import is disabled; set bulk_import.enabled = true to allow it")]
    Disabled,
    #[error("invalid import range: {0}")]
    InvalidRange(String),
    #[error("import run `{0}` not found")]
    RunNotFound(ImportRunId),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("could not encode staged payload: {0}")]
    Payload(#[from] serde_json::Error),
}
