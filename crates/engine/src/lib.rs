//! Synchronization engine between the CRM pipeline, the booking store and the
//! accounting system.

pub mod bulk;
pub mod errors;
pub mod http;
pub mod ingest;
pub mod lock;
pub mod notify;
pub mod pipeline;
pub mod ports;
pub mod propagator;
pub mod provisioner;
pub mod recorder;

#[cfg(test)]
mod testing;

pub use bulk::BulkImporter;
pub use errors::{BulkImportError, SyncError};
pub use ingest::{parse_webhook_batch, EventLog, InboundEvent, IngestOutcome, WebhookBatch};
pub use lock::{LockAttempt, RowSyncLock, SyncLock};
pub use pipeline::{EventOutcome, Gateways, ReplaySummary, SyncEngine, SyncReport};
pub use ports::{AccountingGateway, CrmGateway, GatewayError, Notifier, TaskGateway};
pub use propagator::{PropagationOutcome, StatusPropagator};
pub use provisioner::{OrderProvisioner, ProvisionOutcome, RefreshedOrder};
pub use recorder::{OutboundCall, OutboxRecorder};
