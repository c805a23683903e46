pub mod config;
pub mod domain;
pub mod errors;
pub mod fields;
pub mod lifecycle;
pub mod line_items;
pub mod outbox_engine;
pub mod stages;

pub use domain::booking::{Booking, BookingId, BookingService, BookingStatus, SyncStatus};
pub use domain::client::{Client, ClientId};
pub use domain::crm_event::{CrmEvent, CrmEventStatus, EventKey};
pub use domain::import::{
    DateRange, ImportCounts, ImportRun, ImportRunId, ImportRunStatus, StagedContact, StagedLead,
};
pub use domain::order::{CustomerProfile, OrderLineItem, OrderPayload, ProvisionedOrder};
pub use domain::outbox::{
    AttemptId, AttemptStatus, ErrorClass, OperationKey, SyncAttempt, TargetSystem,
};
pub use errors::DomainError;
pub use lifecycle::{BookingAction, BookingLifecycle, TransitionOutcome};
pub use line_items::{build_order_payload, DepositTreatment, FeeRules};
pub use outbox_engine::{OutboxEngine, OutboxEngineConfig, OutboxError};
pub use stages::{StageMapper, StageMapping, StageRule};
