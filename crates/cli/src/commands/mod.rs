pub mod config;
pub mod import;
pub mod migrate;
pub mod outbox;
pub mod release_locks;

use fleetsync_core::config::{AppConfig, LoadOptions};
use fleetsync_db::{connect_with_settings, migrations, DbPool};
use fleetsync_engine::{BulkImportError, Gateways, SyncEngine, SyncError};
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Runtime;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: u8,
    pub output: String,
}

#[derive(Debug, Serialize)]
struct CommandOutcome {
    command: String,
    status: String,
    error_class: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl CommandResult {
    pub fn success(command: &str, message: impl Into<String>) -> Self {
        Self::success_with(command, message, None)
    }

    pub fn success_with(command: &str, message: impl Into<String>, data: Option<Value>) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "ok".to_string(),
            error_class: None,
            message: message.into(),
            data,
        };
        Self { exit_code: 0, output: serialize_payload(payload) }
    }

    pub fn failure(
        command: &str,
        error_class: &str,
        message: impl Into<String>,
        exit_code: u8,
    ) -> Self {
        let payload = CommandOutcome {
            command: command.to_string(),
            status: "error".to_string(),
            error_class: Some(error_class.to_string()),
            message: message.into(),
            data: None,
        };
        Self { exit_code, output: serialize_payload(payload) }
    }
}

fn serialize_payload(payload: CommandOutcome) -> String {
    serde_json::to_string(&payload).unwrap_or_else(|error| {
        format!(
            "{{\"command\":\"unknown\",\"status\":\"error\",\"error_class\":\"serialization\",\"message\":\"{}\"}}",
            error.to_string().replace('\\', "\\\\").replace('"', "\\\"")
        )
    })
}

/// A failed step: error class, message, exit code.
pub(crate) struct Failure {
    class: &'static str,
    message: String,
    exit_code: u8,
}

impl Failure {
    pub(crate) fn new(class: &'static str, message: impl Into<String>, exit_code: u8) -> Self {
        Self { class, message: message.into(), exit_code }
    }

    pub(crate) fn into_result(self, command: &str) -> CommandResult {
        CommandResult::failure(command, self.class, self.message, self.exit_code)
    }
}

impl From<SyncError> for Failure {
    fn from(error: SyncError) -> Self {
        let class = match &error {
            SyncError::BookingNotFound(_)
            | SyncError::EventNotFound(_)
            | SyncError::AttemptNotFound(_) => "not_found",
            SyncError::InFlight(_)
            | SyncError::NotReplayable(_)
            | SyncError::NotSynced(_)
            | SyncError::OrderConflict { .. }
            | SyncError::Outbox(_) => "conflict",
            SyncError::Gateway(_) => "gateway",
            SyncError::Repository(_) => "repository",
            _ => "sync",
        };
        Self::new(class, error.to_string(), 7)
    }
}

impl From<BulkImportError> for Failure {
    fn from(error: BulkImportError) -> Self {
        let class = match &error {
            BulkImportError::Disabled => "feature_disabled",
            BulkImportError::InvalidRange(_) | BulkImportError::Domain(_) => "invalid_range",
            BulkImportError::RunNotFound(_) => "not_found",
            BulkImportError::Gateway(_) => "gateway",
            BulkImportError::Repository(_) | BulkImportError::Payload(_) => "repository",
        };
        Self::new(class, error.to_string(), 7)
    }
}

pub(crate) fn load_config() -> Result<AppConfig, Failure> {
    AppConfig::load(LoadOptions::default())
        .map_err(|error| Failure::new("config_validation", format!("configuration issue: {error}"), 2))
}

pub(crate) fn runtime() -> Result<Runtime, Failure> {
    tokio::runtime::Builder::new_current_thread().enable_all().build().map_err(|error| {
        Failure::new("runtime_init", format!("failed to initialize async runtime: {error}"), 3)
    })
}

/// Connects and brings the schema up to date.
pub(crate) async fn open_pool(config: &AppConfig) -> Result<DbPool, Failure> {
    let pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(|error| Failure::new("db_connectivity", error.to_string(), 4))?;
    migrations::run_pending(&pool)
        .await
        .map_err(|error| Failure::new("migration", error.to_string(), 5))?;
    Ok(pool)
}

pub(crate) fn sync_engine(pool: DbPool, config: &AppConfig) -> Result<SyncEngine, Failure> {
    let gateways = Gateways::http(config)
        .map_err(|error| Failure::new("client_setup", error.to_string(), 6))?;
    SyncEngine::new(pool, config, gateways)
        .map_err(|error| Failure::new("client_setup", error.to_string(), 6))
}

pub(crate) fn to_data<T: Serialize>(value: &T) -> Option<Value> {
    serde_json::to_value(value).ok()
}
