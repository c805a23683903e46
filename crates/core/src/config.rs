use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fields::LeadFieldMap;
use crate::line_items::{DepositTreatment, FeeRules};
use crate::outbox_engine::OutboxEngineConfig;
use crate::stages::{default_stage_rules, StageMapper, StageRule};

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub crm: CrmConfig,
    pub accounting: AccountingConfig,
    pub sync: SyncConfig,
    pub bulk_import: BulkImportConfig,
    pub notifications: NotificationConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct CrmConfig {
    pub base_url: String,
    pub access_token: SecretString,
    /// Shared secret expected in the `X-Webhook-Secret` header. Unset disables the check.
    pub webhook_secret: Option<SecretString>,
    pub pipeline_id: Option<String>,
    pub timeout_secs: u64,
    pub stages: Vec<StageRule>,
    pub fields: LeadFieldMap,
    /// Stage the lead is moved to once an order exists and an advance is due.
    pub payment_pending_stage_id: String,
    /// Stage the lead is moved to once an order exists and nothing is due upfront.
    pub confirmed_stage_id: String,
}

#[derive(Clone, Debug)]
pub struct AccountingConfig {
    pub base_url: String,
    pub api_key: SecretString,
    pub timeout_secs: u64,
    pub deposit_labels: BTreeMap<String, DepositTreatment>,
    pub default_deposit_treatment: DepositTreatment,
}

#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Upper bound for any single external call.
    pub call_timeout_secs: u64,
    pub retry_base_delay_secs: u64,
    pub retry_backoff_multiplier: u32,
    pub retry_max_delay_secs: u64,
    pub max_attempts: u32,
    pub retry_worker_interval_secs: u64,
    /// `None` keeps stale `in_progress` locks until an operator releases them.
    pub stale_lock_after_secs: Option<u64>,
    /// Window used to derive synthetic event keys when the CRM sends no event id.
    pub event_bucket_secs: u64,
}

#[derive(Clone, Debug)]
pub struct BulkImportConfig {
    pub enabled: bool,
    pub page_size: u32,
    pub max_pages: u32,
    pub contact_concurrency: usize,
    pub inter_batch_delay_ms: u64,
    pub excluded_stage_ids: Vec<String>,
    pub max_range_days: i64,
}

#[derive(Clone, Debug, Default)]
pub struct NotificationConfig {
    pub webhook_url: Option<String>,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub bind_address: Option<String>,
    pub port: Option<u16>,
    pub bulk_import_enabled: Option<bool>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        let fee_rules_default = [
            ("deposit", DepositTreatment::Refundable),
            ("security deposit", DepositTreatment::Refundable),
            ("franchise", DepositTreatment::Refundable),
            ("deposit waiver", DepositTreatment::Taxable),
            ("insurance", DepositTreatment::Taxable),
            ("full insurance", DepositTreatment::Taxable),
        ];

        Self {
            database: DatabaseConfig {
                url: "sqlite://fleetsync.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            crm: CrmConfig {
                base_url: "http://localhost:9100".to_string(),
                access_token: String::new().into(),
                webhook_secret: None,
                pipeline_id: None,
                timeout_secs: 10,
                stages: default_stage_rules(),
                fields: LeadFieldMap::default(),
                payment_pending_stage_id: crate::stages::STAGE_PAYMENT_PENDING.to_string(),
                confirmed_stage_id: crate::stages::STAGE_CONFIRMED.to_string(),
            },
            accounting: AccountingConfig {
                base_url: "http://localhost:9200".to_string(),
                api_key: String::new().into(),
                timeout_secs: 15,
                deposit_labels: fee_rules_default
                    .into_iter()
                    .map(|(label, treatment)| (label.to_string(), treatment))
                    .collect(),
                default_deposit_treatment: DepositTreatment::Refundable,
            },
            sync: SyncConfig {
                call_timeout_secs: 20,
                retry_base_delay_secs: 30,
                retry_backoff_multiplier: 2,
                retry_max_delay_secs: 3600,
                max_attempts: 5,
                retry_worker_interval_secs: 30,
                stale_lock_after_secs: None,
                event_bucket_secs: 60,
            },
            bulk_import: BulkImportConfig {
                enabled: false,
                page_size: 250,
                max_pages: 200,
                contact_concurrency: 5,
                inter_batch_delay_ms: 250,
                excluded_stage_ids: Vec::new(),
                max_range_days: 366,
            },
            notifications: NotificationConfig::default(),
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl CrmConfig {
    pub fn stage_mapper(&self) -> StageMapper {
        StageMapper::new(self.pipeline_id.clone(), self.stages.clone(), self.fields.clone())
    }
}

impl AccountingConfig {
    pub fn fee_rules(&self) -> FeeRules {
        FeeRules::new(self.deposit_labels.clone(), self.default_deposit_treatment)
    }
}

/// External calls a provisioning attempt makes while holding the lock:
/// customer resolution and order creation.
const PROVISIONING_CALLS: u64 = 2;

impl SyncConfig {
    /// Longest a provisioning attempt can legitimately hold its lock. A stale
    /// threshold at or below it would release locks of attempts still running.
    pub fn provisioning_budget_secs(&self) -> u64 {
        PROVISIONING_CALLS.saturating_mul(self.call_timeout_secs)
    }

    pub fn outbox_engine_config(&self) -> OutboxEngineConfig {
        OutboxEngineConfig {
            retry_base_delay_seconds: to_seconds(self.retry_base_delay_secs),
            retry_backoff_multiplier: self.retry_backoff_multiplier,
            retry_max_delay_seconds: to_seconds(self.retry_max_delay_secs),
            max_attempts: self.max_attempts,
            processing_timeout_seconds: to_seconds(self.call_timeout_secs.saturating_mul(3)),
        }
    }
}

fn to_seconds(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("fleetsync.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            set(&mut self.database.url, database.url);
            set(&mut self.database.max_connections, database.max_connections);
            set(&mut self.database.timeout_secs, database.timeout_secs);
        }

        if let Some(server) = patch.server {
            set(&mut self.server.bind_address, server.bind_address);
            set(&mut self.server.port, server.port);
            set(&mut self.server.graceful_shutdown_secs, server.graceful_shutdown_secs);
        }

        if let Some(crm) = patch.crm {
            set(&mut self.crm.base_url, crm.base_url);
            if let Some(token) = crm.access_token {
                self.crm.access_token = secret_value(token);
            }
            if let Some(secret) = crm.webhook_secret {
                self.crm.webhook_secret = Some(secret_value(secret));
            }
            if crm.pipeline_id.is_some() {
                self.crm.pipeline_id = crm.pipeline_id;
            }
            set(&mut self.crm.timeout_secs, crm.timeout_secs);
            set(&mut self.crm.stages, crm.stages);
            set(&mut self.crm.fields, crm.fields);
            set(&mut self.crm.payment_pending_stage_id, crm.payment_pending_stage_id);
            set(&mut self.crm.confirmed_stage_id, crm.confirmed_stage_id);
        }

        if let Some(accounting) = patch.accounting {
            set(&mut self.accounting.base_url, accounting.base_url);
            if let Some(key) = accounting.api_key {
                self.accounting.api_key = secret_value(key);
            }
            set(&mut self.accounting.timeout_secs, accounting.timeout_secs);
            if let Some(labels) = accounting.deposit_labels {
                self.accounting.deposit_labels.extend(labels);
            }
            set(
                &mut self.accounting.default_deposit_treatment,
                accounting.default_deposit_treatment,
            );
        }

        if let Some(sync) = patch.sync {
            set(&mut self.sync.call_timeout_secs, sync.call_timeout_secs);
            set(&mut self.sync.retry_base_delay_secs, sync.retry_base_delay_secs);
            set(&mut self.sync.retry_backoff_multiplier, sync.retry_backoff_multiplier);
            set(&mut self.sync.retry_max_delay_secs, sync.retry_max_delay_secs);
            set(&mut self.sync.max_attempts, sync.max_attempts);
            set(&mut self.sync.retry_worker_interval_secs, sync.retry_worker_interval_secs);
            if sync.stale_lock_after_secs.is_some() {
                self.sync.stale_lock_after_secs = sync.stale_lock_after_secs;
            }
            set(&mut self.sync.event_bucket_secs, sync.event_bucket_secs);
        }

        if let Some(bulk) = patch.bulk_import {
            set(&mut self.bulk_import.enabled, bulk.enabled);
            set(&mut self.bulk_import.page_size, bulk.page_size);
            set(&mut self.bulk_import.max_pages, bulk.max_pages);
            set(&mut self.bulk_import.contact_concurrency, bulk.contact_concurrency);
            set(&mut self.bulk_import.inter_batch_delay_ms, bulk.inter_batch_delay_ms);
            set(&mut self.bulk_import.excluded_stage_ids, bulk.excluded_stage_ids);
            set(&mut self.bulk_import.max_range_days, bulk.max_range_days);
        }

        if let Some(notifications) = patch.notifications {
            if notifications.webhook_url.is_some() {
                self.notifications.webhook_url = notifications.webhook_url;
            }
        }

        if let Some(logging) = patch.logging {
            set(&mut self.logging.level, logging.level);
            set(&mut self.logging.format, logging.format);
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("FLEETSYNC_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("FLEETSYNC_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_env("FLEETSYNC_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("FLEETSYNC_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_env("FLEETSYNC_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("FLEETSYNC_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("FLEETSYNC_SERVER_PORT") {
            self.server.port = parse_env("FLEETSYNC_SERVER_PORT", &value)?;
        }

        if let Some(value) = read_env("FLEETSYNC_CRM_BASE_URL") {
            self.crm.base_url = value;
        }
        if let Some(value) = read_env("FLEETSYNC_CRM_ACCESS_TOKEN") {
            self.crm.access_token = secret_value(value);
        }
        if let Some(value) = read_env("FLEETSYNC_CRM_WEBHOOK_SECRET") {
            self.crm.webhook_secret = Some(secret_value(value));
        }
        if let Some(value) = read_env("FLEETSYNC_CRM_PIPELINE_ID") {
            self.crm.pipeline_id = Some(value);
        }

        if let Some(value) = read_env("FLEETSYNC_ACCOUNTING_BASE_URL") {
            self.accounting.base_url = value;
        }
        if let Some(value) = read_env("FLEETSYNC_ACCOUNTING_API_KEY") {
            self.accounting.api_key = secret_value(value);
        }

        if let Some(value) = read_env("FLEETSYNC_SYNC_MAX_ATTEMPTS") {
            self.sync.max_attempts = parse_env("FLEETSYNC_SYNC_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("FLEETSYNC_SYNC_STALE_LOCK_AFTER_SECS") {
            self.sync.stale_lock_after_secs =
                Some(parse_env("FLEETSYNC_SYNC_STALE_LOCK_AFTER_SECS", &value)?);
        }

        if let Some(value) = read_env("FLEETSYNC_BULK_IMPORT_ENABLED") {
            self.bulk_import.enabled = parse_env("FLEETSYNC_BULK_IMPORT_ENABLED", &value)?;
        }

        if let Some(value) = read_env("FLEETSYNC_NOTIFICATIONS_WEBHOOK_URL") {
            self.notifications.webhook_url = Some(value);
        }

        let log_level =
            read_env("FLEETSYNC_LOGGING_LEVEL").or_else(|| read_env("FLEETSYNC_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("FLEETSYNC_LOGGING_FORMAT").or_else(|| read_env("FLEETSYNC_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        set(&mut self.database.url, overrides.database_url);
        set(&mut self.logging.level, overrides.log_level);
        set(&mut self.server.bind_address, overrides.bind_address);
        set(&mut self.server.port, overrides.port);
        set(&mut self.bulk_import.enabled, overrides.bulk_import_enabled);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_crm(&self.crm)?;
        validate_accounting(&self.accounting)?;
        validate_sync(&self.sync)?;
        validate_bulk_import(&self.bulk_import)?;
        validate_notifications(&self.notifications)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn set<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("fleetsync.toml"), PathBuf::from("config/fleetsync.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validation(message: &str) -> ConfigError {
    ConfigError::Validation(message.to_string())
}

fn validate_http_url(field: &str, url: &str) -> Result<(), ConfigError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(ConfigError::Validation(format!("{field} must start with http:// or https://")))
    }
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)",
        ));
    }
    if database.max_connections == 0 {
        return Err(validation("database.max_connections must be greater than zero"));
    }
    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(validation("database.timeout_secs must be in range 1..=300"));
    }
    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(validation("server.port must be greater than zero"));
    }
    if server.graceful_shutdown_secs == 0 {
        return Err(validation("server.graceful_shutdown_secs must be greater than zero"));
    }
    Ok(())
}

fn validate_crm(crm: &CrmConfig) -> Result<(), ConfigError> {
    validate_http_url("crm.base_url", &crm.base_url)?;
    if crm.timeout_secs == 0 || crm.timeout_secs > 120 {
        return Err(validation("crm.timeout_secs must be in range 1..=120"));
    }
    if crm.stages.is_empty() {
        return Err(validation("crm.stages must map at least one stage"));
    }
    let mut seen = std::collections::HashSet::new();
    for rule in &crm.stages {
        if rule.stage_id.trim().is_empty() {
            return Err(validation("crm.stages entries need a non-empty stage_id"));
        }
        if !seen.insert(rule.stage_id.trim()) {
            return Err(ConfigError::Validation(format!(
                "crm.stages maps stage `{}` more than once",
                rule.stage_id
            )));
        }
    }
    if crm.payment_pending_stage_id.trim().is_empty() || crm.confirmed_stage_id.trim().is_empty()
    {
        return Err(validation(
            "crm.payment_pending_stage_id and crm.confirmed_stage_id must be set",
        ));
    }
    if let Some(secret) = &crm.webhook_secret {
        if secret.expose_secret().trim().is_empty() {
            return Err(validation("crm.webhook_secret must not be blank when set"));
        }
    }
    Ok(())
}

fn validate_accounting(accounting: &AccountingConfig) -> Result<(), ConfigError> {
    validate_http_url("accounting.base_url", &accounting.base_url)?;
    if accounting.timeout_secs == 0 || accounting.timeout_secs > 120 {
        return Err(validation("accounting.timeout_secs must be in range 1..=120"));
    }
    Ok(())
}

fn validate_sync(sync: &SyncConfig) -> Result<(), ConfigError> {
    if sync.call_timeout_secs == 0 {
        return Err(validation("sync.call_timeout_secs must be greater than zero"));
    }
    if sync.retry_backoff_multiplier == 0 {
        return Err(validation("sync.retry_backoff_multiplier must be at least 1"));
    }
    if sync.retry_max_delay_secs < sync.retry_base_delay_secs {
        return Err(validation(
            "sync.retry_max_delay_secs must not be smaller than sync.retry_base_delay_secs",
        ));
    }
    if sync.max_attempts == 0 {
        return Err(validation("sync.max_attempts must be greater than zero"));
    }
    if sync.retry_worker_interval_secs == 0 {
        return Err(validation("sync.retry_worker_interval_secs must be greater than zero"));
    }
    if sync.stale_lock_after_secs == Some(0) {
        return Err(validation(
            "sync.stale_lock_after_secs must be greater than zero; omit it to disable",
        ));
    }
    if let Some(stale_after) = sync.stale_lock_after_secs {
        let budget = sync.provisioning_budget_secs();
        if stale_after <= budget {
            return Err(validation(&format!(
                "sync.stale_lock_after_secs must exceed {budget}s, the provisioning call budget \
                 ({PROVISIONING_CALLS} x sync.call_timeout_secs)"
            )));
        }
    }
    if sync.event_bucket_secs == 0 {
        return Err(validation("sync.event_bucket_secs must be greater than zero"));
    }
    Ok(())
}

fn validate_bulk_import(bulk: &BulkImportConfig) -> Result<(), ConfigError> {
    if bulk.page_size == 0 || bulk.page_size > 500 {
        return Err(validation("bulk_import.page_size must be in range 1..=500"));
    }
    if bulk.max_pages == 0 {
        return Err(validation("bulk_import.max_pages must be greater than zero"));
    }
    if bulk.contact_concurrency == 0 || bulk.contact_concurrency > 32 {
        return Err(validation("bulk_import.contact_concurrency must be in range 1..=32"));
    }
    if bulk.max_range_days <= 0 {
        return Err(validation("bulk_import.max_range_days must be greater than zero"));
    }
    Ok(())
}

fn validate_notifications(notifications: &NotificationConfig) -> Result<(), ConfigError> {
    match &notifications.webhook_url {
        Some(url) => validate_http_url("notifications.webhook_url", url),
        None => Ok(()),
    }
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(validation("logging.level must be one of trace|debug|info|warn|error")),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    crm: Option<CrmPatch>,
    accounting: Option<AccountingPatch>,
    sync: Option<SyncPatch>,
    bulk_import: Option<BulkImportPatch>,
    notifications: Option<NotificationPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CrmPatch {
    base_url: Option<String>,
    access_token: Option<String>,
    webhook_secret: Option<String>,
    pipeline_id: Option<String>,
    timeout_secs: Option<u64>,
    stages: Option<Vec<StageRule>>,
    fields: Option<LeadFieldMap>,
    payment_pending_stage_id: Option<String>,
    confirmed_stage_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AccountingPatch {
    base_url: Option<String>,
    api_key: Option<String>,
    timeout_secs: Option<u64>,
    deposit_labels: Option<BTreeMap<String, DepositTreatment>>,
    default_deposit_treatment: Option<DepositTreatment>,
}

#[derive(Debug, Default, Deserialize)]
struct SyncPatch {
    call_timeout_secs: Option<u64>,
    retry_base_delay_secs: Option<u64>,
    retry_backoff_multiplier: Option<u32>,
    retry_max_delay_secs: Option<u64>,
    max_attempts: Option<u32>,
    retry_worker_interval_secs: Option<u64>,
    stale_lock_after_secs: Option<u64>,
    event_bucket_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct BulkImportPatch {
    enabled: Option<bool>,
    page_size: Option<u32>,
    max_pages: Option<u32>,
    contact_concurrency: Option<usize>,
    inter_batch_delay_ms: Option<u64>,
    excluded_stage_ids: Option<Vec<String>>,
    max_range_days: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct NotificationPatch {
    webhook_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
