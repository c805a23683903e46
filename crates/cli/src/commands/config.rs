use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use fleetsync_core::config::{AppConfig, LoadOptions};
use secrecy::{ExposeSecret, SecretString};
use toml::Value;

/// One inspected setting: dotted key, rendered value, environment override.
struct Entry {
    key: &'static str,
    value: String,
    env_key: Option<&'static str>,
}

fn entry(key: &'static str, value: impl Into<String>, env_key: &'static str) -> Entry {
    Entry { key, value: value.into(), env_key: Some(env_key) }
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for item in entries(&config) {
        let source =
            field_source(item.key, item.env_key, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(render_line(item.key, &item.value, source));
    }

    lines.join("\n")
}

fn entries(config: &AppConfig) -> Vec<Entry> {
    let optional = |value: Option<&str>| value.unwrap_or("<unset>").to_string();
    let stale_lock = config
        .sync
        .stale_lock_after_secs
        .map(|secs| secs.to_string())
        .unwrap_or_else(|| "<disabled>".to_string());

    vec![
        entry("database.url", &config.database.url, "FLEETSYNC_DATABASE_URL"),
        entry(
            "database.max_connections",
            config.database.max_connections.to_string(),
            "FLEETSYNC_DATABASE_MAX_CONNECTIONS",
        ),
        entry(
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            "FLEETSYNC_DATABASE_TIMEOUT_SECS",
        ),
        entry("server.bind_address", &config.server.bind_address, "FLEETSYNC_SERVER_BIND_ADDRESS"),
        entry("server.port", config.server.port.to_string(), "FLEETSYNC_SERVER_PORT"),
        entry("crm.base_url", &config.crm.base_url, "FLEETSYNC_CRM_BASE_URL"),
        entry("crm.access_token", redact(&config.crm.access_token), "FLEETSYNC_CRM_ACCESS_TOKEN"),
        entry(
            "crm.webhook_secret",
            config.crm.webhook_secret.as_ref().map(redact).unwrap_or_else(|| "<unset>".to_string()),
            "FLEETSYNC_CRM_WEBHOOK_SECRET",
        ),
        entry("crm.pipeline_id", optional(config.crm.pipeline_id.as_deref()), "FLEETSYNC_CRM_PIPELINE_ID"),
        Entry { key: "crm.stages", value: format!("{} mapped stage(s)", config.crm.stages.len()), env_key: None },
        entry("accounting.base_url", &config.accounting.base_url, "FLEETSYNC_ACCOUNTING_BASE_URL"),
        entry("accounting.api_key", redact(&config.accounting.api_key), "FLEETSYNC_ACCOUNTING_API_KEY"),
        entry("sync.max_attempts", config.sync.max_attempts.to_string(), "FLEETSYNC_SYNC_MAX_ATTEMPTS"),
        entry("sync.stale_lock_after_secs", stale_lock, "FLEETSYNC_SYNC_STALE_LOCK_AFTER_SECS"),
        entry(
            "bulk_import.enabled",
            config.bulk_import.enabled.to_string(),
            "FLEETSYNC_BULK_IMPORT_ENABLED",
        ),
        entry(
            "notifications.webhook_url",
            optional(config.notifications.webhook_url.as_deref()),
            "FLEETSYNC_NOTIFICATIONS_WEBHOOK_URL",
        ),
        entry("logging.level", &config.logging.level, "FLEETSYNC_LOGGING_LEVEL"),
        entry("logging.format", format!("{:?}", config.logging.format), "FLEETSYNC_LOGGING_FORMAT"),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    ["fleetsync.toml", "config/fleetsync.toml"].into_iter().map(PathBuf::from).find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: Option<&str>,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_key {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn redact(secret: &SecretString) -> String {
    if secret.expose_secret().trim().is_empty() {
        "<empty>".to_string()
    } else {
        "<redacted>".to_string()
    }
}
