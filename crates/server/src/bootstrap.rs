use std::sync::Arc;

use fleetsync_core::config::{AppConfig, ConfigError, LoadOptions};
use fleetsync_db::{connect_with_settings, migrations, DbPool};
use fleetsync_engine::{BulkImporter, Gateways, SyncEngine, SyncError};
use thiserror::Error;
use tracing::info;

use crate::api::ApiState;
use crate::health::HealthState;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub engine: Arc<SyncEngine>,
    pub importer: Arc<BulkImporter>,
}

impl Application {
    pub fn health_state(&self) -> HealthState {
        HealthState::new(self.db_pool.clone(), self.engine.clone(), &self.config.sync)
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            engine: self.engine.clone(),
            importer: self.importer.clone(),
            webhook_secret: self.config.crm.webhook_secret.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("http client setup failed: {0}")]
    HttpClient(#[source] reqwest::Error),
    #[error("sync engine setup failed: {0}")]
    Engine(#[source] SyncError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

/// Connects, migrates and wires the engine from an already loaded config.
pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let gateways = Gateways::http(&config).map_err(BootstrapError::HttpClient)?;
    assemble(config, db_pool, gateways)
}

pub(crate) fn assemble(
    config: AppConfig,
    db_pool: DbPool,
    gateways: Gateways,
) -> Result<Application, BootstrapError> {
    let importer = Arc::new(BulkImporter::from_config(db_pool.clone(), &config, gateways.crm.clone()));
    let engine =
        Arc::new(SyncEngine::new(db_pool.clone(), &config, gateways).map_err(BootstrapError::Engine)?);
    info!(
        event_name = "system.bootstrap.engine_ready",
        correlation_id = "bootstrap",
        notifications = config.notifications.webhook_url.is_some(),
        bulk_import_enabled = config.bulk_import.enabled,
        "sync engine wired"
    );

    Ok(Application { config, db_pool, engine, importer })
}

#[cfg(test)]
mod tests {
    use fleetsync_core::config::{ConfigOverrides, LoadOptions};

    use crate::bootstrap::bootstrap;

    fn overrides(database_url: &str) -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(database_url.to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_rejects_non_sqlite_database_urls() {
        let result = bootstrap(overrides("postgres://localhost/fleetsync")).await;

        let message = result.err().expect("bootstrap should fail").to_string();
        assert!(message.contains("database.url"), "unexpected error: {message}");
    }

    #[tokio::test]
    async fn bootstrap_migrates_schema_and_wires_engine() {
        let app = bootstrap(overrides("sqlite::memory:")).await.expect("bootstrap");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN ('booking', 'crm_event', 'sync_attempt', 'import_run')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("schema query");
        assert_eq!(table_count, 4);

        let stats = app.engine.outbox_stats().await.expect("stats");
        assert_eq!(stats.failed_since, 0);
        assert!(app.api_state().webhook_secret.is_none());

        app.db_pool.close().await;
    }
}
