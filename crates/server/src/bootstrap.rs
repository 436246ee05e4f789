use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use officina_core::config::{AppConfig, ConfigError, LoadOptions};
use officina_service::{
    DirectoryError, EngagementWorkflow, HttpWorkshopDirectory, NegotiationService, QuoteService,
};
use officina_store::{connect_with_settings, migrations, DbPool, SqliteStore};

#[derive(Clone)]
pub struct AppState {
    pub negotiation: NegotiationService<SqliteStore>,
    pub quotes: QuoteService<SqliteStore>,
    pub workflow: Arc<EngagementWorkflow<SqliteStore>>,
}

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub state: AppState,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", "starting application bootstrap");

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(event_name = "system.bootstrap.database_connected", "database connection established");

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(event_name = "system.bootstrap.migrations_applied", "database migrations applied");

    let store = Arc::new(SqliteStore::new(db_pool.clone()));
    let directory = HttpWorkshopDirectory::from_config(&config.directory)?;

    let negotiation = NegotiationService::new(Arc::clone(&store), directory);
    let quotes = QuoteService::new(store);
    let workflow = Arc::new(EngagementWorkflow::new(negotiation.clone(), quotes.clone()));

    info!(
        event_name = "system.bootstrap.services_ready",
        directory_enabled = config.directory.enabled,
        "negotiation and quote services constructed"
    );

    Ok(Application { config, db_pool, state: AppState { negotiation, quotes, workflow } })
}
