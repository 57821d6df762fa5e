//! # Syndication Server
//!
//! Serves the syndication chain, the tagging surface and health checks.
//!
//! ## Usage
//!
//! ```bash
//! # Development defaults plus config/syndication.development.toml
//! cargo run --bin syndication-server
//!
//! # Production
//! SYNDICATION_ENV=production cargo run --release --bin syndication-server
//! ```
//!
//! The `test` environment runs against in-memory collaborators and never
//! reaches the database or any external service.

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;

use syndication_core::cloud::{
    BigQueryWarehouse, CloudSqlAdmin, CloudStorage, GoogleApiClient, MetadataServerTokenSource,
    StaticTokenSource, TokenSource,
};
use syndication_core::config::{ConfigManager, SyndicationConfig};
use syndication_core::logging;
use syndication_core::messaging::CloudTasksQueue;
use syndication_core::orchestration::{DeferralPolicy, PgRunStore, StepRegistry, TaskChainOrchestrator};
use syndication_core::progress::{
    DisabledChannel, NotificationChannel, PgMessageHistoryStore, ProgressReporter, SlackChannel,
};
use syndication_core::syndication::{
    CloudServices, IdSpacePartition, MigrationEngine, PgStagingMigrator, SyndicationNaming,
    SyndicationSteps,
};
use syndication_core::tagging::{BulkTagService, PgTagFilterStore};
use syndication_core::test_helpers::TestPipeline;
use syndication_core::web::{self, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_structured_logging();

    info!("Starting Syndication Server");
    info!("   Version: {}", env!("CARGO_PKG_VERSION"));

    let manager = ConfigManager::load().context("Failed to load configuration")?;
    let config = manager.config().clone();
    info!("   Environment: {}", manager.environment());
    info!("   Target: {}", config.syndication.target_environment);

    let app_state = if config.is_test_environment() {
        info!("   Collaborators: in-memory");
        TestPipeline::with_config(config.clone()).app_state()
    } else {
        build_state(config.clone()).await?
    };

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_address))?;
    info!("   Listening on {}", config.server.bind_address);

    axum::serve(listener, web::create_app(app_state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Syndication Server shutdown complete");
    Ok(())
}

/// Wire the production collaborators
async fn build_state(config: SyndicationConfig) -> anyhow::Result<AppState> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(Duration::from_secs(config.database.acquire_timeout_seconds))
        .connect(&config.database.url)
        .await
        .context("Failed to connect to the target database")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()
        .context("Failed to build HTTP client")?;
    let tokens: Arc<dyn TokenSource> = match &config.gcp.access_token {
        Some(token) => Arc::new(StaticTokenSource::new(token.clone())),
        None => Arc::new(MetadataServerTokenSource::new(http.clone())),
    };
    let api = GoogleApiClient::new(http.clone(), tokens.clone());

    let channel: Arc<dyn NotificationChannel> = match (&config.notifications.slack_token, config.notifications.enabled) {
        (Some(token), true) => Arc::new(SlackChannel::new(
            http.clone(),
            config.notifications.api_base_url.clone(),
            token.clone(),
        )),
        _ => Arc::new(DisabledChannel),
    };
    let history = Arc::new(PgMessageHistoryStore::new(pool.clone()));
    let progress = Arc::new(ProgressReporter::new(
        channel,
        history.clone(),
        config.notifications.channel_id.clone(),
    ));

    let queue = Arc::new(CloudTasksQueue::new(
        http,
        tokens,
        config.gcp.project.clone(),
        config.gcp.location.clone(),
        config.gcp.app_engine_service.clone(),
    ));
    let label = SyndicationNaming::new(&config).target_project();

    let orchestrator = Arc::new(TaskChainOrchestrator::new(
        Arc::new(StepRegistry::standard()),
        queue.clone(),
        Arc::new(PgRunStore::new(pool.clone())),
        progress.clone(),
        DeferralPolicy::from(&config.deferral),
        config.queues.clone(),
        label.clone(),
    ));
    let tagging = Arc::new(BulkTagService::new(
        Arc::new(PgTagFilterStore::new(pool.clone())),
        queue,
        progress,
        config.queues.clone(),
        config.tagging.ts_vector_language(),
        label,
    ));
    let migration = Arc::new(MigrationEngine::new(
        Arc::new(PgStagingMigrator::new(pool, &config.syndication)),
        IdSpacePartition::from(&config.id_space),
        config.syndication.clone(),
    ));
    let cloud = CloudServices {
        sql: Arc::new(CloudSqlAdmin::new(api.clone())),
        storage: Arc::new(CloudStorage::new(api.clone())),
        warehouse: Arc::new(BigQueryWarehouse::new(api)),
    };
    let steps = Arc::new(SyndicationSteps::new(
        orchestrator,
        cloud,
        migration,
        tagging.clone(),
        &config,
    ));

    Ok(AppState::new(Arc::new(config), steps, tagging, history))
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
