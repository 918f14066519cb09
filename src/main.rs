use adsync::api::{create_router, ApiState};
use adsync::config::AppConfig;
use adsync::credentials::IntegrationStore;
use adsync::jobs::{JobRunner, Scheduler, SyncJobQueue};
use adsync::metrics::{MetricStore, MetricsWriter};
use adsync::oauth::OAuthFlow;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "adsync=info".into()),
        )
        .init();

    info!("Ad sync engine starting...");

    let config = Arc::new(AppConfig::from_env().context("Failed to load configuration")?);

    let connected_providers: Vec<&str> = adsync::providers::ProviderKind::all()
        .into_iter()
        .filter(|kind| config.provider_app(*kind).is_ok())
        .map(|kind| kind.as_str())
        .collect();

    info!(
        integrations_db = %config.integrations_db,
        jobs_db = %config.jobs_db,
        metrics_db = %config.metrics_db,
        api_port = config.api_port,
        providers = ?connected_providers,
        "Configuration loaded"
    );

    let integrations = Arc::new(
        IntegrationStore::new(&config.integrations_db, &config.encryption_key)
            .context("Failed to initialize integration store")?,
    );
    info!("Integration store initialized");

    let queue = Arc::new(
        SyncJobQueue::new(&config.jobs_db, Arc::clone(&integrations))
            .context("Failed to initialize job queue")?,
    );
    info!("Sync job queue initialized");

    let metrics = Arc::new(MetricStore::new(&config.metrics_db).context("Failed to initialize metric store")?);
    info!("Metric store initialized");

    let flow = Arc::new(
        OAuthFlow::new(
            Arc::clone(&config),
            Arc::clone(&integrations),
            Arc::clone(&queue),
        )
        .context("Failed to initialize OAuth flow")?,
    );
    let scheduler = Arc::new(Scheduler::new(Arc::clone(&integrations), Arc::clone(&queue)));
    let runner = Arc::new(JobRunner::new(
        Arc::clone(&config),
        Arc::clone(&integrations),
        Arc::clone(&queue),
        MetricsWriter::new(Arc::clone(&metrics)),
    ));

    let api_state = ApiState {
        config: Arc::clone(&config),
        flow,
        integrations,
        queue,
        scheduler,
        runner,
        metrics,
    };
    let router = create_router(api_state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.api_port))
        .await
        .context("Failed to bind API port")?;
    info!(port = config.api_port, "Sync API listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    server_handle.abort();
    info!("Sync engine stopped");

    Ok(())
}
