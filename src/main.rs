mod api;
mod config;
mod error;
mod face_index;
mod indexer;
mod layout;
mod metadata_store;
mod object_store;
mod reaper;
mod search;
mod thumbnails;

use anyhow::{Context, Result};
use api::{start_api_server, AppState};
use config::Config;
use face_index::RekognitionIndex;
use indexer::FaceIndexer;
use metadata_store::PgMetadataStore;
use object_store::S3ObjectStore;
use reaper::LifecycleReaper;
use search::IdentitySearch;
use std::sync::Arc;
use thumbnails::ThumbnailPipeline;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(service = %config.service.name, "Starting Revela media pipeline");

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize backends
    let metadata = Arc::new(
        PgMetadataStore::new(&config.database)
            .await
            .context("Failed to initialize metadata store")?,
    );

    if config.database.run_migrations {
        metadata
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let originals: Arc<dyn object_store::ObjectStore> = Arc::new(
        S3ObjectStore::new(&config.s3, config.s3.originals_bucket.clone())
            .await
            .context("Failed to initialize originals store")?,
    );

    let derived: Arc<dyn object_store::ObjectStore> = Arc::new(
        S3ObjectStore::new(&config.s3, config.s3.derived_bucket.clone())
            .await
            .context("Failed to initialize derived store")?,
    );

    let index: Arc<dyn face_index::BiometricIndex> = Arc::new(
        RekognitionIndex::new(&config.rekognition)
            .await
            .context("Failed to initialize biometric index")?,
    );

    // Build components
    let indexer = Arc::new(FaceIndexer::new(
        originals.clone(),
        config.s3.originals_bucket.clone(),
        metadata.clone(),
        index.clone(),
    ));

    let watermark = ThumbnailPipeline::load_watermark(derived.as_ref(), &config.thumbnails).await;
    let thumbnails = Arc::new(ThumbnailPipeline::new(
        originals.clone(),
        derived.clone(),
        config.thumbnails.clone(),
        watermark,
    ));

    let search = Arc::new(IdentitySearch::new(
        metadata.clone(),
        index.clone(),
        config.s3.originals_bucket.clone(),
        config.rekognition.similarity_threshold,
        config.rekognition.search_concurrency,
    ));

    let reaper = Arc::new(LifecycleReaper::new(
        metadata.clone(),
        originals.clone(),
        derived.clone(),
        index.clone(),
        config.reaper.batch_size,
    ));

    let state = AppState {
        indexer,
        thumbnails,
        search,
        reaper: reaper.clone(),
        metadata: metadata.clone(),
        originals: originals.clone(),
        pool: Some(metadata.pool().clone()),
        admin_secret: config.api.admin_secret.clone(),
    };

    let shutdown = CancellationToken::new();

    // Spawn the reaper scheduler
    let scheduler_handle = if config.reaper.scheduler_enabled {
        let interval = config.reap_interval();
        let cancel = shutdown.clone();
        Some(tokio::spawn(reaper.run_scheduler(interval, cancel)))
    } else {
        info!("Reaper scheduler disabled, /reap trigger only");
        None
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Media pipeline started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down media pipeline");

    shutdown.cancel();
    if let Some(handle) = scheduler_handle {
        let _ = handle.await;
    }
    api_handle.abort();

    info!("Media pipeline stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
