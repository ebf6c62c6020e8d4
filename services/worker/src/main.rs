use anyhow::{Context, Result};
use plate_capture::{ClipExtractor, Ffmpeg, MediaTool, RetentionSweeper, SegmentIndex, SegmentRecorder};
use plate_worker::config::Config;
use plate_worker::processor::{DetectionProcessor, RegionPolicy};
use plate_worker::registry::{DvlaClient, VehicleRegistry};
use plate_worker::{start_api_server, AppState, PgPlateStore, PlateStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Upper bound on waiting for in-flight detections and clips at shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, &config.service.log_format)?;

    info!(
        service = %config.service.name,
        region_mode = ?config.region.mode,
        video_capture = config.features.video_capture,
        "Starting plate worker"
    );

    config.validate().context("Invalid configuration")?;

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let store = Arc::new(
        PgPlateStore::new(&config.database)
            .await
            .context("Failed to initialize plate store")?,
    );

    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let registry: Option<Arc<dyn VehicleRegistry>> = if config.registry_enabled() {
        let client =
            DvlaClient::new(&config.registry).context("Failed to initialize registry client")?;
        Some(Arc::new(client))
    } else {
        None
    };

    let policy = RegionPolicy {
        mode: config.region.mode,
        enrich: config.features.registry_enrichment,
    };
    let mut processor = DetectionProcessor::new(store.clone(), registry, policy);

    let mut background: Vec<JoinHandle<()>> = Vec::new();
    let mut recorder = None;

    if config.features.video_capture {
        let capture = &config.capture;

        for dir in [&capture.buffer.segment_dir, &capture.clip.clip_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }

        let index = Arc::new(SegmentIndex::with_capacity(capture.buffer.index_capacity()));
        index
            .load_existing(&capture.buffer.segment_dir, capture.buffer.segment_duration())
            .await
            .context("Failed to load existing segments")?;

        let tool: Arc<dyn MediaTool> = Arc::new(Ffmpeg::new(&capture.stream));

        let segment_recorder = Arc::new(SegmentRecorder::new(capture, tool.clone(), index.clone()));
        let sweeper = RetentionSweeper::new(&capture.buffer, index.clone());

        let r = segment_recorder.clone();
        background.push(tokio::spawn(async move { r.run().await }));
        background.push(tokio::spawn(async move { sweeper.run().await }));

        processor = processor.with_clip_capture(Arc::new(ClipExtractor::new(capture, index, tool)));
        recorder = Some(segment_recorder);
    } else {
        info!("Video capture disabled");
    }

    let processor = Arc::new(processor);

    let api_state = AppState {
        processor: processor.clone(),
        store: store.clone() as Arc<dyn PlateStore>,
        clip_dir: config.capture.clip.clip_dir.clone(),
        recorder: recorder.clone(),
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = ?e, "API server error");
        }
    });

    info!("Plate worker started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down plate worker");

    if let Some(recorder) = &recorder {
        recorder.stop();
    }

    let pending = processor.pending_tasks();
    if pending > 0 {
        info!(pending, "Waiting for in-flight detections");
    }
    if tokio::time::timeout(DRAIN_TIMEOUT, processor.shutdown())
        .await
        .is_err()
    {
        warn!(
            timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "Detections still running at shutdown"
        );
    }

    // Abort tasks
    api_handle.abort();
    for handle in background {
        handle.abort();
    }

    info!("Plate worker stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_level)
            .with_context(|| format!("Invalid log level: {}", log_level))?,
    };

    let subscriber = tracing_subscriber::registry().with(env_filter);

    if log_format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
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
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
