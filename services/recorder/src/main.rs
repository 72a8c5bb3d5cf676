use anyhow::{Context, Result};
use emovision_recorder::config::{ExportConfig, IngestConfig, LogFormat, ServiceConfig};
use emovision_recorder::frame::dominant_by_confidence;
use emovision_recorder::{
    default_backend, open_cold_store, Config, ExportPipeline, IngestOutcome, PlaybackBuffer,
    SessionManager, TieredFrameStore, TransportMessage,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service);

    info!(
        service = %config.service.name,
        mode = ?config.recording.mode,
        "Starting EmoVision recorder"
    );

    if let Some(port) = config.service.metrics_port {
        init_metrics(port)?;
    }

    let cold = open_cold_store(
        config.recording.persist_cold_store,
        &config.store.database_url,
        config.store.max_connections,
    )
    .await
    .context("Failed to open cold store")?;

    let store = Arc::new(TieredFrameStore::new(config.store_settings(), cold));
    let manager = Arc::new(SessionManager::new(store.clone(), config.recording.clone()));
    let exporter = ExportPipeline::new(store.clone(), default_backend());

    let restored = manager
        .restore_sessions()
        .await
        .context("Failed to restore sessions")?;
    if restored > 0 {
        info!(restored, "Earlier sessions available for review");
    }

    let source = source_descriptor(&config.ingest);
    let session_id = manager.start(&source)?;

    tokio::select! {
        result = run_ingest(manager.clone(), &config) => {
            result.context("Ingestion failed")?;
        }
        _ = shutdown_signal() => {
            info!("Shutting down recorder");
        }
    }

    if manager.active_session_id().is_some() {
        manager.end()?;
    }
    manager.flush().await.context("Failed to flush store")?;

    export_session(&manager, &exporter, &session_id, &config.export).await?;

    info!("Recorder stopped");
    Ok(())
}

fn source_descriptor(ingest: &IngestConfig) -> String {
    if let Some(descriptor) = &ingest.source_descriptor {
        return descriptor.clone();
    }
    match &ingest.source_path {
        Some(path) => format!("file:{}", path.display()),
        None => "stdin".to_string(),
    }
}

/// Feed NDJSON transport messages into the active session until end of
/// stream or end of input.
async fn run_ingest(manager: Arc<SessionManager>, config: &Config) -> Result<()> {
    let reader: Box<dyn AsyncBufRead + Unpin + Send> = match &config.ingest.source_path {
        Some(path) => Box::new(BufReader::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    let mut live = PlaybackBuffer::from_config(&config.playback);
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let message = match TransportMessage::from_json(&line) {
            Ok(message) => message,
            Err(e) => {
                metrics::counter!("recorder.messages.invalid").increment(1);
                warn!(error = %e, "Skipping malformed transport message");
                continue;
            }
        };

        let Some(active) = manager.active_session_id() else {
            break;
        };

        match message {
            TransportMessage::Frame(mut event) => {
                if event.session_id.is_empty() {
                    event.session_id = active;
                }

                let live_label = dominant_by_confidence(&event.emotions).map(str::to_string);
                live.push((event.frame_id, live_label), Instant::now());

                match manager.ingest(event).await? {
                    IngestOutcome::Dropped => debug!("Frame dropped by store"),
                    outcome => debug!(?outcome, "Frame ingested"),
                }

                if let Some((frame_id, emotion)) = live.get_playable_frame(Instant::now()) {
                    debug!(frame_id, emotion = ?emotion, "Live frame");
                }
            }
            TransportMessage::Event(mut event) => {
                if event.session_id.is_empty() {
                    event.session_id = active;
                }
                if let Some(summary) = manager.handle_stream_event(&event)? {
                    info!(
                        session_id = %summary.session_id,
                        recorded = summary.total_recorded,
                        dropped = summary.total_dropped,
                        "Stream ended"
                    );
                    break;
                }
            }
        }
    }

    // end of input is an end of stream
    if manager.active_session_id().is_some() {
        manager.mark_ended()?;
    }
    Ok(())
}

async fn export_session(
    manager: &SessionManager,
    exporter: &ExportPipeline,
    session_id: &str,
    config: &ExportConfig,
) -> Result<()> {
    let snapshot = manager.export_snapshot(session_id)?;

    let artifact = exporter
        .export_json(&snapshot)
        .await
        .context("JSON export failed")?;
    let path = artifact.write_to(&config.output_dir).await?;
    info!(path = %path.display(), frames = snapshot.frame_ids.len(), "Results exported");

    if config.video && !snapshot.frame_ids.is_empty() {
        match exporter.download_video(&snapshot, config.target_fps).await {
            Ok(artifact) => {
                let path = artifact.write_to(&config.output_dir).await?;
                info!(path = %path.display(), format = ?artifact.format, "Video exported");
            }
            Err(e) => warn!(error = %e, "Video export unavailable"),
        }
    }

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(service: &ServiceConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&service.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    match service.log_format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).init(),
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
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
            Ok(mut stream) => {
                stream.recv().await;
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
