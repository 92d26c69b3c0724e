// Relay server - HTTP ingestion, polling and WebSocket push
//
// Runs anywhere a single process can listen on a port:
// - Docker containers
// - VM instances
// - Local development
//
// Features:
// - Axum HTTP server with WebSocket upgrade
// - Chunked batch reassembly with per-batch timeouts
// - Bounded in-memory history for polling clients
// - Structured logging with tracing
// - Graceful shutdown that delivers partially received batches

use adrelay_config::RuntimeConfig;
use adrelay_handlers::{IngestError, IngestProcessor};
use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

mod handlers;
mod init;
mod ws;

use handlers::{clear_data, get_data, health_check, post_data, ready_check};
pub use init::init_tracing;
use ws::ws_handler;

/// Application state shared across all requests
#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<IngestProcessor>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(processor: Arc<IngestProcessor>) -> Self {
        Self {
            processor,
            started_at: Instant::now(),
        }
    }
}

/// Error type that implements IntoResponse
pub(crate) struct AppError {
    status: StatusCode,
    error: anyhow::Error,
    error_type: Option<&'static str>,
    hint: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("Request error: {:?}", self.error);
        } else {
            warn!(status = self.status.as_u16(), "Rejected request: {}", self.error);
        }

        let mut body = json!({
            "success": false,
            "error": self.error.to_string(),
        });
        if let Some(error_type) = self.error_type {
            body["errorType"] = json!(error_type);
        }
        if let Some(hint) = self.hint {
            body["hint"] = json!(hint);
        }

        (self.status, Json(body)).into_response()
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        let status =
            StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let error_type = err.is_client_error().then(|| err.error_type());
        let hint = err.hint();
        Self {
            status,
            error: err.into(),
            error_type,
            hint,
        }
    }
}

impl AppError {
    pub fn internal<E>(error: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: error.into(),
            error_type: None,
            hint: None,
        }
    }
}

/// Router with every route wired to the given state.
pub fn build_router(state: AppState) -> Router {
    let body_limit = state.processor.max_payload_bytes();

    Router::new()
        .route("/data", get(get_data).post(post_data).delete(clear_data))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}

/// Entry point (loads config automatically)
pub async fn run() -> Result<()> {
    let config = RuntimeConfig::load().context("Failed to load configuration")?;
    run_with_config(config).await
}

/// Entry point with pre-loaded configuration (for CLI usage)
pub async fn run_with_config(config: RuntimeConfig) -> Result<()> {
    init_tracing(&config);

    let addr = config
        .server
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("server config required"))?
        .listen_addr
        .clone();

    info!(
        "Batch reassembly: timeout={}s stale_after={}s max_active={} max_total={}",
        config.batch.timeout_secs,
        config.batch.stale_after_secs,
        config.batch.max_active_batches,
        config.batch.max_total
    );
    info!(
        "History capacity {} entries, max payload {} bytes",
        config.history.capacity, config.request.max_payload_bytes
    );

    let processor = IngestProcessor::from_config(&config);
    let state = AppState::new(Arc::clone(&processor));
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context(format!("Failed to bind to {}", addr))?;

    info!("Relay listening on http://{}", addr);
    info!("Routes:");
    info!("  POST   http://{}/data    - Chunk ingestion", addr);
    info!("  GET    http://{}/data    - History (?since=<cursor> for new entries)", addr);
    info!("  DELETE http://{}/data    - Clear history", addr);
    info!("  GET    ws://{}/ws        - Live push", addr);
    info!("  GET    http://{}/health  - Health check", addr);
    info!("  GET    http://{}/ready   - Readiness check", addr);
    info!("Press Ctrl+C or send SIGTERM to stop");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweep_handle = {
        let processor = Arc::clone(&processor);
        let interval = config.batch.sweep_interval().max(Duration::from_secs(1));
        tokio::spawn(async move {
            run_stale_sweep(processor, shutdown_rx, interval).await;
        })
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Sweep must be stopped before the final drain
    let _ = shutdown_tx.send(true);
    if let Err(e) = sweep_handle.await {
        warn!(error = %e, "Stale sweep task ended abnormally");
    }

    flush_pending_batches(&processor);

    info!("Server shutdown complete");

    Ok(())
}

fn flush_pending_batches(processor: &IngestProcessor) {
    let flushed = processor.drain_all();
    if flushed > 0 {
        info!(
            batch_count = flushed,
            "Delivered buffered batches before shutdown"
        );
    }
}

/// Background task that periodically flushes abandoned batches
async fn run_stale_sweep(
    processor: Arc<IngestProcessor>,
    mut shutdown: watch::Receiver<bool>,
    interval: Duration,
) {
    debug!(
        "Stale sweep task started (interval={}s)",
        interval.as_secs()
    );

    let mut ticker = tokio::time::interval(interval);
    // first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                processor.sweep_stale();
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    debug!("Stale sweep task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use adrelay_batch::AccumulatorConfig;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn sweep_task_flushes_and_stops_on_shutdown() {
        let processor = IngestProcessor::new(
            AccumulatorConfig {
                timeout: Duration::ZERO,
                stale_after: Duration::from_secs(3600),
                max_active_batches: 10,
                ..AccumulatorConfig::default()
            },
            10,
            1024,
        );
        // submitted straight to the accumulator, so no timer backs this batch
        processor
            .accumulator()
            .submit(adrelay_batch::Chunk {
                batch_id: "lost".into(),
                index: 0,
                total: 2,
                payload: json!(1),
            })
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_stale_sweep(
            Arc::clone(&processor),
            rx,
            Duration::from_secs(60),
        ));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(processor.accumulator().is_empty());
        assert_eq!(processor.history().len(), 1);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn ingest_errors_map_to_status_and_type() {
        let err = AppError::from(IngestError::NoPayload);
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.error_type, Some("NoPayload"));
        assert!(err.hint.is_some());

        let err = AppError::from(IngestError::Internal {
            message: "boom".into(),
        });
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.error_type.is_none());
    }
}
