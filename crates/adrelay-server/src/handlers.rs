// HTTP request handlers
//
// Chunk ingestion, history polling and health endpoints

use adrelay_handlers::{decode_body, ChunkHeaders, IngestError};
use axum::{
    body::Bytes,
    extract::{
        rejection::{BytesRejection, QueryRejection},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use metrics::{counter, histogram};
use serde::Deserialize;
use serde_json::json;
use std::time::Instant;
use tracing::{debug, info};

use crate::{AppError, AppState};

#[derive(Debug, Deserialize)]
pub(crate) struct DataQuery {
    since: Option<u64>,
}

/// POST /data - chunk ingestion endpoint
pub(crate) async fn post_data(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<impl IntoResponse, AppError> {
    let start = Instant::now();
    let processor = &state.processor;

    let parsed = body
        .map_err(|rejection| body_rejection(rejection, processor.max_payload_bytes()))
        .and_then(|body| {
            let chunk_headers = ChunkHeaders::parse(
                |name| headers.get(name).and_then(|v| v.to_str().ok()),
                processor.max_batch_total(),
            )?;
            let payload = decode_body(&body, processor.max_payload_bytes())?;
            Ok((chunk_headers, payload, body.len()))
        });
    let (chunk_headers, payload, bytes) = match parsed {
        Ok(parsed) => parsed,
        Err(e) => {
            counter!("adrelay.ingest.rejected", 1);
            return Err(e.into());
        }
    };

    debug!(
        request_id = %chunk_headers.request_id,
        batch_id = %chunk_headers.batch_id,
        index = chunk_headers.index,
        total = chunk_headers.total,
        bytes,
        "Received chunk"
    );

    let ack = processor.ingest(chunk_headers, payload)?;

    histogram!(
        "adrelay.ingest.latency_ms",
        start.elapsed().as_secs_f64() * 1000.0
    );

    Ok((StatusCode::OK, Json(ack.to_json())))
}

/// Body extraction stops at the router's limit; report it like any other
/// ingestion error.
fn body_rejection(rejection: BytesRejection, max_payload_bytes: usize) -> IngestError {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        IngestError::PayloadTooLarge {
            limit: max_payload_bytes,
        }
    } else {
        IngestError::InvalidRequest {
            message: rejection.body_text(),
            hint: None,
        }
    }
}

/// GET /data - full history, or entries after `?since=<cursor>`
pub(crate) async fn get_data(
    State(state): State<AppState>,
    query: Result<Query<DataQuery>, QueryRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Query(query) = query.map_err(|rejection| IngestError::InvalidRequest {
        message: rejection.body_text(),
        hint: Some("since must be a non-negative integer entry id".into()),
    })?;
    let processor = &state.processor;

    let body = match query.since {
        Some(cursor) => {
            let slice = processor.history_since(cursor);
            let entries = serde_json::to_value(&slice.entries).map_err(AppError::internal)?;
            json!({
                "success": true,
                "data": entries,
                "notifications": entries,
                "latestId": slice.latest_id,
            })
        }
        None => {
            let entries = processor.history().all();
            json!({
                "success": true,
                "count": entries.len(),
                "data": entries,
                "timestamp": Utc::now(),
            })
        }
    };

    Ok(Json(body))
}

/// DELETE /data - clear history
pub(crate) async fn clear_data(State(state): State<AppState>) -> impl IntoResponse {
    let previous_count = state.processor.clear_history();
    info!(previous_count, "Cleared history");

    Json(json!({
        "success": true,
        "message": "History cleared",
        "previousCount": previous_count,
    }))
}

/// GET /health - liveness plus in-flight batch state
pub(crate) async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let processor = &state.processor;

    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "clients": processor.client_count(),
            "uptime": state.started_at.elapsed().as_secs(),
            "activeBatches": processor.active_batches(),
            "historyCount": processor.history().len(),
        })),
    )
}

/// GET /ready - readiness check
pub(crate) async fn ready_check() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "ready"})))
}
