//! Axum route handlers for the aggregation API.

use crate::aggregate::{self, DeviceRecords};
use crate::storage::BlobSource;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use std::sync::Arc;
use std::time::Instant;
use telemetry_types::*;
use tokio::sync::Mutex;

pub struct AppState {
    pub source: Arc<dyn BlobSource>,
    pub start_time: Instant,
    pub last_scan: Arc<Mutex<Option<ScanSummary>>>,
}

#[derive(Debug, Clone)]
pub struct ScanSummary {
    pub at: String,
    pub blobs: usize,
}

/// Read every `.json` blob in the source and group decoded records by device.
pub async fn scan(
    source: &dyn BlobSource,
    device_filter: Option<&str>,
) -> Result<(DeviceRecords, usize), String> {
    let names = source.list_blobs().await?;
    let mut records = DeviceRecords::new();
    let mut processed = 0usize;

    for name in &names {
        log::debug!("[AGGREGATOR] Blob found: {}", name);
        if !name.ends_with(".json") {
            log::warn!("[AGGREGATOR] Found a blob with no .json: {}", name);
            continue;
        }

        let bytes = match source.read_blob(name).await {
            Ok(b) => b,
            Err(e) => {
                log::error!("[AGGREGATOR] Error processing {}: {}", name, e);
                continue;
            }
        };
        let content = String::from_utf8_lossy(&bytes);
        let messages = aggregate::decode_blob(name, &content);
        aggregate::collect_records(&mut records, name, messages, device_filter);
        processed += 1;
    }

    log::info!(
        "[AGGREGATOR] Scanned {} blob(s), {} device(s) matched",
        processed,
        records.len()
    );
    Ok((records, processed))
}

// GET /api/telemetry?avg=yes&device_id=...
pub async fn telemetry(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TelemetryQuery>,
) -> (StatusCode, Json<serde_json::Value>) {
    let filter = query.device_filter();
    let (records, blobs) = match scan(state.source.as_ref(), filter.as_deref()).await {
        Ok(r) => r,
        Err(e) => {
            log::error!("[AGGREGATOR] Scan failed: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e })),
            );
        }
    };

    *state.last_scan.lock().await = Some(ScanSummary {
        at: chrono::Utc::now().to_rfc3339(),
        blobs,
    });

    let body = if query.wants_average() {
        serde_json::to_value(AggregationResponse::new(aggregate::hourly_averages(&records)))
    } else {
        serde_json::to_value(AggregationResponse::new(records))
    };

    match body {
        Ok(v) => (StatusCode::OK, Json(v)),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

// GET /rpc/status
pub async fn status(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<RpcResponse<ServiceStatus>>) {
    let last = state.last_scan.lock().await.clone();
    (
        StatusCode::OK,
        Json(RpcResponse::ok(ServiceStatus {
            running: true,
            uptime_secs: state.start_time.elapsed().as_secs(),
            source: state.source.describe(),
            last_scan_at: last.as_ref().map(|s| s.at.clone()),
            last_scan_blobs: last.map(|s| s.blobs).unwrap_or(0),
        })),
    )
}
