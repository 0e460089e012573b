//! Telemetry Aggregator: scans stored telemetry and serves per-device
//! hourly statistics.
//!
//! Default: http://127.0.0.1:9110/api/telemetry?avg=yes

mod aggregate;
mod routes;
mod storage;

use routes::AppState;
use std::sync::Arc;
use std::time::Instant;
use storage::BlobSource;
use tokio::sync::Mutex;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    env_logger::init();

    let port: u16 = std::env::var("TELEMETRY_AGGREGATOR_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(9110);

    let source: Arc<dyn BlobSource> = match std::env::var("TELEMETRY_CONTAINER_SAS_URL") {
        Ok(url) => Arc::new(
            storage::ContainerClient::from_sas_url(&url).expect("Invalid TELEMETRY_CONTAINER_SAS_URL"),
        ),
        Err(_) => {
            let dir = std::env::var("TELEMETRY_STORE_DIR").unwrap_or_else(|_| "./telemetry".to_string());
            log::warn!("TELEMETRY_CONTAINER_SAS_URL not set, reading blobs from {}", dir);
            Arc::new(storage::LocalDirSource::new(dir))
        }
    };
    log::info!("Telemetry source: {}", source.describe());

    let state = Arc::new(AppState {
        source,
        start_time: Instant::now(),
        last_scan: Arc::new(Mutex::new(None)),
    });

    let cors = tower_http::cors::CorsLayer::permissive();

    let app = axum::Router::new()
        .route("/api/telemetry", axum::routing::get(routes::telemetry))
        .route("/rpc/status", axum::routing::get(routes::status))
        .with_state(state)
        .layer(cors);

    let addr = format!("127.0.0.1:{}", port);
    log::info!("Telemetry Aggregator listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind");

    axum::serve(listener, app).await.expect("Server error");
}
