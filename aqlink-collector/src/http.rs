// aqlink Collector - HTTP endpoints
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Health, readiness, status and metrics endpoints.
//!
//! The dispatcher is owned by the main loop; handlers only see the
//! [`Snapshot`] it publishes after every pass.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::info;

use aqlink_gateway::{ConnectionState, ConnectionStatus, DispatchStats};

use crate::metrics::encode_metrics;

/// Broker status as served over HTTP
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrokerView {
    pub name: String,
    pub state: &'static str,
    pub restart_count: u32,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl From<&ConnectionStatus> for BrokerView {
    fn from(status: &ConnectionStatus) -> Self {
        Self {
            name: status.endpoint.clone(),
            state: status.state.as_str(),
            restart_count: status.restart_count,
            consecutive_failures: status.consecutive_failures,
            last_error: status.last_error.clone(),
        }
    }
}

/// What the main loop last published
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    pub running: bool,
    pub stats: DispatchStats,
    pub queue_len: usize,
    pub queue_dropped: u64,
    pub cache_entries: usize,
    pub brokers: Vec<BrokerView>,
}

impl Snapshot {
    /// Running, with at least one source still able to deliver
    pub fn is_ready(&self) -> bool {
        self.running
            && (self.brokers.is_empty()
                || self
                    .brokers
                    .iter()
                    .any(|b| b.state != ConnectionState::Retired.as_str()))
    }
}

/// Application state shared across handlers.
pub struct AppState {
    start_time: Instant,
    snapshot: Mutex<Snapshot>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            snapshot: Mutex::new(Snapshot::default()),
        }
    }

    pub fn publish(&self, snapshot: Snapshot) {
        *self.lock() = snapshot;
    }

    pub fn snapshot(&self) -> Snapshot {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Snapshot> {
        // a panicked writer leaves a whole snapshot behind
        self.snapshot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/status", get(status_handler))
        .with_state(state)
}

/// Serve until the task is aborted
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> std::io::Result<()> {
    let addr: Option<SocketAddr> = listener.local_addr().ok();
    if let Some(addr) = addr {
        info!("Starting server on http://{}", addr);
    }
    axum::serve(listener, router(state)).await
}

async fn root_handler() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html>
<head><title>aqlink Collector</title></head>
<body>
    <h1>aqlink Collector</h1>
    <ul>
        <li><a href="/metrics">/metrics</a> - Prometheus metrics</li>
        <li><a href="/health">/health</a> - Health check</li>
        <li><a href="/ready">/ready</a> - Readiness check</li>
        <li><a href="/status">/status</a> - Status information (JSON)</li>
    </ul>
</body>
</html>"#,
    )
}

async fn metrics_handler() -> impl IntoResponse {
    match encode_metrics() {
        Ok(metrics) => (
            StatusCode::OK,
            [("Content-Type", "text/plain; charset=utf-8")],
            metrics,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("Content-Type", "text/plain; charset=utf-8")],
            e.to_string(),
        ),
    }
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn ready_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.snapshot().is_ready() {
        (StatusCode::OK, "Ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Not ready")
    }
}

/// Status information response.
#[derive(Serialize)]
pub struct StatusResponse {
    version: String,
    uptime_secs: u64,
    #[serde(flatten)]
    snapshot: Snapshot,
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        snapshot: state.snapshot(),
    })
}
