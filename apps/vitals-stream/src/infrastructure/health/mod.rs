//! Health Check, Snapshot and Metrics Endpoint
//!
//! Small HTTP surface over the running monitor.
//!
//! # Endpoints
//!
//! - `GET /health` - JSON health report (503 once reconnection gave up)
//! - `GET /healthz` - Liveness probe (simple OK)
//! - `GET /readyz` - Readiness probe (200 only while connected)
//! - `GET /metrics` - Prometheus metrics in text format
//! - `GET /snapshot` - Current monitor snapshot as JSON

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::MonitorHandle;
use crate::domain::vitals::RosterCounts;
use crate::infrastructure::connection::{ConnectionHandle, ConnectionStatus};
use crate::infrastructure::metrics::get_metrics_handle;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

// =============================================================================
// Health Report
// =============================================================================

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Overall status.
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Seconds since the server state was created.
    pub uptime_secs: u64,
    /// Time the report was built.
    pub current_time: DateTime<Utc>,
    /// Broker connection status.
    pub connection: ConnectionStatus,
    /// Roster counts from the latest snapshot.
    pub students: RosterCounts,
}

/// Coarse service status derived from the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Connected to the broker.
    Healthy,
    /// Not connected, but connecting or still retrying.
    Degraded,
    /// Reconnection gave up.
    Unhealthy,
}

impl HealthStatus {
    /// Classify a connection status.
    #[must_use]
    pub fn from_connection(status: &ConnectionStatus) -> Self {
        if status.exhausted {
            Self::Unhealthy
        } else if status.is_connected() {
            Self::Healthy
        } else {
            Self::Degraded
        }
    }

    /// HTTP status code reported for this status.
    #[must_use]
    pub const fn http_code(self) -> StatusCode {
        match self {
            Self::Healthy | Self::Degraded => StatusCode::OK,
            Self::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

// =============================================================================
// Server
// =============================================================================

/// Handles the endpoints read from.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    connection: ConnectionHandle,
    monitor: MonitorHandle,
}

impl HealthServerState {
    /// Capture the handles; uptime counts from here.
    #[must_use]
    pub fn new(version: String, connection: ConnectionHandle, monitor: MonitorHandle) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            connection,
            monitor,
        }
    }

    fn report(&self) -> HealthResponse {
        let connection = self.connection.status();
        HealthResponse {
            status: HealthStatus::from_connection(&connection),
            version: self.version.clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            current_time: Utc::now(),
            connection,
            students: self.monitor.snapshot().counts,
        }
    }
}

/// Health and snapshot HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a server for `port` on all interfaces.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Bind and serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError::Bind` if the port is unavailable and
    /// `HealthServerError::Serve` if the server stops with an I/O error.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| HealthServerError::Bind {
                port: self.port,
                source,
            })?;

        tracing::info!(%addr, "Health server listening");
        self.serve(listener).await
    }

    /// Serve on an already bound listener until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError::Serve` if the server stops with an I/O
    /// error.
    pub async fn serve(self, listener: TcpListener) -> Result<(), HealthServerError> {
        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(HealthServerError::Serve)?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/healthz", get(|| async { "OK" }))
        .route("/readyz", get(ready))
        .route("/metrics", get(metrics))
        .route("/snapshot", get(snapshot))
        .with_state(state)
}

// =============================================================================
// Handlers
// =============================================================================

async fn health(State(state): State<Arc<HealthServerState>>) -> Response {
    let report = state.report();
    (report.status.http_code(), Json(report)).into_response()
}

async fn ready(State(state): State<Arc<HealthServerState>>) -> Response {
    let status = state.connection.status();
    let code = if status.is_connected() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, status.state.as_str()).into_response()
}

async fn metrics() -> Response {
    match get_metrics_handle() {
        Some(handle) => (
            [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}

async fn snapshot(State(state): State<Arc<HealthServerState>>) -> Response {
    Json(state.monitor.snapshot().as_ref().clone()).into_response()
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// The port could not be bound.
    #[error("failed to bind health server to port {port}")]
    Bind {
        /// Requested port.
        port: u16,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The server stopped with an I/O error.
    #[error("health server failed")]
    Serve(#[source] std::io::Error),
}

// =============================================================================
// Tests
// =============================================================================
