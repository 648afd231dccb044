//! Vitals Stream Binary
//!
//! Headless classroom monitor: connects to the broker, tracks one
//! classroom's roster, and serves health and snapshot endpoints.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin vitals-stream
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `VITALS_API_BASE_URL`: REST base URL; the socket endpoint is derived from it
//!
//! ## Optional
//! - `VITALS_AUTH_TOKEN`: Bearer token for the socket handshake
//! - `VITALS_CLASSROOM_ID`: Classroom to monitor (default: every classroom)
//! - `VITALS_ROSTER_FILE`: JSON roster seed file
//! - `VITALS_TASK_ID`: Task whose vitals are requested for every rostered student
//! - `VITALS_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `OTEL_ENABLED`: Enable OpenTelemetry export (default: false)
//! - `RUST_LOG`: Log level (default: info)
//!
//! See `MonitorConfig` for the connection and monitor tuning variables.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use vitals_stream::domain::subscription::CallbackSink;
use vitals_stream::domain::topic::{self, TopicPattern};
use vitals_stream::infrastructure::telemetry;
use vitals_stream::{
    ConnectionDriver, ConnectionHandle, ConnectionOptions, ConnectionState, HealthServer,
    HealthServerState, MonitorConfig, MonitorHandle, Subscription, VitalsMonitor, VitalsRequester,
    WebSocketTransport, init_metrics, load_roster,
};

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting vitals stream");

    let _metrics_handle = init_metrics().context("failed to install Prometheus recorder")?;

    let config = MonitorConfig::from_env().context("invalid configuration")?;
    let endpoint = config.socket_url().context("invalid VITALS_API_BASE_URL")?;
    log_config(&config, &endpoint);

    let roster = match &config.roster_file {
        Some(path) => load_roster(path)?,
        None => Vec::new(),
    };
    tracing::info!(students = roster.len(), "Roster loaded");
    for gap in config.coverage_gaps(roster.len()) {
        tracing::warn!("{}", gap.message());
    }

    let shutdown_token = CancellationToken::new();

    let (driver, connection) = ConnectionDriver::new(
        Arc::new(WebSocketTransport::new()),
        ConnectionOptions::from_connection_settings(endpoint, &config.connection),
        shutdown_token.clone(),
    );
    let (monitor, monitor_handle) =
        VitalsMonitor::new(config.monitor.clone(), shutdown_token.clone());

    let driver_task = tokio::spawn(driver.run());
    let monitor_task = tokio::spawn(monitor.run());

    let requester_task = config.requester.clone().map(|settings| {
        let students = roster.iter().map(|entry| entry.student_id.clone()).collect();
        let (requester, handle) =
            VitalsRequester::new(settings, students, connection.clone(), shutdown_token.clone());
        (tokio::spawn(requester.run()), handle)
    });

    monitor_handle.reset_roster(config.classroom_id.clone(), roster);

    let _subscriptions = attach(&connection, &monitor_handle, config.classroom_id.as_deref());

    connection.connect(config.credential.clone());

    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        connection.clone(),
        monitor_handle.clone(),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracing::info!("Vitals stream ready");

    await_shutdown_signal().await;

    connection.disconnect();
    wait_for_disconnect(&connection).await;
    shutdown_token.cancel();

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        let _ = driver_task.await;
        let _ = monitor_task.await;
        if let Some((task, _handle)) = requester_task {
            let _ = task.await;
        }
    })
    .await
    .is_err()
    {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Tasks did not stop in time"
        );
    }

    tracing::info!("Vitals stream stopped");
    Ok(())
}

/// Subscribe the monitor and the system event logger.
fn attach(
    connection: &ConnectionHandle,
    monitor: &MonitorHandle,
    classroom_id: Option<&str>,
) -> Vec<Subscription> {
    let (vitals_topic, alerts_topic) = classroom_id.map_or_else(
        || {
            (
                topic::ANY_CLASSROOM_VITALS.to_string(),
                topic::ANY_CLASSROOM_ALERTS.to_string(),
            )
        },
        |id| {
            (
                topic::classroom_vitals_topic(id),
                topic::classroom_alerts_topic(id),
            )
        },
    );

    let mut subscriptions = vec![
        connection.subscribe(vitals_topic, Arc::new(monitor.vitals_sink())),
        connection.subscribe(alerts_topic, Arc::new(monitor.alert_sink())),
        connection.subscribe(topic::GLOBAL_ALERTS_TOPIC, Arc::new(monitor.alert_sink())),
    ];

    for system_topic in [
        topic::SYSTEM_CONNECTED,
        topic::SYSTEM_DISCONNECTED,
        topic::SYSTEM_ERROR,
    ] {
        let sink = CallbackSink::new(|message: &vitals_stream::InboundMessage| {
            match message.topic.as_str() {
                topic::SYSTEM_ERROR => {
                    tracing::warn!(payload = %message.payload, "Broker connection error");
                }
                topic::SYSTEM_DISCONNECTED => {
                    tracing::warn!(payload = %message.payload, "Broker disconnected");
                }
                _ => tracing::info!(payload = %message.payload, "Broker connected"),
            }
        });
        subscriptions.push(connection.subscribe(TopicPattern::new(system_topic), Arc::new(sink)));
    }

    subscriptions
}

/// Wait briefly for the close frame to go out.
async fn wait_for_disconnect(connection: &ConnectionHandle) {
    let mut status = connection.watch_status();
    let _ = tokio::time::timeout(
        Duration::from_secs(2),
        status.wait_for(|s| s.state == ConnectionState::Disconnected),
    )
    .await;
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &MonitorConfig, endpoint: &str) {
    tracing::info!(
        endpoint,
        classroom_id = config.classroom_id.as_deref().unwrap_or("*"),
        authenticated = config.credential.is_some(),
        task_id = config.requester.as_ref().map_or("-", |r| r.task_id.as_str()),
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        max_reconnect_attempts = config.connection.max_reconnect_attempts,
        outbound_capacity = config.connection.outbound_capacity,
        overflow = config.connection.outbound_overflow.as_str(),
        commit_delay_ms = config.monitor.commit_delay.as_millis(),
        offline_threshold_secs = config.monitor.offline_threshold.as_secs(),
        "Tuning"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
