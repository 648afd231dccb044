//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, and the broker connection driver.

/// Broker connection driver, heartbeat, backoff and outbound buffer.
pub mod connection;

/// JSON envelope codec for broker frames.
pub mod codec;

/// Transport adapters (WebSocket, in-memory).
pub mod transport;

/// Configuration from environment variables.
pub mod config;

/// Roster seed file loading.
pub mod roster;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Tracing and OpenTelemetry setup.
pub mod telemetry;
