//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `VitalsMonitor`: debounced vitals commits, liveness sweeps and alert
//!   correlation on a single task
//! - `VitalsRequester`: initial, periodic and on-demand vitals requests
//! - `CancellableTimer`: schedule/cancel primitive shared by the drivers

pub mod monitor;
pub mod requester;
pub mod timer;

pub use monitor::{
    AlertSink, MonitorCommand, MonitorHandle, MonitorSettings, MonitorSnapshot, VitalsMonitor,
    VitalsSink,
};
pub use requester::{
    RequestKind, RequesterHandle, RequesterSettings, VitalsRequest, VitalsRequester,
};
pub use timer::CancellableTimer;
