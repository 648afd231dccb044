//! Configuration Module
//!
//! Environment-driven configuration for the vitals monitor.

mod settings;

pub use settings::{
    ConfigError, ConnectionSettings, CoverageGap, MonitorConfig, ServerSettings,
};
