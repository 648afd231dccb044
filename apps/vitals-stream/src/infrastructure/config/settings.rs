//! Monitor Configuration Settings
//!
//! Configuration types for the vitals monitor, loaded from environment
//! variables. Unparsable optional values fall back to their defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::application::ports::{Credential, TransportError};
use crate::application::services::{MonitorSettings, RequesterSettings};
use crate::domain::vitals::StatusThresholds;
use crate::infrastructure::connection::OverflowPolicy;
use crate::infrastructure::transport::derive_socket_url;

/// Broker connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Heartbeat ping interval.
    pub heartbeat_interval: Duration,
    /// Inbound silence before the link is considered dead.
    pub heartbeat_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Upper bound of the additive jitter.
    pub reconnect_jitter_max: Duration,
    /// Reconnection attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Delay between teardown and the new attempt of an explicit reconnect.
    pub reconnect_settle: Duration,
    /// Pacing of the outbound buffer drain.
    pub flush_interval: Duration,
    /// Outbound buffer bound.
    pub outbound_capacity: usize,
    /// What to do when the outbound buffer is full.
    pub outbound_overflow: OverflowPolicy,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            reconnect_delay_initial: Duration::from_millis(2000),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 1.5,
            reconnect_jitter_max: Duration::from_millis(1000),
            max_reconnect_attempts: 5,
            reconnect_settle: Duration::from_millis(500),
            flush_interval: Duration::from_millis(50),
            outbound_capacity: 256,
            outbound_overflow: OverflowPolicy::DropOldest,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Complete monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// REST base URL of the backend.
    pub api_base_url: String,
    /// Bearer credential for the socket handshake.
    pub credential: Option<Credential>,
    /// Classroom to monitor; `None` follows every classroom.
    pub classroom_id: Option<String>,
    /// JSON roster seed file.
    pub roster_file: Option<PathBuf>,
    /// Server port settings.
    pub server: ServerSettings,
    /// Broker connection settings.
    pub connection: ConnectionSettings,
    /// Reducer, liveness and alert settings.
    pub monitor: MonitorSettings,
    /// Vitals push requests; `None` when no task id is configured.
    pub requester: Option<RequesterSettings>,
}

impl MonitorConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if required variables are missing or empty.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let api_base_url = env
            .get("VITALS_API_BASE_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("VITALS_API_BASE_URL".to_string()))?;
        if api_base_url.trim().is_empty() {
            return Err(ConfigError::EmptyValue("VITALS_API_BASE_URL".to_string()));
        }

        let credential = env.non_empty("VITALS_AUTH_TOKEN").map(Credential::new);
        let classroom_id = env.non_empty("VITALS_CLASSROOM_ID");
        let roster_file = env.non_empty("VITALS_ROSTER_FILE").map(PathBuf::from);

        let server = ServerSettings {
            health_port: env.parse("VITALS_HEALTH_PORT", ServerSettings::default().health_port),
        };

        let defaults = ConnectionSettings::default();
        let connection = ConnectionSettings {
            heartbeat_interval: env.period_secs(
                "VITALS_HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval,
            ),
            heartbeat_timeout: env
                .period_secs("VITALS_HEARTBEAT_TIMEOUT_SECS", defaults.heartbeat_timeout),
            reconnect_delay_initial: env.duration_millis(
                "VITALS_RECONNECT_DELAY_INITIAL_MS",
                defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: env.duration_secs(
                "VITALS_RECONNECT_DELAY_MAX_SECS",
                defaults.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: env.parse(
                "VITALS_RECONNECT_DELAY_MULTIPLIER",
                defaults.reconnect_delay_multiplier,
            ),
            reconnect_jitter_max: env.duration_millis(
                "VITALS_RECONNECT_JITTER_MAX_MS",
                defaults.reconnect_jitter_max,
            ),
            max_reconnect_attempts: env.parse(
                "VITALS_MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            ),
            reconnect_settle: env
                .duration_millis("VITALS_RECONNECT_SETTLE_MS", defaults.reconnect_settle),
            flush_interval: env.duration_millis("VITALS_FLUSH_INTERVAL_MS", defaults.flush_interval),
            outbound_capacity: env.parse("VITALS_OUTBOUND_CAPACITY", defaults.outbound_capacity),
            outbound_overflow: env
                .non_empty("VITALS_OUTBOUND_OVERFLOW")
                .map_or(defaults.outbound_overflow, |s| {
                    OverflowPolicy::from_str_case_insensitive(&s)
                }),
        };

        let defaults = MonitorSettings::default();
        let monitor = MonitorSettings {
            commit_delay: env.duration_millis("VITALS_COMMIT_DELAY_MS", defaults.commit_delay),
            sweep_interval: env
                .period_secs("VITALS_SWEEP_INTERVAL_SECS", defaults.sweep_interval),
            offline_threshold: env.duration_secs(
                "VITALS_OFFLINE_THRESHOLD_SECS",
                defaults.offline_threshold,
            ),
            alert_hold: env.duration_secs("VITALS_ALERT_HOLD_SECS", defaults.alert_hold),
            alert_log_capacity: env
                .parse("VITALS_ALERT_LOG_CAPACITY", defaults.alert_log_capacity),
            thresholds: StatusThresholds {
                resting_heart_rate_max: env.parse(
                    "VITALS_RESTING_HEART_RATE_MAX",
                    defaults.thresholds.resting_heart_rate_max,
                ),
                min_oxygen_saturation: env.parse(
                    "VITALS_MIN_OXYGEN_SATURATION",
                    defaults.thresholds.min_oxygen_saturation,
                ),
            },
        };

        let requester = env.non_empty("VITALS_TASK_ID").map(|task_id| {
            let defaults = RequesterSettings::new(task_id);
            RequesterSettings {
                interval: env.period_secs("VITALS_REQUEST_INTERVAL_SECS", defaults.interval),
                ..defaults
            }
        });

        Ok(Self {
            api_base_url,
            credential,
            classroom_id,
            roster_file,
            server,
            connection,
            monitor,
            requester,
        })
    }

    /// Reasons this configuration, with a roster of `roster_len`
    /// students, will not receive any vitals.
    #[must_use]
    pub fn coverage_gaps(&self, roster_len: usize) -> Vec<CoverageGap> {
        let mut gaps = Vec::new();
        if self.classroom_id.is_none() {
            gaps.push(CoverageGap::NoClassroom);
        }
        if roster_len == 0 {
            gaps.push(CoverageGap::EmptyRoster);
        }
        gaps
    }

    /// Socket endpoint derived from the REST base URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL has an unsupported scheme.
    pub fn socket_url(&self) -> Result<String, TransportError> {
        derive_socket_url(&self.api_base_url)
    }
}

/// Configuration that leaves the monitor without vitals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverageGap {
    /// No classroom id: the `+` wildcard topics are matched locally and
    /// never registered with the broker, so no classroom traffic arrives.
    NoClassroom,
    /// Empty roster: every sample is out of scope and dropped.
    EmptyRoster,
}

impl CoverageGap {
    /// Log message for this gap.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::NoClassroom => {
                "VITALS_CLASSROOM_ID is unset; wildcard classroom topics are not registered with the broker"
            }
            Self::EmptyRoster => "Roster is empty; every vitals sample will be dropped as out of scope",
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn non_empty(&self, key: &str) -> Option<String> {
        self.get(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn duration_secs(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .map_or(default, Duration::from_secs)
    }

    /// Like `duration_secs`, but zero falls back to the default.
    fn period_secs(&self, key: &str, default: Duration) -> Duration {
        Some(self.duration_secs(key, default))
            .filter(|period| !period.is_zero())
            .unwrap_or(default)
    }

    fn duration_millis(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .map_or(default, Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<MonitorConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        MonitorConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn requires_api_base_url() {
        assert!(matches!(
            config_from(&[]),
            Err(ConfigError::MissingEnvVar(ref key)) if key == "VITALS_API_BASE_URL"
        ));
        assert!(matches!(
            config_from(&[("VITALS_API_BASE_URL", "  ")]),
            Err(ConfigError::EmptyValue(_))
        ));
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = config_from(&[("VITALS_API_BASE_URL", "https://stathis.app/api")]).unwrap();

        assert!(config.credential.is_none());
        assert!(config.classroom_id.is_none());
        assert!(config.roster_file.is_none());
        assert_eq!(config.server.health_port, 8083);

        let connection = &config.connection;
        assert_eq!(connection.reconnect_delay_initial, Duration::from_secs(2));
        assert_eq!(connection.reconnect_delay_max, Duration::from_secs(30));
        assert!((connection.reconnect_delay_multiplier - 1.5).abs() < f64::EPSILON);
        assert_eq!(connection.reconnect_jitter_max, Duration::from_millis(1000));
        assert_eq!(connection.max_reconnect_attempts, 5);
        assert_eq!(connection.outbound_capacity, 256);
        assert_eq!(connection.outbound_overflow, OverflowPolicy::DropOldest);

        assert_eq!(config.monitor.commit_delay, Duration::from_millis(500));
        assert_eq!(config.monitor.offline_threshold, Duration::from_secs(30));
        assert_eq!(config.monitor.alert_log_capacity, 200);

        assert_eq!(config.socket_url().unwrap(), "wss://stathis.app/ws");
    }

    #[test]
    fn reads_overrides() {
        let config = config_from(&[
            ("VITALS_API_BASE_URL", "http://localhost:8080"),
            ("VITALS_AUTH_TOKEN", "secret-token"),
            ("VITALS_CLASSROOM_ID", "room-7"),
            ("VITALS_ROSTER_FILE", "/etc/roster.json"),
            ("VITALS_HEALTH_PORT", "9000"),
            ("VITALS_MAX_RECONNECT_ATTEMPTS", "10"),
            ("VITALS_OUTBOUND_OVERFLOW", "reject-new"),
            ("VITALS_COMMIT_DELAY_MS", "250"),
            ("VITALS_RESTING_HEART_RATE_MAX", "110"),
        ])
        .unwrap();

        assert_eq!(
            config.credential.as_ref().map(Credential::expose),
            Some("secret-token")
        );
        assert_eq!(config.classroom_id.as_deref(), Some("room-7"));
        assert_eq!(config.roster_file, Some(PathBuf::from("/etc/roster.json")));
        assert_eq!(config.server.health_port, 9000);
        assert_eq!(config.connection.max_reconnect_attempts, 10);
        assert_eq!(config.connection.outbound_overflow, OverflowPolicy::RejectNew);
        assert_eq!(config.monitor.commit_delay, Duration::from_millis(250));
        assert!((config.monitor.thresholds.resting_heart_rate_max - 110.0).abs() < f64::EPSILON);
        assert_eq!(config.socket_url().unwrap(), "ws://localhost:8080/ws");
    }

    #[test]
    fn unparsable_values_fall_back_to_defaults() {
        let config = config_from(&[
            ("VITALS_API_BASE_URL", "http://localhost"),
            ("VITALS_HEALTH_PORT", "not-a-port"),
            ("VITALS_RECONNECT_DELAY_MULTIPLIER", "fast"),
            ("VITALS_CLASSROOM_ID", ""),
        ])
        .unwrap();

        assert_eq!(config.server.health_port, 8083);
        assert!((config.connection.reconnect_delay_multiplier - 1.5).abs() < f64::EPSILON);
        assert!(config.classroom_id.is_none());
    }

    #[test]
    fn zero_periods_fall_back_to_defaults() {
        let config = config_from(&[
            ("VITALS_API_BASE_URL", "http://localhost"),
            ("VITALS_SWEEP_INTERVAL_SECS", "0"),
            ("VITALS_HEARTBEAT_INTERVAL_SECS", "0"),
            ("VITALS_HEARTBEAT_TIMEOUT_SECS", "0"),
            ("VITALS_COMMIT_DELAY_MS", "0"),
        ])
        .unwrap();

        assert_eq!(config.monitor.sweep_interval, Duration::from_secs(5));
        assert_eq!(config.connection.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.connection.heartbeat_timeout, Duration::from_secs(60));
        assert_eq!(config.monitor.commit_delay, Duration::ZERO);
    }

    #[test]
    fn missing_scope_is_reported() {
        let config = config_from(&[("VITALS_API_BASE_URL", "http://localhost")]).unwrap();
        assert_eq!(
            config.coverage_gaps(0),
            vec![CoverageGap::NoClassroom, CoverageGap::EmptyRoster]
        );

        let config = config_from(&[
            ("VITALS_API_BASE_URL", "http://localhost"),
            ("VITALS_CLASSROOM_ID", "c1"),
        ])
        .unwrap();
        assert_eq!(config.coverage_gaps(0), vec![CoverageGap::EmptyRoster]);
        assert!(config.coverage_gaps(3).is_empty());
    }

    #[test]
    fn requester_needs_a_task_id() {
        let config = config_from(&[("VITALS_API_BASE_URL", "http://localhost")]).unwrap();
        assert!(config.requester.is_none());

        let config = config_from(&[
            ("VITALS_API_BASE_URL", "http://localhost"),
            ("VITALS_TASK_ID", " task-9 "),
            ("VITALS_REQUEST_INTERVAL_SECS", "0"),
        ])
        .unwrap();
        let requester = config.requester.unwrap();
        assert_eq!(requester.task_id, "task-9");
        assert_eq!(requester.interval, Duration::from_secs(10));
    }

    #[test]
    fn credential_is_redacted_in_debug() {
        let config = config_from(&[
            ("VITALS_API_BASE_URL", "http://localhost"),
            ("VITALS_AUTH_TOKEN", "super-secret"),
        ])
        .unwrap();

        let debug = format!("{config:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("REDACTED"));
    }
}
