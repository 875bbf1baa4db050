use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::SyncError;
use crate::protocol::Channel;

// =============================================================================
// File config (serde, one section per concern)
// =============================================================================
//
//   [connection]
//   max_reconnect_attempts = 3
//
// Every field has a default, so an empty file is a valid configuration.

/// Top-level tunables for the synchronization layer.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SyncFileConfig {
    #[serde(default)]
    pub backend: BackendFileConfig,
    #[serde(default)]
    pub connection: ConnectionFileConfig,
    #[serde(default)]
    pub detail: DetailFileConfig,
    #[serde(default)]
    pub list: ListFileConfig,
    #[serde(default)]
    pub aggregate: AggregateFileConfig,
}

/// Where the backend lives (`[backend]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendFileConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
}

impl Default for BackendFileConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_prefix: default_api_prefix(),
        }
    }
}

/// Reconnect and heartbeat policy (`[connection]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionFileConfig {
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    /// Double the wait after each failed attempt, up to `max_reconnect_interval_ms`.
    #[serde(default)]
    pub reconnect_backoff: bool,
    #[serde(default = "default_max_reconnect_interval_ms")]
    pub max_reconnect_interval_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

impl Default for ConnectionFileConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_interval_ms: default_reconnect_interval_ms(),
            reconnect_backoff: false,
            max_reconnect_interval_ms: default_max_reconnect_interval_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
        }
    }
}

/// Single-ATM telemetry (`[detail]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DetailFileConfig {
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_low_cash_percent")]
    pub low_cash_percent: f64,
    #[serde(default = "default_high_temperature_celsius")]
    pub high_temperature_celsius: f64,
}

impl Default for DetailFileConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            low_cash_percent: default_low_cash_percent(),
            high_temperature_celsius: default_high_temperature_celsius(),
        }
    }
}

/// Fleet list markers (`[list]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListFileConfig {
    #[serde(default = "default_marker_retention_secs")]
    pub marker_retention_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_marker_capacity")]
    pub marker_capacity: usize,
}

impl Default for ListFileConfig {
    fn default() -> Self {
        Self {
            marker_retention_secs: default_marker_retention_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            marker_capacity: default_marker_capacity(),
        }
    }
}

/// Dashboard counters and alerts (`[aggregate]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AggregateFileConfig {
    #[serde(default = "default_resync_interval_secs")]
    pub resync_interval_secs: u64,
    #[serde(default = "default_max_alerts")]
    pub max_alerts: usize,
}

impl Default for AggregateFileConfig {
    fn default() -> Self {
        Self {
            resync_interval_secs: default_resync_interval_secs(),
            max_alerts: default_max_alerts(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}
fn default_api_prefix() -> String {
    "/api/v1".to_string()
}
fn default_true() -> bool {
    true
}
fn default_reconnect_interval_ms() -> u64 {
    3000
}
fn default_max_reconnect_interval_ms() -> u64 {
    60_000
}
fn default_max_reconnect_attempts() -> u32 {
    10
}
fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_history_capacity() -> usize {
    100
}
fn default_low_cash_percent() -> f64 {
    20.0
}
fn default_high_temperature_celsius() -> f64 {
    45.0
}
fn default_marker_retention_secs() -> u64 {
    30
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_marker_capacity() -> usize {
    1024
}
fn default_resync_interval_secs() -> u64 {
    15
}
fn default_max_alerts() -> usize {
    50
}

// =============================================================================
// Runtime config (durations resolved)
// =============================================================================

#[derive(Clone, Debug, Default)]
pub struct SyncConfig {
    pub backend: BackendConfig,
    pub connection: ConnectionConfig,
    pub detail: DetailConfig,
    pub list: ListConfig,
    pub aggregate: AggregateConfig,
}

impl SyncConfig {
    pub fn from_file(fc: &SyncFileConfig) -> Self {
        Self {
            backend: BackendConfig::from_file(&fc.backend),
            connection: ConnectionConfig::from_file(&fc.connection),
            detail: DetailConfig::from_file(&fc.detail),
            list: ListConfig::from_file(&fc.list),
            aggregate: AggregateConfig::from_file(&fc.aggregate),
        }
    }
}

#[derive(Clone, Debug)]
pub struct BackendConfig {
    pub base_url: String,
    pub api_prefix: String,
}

impl BackendConfig {
    pub fn from_file(fc: &BackendFileConfig) -> Self {
        Self {
            base_url: fc.base_url.clone(),
            api_prefix: fc.api_prefix.clone(),
        }
    }

    /// Socket URL for `channel`.
    pub fn ws_url(&self, channel: &Channel) -> Result<String, SyncError> {
        channel.ws_url(&self.base_url, &self.api_prefix)
    }

    /// REST URL for `path` (leading slash expected).
    pub fn http_url(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        match self.api_prefix.trim_matches('/') {
            "" => format!("{base}{path}"),
            prefix => format!("{base}/{prefix}{path}"),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::from_file(&BackendFileConfig::default())
    }
}

#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub auto_reconnect: bool,
    pub reconnect_interval: Duration,
    pub reconnect_backoff: bool,
    pub max_reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: Duration,
}

impl ConnectionConfig {
    pub fn from_file(fc: &ConnectionFileConfig) -> Self {
        Self {
            auto_reconnect: fc.auto_reconnect,
            reconnect_interval: Duration::from_millis(fc.reconnect_interval_ms),
            reconnect_backoff: fc.reconnect_backoff,
            max_reconnect_interval: Duration::from_millis(fc.max_reconnect_interval_ms),
            max_reconnect_attempts: fc.max_reconnect_attempts,
            heartbeat_interval: Duration::from_secs(fc.heartbeat_interval_secs),
        }
    }

    /// Wait before reconnect attempt number `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        if !self.reconnect_backoff {
            return self.reconnect_interval;
        }
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.reconnect_interval
            .saturating_mul(factor)
            .min(self.max_reconnect_interval)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from_file(&ConnectionFileConfig::default())
    }
}

#[derive(Clone, Debug)]
pub struct DetailConfig {
    pub history_capacity: usize,
    pub low_cash_percent: f64,
    pub high_temperature_celsius: f64,
}

impl DetailConfig {
    pub fn from_file(fc: &DetailFileConfig) -> Self {
        Self {
            history_capacity: fc.history_capacity,
            low_cash_percent: fc.low_cash_percent,
            high_temperature_celsius: fc.high_temperature_celsius,
        }
    }
}

impl Default for DetailConfig {
    fn default() -> Self {
        Self::from_file(&DetailFileConfig::default())
    }
}

#[derive(Clone, Debug)]
pub struct ListConfig {
    pub marker_retention: Duration,
    pub sweep_interval: Duration,
    pub marker_capacity: usize,
}

impl ListConfig {
    pub fn from_file(fc: &ListFileConfig) -> Self {
        Self {
            marker_retention: Duration::from_secs(fc.marker_retention_secs),
            sweep_interval: Duration::from_secs(fc.sweep_interval_secs),
            marker_capacity: fc.marker_capacity,
        }
    }
}

impl Default for ListConfig {
    fn default() -> Self {
        Self::from_file(&ListFileConfig::default())
    }
}

#[derive(Clone, Debug)]
pub struct AggregateConfig {
    pub resync_interval: Duration,
    pub max_alerts: usize,
}

impl AggregateConfig {
    pub fn from_file(fc: &AggregateFileConfig) -> Self {
        Self {
            resync_interval: Duration::from_secs(fc.resync_interval_secs),
            max_alerts: fc.max_alerts,
        }
    }
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self::from_file(&AggregateFileConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.backend.base_url, "http://localhost:8000");
        assert!(config.connection.auto_reconnect);
        assert_eq!(config.connection.reconnect_interval, Duration::from_secs(3));
        assert_eq!(config.connection.max_reconnect_attempts, 10);
        assert_eq!(config.connection.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.detail.history_capacity, 100);
        assert_eq!(config.list.marker_retention, Duration::from_secs(30));
        assert_eq!(config.list.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.aggregate.resync_interval, Duration::from_secs(15));
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let fc: SyncFileConfig =
            serde_json::from_str(r#"{"connection":{"max_reconnect_attempts":3}}"#).unwrap();
        let config = SyncConfig::from_file(&fc);
        assert_eq!(config.connection.max_reconnect_attempts, 3);
        assert_eq!(config.connection.reconnect_interval, Duration::from_secs(3));
        assert_eq!(config.detail.low_cash_percent, 20.0);
    }

    #[test]
    fn test_fixed_retry_delay() {
        let config = ConnectionConfig::default();
        assert_eq!(config.retry_delay(1), Duration::from_secs(3));
        assert_eq!(config.retry_delay(9), Duration::from_secs(3));
    }

    #[test]
    fn test_backoff_retry_delay_is_capped() {
        let config = ConnectionConfig {
            reconnect_backoff: true,
            reconnect_interval: Duration::from_secs(1),
            max_reconnect_interval: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(config.retry_delay(1), Duration::from_secs(1));
        assert_eq!(config.retry_delay(2), Duration::from_secs(2));
        assert_eq!(config.retry_delay(4), Duration::from_secs(8));
        assert_eq!(config.retry_delay(5), Duration::from_secs(10));
        assert_eq!(config.retry_delay(40), Duration::from_secs(10));
    }

    #[test]
    fn test_urls() {
        let backend = BackendConfig::default();
        assert_eq!(
            backend.ws_url(&Channel::Alerts).unwrap(),
            "ws://localhost:8000/api/v1/ws/alerts"
        );
        assert_eq!(
            backend.http_url("/dashboard/stats"),
            "http://localhost:8000/api/v1/dashboard/stats"
        );
    }
}
