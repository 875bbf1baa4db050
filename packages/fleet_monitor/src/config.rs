use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use fleet_sync::SyncConfig;
use fleet_sync::config::{
    AggregateFileConfig, BackendFileConfig, ConnectionFileConfig, DetailFileConfig,
    ListFileConfig, SyncFileConfig,
};
use serde::{Deserialize, Serialize};

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [connection]
//                    max_reconnect_attempts = 3
//
//   env var:         FLEET_CONNECTION__MAX_RECONNECT_ATTEMPTS=3   (double underscore = nesting)
//
//   cli:             --base-url https://fleet.example.com  (backend.base_url only)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
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
    #[serde(default)]
    pub monitor: MonitorFileConfig,
}

impl FileConfig {
    fn sync(&self) -> SyncFileConfig {
        SyncFileConfig {
            backend: self.backend.clone(),
            connection: self.connection.clone(),
            detail: self.detail.clone(),
            list: self.list.clone(),
            aggregate: self.aggregate.clone(),
        }
    }
}

/// Binary-only tunables (lives under `[monitor]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitorFileConfig {
    /// How often `fleet atms` refetches the ATM page.
    #[serde(default = "default_page_refresh_secs")]
    pub page_refresh_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for MonitorFileConfig {
    fn default() -> Self {
        Self {
            page_refresh_secs: default_page_refresh_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_page_refresh_secs() -> u64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    10
}

/// Default location of config.toml (`~/.config/fleet/config.toml` on Linux).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("fleet").join("config.toml"))
}

/// Build a figment that layers: defaults → config.toml → FLEET_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `FLEET_BACKEND__BASE_URL=https://fleet.example.com`  →  `backend.base_url`
///   `FLEET_LIST__MARKER_RETENTION_SECS=45`  →  `list.marker_retention_secs = 45`
pub fn load_config(config_path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(FileConfig::default()));
    if let Some(path) = config_path {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed("FLEET_").split("__"))
}

/// Resolved configuration handed to the subcommands.
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    pub sync: SyncConfig,
    pub page_refresh: Duration,
    pub request_timeout: Duration,
}

impl MonitorConfig {
    /// Load config, then apply CLI overrides.
    pub fn new(config_path: Option<PathBuf>, base_url: Option<String>) -> Result<Self> {
        let path = config_path.or_else(default_config_path);
        let mut fc: FileConfig = load_config(path.as_deref())
            .extract()
            .context("Failed to load configuration")?;
        if let Some(base_url) = base_url {
            fc.backend.base_url = base_url;
        }
        Ok(Self::from_file(&fc))
    }

    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            sync: SyncConfig::from_file(&fc.sync()),
            page_refresh: Duration::from_secs(fc.monitor.page_refresh_secs.max(1)),
            request_timeout: Duration::from_secs(fc.monitor.request_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_config_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        let fc: FileConfig = load_config(Some(&path)).extract().unwrap();
        assert_eq!(fc.backend.base_url, "http://localhost:8000");
        assert_eq!(fc.connection.max_reconnect_attempts, 10);
        assert_eq!(fc.monitor.page_refresh_secs, 30);
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(
            &path,
            "[connection]\nmax_reconnect_attempts = 3\n\n[list]\nmarker_retention_secs = 45\n\n[monitor]\npage_refresh_secs = 5\n",
        )
        .unwrap();
        let fc: FileConfig = load_config(Some(&path)).extract().unwrap();
        assert_eq!(fc.connection.max_reconnect_attempts, 3);
        // Untouched keys in a present section keep their defaults
        assert_eq!(fc.connection.reconnect_interval_ms, 3000);
        assert_eq!(fc.list.marker_retention_secs, 45);

        let config = MonitorConfig::from_file(&fc);
        assert_eq!(config.sync.list.marker_retention, Duration::from_secs(45));
        assert_eq!(config.page_refresh, Duration::from_secs(5));
    }

    #[test]
    fn test_missing_file_is_not_an_error() {
        let fc: FileConfig = load_config(Some(Path::new("/nonexistent/fleet/config.toml")))
            .extract()
            .unwrap();
        assert_eq!(fc.aggregate.resync_interval_secs, 15);
    }

    #[test]
    fn test_cli_base_url_overrides_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[backend]\nbase_url = \"http://file:8000\"\n").unwrap();
        let config =
            MonitorConfig::new(Some(path), Some("https://cli.example.com".into())).unwrap();
        assert_eq!(config.sync.backend.base_url, "https://cli.example.com");
    }
}
