//! REST collaborator: dashboard counters, recent alerts and the ATM page.

use std::time::Duration;

use anyhow::{Context, Result};
use fleet_sync::config::BackendConfig;
use fleet_sync::{AggregateStats, Alert, AtmRecord, Resync, StatsSource, SyncError};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

/// Rows requested per page fetch for `fleet atms`.
pub const PAGE_SIZE: u32 = 100;

#[derive(Debug, Deserialize)]
struct RecentAlerts {
    #[serde(default)]
    alerts: Option<Vec<Alert>>,
}

#[derive(Debug, Deserialize)]
struct AtmPage {
    data: Vec<AtmRecord>,
    #[serde(default)]
    total: u64,
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    backend: BackendConfig,
}

impl ApiClient {
    pub fn new(backend: BackendConfig, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { http, backend })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = self.backend.http_url(path);
        debug!(url = %url, "GET");
        let resp = self
            .http
            .get(&url)
            .query(query)
            .send()
            .await
            .with_context(|| format!("Failed to reach {url}"))?
            .error_for_status()
            .with_context(|| format!("Request to {url} failed"))?;
        resp.json()
            .await
            .with_context(|| format!("Invalid response from {url}"))
    }

    pub async fn fetch_stats(&self) -> Result<AggregateStats> {
        self.get("/dashboard/stats", &[]).await
    }

    /// `None` when the response carries no `alerts` field.
    pub async fn fetch_recent_alerts(&self) -> Result<Option<Vec<Alert>>> {
        let body: RecentAlerts = self.get("/telemetry/alerts/recent", &[]).await?;
        Ok(body.alerts)
    }

    /// First page of the ATM registry.
    pub async fn fetch_atms(&self) -> Result<Vec<AtmRecord>> {
        let page: AtmPage = self
            .get(
                "/atms",
                &[("page", "1".to_string()), ("pageSize", PAGE_SIZE.to_string())],
            )
            .await?;
        if page.total > page.data.len() as u64 {
            debug!(shown = page.data.len(), total = page.total, "ATM list truncated to first page");
        }
        Ok(page.data)
    }
}

impl StatsSource for ApiClient {
    async fn fetch(&self) -> Result<Resync, SyncError> {
        let (stats, alerts) = tokio::join!(self.fetch_stats(), self.fetch_recent_alerts());
        let stats = stats.map_err(|e| SyncError::Fetch(format!("{e:#}")))?;
        // Counters are what the poll is for; stale alerts are tolerable
        let alerts = alerts.unwrap_or_else(|e| {
            warn!(error = %format!("{e:#}"), "Failed to fetch recent alerts");
            None
        });
        Ok(Resync { stats, alerts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_alerts_shape() {
        let body: RecentAlerts = serde_json::from_str(
            r#"{"alerts":[{"alert_id":"a1","atm_id":"ATM-1","severity":"high","title":"Cash low","message":"below 10%","triggered_at":"2024-05-01T10:00:00"}]}"#,
        )
        .unwrap();
        let alerts = body.alerts.unwrap();
        assert_eq!(alerts[0].id, "a1");
        assert!(alerts[0].timestamp.is_some());

        let empty: RecentAlerts = serde_json::from_str("{}").unwrap();
        assert!(empty.alerts.is_none());
    }

    #[test]
    fn test_atm_page_shape() {
        let page: AtmPage = serde_json::from_str(
            r#"{"data":[{"atm_id":"ATM-1","name":"Main St","status":"online"}],"total":1,"page":1,"pageSize":100,"totalPages":1}"#,
        )
        .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.data[0].name, "Main St");
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_a_fetch_error() {
        let mut backend = BackendConfig::default();
        backend.base_url = "http://127.0.0.1:1".into();
        let client = ApiClient::new(backend, Duration::from_secs(2)).unwrap();
        let err = client.fetch().await.unwrap_err();
        assert!(matches!(err, SyncError::Fetch(_)));
    }
}
