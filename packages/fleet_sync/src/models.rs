//! Domain records carried by the streaming channels and the REST collaborator.

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Operational status of an ATM.
///
/// The server vocabulary is open-ended, so unrecognized statuses are kept
/// verbatim in `Other` instead of failing the whole frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AtmStatus {
    Online,
    Offline,
    Error,
    Maintenance,
    Other(String),
}

impl AtmStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Error => "error",
            Self::Maintenance => "maintenance",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for AtmStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "online" => Self::Online,
            "offline" => Self::Offline,
            "error" => Self::Error,
            "maintenance" => Self::Maintenance,
            _ => Self::Other(s),
        }
    }
}

impl From<AtmStatus> for String {
    fn from(status: AtmStatus) -> Self {
        match status {
            AtmStatus::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl FromStr for AtmStatus {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s.to_string()))
    }
}

impl fmt::Display for AtmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gauges and diagnostics reported with a telemetry sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Readings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cash_level_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_celsius: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_usage_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_usage_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_latency_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// One point of a per-ATM telemetry time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    #[serde(alias = "timestamp", deserialize_with = "timestamp::required")]
    pub time: DateTime<Utc>,
    pub atm_id: String,
    pub status: AtmStatus,
    #[serde(flatten)]
    pub readings: Readings,
}

/// A point status transition for one ATM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub atm_id: String,
    pub old_status: AtmStatus,
    pub new_status: AtmStatus,
    #[serde(deserialize_with = "timestamp::required")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
    Warning,
    Error,
    Other(String),
}

impl AlertSeverity {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Other(s) => s,
        }
    }

    /// Severities that warrant an error-level notification.
    pub fn is_urgent(&self) -> bool {
        matches!(self, Self::High | Self::Critical | Self::Error)
    }
}

impl From<String> for AlertSeverity {
    fn from(s: String) -> Self {
        match s.as_str() {
            "low" => Self::Low,
            "medium" => Self::Medium,
            "high" => Self::High,
            "critical" => Self::Critical,
            "warning" => Self::Warning,
            "error" => Self::Error,
            _ => Self::Other(s),
        }
    }
}

impl From<AlertSeverity> for String {
    fn from(severity: AlertSeverity) -> Self {
        match severity {
            AlertSeverity::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
    #[serde(other)]
    Unknown,
}

/// A user-dismissible alert record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    #[serde(alias = "alert_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atm_id: Option<String>,
    pub severity: AlertSeverity,
    #[serde(default, alias = "type", skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(
        default,
        alias = "triggered_at",
        deserialize_with = "timestamp::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AlertStatus>,
}

impl Alert {
    /// Title if present, otherwise the message.
    pub fn headline(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.message)
    }
}

/// Dashboard-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    #[serde(default)]
    pub total_atms: u64,
    #[serde(default)]
    pub online_atms: u64,
    #[serde(default)]
    pub offline_atms: u64,
    #[serde(default)]
    pub error_atms: u64,
    #[serde(default)]
    pub maintenance_atms: u64,
    #[serde(default)]
    pub total_transactions_today: u64,
    #[serde(default)]
    pub avg_cash_level: f64,
    #[serde(default)]
    pub critical_alerts: u64,
    #[serde(
        default,
        deserialize_with = "timestamp::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_updated: Option<DateTime<Utc>>,
}

impl AggregateStats {
    /// Count for the bucket a status maps to, if it maps to one.
    pub fn bucket(&self, status: &AtmStatus) -> Option<u64> {
        match status {
            AtmStatus::Online => Some(self.online_atms),
            AtmStatus::Offline => Some(self.offline_atms),
            AtmStatus::Error => Some(self.error_atms),
            AtmStatus::Maintenance => Some(self.maintenance_atms),
            AtmStatus::Other(_) => None,
        }
    }

    fn bucket_mut(&mut self, status: &AtmStatus) -> Option<&mut u64> {
        match status {
            AtmStatus::Online => Some(&mut self.online_atms),
            AtmStatus::Offline => Some(&mut self.offline_atms),
            AtmStatus::Error => Some(&mut self.error_atms),
            AtmStatus::Maintenance => Some(&mut self.maintenance_atms),
            AtmStatus::Other(_) => None,
        }
    }

    /// Sum of all status buckets.
    pub fn bucket_total(&self) -> u64 {
        self.online_atms + self.offline_atms + self.error_atms + self.maintenance_atms
    }

    /// Move one ATM from the `old` bucket to the `new` bucket.
    ///
    /// The old bucket is clamped at zero; statuses without a bucket are
    /// skipped on their side of the move. Counters other than the two buckets
    /// and `last_updated` are left alone.
    pub fn apply_status_change(&mut self, old: &AtmStatus, new: &AtmStatus, at: DateTime<Utc>) {
        if old != new {
            if let Some(count) = self.bucket_mut(old) {
                *count = count.saturating_sub(1);
            }
            if let Some(count) = self.bucket_mut(new) {
                *count += 1;
            }
        }
        self.last_updated = Some(at);
    }
}

/// One row of the fleet list as served by the REST collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtmRecord {
    pub atm_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    pub status: AtmStatus,
    #[serde(
        default,
        deserialize_with = "timestamp::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        deserialize_with = "timestamp::optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Parse an ISO-8601 timestamp. Offsets are honored; naive timestamps are
/// taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

pub(crate) mod timestamp {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, de};

    use super::parse_timestamp;

    pub fn required<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse_timestamp(&raw).ok_or_else(|| de::Error::custom(format!("invalid timestamp: {raw}")))
    }

    pub fn optional<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        match Option::<String>::deserialize(d)? {
            None => Ok(None),
            Some(raw) => parse_timestamp(&raw)
                .map(Some)
                .ok_or_else(|| de::Error::custom(format!("invalid timestamp: {raw}"))),
        }
    }
}
