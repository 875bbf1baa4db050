//! User-facing notifications emitted by consumers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{AtmStatus, StatusChange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for NotificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        })
    }
}

/// A one-shot toast for the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub at: DateTime<Utc>,
}

impl Notification {
    pub fn new(level: NotificationLevel, title: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            level,
            title: title.into(),
            description: None,
            at,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// How a consumer phrases status-change toasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatusStyle {
    /// Fleet list: "{id} changed ...", includes maintenance.
    List,
    /// Dashboard: "ATM {id} changed ...".
    Dashboard,
    /// Single ATM: "Status changed ...", described by the ATM id.
    Detail,
}

pub(crate) fn status_change(
    change: &StatusChange,
    style: StatusStyle,
    at: DateTime<Utc>,
) -> Option<Notification> {
    let (level, description) = match (&change.new_status, &change.old_status) {
        (AtmStatus::Error, _) => (NotificationLevel::Error, "ATM requires attention"),
        (AtmStatus::Offline, _) => (NotificationLevel::Warning, "ATM went offline"),
        (AtmStatus::Online, old) if *old != AtmStatus::Online => {
            (NotificationLevel::Success, "ATM is back online")
        }
        (AtmStatus::Maintenance, _) if style == StatusStyle::List => {
            (NotificationLevel::Info, "ATM is under maintenance")
        }
        _ => return None,
    };
    let transition = format!("changed from {} to {}", change.old_status, change.new_status);
    let notification = match style {
        StatusStyle::List => Notification::new(level, format!("{} {transition}", change.atm_id), at)
            .with_description(description),
        StatusStyle::Dashboard => {
            Notification::new(level, format!("ATM {} {transition}", change.atm_id), at)
                .with_description(description)
        }
        StatusStyle::Detail => Notification::new(level, format!("Status {transition}"), at)
            .with_description(format!("ATM {}", change.atm_id)),
    };
    Some(notification)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(old: AtmStatus, new: AtmStatus) -> StatusChange {
        StatusChange {
            atm_id: "ATM-4".into(),
            old_status: old,
            new_status: new,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn error_transition_is_error_level() {
        let n = status_change(
            &change(AtmStatus::Online, AtmStatus::Error),
            StatusStyle::Dashboard,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(n.level, NotificationLevel::Error);
        assert_eq!(n.title, "ATM ATM-4 changed from online to error");
        assert_eq!(n.description.as_deref(), Some("ATM requires attention"));
    }

    #[test]
    fn online_to_online_is_silent() {
        let c = change(AtmStatus::Online, AtmStatus::Online);
        assert!(status_change(&c, StatusStyle::List, Utc::now()).is_none());
    }

    #[test]
    fn maintenance_only_on_list() {
        let c = change(AtmStatus::Online, AtmStatus::Maintenance);
        let n = status_change(&c, StatusStyle::List, Utc::now()).unwrap();
        assert_eq!(n.level, NotificationLevel::Info);
        assert!(status_change(&c, StatusStyle::Dashboard, Utc::now()).is_none());
        assert!(status_change(&c, StatusStyle::Detail, Utc::now()).is_none());
    }

    #[test]
    fn detail_style_names_the_atm_in_description() {
        let c = change(AtmStatus::Error, AtmStatus::Online);
        let n = status_change(&c, StatusStyle::Detail, Utc::now()).unwrap();
        assert_eq!(n.level, NotificationLevel::Success);
        assert_eq!(n.title, "Status changed from error to online");
        assert_eq!(n.description.as_deref(), Some("ATM ATM-4"));
    }
}
