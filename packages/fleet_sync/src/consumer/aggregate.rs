//! Dashboard aggregate consumer.
//!
//! Counters are pulled from a [`StatsSource`] on a fixed cadence and replaced
//! wholesale; between pulls, status changes pushed on the dashboard channel
//! move one ATM between buckets so the numbers react immediately. The pushed
//! adjustments may drift and the next pull corrects them.
//!
//! Alerts are a separate bounded list fed by the pull, the dashboard
//! hydration and the alerts channel.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Clock, Notifier, open_channel};
use crate::config::{AggregateConfig, SyncConfig};
use crate::connection::{ConnectionManager, ConnectionStatus};
use crate::error::SyncError;
use crate::models::{AggregateStats, Alert};
use crate::notify::{self, Notification, NotificationLevel, StatusStyle};
use crate::protocol::{AlertRef, Channel, Inbound, MessageKind, ServerMessage};
use crate::transport::Connector;

const DASHBOARD_KINDS: [MessageKind; 3] = [
    MessageKind::ConnectionEstablished,
    MessageKind::DashboardInitial,
    MessageKind::StatusChange,
];

const ALERT_KINDS: [MessageKind; 5] = [
    MessageKind::ConnectionEstablished,
    MessageKind::AlertsInitial,
    MessageKind::NewAlert,
    MessageKind::AlertUpdated,
    MessageKind::AlertResolved,
];

/// Result of one authoritative pull.
#[derive(Debug, Clone, PartialEq)]
pub struct Resync {
    pub stats: AggregateStats,
    /// `None` leaves the current alert list alone.
    pub alerts: Option<Vec<Alert>>,
}

/// Where the periodic full resync comes from.
pub trait StatsSource: Send + Sync + 'static {
    fn fetch(&self) -> impl Future<Output = Result<Resync, SyncError>> + Send;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateSnapshot {
    pub stats: Option<AggregateStats>,
    /// Newest first.
    pub alerts: Vec<Alert>,
    pub is_loading: bool,
    pub last_update: Option<DateTime<Utc>>,
    /// When `stats` was last replaced by a pull or hydration.
    pub last_stats_update: Option<DateTime<Utc>>,
    pub dashboard_connection: ConnectionStatus,
    pub alerts_connection: ConnectionStatus,
}

/// Reducer for the dashboard and alerts channels.
#[derive(Debug, Clone)]
pub struct AggregateState {
    stats: Option<AggregateStats>,
    alerts: Vec<Alert>,
    max_alerts: usize,
    is_loading: bool,
    last_update: Option<DateTime<Utc>>,
    last_stats_update: Option<DateTime<Utc>>,
}

impl AggregateState {
    pub fn new(config: &AggregateConfig) -> Self {
        Self {
            stats: None,
            alerts: Vec::new(),
            max_alerts: config.max_alerts,
            is_loading: true,
            last_update: None,
            last_stats_update: None,
        }
    }

    pub fn stats(&self) -> Option<&AggregateStats> {
        self.stats.as_ref()
    }

    pub fn alerts(&self) -> &[Alert] {
        &self.alerts
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    /// Overwrite the counters (and alerts, when present) with a pull result.
    pub fn resync(&mut self, resync: Resync, now: DateTime<Utc>) {
        self.replace_stats(resync.stats, now);
        if let Some(alerts) = resync.alerts {
            self.set_alerts(alerts);
        }
    }

    fn replace_stats(&mut self, stats: AggregateStats, now: DateTime<Utc>) {
        self.stats = Some(stats);
        self.is_loading = false;
        self.last_stats_update = Some(now);
        self.last_update = Some(now);
    }

    fn set_alerts(&mut self, mut alerts: Vec<Alert>) {
        alerts.truncate(self.max_alerts);
        self.alerts = alerts;
    }

    pub fn apply(&mut self, inbound: &Inbound, now: DateTime<Utc>) -> Vec<Notification> {
        match &inbound.message {
            ServerMessage::DashboardInitial(hydration) => {
                if let Some(stats) = &hydration.stats {
                    self.replace_stats(stats.clone(), now);
                }
                if let Some(alerts) = &hydration.alerts {
                    self.set_alerts(alerts.clone());
                }
                self.last_update = Some(now);
                Vec::new()
            }
            ServerMessage::AlertsInitial(hydration) => {
                if let Some(alerts) = &hydration.alerts {
                    self.set_alerts(alerts.clone());
                }
                self.last_update = Some(now);
                Vec::new()
            }
            ServerMessage::StatusChange(change) => {
                if let Some(stats) = self.stats.as_mut() {
                    stats.apply_status_change(&change.old_status, &change.new_status, change.timestamp);
                }
                self.last_update = Some(now);
                notify::status_change(change, StatusStyle::Dashboard, now)
                    .into_iter()
                    .collect()
            }
            ServerMessage::NewAlert(alert) => {
                self.alerts.retain(|a| a.id != alert.id);
                self.alerts.insert(0, alert.clone());
                self.alerts.truncate(self.max_alerts);
                self.last_update = Some(now);
                vec![new_alert_notification(alert, now)]
            }
            ServerMessage::AlertUpdated(alert) => {
                match self.alerts.iter_mut().find(|a| a.id == alert.id) {
                    Some(existing) => *existing = alert.clone(),
                    None => debug!(alert = %alert.id, "Update for alert not in list"),
                }
                self.last_update = Some(now);
                Vec::new()
            }
            ServerMessage::AlertResolved(resolved) => {
                self.alerts.retain(|a| a.id != resolved.id);
                self.last_update = Some(now);
                vec![resolved_notification(resolved, now)]
            }
            _ => Vec::new(),
        }
    }

    /// Remove one alert. Returns whether it was present.
    pub fn mark_read(&mut self, alert_id: &str) -> bool {
        let before = self.alerts.len();
        self.alerts.retain(|a| a.id != alert_id);
        self.alerts.len() != before
    }

    pub fn clear_alerts(&mut self) {
        self.alerts.clear();
    }

    pub fn snapshot(
        &self,
        dashboard_connection: ConnectionStatus,
        alerts_connection: ConnectionStatus,
    ) -> AggregateSnapshot {
        AggregateSnapshot {
            stats: self.stats.clone(),
            alerts: self.alerts.clone(),
            is_loading: self.is_loading,
            last_update: self.last_update,
            last_stats_update: self.last_stats_update,
            dashboard_connection,
            alerts_connection,
        }
    }
}

fn new_alert_notification(alert: &Alert, now: DateTime<Utc>) -> Notification {
    let atm = alert.atm_id.as_deref().unwrap_or("unknown");
    if alert.severity.is_urgent() {
        Notification::new(
            NotificationLevel::Error,
            format!("New {} alert: {}", alert.severity, alert.headline()),
            now,
        )
        .with_description(format!("ATM {atm}: {}", alert.message))
    } else {
        Notification::new(
            NotificationLevel::Warning,
            format!("New alert: {}", alert.headline()),
            now,
        )
        .with_description(format!("ATM {atm}"))
    }
}

fn resolved_notification(resolved: &AlertRef, now: DateTime<Utc>) -> Notification {
    let title = resolved.title.as_deref().unwrap_or(&resolved.id);
    let n = Notification::new(NotificationLevel::Success, format!("Alert resolved: {title}"), now);
    match &resolved.atm_id {
        Some(atm) => n.with_description(format!("ATM {atm}")),
        None => n,
    }
}

enum AggregateCommand {
    Refresh,
    MarkRead(String),
    ClearAlerts,
}

/// Mounted dashboard consumer: dashboard and alerts channels plus the poll.
pub struct AggregateConsumer {
    dashboard: ConnectionManager,
    alerts: ConnectionManager,
    snapshot: watch::Receiver<AggregateSnapshot>,
    notifier: Notifier,
    commands: mpsc::UnboundedSender<AggregateCommand>,
    cancel: CancellationToken,
}

impl AggregateConsumer {
    /// Open both channels and start polling `source`; the first pull runs
    /// immediately.
    pub fn mount<C, S>(config: &SyncConfig, connector: C, source: S) -> Result<Self, SyncError>
    where
        C: Connector + Clone,
        S: StatsSource,
    {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let dashboard = open_channel(
            Channel::Dashboard,
            &DASHBOARD_KINDS,
            inbox_tx.clone(),
            config,
            connector.clone(),
        )?;
        let alerts = open_channel(Channel::Alerts, &ALERT_KINDS, inbox_tx, config, connector)?;

        let state = AggregateState::new(&config.aggregate);
        let (snapshot_tx, snapshot_rx) =
            watch::channel(state.snapshot(dashboard.status(), alerts.status()));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let notifier = Notifier::new(Channel::Dashboard);
        let cancel = CancellationToken::new();

        let actor = Actor {
            state,
            config: config.aggregate.clone(),
            source: Arc::new(source),
            inbox: inbox_rx,
            commands: commands_rx,
            dashboard_status: dashboard.subscribe(),
            alerts_status: alerts.subscribe(),
            snapshot: snapshot_tx,
            notifier: notifier.clone(),
            cancel: cancel.clone(),
        };
        tokio::spawn(actor.run());

        Ok(Self {
            dashboard,
            alerts,
            snapshot: snapshot_rx,
            notifier,
            commands: commands_tx,
            cancel,
        })
    }

    pub fn snapshot(&self) -> AggregateSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AggregateSnapshot> {
        self.snapshot.clone()
    }

    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifier.subscribe()
    }

    /// Pull now instead of waiting for the next tick.
    pub fn refresh(&self) {
        let _ = self.commands.send(AggregateCommand::Refresh);
    }

    pub fn mark_read(&self, alert_id: impl Into<String>) {
        let _ = self.commands.send(AggregateCommand::MarkRead(alert_id.into()));
    }

    pub fn clear_alerts(&self) {
        let _ = self.commands.send(AggregateCommand::ClearAlerts);
    }

    pub fn dashboard_connection(&self) -> &ConnectionManager {
        &self.dashboard
    }

    pub fn alerts_connection(&self) -> &ConnectionManager {
        &self.alerts
    }

    /// Disconnect both channels and stop polling.
    pub fn unmount(self) {
        self.dashboard.disconnect();
        self.alerts.disconnect();
    }
}

impl Drop for AggregateConsumer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Actor<S: StatsSource> {
    state: AggregateState,
    config: AggregateConfig,
    source: Arc<S>,
    inbox: mpsc::UnboundedReceiver<Inbound>,
    commands: mpsc::UnboundedReceiver<AggregateCommand>,
    dashboard_status: watch::Receiver<ConnectionStatus>,
    alerts_status: watch::Receiver<ConnectionStatus>,
    snapshot: watch::Sender<AggregateSnapshot>,
    notifier: Notifier,
    cancel: CancellationToken,
}

impl<S: StatsSource> Actor<S> {
    async fn run(mut self) {
        let clock = Clock::start();
        // interval() panics on a zero period
        let period = self.config.resync_interval.max(Duration::from_millis(1));
        let mut poll = tokio::time::interval(period);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let (fetched_tx, mut fetched_rx) = mpsc::unbounded_channel();
        let mut in_flight = false;
        let mut dashboard_open = true;
        let mut alerts_open = true;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = poll.tick() => {
                    if !in_flight {
                        in_flight = true;
                        self.spawn_fetch(&fetched_tx);
                    }
                }
                Some(result) = fetched_rx.recv() => {
                    in_flight = false;
                    match result {
                        Ok(resync) => self.state.resync(resync, clock.now()),
                        Err(e) => warn!(error = %e, "Dashboard resync failed"),
                    }
                }
                Some(inbound) = self.inbox.recv() => {
                    let notes = self.state.apply(&inbound, clock.now());
                    self.notifier.emit(notes);
                }
                Some(cmd) = self.commands.recv() => match cmd {
                    AggregateCommand::Refresh => {
                        if !in_flight {
                            in_flight = true;
                            self.spawn_fetch(&fetched_tx);
                        }
                    }
                    AggregateCommand::MarkRead(id) => {
                        self.state.mark_read(&id);
                    }
                    AggregateCommand::ClearAlerts => self.state.clear_alerts(),
                },
                changed = self.dashboard_status.changed(), if dashboard_open => {
                    dashboard_open = changed.is_ok();
                }
                changed = self.alerts_status.changed(), if alerts_open => {
                    alerts_open = changed.is_ok();
                }
            }
            let dashboard = self.dashboard_status.borrow_and_update().clone();
            let alerts = self.alerts_status.borrow_and_update().clone();
            self.snapshot
                .send_replace(self.state.snapshot(dashboard, alerts));
        }
        debug!("Aggregate consumer stopped");
    }

    /// Run one pull off the actor task so a slow backend never stalls
    /// message processing.
    fn spawn_fetch(&self, done: &mpsc::UnboundedSender<Result<Resync, SyncError>>) {
        let source = self.source.clone();
        let done = done.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                result = source.fetch() => {
                    let _ = done.send(result);
                }
            }
        });
    }
}
