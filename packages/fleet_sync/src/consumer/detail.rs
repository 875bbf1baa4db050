//! Single-ATM telemetry consumer.
//!
//! Keeps the latest sample and a newest-first history buffer for one ATM, and
//! raises a notification each time a reading crosses into a bad range.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Clock, Notifier, open_channel};
use crate::config::{DetailConfig, SyncConfig};
use crate::connection::{ConnectionManager, ConnectionStatus};
use crate::error::SyncError;
use crate::history::HistoryBuffer;
use crate::models::TelemetrySample;
use crate::notify::{self, Notification, NotificationLevel, StatusStyle};
use crate::protocol::{Channel, DetailHydration, Inbound, MessageKind, REQUEST_HISTORY, ServerMessage};
use crate::transport::Connector;

const DETAIL_KINDS: [MessageKind; 5] = [
    MessageKind::ConnectionEstablished,
    MessageKind::AtmInitial,
    MessageKind::TelemetryUpdate,
    MessageKind::StatusChange,
    MessageKind::HistoryRequested,
];

/// Immutable view of one ATM's telemetry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetailSnapshot {
    pub atm_id: String,
    pub latest: Option<TelemetrySample>,
    /// Newest first.
    pub history: Vec<TelemetrySample>,
    pub is_loading: bool,
    pub last_update: Option<DateTime<Utc>>,
    pub connection: ConnectionStatus,
}

/// Reducer for the detail channel.
#[derive(Debug, Clone)]
pub struct DetailState {
    atm_id: String,
    latest: Option<TelemetrySample>,
    history: HistoryBuffer<TelemetrySample>,
    low_cash_percent: f64,
    high_temperature_celsius: f64,
    is_loading: bool,
    last_update: Option<DateTime<Utc>>,
}

impl DetailState {
    pub fn new(atm_id: impl Into<String>, config: &DetailConfig) -> Self {
        Self {
            atm_id: atm_id.into(),
            latest: None,
            history: HistoryBuffer::new(config.history_capacity),
            low_cash_percent: config.low_cash_percent,
            high_temperature_celsius: config.high_temperature_celsius,
            is_loading: true,
            last_update: None,
        }
    }

    pub fn atm_id(&self) -> &str {
        &self.atm_id
    }

    pub fn latest(&self) -> Option<&TelemetrySample> {
        self.latest.as_ref()
    }

    pub fn history(&self) -> &HistoryBuffer<TelemetrySample> {
        &self.history
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    /// Apply one message. Messages about other ATMs are ignored.
    pub fn apply(&mut self, inbound: &Inbound, now: DateTime<Utc>) -> Vec<Notification> {
        if inbound.subject().is_some_and(|id| id != self.atm_id) {
            debug!(atm = %self.atm_id, subject = ?inbound.subject(), "Ignoring message for another ATM");
            return Vec::new();
        }
        match &inbound.message {
            ServerMessage::AtmInitial(hydration) => {
                self.hydrate(hydration, now);
                Vec::new()
            }
            ServerMessage::TelemetryUpdate(sample) => self.push_sample(sample.clone(), now),
            ServerMessage::StatusChange(change) => {
                if let Some(latest) = self.latest.as_mut() {
                    let head_is_latest = self.history.latest() == Some(&*latest);
                    latest.status = change.new_status.clone();
                    latest.time = change.timestamp;
                    if head_is_latest {
                        if let Some(head) = self.history.latest_mut() {
                            head.status = change.new_status.clone();
                            head.time = change.timestamp;
                        }
                    }
                }
                self.last_update = Some(now);
                notify::status_change(change, StatusStyle::Detail, now).into_iter().collect()
            }
            ServerMessage::HistoryRequested => vec![
                Notification::new(NotificationLevel::Success, "Telemetry history refreshed", now)
                    .with_description(format!("ATM {}", self.atm_id)),
            ],
            _ => Vec::new(),
        }
    }

    fn hydrate(&mut self, hydration: &DetailHydration, now: DateTime<Utc>) {
        if let Some(history) = &hydration.telemetry_history {
            self.history.replace(history.iter().cloned());
        }
        match &hydration.latest_telemetry {
            Some(latest) => {
                if self.history.latest() != Some(latest) {
                    self.history.push(latest.clone());
                }
                self.latest = Some(latest.clone());
            }
            None => {
                if let Some(head) = self.history.latest() {
                    self.latest = Some(head.clone());
                }
            }
        }
        self.is_loading = false;
        self.last_update = Some(now);
    }

    fn push_sample(&mut self, sample: TelemetrySample, now: DateTime<Utc>) -> Vec<Notification> {
        let notes = self.crossings(&sample, now);
        self.history.push(sample.clone());
        self.latest = Some(sample);
        self.last_update = Some(now);
        notes
    }

    /// Readings that entered a bad range relative to the previous latest sample.
    fn crossings(&self, sample: &TelemetrySample, now: DateTime<Utc>) -> Vec<Notification> {
        let prev = self.latest.as_ref().map(|s| &s.readings);
        let cur = &sample.readings;
        let describe = || format!("ATM {}", self.atm_id);
        let mut notes = Vec::new();

        if let Some(code) = &cur.error_code {
            if prev.and_then(|p| p.error_code.as_ref()) != Some(code) {
                let detail = cur.error_message.as_deref().unwrap_or(code);
                notes.push(
                    Notification::new(NotificationLevel::Error, format!("ATM Error: {detail}"), now)
                        .with_description(describe()),
                );
            }
        }

        let low = self.low_cash_percent;
        let was_low = prev
            .and_then(|p| p.cash_level_percent)
            .is_some_and(|c| c < low);
        if let Some(cash) = cur.cash_level_percent.filter(|c| *c < low) {
            if !was_low {
                notes.push(
                    Notification::new(NotificationLevel::Warning, format!("Low cash level: {cash}%"), now)
                        .with_description(describe()),
                );
            }
        }

        let high = self.high_temperature_celsius;
        let was_hot = prev
            .and_then(|p| p.temperature_celsius)
            .is_some_and(|t| t > high);
        if let Some(temp) = cur.temperature_celsius.filter(|t| *t > high) {
            if !was_hot {
                notes.push(
                    Notification::new(
                        NotificationLevel::Warning,
                        format!("High temperature: {temp}°C"),
                        now,
                    )
                    .with_description(describe()),
                );
            }
        }
        notes
    }

    /// Empty the history buffer. The latest sample is kept.
    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    pub fn snapshot(&self, connection: ConnectionStatus) -> DetailSnapshot {
        DetailSnapshot {
            atm_id: self.atm_id.clone(),
            latest: self.latest.clone(),
            history: self.history.to_vec(),
            is_loading: self.is_loading,
            last_update: self.last_update,
            connection,
        }
    }
}

enum DetailCommand {
    ClearHistory,
}

/// Mounted detail consumer for one ATM.
pub struct DetailConsumer {
    atm_id: String,
    connection: ConnectionManager,
    snapshot: watch::Receiver<DetailSnapshot>,
    notifier: Notifier,
    commands: mpsc::UnboundedSender<DetailCommand>,
    cancel: CancellationToken,
}

impl DetailConsumer {
    /// Open the detail channel for `atm_id` and start applying its messages.
    pub fn mount<C: Connector>(
        atm_id: impl Into<String>,
        config: &SyncConfig,
        connector: C,
    ) -> Result<Self, SyncError> {
        let atm_id = atm_id.into();
        let channel = Channel::AtmDetail(atm_id.clone());
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let connection = open_channel(channel.clone(), &DETAIL_KINDS, inbox_tx, config, connector)?;

        let state = DetailState::new(atm_id.clone(), &config.detail);
        let (snapshot_tx, snapshot_rx) = watch::channel(state.snapshot(connection.status()));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let notifier = Notifier::new(channel);
        let cancel = CancellationToken::new();

        tokio::spawn(run(
            state,
            inbox_rx,
            commands_rx,
            connection.subscribe(),
            snapshot_tx,
            notifier.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            atm_id,
            connection,
            snapshot: snapshot_rx,
            notifier,
            commands: commands_tx,
            cancel,
        })
    }

    pub fn atm_id(&self) -> &str {
        &self.atm_id
    }

    pub fn snapshot(&self) -> DetailSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DetailSnapshot> {
        self.snapshot.clone()
    }

    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifier.subscribe()
    }

    /// Ask the server to resend this ATM's history.
    pub fn request_history(&self) {
        self.connection.send(REQUEST_HISTORY);
    }

    pub fn clear_history(&self) {
        let _ = self.commands.send(DetailCommand::ClearHistory);
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Disconnect and stop every timer owned by this consumer.
    pub fn unmount(self) {
        self.connection.disconnect();
    }
}

impl Drop for DetailConsumer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    mut state: DetailState,
    mut inbox: mpsc::UnboundedReceiver<Inbound>,
    mut commands: mpsc::UnboundedReceiver<DetailCommand>,
    mut status: watch::Receiver<ConnectionStatus>,
    snapshot: watch::Sender<DetailSnapshot>,
    notifier: Notifier,
    cancel: CancellationToken,
) {
    let clock = Clock::start();
    let mut status_open = true;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(inbound) = inbox.recv() => {
                let notes = state.apply(&inbound, clock.now());
                notifier.emit(notes);
            }
            Some(cmd) = commands.recv() => match cmd {
                DetailCommand::ClearHistory => state.clear_history(),
            },
            changed = status.changed(), if status_open => {
                if changed.is_err() {
                    status_open = false;
                }
            }
        }
        let current = status.borrow_and_update().clone();
        snapshot.send_replace(state.snapshot(current));
    }
    debug!(atm = %state.atm_id(), "Detail consumer stopped");
}
