//! Fleet list consumer.
//!
//! The list itself comes from the REST collaborator via [`ListConsumer::merge`];
//! the stream only patches statuses in place and records a short-lived marker
//! per changed ATM so the UI can highlight "just changed" rows.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Clock, Notifier, open_channel};
use crate::config::{ListConfig, SyncConfig};
use crate::connection::{ConnectionManager, ConnectionStatus};
use crate::error::SyncError;
use crate::markers::MarkerCache;
use crate::models::{AtmRecord, AtmStatus};
use crate::notify::{self, Notification, StatusStyle};
use crate::protocol::{Channel, Inbound, MessageKind, ServerMessage};
use crate::transport::Connector;

const LIST_KINDS: [MessageKind; 2] = [MessageKind::ConnectionEstablished, MessageKind::StatusChange];

/// "Recently changed" marker for one ATM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusDelta {
    pub atm_id: String,
    pub old_status: AtmStatus,
    pub new_status: AtmStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListSnapshot {
    pub atms: Vec<AtmRecord>,
    /// Live markers keyed by ATM id.
    pub recently_changed: BTreeMap<String, StatusDelta>,
    pub last_update: Option<DateTime<Utc>>,
    pub connection: ConnectionStatus,
}

impl ListSnapshot {
    pub fn is_recently_changed(&self, atm_id: &str) -> bool {
        self.recently_changed.contains_key(atm_id)
    }
}

/// Reducer for the list channel.
#[derive(Debug, Clone)]
pub struct ListState {
    atms: Vec<AtmRecord>,
    markers: MarkerCache<String, StatusDelta>,
    last_update: Option<DateTime<Utc>>,
}

impl ListState {
    pub fn new(config: &ListConfig) -> Self {
        Self {
            atms: Vec::new(),
            markers: MarkerCache::new(config.marker_retention, config.marker_capacity),
            last_update: None,
        }
    }

    pub fn atms(&self) -> &[AtmRecord] {
        &self.atms
    }

    pub fn markers(&self) -> &MarkerCache<String, StatusDelta> {
        &self.markers
    }

    pub fn apply(&mut self, inbound: &Inbound, now: DateTime<Utc>) -> Vec<Notification> {
        let ServerMessage::StatusChange(change) = &inbound.message else {
            return Vec::new();
        };
        match self.atms.iter_mut().find(|a| a.atm_id == change.atm_id) {
            Some(atm) => {
                atm.status = change.new_status.clone();
                atm.updated_at = Some(change.timestamp);
            }
            None => debug!(atm = %change.atm_id, "Status change for ATM not in current page"),
        }
        self.markers.insert(
            change.atm_id.clone(),
            StatusDelta {
                atm_id: change.atm_id.clone(),
                old_status: change.old_status.clone(),
                new_status: change.new_status.clone(),
                timestamp: change.timestamp,
            },
            change.timestamp,
        );
        self.markers.sweep(now);
        self.last_update = Some(now);
        notify::status_change(change, StatusStyle::List, now).into_iter().collect()
    }

    /// Replace the baseline with a freshly fetched page. Markers are kept.
    pub fn merge(&mut self, page: Vec<AtmRecord>, now: DateTime<Utc>) {
        self.atms = page;
        self.last_update = Some(now);
    }

    pub fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        self.markers.sweep(now)
    }

    pub fn clear_markers(&mut self) {
        self.markers.clear();
    }

    pub fn is_recently_changed(&self, atm_id: &str) -> bool {
        self.markers.contains_key(atm_id)
    }

    pub fn snapshot(&self, connection: ConnectionStatus) -> ListSnapshot {
        ListSnapshot {
            atms: self.atms.clone(),
            recently_changed: self
                .markers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            last_update: self.last_update,
            connection,
        }
    }
}

enum ListCommand {
    Merge(Vec<AtmRecord>),
    ClearMarkers,
}

/// Mounted fleet list consumer.
pub struct ListConsumer {
    connection: ConnectionManager,
    snapshot: watch::Receiver<ListSnapshot>,
    notifier: Notifier,
    commands: mpsc::UnboundedSender<ListCommand>,
    cancel: CancellationToken,
}

impl ListConsumer {
    pub fn mount<C: Connector>(config: &SyncConfig, connector: C) -> Result<Self, SyncError> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let connection = open_channel(Channel::AtmList, &LIST_KINDS, inbox_tx, config, connector)?;

        let state = ListState::new(&config.list);
        let (snapshot_tx, snapshot_rx) = watch::channel(state.snapshot(connection.status()));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let notifier = Notifier::new(Channel::AtmList);
        let cancel = CancellationToken::new();

        tokio::spawn(run(
            state,
            config.list.clone(),
            inbox_rx,
            commands_rx,
            connection.subscribe(),
            snapshot_tx,
            notifier.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            connection,
            snapshot: snapshot_rx,
            notifier,
            commands: commands_tx,
            cancel,
        })
    }

    pub fn snapshot(&self) -> ListSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ListSnapshot> {
        self.snapshot.clone()
    }

    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifier.subscribe()
    }

    /// Install a freshly fetched page as the new baseline.
    pub fn merge(&self, page: Vec<AtmRecord>) {
        let _ = self.commands.send(ListCommand::Merge(page));
    }

    pub fn clear_markers(&self) {
        let _ = self.commands.send(ListCommand::ClearMarkers);
    }

    pub fn is_recently_changed(&self, atm_id: &str) -> bool {
        self.snapshot.borrow().is_recently_changed(atm_id)
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Disconnect and stop the sweep timer.
    pub fn unmount(self) {
        self.connection.disconnect();
    }
}

impl Drop for ListConsumer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    mut state: ListState,
    config: ListConfig,
    mut inbox: mpsc::UnboundedReceiver<Inbound>,
    mut commands: mpsc::UnboundedReceiver<ListCommand>,
    mut status: watch::Receiver<ConnectionStatus>,
    snapshot: watch::Sender<ListSnapshot>,
    notifier: Notifier,
    cancel: CancellationToken,
) {
    let clock = Clock::start();
    let period = config.sweep_interval.max(std::time::Duration::from_millis(1));
    let mut sweep = tokio::time::interval_at(Instant::now() + period, period);
    let mut status_open = true;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sweep.tick() => {
                let removed = state.sweep(clock.now());
                if removed > 0 {
                    debug!(removed, "Swept expired status markers");
                }
            }
            Some(inbound) = inbox.recv() => {
                let notes = state.apply(&inbound, clock.now());
                notifier.emit(notes);
            }
            Some(cmd) = commands.recv() => match cmd {
                ListCommand::Merge(page) => state.merge(page, clock.now()),
                ListCommand::ClearMarkers => state.clear_markers(),
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
    debug!("List consumer stopped");
}
