//! Consumers: per-channel read models.
//!
//! Each consumer is split in two: a plain `*State` reducer that applies one
//! [`Inbound`] message at a time (no I/O, no clock), and a mounted handle that
//! owns the connection(s), runs the reducer on its own task and publishes
//! immutable snapshots on a watch channel. Notifications go out on a
//! broadcast channel.

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::connection::ConnectionManager;
use crate::error::SyncError;
use crate::notify::{Notification, NotificationLevel};
use crate::protocol::{Channel, Inbound, MessageKind};
use crate::router::MessageRouter;
use crate::transport::Connector;

pub mod aggregate;
pub mod detail;
pub mod list;

const NOTIFICATION_CAPACITY: usize = 64;

/// Fan-out of consumer notifications.
#[derive(Debug, Clone)]
pub(crate) struct Notifier {
    tx: broadcast::Sender<Notification>,
    channel: Channel,
}

impl Notifier {
    pub(crate) fn new(channel: Channel) -> Self {
        let (tx, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self { tx, channel }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(&self, notifications: Vec<Notification>) {
        for n in notifications {
            if n.level == NotificationLevel::Error {
                warn!(channel = %self.channel, title = %n.title, "Notification");
            } else {
                debug!(channel = %self.channel, level = %n.level, title = %n.title, "Notification");
            }
            // No subscribers is fine
            let _ = self.tx.send(n);
        }
    }
}

/// Wall clock anchored at mount time and advanced by the tokio clock, so
/// consumer timers and marker ages agree (including under paused test time).
#[derive(Debug, Clone, Copy)]
pub(crate) struct Clock {
    wall: DateTime<Utc>,
    mono: Instant,
}

impl Clock {
    pub(crate) fn start() -> Self {
        Self {
            wall: Utc::now(),
            mono: Instant::now(),
        }
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.wall + TimeDelta::from_std(self.mono.elapsed()).unwrap_or(TimeDelta::zero())
    }
}

/// Spawn a connection for `channel` whose `kinds` land in `inbox`, and connect it.
pub(crate) fn open_channel<C: Connector>(
    channel: Channel,
    kinds: &[MessageKind],
    inbox: mpsc::UnboundedSender<Inbound>,
    config: &SyncConfig,
    connector: C,
) -> Result<ConnectionManager, SyncError> {
    let url = config.backend.ws_url(&channel)?;
    let router = MessageRouter::new(channel).route(kinds, inbox);
    let manager = ConnectionManager::spawn(url, connector, router, config.connection.clone());
    manager.connect();
    Ok(manager)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_notifier_fans_out() {
        let notifier = Notifier::new(Channel::Alerts);
        let mut a = notifier.subscribe();
        let mut b = notifier.subscribe();
        notifier.emit(vec![Notification::new(
            NotificationLevel::Warning,
            "New alert",
            Utc::now(),
        )]);
        assert_eq!(a.recv().await.unwrap().title, "New alert");
        assert_eq!(b.recv().await.unwrap().level, NotificationLevel::Warning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_tokio_time() {
        let clock = Clock::start();
        let before = clock.now();
        tokio::time::sleep(std::time::Duration::from_secs(90)).await;
        let elapsed = clock.now() - before;
        assert!(elapsed >= TimeDelta::seconds(90));
        assert!(elapsed < TimeDelta::seconds(91));
    }

    #[tokio::test]
    async fn test_open_channel_rejects_bad_base_url() {
        let mut config = SyncConfig::default();
        config.backend.base_url = "localhost:8000".into();
        let (connector, _server) = crate::transport::memory::MemoryConnector::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = open_channel(Channel::Alerts, &[], tx, &config, connector);
        assert!(matches!(result, Err(SyncError::InvalidUrl(_))));
    }
}
