//! ConnectionManager: one resilient streaming socket per channel.
//!
//! The handle is cheap and synchronous; a spawned actor owns the socket, the
//! heartbeat timer and the reconnect timer, so every lifecycle event and
//! inbound frame for a channel is processed on one task in order. Dropping the
//! handle or calling `disconnect()` cancels all of them together.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use crate::config::ConnectionConfig;
use crate::error::SyncError;
use crate::metrics::SyncMetrics;
use crate::protocol::{Channel, PING};
use crate::router::MessageRouter;
use crate::transport::{Connector, FrameSink, FrameStream, NORMAL_CLOSURE, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        })
    }
}

/// Observable status of one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub last_error: Option<String>,
    /// Reconnect attempts since the last successful open.
    pub attempt: u32,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            last_error: None,
            attempt: 0,
        }
    }
}

#[derive(Debug)]
enum Command {
    Connect,
    Disconnect,
    Reconnect,
    Send(String),
}

/// Handle to a connection actor.
///
/// Must be created inside a tokio runtime.
#[derive(Debug)]
pub struct ConnectionManager {
    channel: Channel,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    metrics: Arc<SyncMetrics>,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    /// Spawn the actor in the Disconnected state. Nothing is opened until
    /// [`connect`](Self::connect) is called.
    pub fn spawn<C: Connector>(
        url: impl Into<String>,
        connector: C,
        router: MessageRouter,
        config: ConnectionConfig,
    ) -> Self {
        let channel = router.channel().clone();
        let metrics = router.metrics().clone();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());
        let shutdown = CancellationToken::new();

        let actor = Actor {
            channel: channel.clone(),
            url: url.into(),
            connector,
            router,
            config,
            commands: commands_rx,
            status: status_tx,
            metrics: metrics.clone(),
            shutdown: shutdown.clone(),
            attempts: 0,
            last_error: None,
        };
        tokio::spawn(actor.run());

        Self {
            channel,
            commands: commands_tx,
            status: status_rx,
            metrics,
            shutdown,
        }
    }

    /// Open the socket. No-op while Connecting or Connected; from Failed it
    /// starts over with a fresh attempt counter.
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Close with "normal closure", cancel heartbeat and reconnect timers and
    /// reset to Disconnected.
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    /// Drop the current socket (if any) and connect again from attempt zero.
    pub fn reconnect(&self) {
        let _ = self.commands.send(Command::Reconnect);
    }

    /// Fire-and-forget. Dropped with a warning unless Connected.
    pub fn send(&self, message: impl Into<String>) {
        if self.state() != ConnectionState::Connected {
            warn!(channel = %self.channel, state = %self.state(), "Cannot send message: not connected");
            self.metrics.send_dropped();
            return;
        }
        let _ = self.commands.send(Command::Send(message.into()));
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn last_error(&self) -> Option<String> {
        self.status.borrow().last_error.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.metrics
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// =============================================================================
// Actor
// =============================================================================

enum Next {
    Idle,
    Connect,
    Shutdown,
}

enum Opened<C: Connector> {
    Session(C::Sink, C::Stream),
    Failed(SyncError),
    Cancelled,
    Restart,
    Shutdown,
}

enum SessionEnd {
    /// Server closed with "normal closure".
    Clean,
    /// Local `disconnect()`.
    Local,
    Unclean,
    Restart,
    Shutdown,
}

enum Retry {
    Now,
    Cancelled,
    Shutdown,
}

struct Actor<C: Connector> {
    channel: Channel,
    url: String,
    connector: C,
    router: MessageRouter,
    config: ConnectionConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<ConnectionStatus>,
    metrics: Arc<SyncMetrics>,
    shutdown: CancellationToken,
    attempts: u32,
    last_error: Option<String>,
}

impl<C: Connector> Actor<C> {
    async fn run(mut self) {
        let mut next = Next::Idle;
        loop {
            next = match next {
                Next::Idle => self.idle().await,
                Next::Connect => self.connect_cycle().await,
                Next::Shutdown => break,
            };
        }
        self.attempts = 0;
        self.publish(ConnectionState::Disconnected);
        debug!(channel = %self.channel, "Connection actor stopped");
    }

    fn publish(&self, state: ConnectionState) {
        self.status.send_replace(ConnectionStatus {
            state,
            last_error: self.last_error.clone(),
            attempt: self.attempts,
        });
    }

    fn current_state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    fn drop_send(&self) {
        warn!(channel = %self.channel, "Cannot send message: not connected");
        self.metrics.send_dropped();
    }

    /// Back to Disconnected after a local disconnect or a clean close.
    fn reset(&mut self) {
        self.attempts = 0;
        self.last_error = None;
        self.publish(ConnectionState::Disconnected);
    }

    /// A new cycle started by `connect()` or `reconnect()`.
    fn start_fresh(&mut self) {
        self.attempts = 0;
        self.last_error = None;
    }

    /// Disconnected or Failed: wait for a command.
    async fn idle(&mut self) -> Next {
        loop {
            let cmd = tokio::select! {
                _ = self.shutdown.cancelled() => return Next::Shutdown,
                cmd = self.commands.recv() => cmd,
            };
            match cmd {
                None => return Next::Shutdown,
                Some(Command::Connect) | Some(Command::Reconnect) => {
                    self.start_fresh();
                    return Next::Connect;
                }
                Some(Command::Disconnect) => {
                    if self.current_state() != ConnectionState::Disconnected {
                        self.reset();
                    }
                }
                Some(Command::Send(_)) => self.drop_send(),
            }
        }
    }

    /// Connect, run the session, and apply the reconnect policy until the
    /// connection is given up or torn down.
    async fn connect_cycle(&mut self) -> Next {
        loop {
            self.publish(ConnectionState::Connecting);
            let end = match self.open().await {
                Opened::Session(sink, stream) => self.session(sink, stream).await,
                Opened::Failed(e) => {
                    warn!(channel = %self.channel, url = %self.url, error = %e, "Connection failed");
                    self.last_error = Some(e.to_string());
                    SessionEnd::Unclean
                }
                Opened::Cancelled => SessionEnd::Local,
                Opened::Restart => SessionEnd::Restart,
                Opened::Shutdown => SessionEnd::Shutdown,
            };

            match end {
                SessionEnd::Clean | SessionEnd::Local => {
                    self.reset();
                    return Next::Idle;
                }
                SessionEnd::Shutdown => return Next::Shutdown,
                SessionEnd::Restart => {
                    self.start_fresh();
                    continue;
                }
                SessionEnd::Unclean => {}
            }

            if !self.config.auto_reconnect {
                // Keeps last_error so the drop stays visible
                self.attempts = 0;
                self.publish(ConnectionState::Disconnected);
                return Next::Idle;
            }
            if self.attempts >= self.config.max_reconnect_attempts {
                self.last_error = Some(SyncError::RetriesExhausted.to_string());
                error!(
                    channel = %self.channel,
                    attempts = self.attempts,
                    "Maximum reconnection attempts reached"
                );
                self.publish(ConnectionState::Failed);
                return Next::Idle;
            }

            self.attempts += 1;
            self.metrics.reconnect_scheduled();
            let delay = self.config.retry_delay(self.attempts);
            self.publish(ConnectionState::Reconnecting);
            info!(
                channel = %self.channel,
                attempt = self.attempts,
                max = self.config.max_reconnect_attempts,
                delay_ms = delay.as_millis() as u64,
                "Scheduling reconnect"
            );
            match self.wait_for_retry(delay).await {
                Retry::Now => {}
                Retry::Cancelled => {
                    self.reset();
                    return Next::Idle;
                }
                Retry::Shutdown => return Next::Shutdown,
            }
        }
    }

    async fn open(&mut self) -> Opened<C> {
        let connect = self.connector.connect(&self.url);
        tokio::pin!(connect);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Opened::Shutdown,
                result = &mut connect => {
                    return match result {
                        Ok((sink, stream)) => Opened::Session(sink, stream),
                        Err(e) => Opened::Failed(e),
                    };
                }
                cmd = self.commands.recv() => match cmd {
                    None => return Opened::Shutdown,
                    Some(Command::Disconnect) => return Opened::Cancelled,
                    Some(Command::Reconnect) => return Opened::Restart,
                    Some(Command::Connect) => {}
                    Some(Command::Send(_)) => self.drop_send(),
                },
            }
        }
    }

    async fn session(&mut self, mut sink: C::Sink, mut stream: C::Stream) -> SessionEnd {
        self.attempts = 0;
        self.last_error = None;
        self.publish(ConnectionState::Connected);
        info!(channel = %self.channel, url = %self.url, "Connected");

        let period = self.config.heartbeat_interval.max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    sink.close(NORMAL_CLOSURE, "client shutdown").await;
                    return SessionEnd::Shutdown;
                }
                _ = heartbeat.tick() => {
                    match sink.send_text(PING.to_string()).await {
                        Ok(()) => self.metrics.heartbeat_sent(),
                        Err(e) => warn!(channel = %self.channel, error = %e, "Heartbeat send failed"),
                    }
                }
                event = stream.next_event() => match event {
                    TransportEvent::Frame(text) => {
                        self.router.dispatch(&text);
                    }
                    TransportEvent::Error(e) => {
                        warn!(channel = %self.channel, error = %e, "Transport error");
                        self.last_error = Some(e);
                        self.publish(ConnectionState::Connected);
                    }
                    TransportEvent::Closed { .. } if event.is_clean_close() => {
                        info!(channel = %self.channel, "Connection closed normally");
                        return SessionEnd::Clean;
                    }
                    TransportEvent::Closed { code, reason } => {
                        info!(channel = %self.channel, code = ?code, %reason, "Connection closed");
                        if self.last_error.is_none() {
                            self.last_error = Some(match code {
                                Some(code) => format!("connection closed with code {code}"),
                                None => "connection lost".to_string(),
                            });
                        }
                        return SessionEnd::Unclean;
                    }
                },
                cmd = self.commands.recv() => match cmd {
                    None => {
                        sink.close(NORMAL_CLOSURE, "client shutdown").await;
                        return SessionEnd::Shutdown;
                    }
                    Some(Command::Disconnect) => {
                        sink.close(NORMAL_CLOSURE, "client disconnect").await;
                        return SessionEnd::Local;
                    }
                    Some(Command::Reconnect) => {
                        sink.close(NORMAL_CLOSURE, "client reconnect").await;
                        return SessionEnd::Restart;
                    }
                    Some(Command::Connect) => {}
                    Some(Command::Send(text)) => {
                        if let Err(e) = sink.send_text(text).await {
                            warn!(channel = %self.channel, error = %e, "Send failed");
                        }
                    }
                },
            }
        }
    }

    async fn wait_for_retry(&mut self, delay: Duration) -> Retry {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Retry::Shutdown,
                _ = &mut sleep => return Retry::Now,
                cmd = self.commands.recv() => match cmd {
                    None => return Retry::Shutdown,
                    Some(Command::Connect) => return Retry::Now,
                    Some(Command::Reconnect) => {
                        self.start_fresh();
                        return Retry::Now;
                    }
                    Some(Command::Disconnect) => return Retry::Cancelled,
                    Some(Command::Send(_)) => self.drop_send(),
                },
            }
        }
    }
}
