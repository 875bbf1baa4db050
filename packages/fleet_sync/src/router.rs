//! Frame decoding and dispatch by message kind.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::metrics::SyncMetrics;
use crate::protocol::{Channel, Frame, Inbound, MessageKind, decode_frame};

/// What happened to one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    HeartbeatAck,
    Dispatched(MessageKind),
    /// Unknown tag, or a known kind nobody registered for.
    Unhandled(String),
    Malformed,
    /// The registered consumer has gone away.
    Dropped(MessageKind),
}

/// Routes decoded messages to the consumer inbox registered for their kind.
///
/// Registration happens up front through [`MessageRouter::route`]; the table
/// is fixed once the router is handed to a connection.
#[derive(Debug)]
pub struct MessageRouter {
    channel: Channel,
    routes: HashMap<MessageKind, mpsc::UnboundedSender<Inbound>>,
    metrics: Arc<SyncMetrics>,
}

impl MessageRouter {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            routes: HashMap::new(),
            metrics: Arc::new(SyncMetrics::new()),
        }
    }

    /// Send every message of `kinds` to `inbox`. Later registrations win.
    pub fn route(mut self, kinds: &[MessageKind], inbox: mpsc::UnboundedSender<Inbound>) -> Self {
        for kind in kinds {
            self.routes.insert(*kind, inbox.clone());
        }
        self
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.metrics
    }

    pub fn dispatch(&self, text: &str) -> RouteOutcome {
        self.metrics.frame_received();
        match decode_frame(text) {
            Frame::Heartbeat => {
                self.metrics.heartbeat_ack();
                RouteOutcome::HeartbeatAck
            }
            Frame::Malformed(e) => {
                self.metrics.frame_malformed();
                warn!(channel = %self.channel, error = %e, "Dropping malformed frame");
                RouteOutcome::Malformed
            }
            Frame::Unknown { tag } => {
                self.metrics.frame_unhandled();
                debug!(channel = %self.channel, %tag, "Ignoring unknown message type");
                RouteOutcome::Unhandled(tag)
            }
            Frame::Message(inbound) => {
                let kind = inbound.message.kind();
                let Some(inbox) = self.routes.get(&kind) else {
                    self.metrics.frame_unhandled();
                    debug!(channel = %self.channel, tag = %kind, "No handler for message type");
                    return RouteOutcome::Unhandled(kind.tag().to_string());
                };
                if inbox.send(inbound).is_err() {
                    debug!(channel = %self.channel, tag = %kind, "Consumer gone, dropping message");
                    return RouteOutcome::Dropped(kind);
                }
                self.metrics.message_dispatched();
                RouteOutcome::Dispatched(kind)
            }
        }
    }
}
