//! Per-connection counters for observability
//!
//! Counters never drive behavior; they are read through [`SyncMetrics::snapshot`].

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one channel's connection
#[derive(Debug, Default)]
pub struct SyncMetrics {
    // Inbound
    /// Text frames read off the transport
    pub frames_received: AtomicU64,
    /// "pong" / heartbeat-ack frames dropped by the router
    pub heartbeat_acks: AtomicU64,
    /// Frames that could not be decoded
    pub frames_malformed: AtomicU64,
    /// Frames with a tag nobody handles
    pub frames_unhandled: AtomicU64,
    /// Messages handed to a consumer
    pub messages_dispatched: AtomicU64,

    // Outbound
    pub heartbeats_sent: AtomicU64,
    /// `send()` calls made while not connected
    pub sends_dropped: AtomicU64,

    // Lifecycle
    pub reconnects_scheduled: AtomicU64,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeat_ack(&self) {
        self.heartbeat_acks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_malformed(&self) {
        self.frames_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_unhandled(&self) {
        self.frames_unhandled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dispatched(&self) {
        self.messages_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeat_sent(&self) {
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn send_dropped(&self) {
        self.sends_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnect_scheduled(&self) {
        self.reconnects_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    /// Create a snapshot of all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            inbound: InboundMetrics {
                frames: self.frames_received.load(Ordering::Relaxed),
                heartbeat_acks: self.heartbeat_acks.load(Ordering::Relaxed),
                malformed: self.frames_malformed.load(Ordering::Relaxed),
                unhandled: self.frames_unhandled.load(Ordering::Relaxed),
                dispatched: self.messages_dispatched.load(Ordering::Relaxed),
            },
            outbound: OutboundMetrics {
                heartbeats: self.heartbeats_sent.load(Ordering::Relaxed),
                dropped: self.sends_dropped.load(Ordering::Relaxed),
            },
            reconnects_scheduled: self.reconnects_scheduled.load(Ordering::Relaxed),
        }
    }
}

/// Serializable point-in-time view of [`SyncMetrics`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub inbound: InboundMetrics,
    pub outbound: OutboundMetrics,
    pub reconnects_scheduled: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMetrics {
    pub frames: u64,
    pub heartbeat_acks: u64,
    pub malformed: u64,
    pub unhandled: u64,
    pub dispatched: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMetrics {
    pub heartbeats: u64,
    pub dropped: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = SyncMetrics::new();
        metrics.frame_received();
        metrics.frame_received();
        metrics.heartbeat_ack();
        metrics.message_dispatched();
        metrics.send_dropped();
        metrics.reconnect_scheduled();

        let snap = metrics.snapshot();
        assert_eq!(snap.inbound.frames, 2);
        assert_eq!(snap.inbound.heartbeat_acks, 1);
        assert_eq!(snap.inbound.dispatched, 1);
        assert_eq!(snap.inbound.malformed, 0);
        assert_eq!(snap.outbound.dropped, 1);
        assert_eq!(snap.reconnects_scheduled, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let snap = SyncMetrics::new().snapshot();
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["inbound"]["frames"], 0);
        assert_eq!(json["outbound"]["heartbeats"], 0);
    }
}
