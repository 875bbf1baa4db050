//! Real-time synchronization layer for the ATM fleet dashboard.
//!
//! One streaming connection per logical channel (dashboard, ATM list, single
//! ATM detail, alerts). Each connection decodes inbound frames into typed
//! messages and hands them to the consumer that owns the channel; consumers
//! merge them into a cached read model and publish immutable snapshots.
//!
//! - `connection`: connect / heartbeat / reconnect-with-backoff lifecycle
//! - `router`: frame decoding and dispatch by message kind
//! - `consumer`: detail, list and aggregate read models
//! - `transport`: WebSocket and in-memory transports

pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod history;
pub mod markers;
pub mod metrics;
pub mod models;
pub mod notify;
pub mod protocol;
pub mod router;
pub mod transport;

pub use config::{SyncConfig, SyncFileConfig};
pub use connection::{ConnectionManager, ConnectionState, ConnectionStatus};
pub use consumer::aggregate::{AggregateConsumer, AggregateSnapshot, Resync, StatsSource};
pub use consumer::detail::{DetailConsumer, DetailSnapshot};
pub use consumer::list::{ListConsumer, ListSnapshot, StatusDelta};
pub use error::SyncError;
pub use models::{AggregateStats, Alert, AtmRecord, AtmStatus, StatusChange, TelemetrySample};
pub use notify::{Notification, NotificationLevel};
pub use protocol::{Channel, Inbound, MessageKind, ServerMessage};
pub use router::{MessageRouter, RouteOutcome};
pub use transport::memory::MemoryConnector;
pub use transport::ws::WsConnector;
