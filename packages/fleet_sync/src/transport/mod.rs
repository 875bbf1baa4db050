//! Transport abstraction
//!
//! The connection manager only needs three things from a socket: open it,
//! write text frames to one half, and read lifecycle events from the other.
//!
//! - `ws`: WebSocket via tokio-tungstenite
//! - `memory`: in-process transport driven by a test-side remote

use std::future::Future;

use crate::error::SyncError;

pub mod memory;
pub mod ws;

/// WebSocket "normal closure" code.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Something observed on the read half.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(String),
    /// Transport-level error. A `Closed` event follows once the socket is gone.
    Error(String),
    /// Socket closed; `code` is `None` when no close frame was received.
    Closed { code: Option<u16>, reason: String },
}

impl TransportEvent {
    pub fn is_clean_close(&self) -> bool {
        matches!(self, Self::Closed { code: Some(NORMAL_CLOSURE), .. })
    }
}

/// Write half.
pub trait FrameSink: Send + 'static {
    fn send_text(&mut self, text: String) -> impl Future<Output = Result<(), SyncError>> + Send;

    /// Send a close frame and shut the write half. Best effort.
    fn close(&mut self, code: u16, reason: &str) -> impl Future<Output = ()> + Send;
}

/// Read half. Once `Closed` is returned every later call returns `Closed`.
pub trait FrameStream: Send + 'static {
    fn next_event(&mut self) -> impl Future<Output = TransportEvent> + Send;
}

/// Opens sockets for a connection manager.
pub trait Connector: Send + Sync + 'static {
    type Sink: FrameSink;
    type Stream: FrameStream;

    fn connect(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<(Self::Sink, Self::Stream), SyncError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_normal_closure_is_clean() {
        let clean = TransportEvent::Closed {
            code: Some(NORMAL_CLOSURE),
            reason: String::new(),
        };
        let abnormal = TransportEvent::Closed {
            code: Some(1006),
            reason: String::new(),
        };
        let no_frame = TransportEvent::Closed {
            code: None,
            reason: String::new(),
        };
        assert!(clean.is_clean_close());
        assert!(!abnormal.is_clean_close());
        assert!(!no_frame.is_clean_close());
    }
}
