//! In-process transport.
//!
//! [`MemoryConnector`] hands every accepted connection's far end to a
//! [`MemoryServer`] as a [`MemoryRemote`], which can push frames, errors and
//! closes to the client and read back what the client sent. Connections can
//! be refused ahead of time to script reconnect scenarios.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, mpsc};

use super::{Connector, FrameSink, FrameStream, TransportEvent};
use crate::error::SyncError;

#[derive(Debug)]
enum Script {
    Accept,
    Refuse(String),
}

/// What the client wrote to its sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Text(String),
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone)]
pub struct MemoryConnector {
    script: Arc<Mutex<VecDeque<Script>>>,
    accepted: mpsc::UnboundedSender<MemoryRemote>,
    attempts: Arc<AtomicUsize>,
}

/// Receives the far end of every accepted connection.
#[derive(Debug)]
pub struct MemoryServer {
    accepted: mpsc::UnboundedReceiver<MemoryRemote>,
}

/// Far end of one accepted connection.
#[derive(Debug)]
pub struct MemoryRemote {
    pub url: String,
    to_client: mpsc::UnboundedSender<TransportEvent>,
    from_client: mpsc::UnboundedReceiver<Outgoing>,
}

pub struct MemorySink {
    tx: mpsc::UnboundedSender<Outgoing>,
}

pub struct MemoryStream {
    rx: mpsc::UnboundedReceiver<TransportEvent>,
    done: bool,
}

impl MemoryConnector {
    pub fn new() -> (Self, MemoryServer) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                script: Arc::new(Mutex::new(VecDeque::new())),
                accepted: tx,
                attempts: Arc::new(AtomicUsize::new(0)),
            },
            MemoryServer { accepted: rx },
        )
    }

    /// Refuse the next `n` connection attempts with `reason`.
    pub async fn refuse_next(&self, n: usize, reason: &str) {
        let mut script = self.script.lock().await;
        for _ in 0..n {
            script.push_back(Script::Refuse(reason.to_string()));
        }
    }

    /// Connection attempts made so far, refused ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for MemoryConnector {
    type Sink = MemorySink;
    type Stream = MemoryStream;

    async fn connect(&self, url: &str) -> Result<(MemorySink, MemoryStream), SyncError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().await.pop_front().unwrap_or(Script::Accept);
        if let Script::Refuse(reason) = step {
            return Err(SyncError::Connect(reason));
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let remote = MemoryRemote {
            url: url.to_string(),
            to_client: event_tx,
            from_client: out_rx,
        };
        self.accepted
            .send(remote)
            .map_err(|_| SyncError::Connect("memory server dropped".into()))?;
        Ok((
            MemorySink { tx: out_tx },
            MemoryStream {
                rx: event_rx,
                done: false,
            },
        ))
    }
}

impl MemoryServer {
    pub async fn accept(&mut self) -> Option<MemoryRemote> {
        self.accepted.recv().await
    }

    pub fn try_accept(&mut self) -> Option<MemoryRemote> {
        self.accepted.try_recv().ok()
    }
}

impl MemoryRemote {
    /// Deliver a text frame. Returns false once the client is gone.
    pub fn push_frame(&self, text: impl Into<String>) -> bool {
        self.to_client.send(TransportEvent::Frame(text.into())).is_ok()
    }

    pub fn push_error(&self, error: impl Into<String>) -> bool {
        self.to_client.send(TransportEvent::Error(error.into())).is_ok()
    }

    /// Close from the server side with `code`.
    pub fn close(&self, code: u16) -> bool {
        self.to_client
            .send(TransportEvent::Closed {
                code: Some(code),
                reason: String::new(),
            })
            .is_ok()
    }

    /// Next thing the client wrote, or `None` once its sink is dropped.
    pub async fn recv_sent(&mut self) -> Option<Outgoing> {
        self.from_client.recv().await
    }
}

impl FrameSink for MemorySink {
    async fn send_text(&mut self, text: String) -> Result<(), SyncError> {
        self.tx
            .send(Outgoing::Text(text))
            .map_err(|_| SyncError::Send("remote closed".into()))
    }

    async fn close(&mut self, code: u16, reason: &str) {
        let _ = self.tx.send(Outgoing::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

impl FrameStream for MemoryStream {
    async fn next_event(&mut self) -> TransportEvent {
        if self.done {
            return TransportEvent::Closed {
                code: None,
                reason: String::new(),
            };
        }
        match self.rx.recv().await {
            Some(event) => {
                if matches!(event, TransportEvent::Closed { .. }) {
                    self.done = true;
                }
                event
            }
            None => {
                // Remote dropped without a close frame
                self.done = true;
                TransportEvent::Closed {
                    code: None,
                    reason: String::new(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::NORMAL_CLOSURE;

    #[tokio::test]
    async fn test_accept_and_exchange() {
        let (connector, mut server) = MemoryConnector::new();
        let (mut sink, mut stream) = connector.connect("ws://test/ws/alerts").await.unwrap();
        let mut remote = server.accept().await.unwrap();
        assert_eq!(remote.url, "ws://test/ws/alerts");

        remote.push_frame("hello");
        assert_eq!(stream.next_event().await, TransportEvent::Frame("hello".into()));

        sink.send_text("ping".into()).await.unwrap();
        assert_eq!(remote.recv_sent().await, Some(Outgoing::Text("ping".into())));

        sink.close(NORMAL_CLOSURE, "done").await;
        assert_eq!(
            remote.recv_sent().await,
            Some(Outgoing::Close {
                code: NORMAL_CLOSURE,
                reason: "done".into()
            })
        );
    }

    #[tokio::test]
    async fn test_refusals_are_consumed_in_order() {
        let (connector, _server) = MemoryConnector::new();
        connector.refuse_next(2, "down").await;
        assert!(matches!(
            connector.connect("ws://x").await,
            Err(SyncError::Connect(reason)) if reason == "down"
        ));
        assert!(connector.connect("ws://x").await.is_err());
        assert!(connector.connect("ws://x").await.is_ok());
        assert_eq!(connector.attempts(), 3);
    }

    #[tokio::test]
    async fn test_dropped_remote_reads_as_abnormal_close() {
        let (connector, mut server) = MemoryConnector::new();
        let (_sink, mut stream) = connector.connect("ws://x").await.unwrap();
        drop(server.accept().await.unwrap());
        assert_eq!(
            stream.next_event().await,
            TransportEvent::Closed {
                code: None,
                reason: String::new()
            }
        );
    }

    #[tokio::test]
    async fn test_stream_stays_closed() {
        let (connector, mut server) = MemoryConnector::new();
        let (_sink, mut stream) = connector.connect("ws://x").await.unwrap();
        let remote = server.accept().await.unwrap();
        remote.close(4000);
        remote.push_frame("late");
        assert!(matches!(
            stream.next_event().await,
            TransportEvent::Closed { code: Some(4000), .. }
        ));
        assert!(matches!(
            stream.next_event().await,
            TransportEvent::Closed { code: None, .. }
        ));
    }
}
