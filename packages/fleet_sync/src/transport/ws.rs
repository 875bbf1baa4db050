//! WebSocket transport over tokio-tungstenite.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use super::{Connector, FrameSink, FrameStream, TransportEvent};
use crate::error::SyncError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens `ws://` and `wss://` sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

pub struct WsSink(SplitSink<WsStream, Message>);

pub struct WsEvents {
    inner: SplitStream<WsStream>,
    done: bool,
}

impl Connector for WsConnector {
    type Sink = WsSink;
    type Stream = WsEvents;

    async fn connect(&self, url: &str) -> Result<(WsSink, WsEvents), SyncError> {
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(SyncError::from_tungstenite)?;
        debug!(%url, "WebSocket handshake complete");
        let (sink, stream) = stream.split();
        Ok((
            WsSink(sink),
            WsEvents {
                inner: stream,
                done: false,
            },
        ))
    }
}

impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), SyncError> {
        self.0
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| SyncError::Send(e.to_string()))
    }

    async fn close(&mut self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        let _ = self.0.send(Message::Close(Some(frame))).await;
        let _ = self.0.close().await;
    }
}

impl FrameStream for WsEvents {
    async fn next_event(&mut self) -> TransportEvent {
        loop {
            if self.done {
                return TransportEvent::Closed {
                    code: None,
                    reason: String::new(),
                };
            }
            match self.inner.next().await {
                Some(Ok(Message::Text(text))) => return TransportEvent::Frame(text.to_string()),
                Some(Ok(Message::Binary(bytes))) => {
                    return TransportEvent::Frame(String::from_utf8_lossy(&bytes).into_owned());
                }
                Some(Ok(Message::Close(frame))) => {
                    self.done = true;
                    return match frame {
                        Some(frame) => TransportEvent::Closed {
                            code: Some(u16::from(frame.code)),
                            reason: frame.reason.to_string(),
                        },
                        None => TransportEvent::Closed {
                            code: None,
                            reason: String::new(),
                        },
                    };
                }
                // Ping/pong are answered by tungstenite itself
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.done = true;
                    return TransportEvent::Error(e.to_string());
                }
                None => {
                    self.done = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::NORMAL_CLOSURE;
    use tokio::net::TcpListener;

    async fn serve_once<F, Fut>(script: F) -> String
    where
        F: FnOnce(WebSocketStream<TcpStream>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            script(ws).await;
        });
        format!("ws://{addr}/ws/dashboard")
    }

    #[tokio::test]
    async fn test_frames_and_clean_close() {
        let url = serve_once(|mut ws| async move {
            ws.send(Message::Text("hello".into())).await.unwrap();
            ws.send(Message::Binary(b"bin".to_vec().into())).await.unwrap();
            ws.close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "bye".into(),
            }))
            .await
            .unwrap();
        })
        .await;

        let (_sink, mut events) = WsConnector.connect(&url).await.unwrap();
        assert_eq!(events.next_event().await, TransportEvent::Frame("hello".into()));
        assert_eq!(events.next_event().await, TransportEvent::Frame("bin".into()));
        assert_eq!(
            events.next_event().await,
            TransportEvent::Closed {
                code: Some(NORMAL_CLOSURE),
                reason: "bye".into()
            }
        );
        assert!(matches!(
            events.next_event().await,
            TransportEvent::Closed { code: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_outbound_text_reaches_server() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let url = serve_once(|mut ws| async move {
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                let _ = tx.send(text.to_string());
            }
        })
        .await;

        let (mut sink, _events) = WsConnector.connect(&url).await.unwrap();
        sink.send_text("ping".into()).await.unwrap();
        assert_eq!(rx.await.unwrap(), "ping");
    }

    #[tokio::test]
    async fn test_refused_connection_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = WsConnector.connect(&format!("ws://{addr}/ws/alerts")).await;
        assert!(result.is_err());
    }
}
