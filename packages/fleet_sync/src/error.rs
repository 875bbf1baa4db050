//! Error types for the synchronization layer.

use tokio_tungstenite::tungstenite;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("invalid base url: {0}")]
    InvalidUrl(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("malformed frame: {0}")]
    Decode(String),

    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("maximum reconnection attempts reached")]
    RetriesExhausted,
}

impl SyncError {
    /// Classify a tungstenite error: refused/reset/aborted sockets are connect
    /// failures, everything else is a transport error.
    pub fn from_tungstenite(err: tungstenite::Error) -> Self {
        let is_connect = match &err {
            tungstenite::Error::Io(io_err) => matches!(
                io_err.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        };
        if is_connect {
            Self::Connect(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}
