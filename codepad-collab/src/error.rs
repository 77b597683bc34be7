//! Error types for the collaboration layer.
//!
//! None of these are fatal: transport errors feed the reconnect policy,
//! decode errors drop a single frame, codec errors drop a single send.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::MessageKind;

/// Failure to serialize an outbound payload.
#[derive(Debug, Error)]
#[error("failed to encode frame: {0}")]
pub struct CodecError(#[from] serde_json::Error);

/// Failure to turn an inbound frame into a [`crate::protocol::Message`].
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("unknown message kind `{0}`")]
    UnknownKind(String),

    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },
}

/// Connection-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    /// The server answered the upgrade with an HTTP error.
    #[error("connection refused: {0}")]
    Refused(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error;
        match e {
            Error::Http(response) => {
                TransportError::Refused(format!("server answered {}", response.status()))
            }
            other => TransportError::WebSocket(Box::new(other)),
        }
    }
}

/// Failure to load a [`crate::config::CollabConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// The collaboration task is no longer running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("collaboration service has stopped")]
pub struct ServiceStopped;
