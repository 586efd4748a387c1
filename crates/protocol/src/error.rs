//! Error types for session operations
//!
//! Flat hierarchy. Per-command failures (`Protocol`, `Decode`, `Timeout`,
//! `Cancelled`) only ever reach the caller that issued the command.
//! Connection-wide failures (`Transport`) close the whole session.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::codec::{CommandId, RemoteError};

/// Result type for session operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error in `{method}`: {error}")]
    Protocol { method: String, error: RemoteError },

    #[error("Failed to decode result of `{method}` (id {id}): {source}")]
    Decode {
        id: CommandId,
        method: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode params of `{method}`: {source}")]
    Encode {
        method: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Session closed: {reason}")]
    SessionClosed { reason: CloseReason },

    #[error("Command `{method}` timed out after {after:?}")]
    Timeout { method: String, after: Duration },

    #[error("Command `{method}` cancelled")]
    Cancelled { method: String },

    #[error("Command id space exhausted")]
    IdsExhausted,
}

/// Failures of the underlying connection
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Invalid endpoint `{endpoint}`: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("Connection closed")]
    Closed,
}

/// Why a session stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `Session::close` was called locally.
    Requested(String),
    /// The peer ended the stream.
    RemoteClosed,
    /// Reading or writing the transport failed.
    Transport(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Requested(reason) => write!(f, "closed by client ({reason})"),
            CloseReason::RemoteClosed => f.write_str("connection closed by remote"),
            CloseReason::Transport(err) => write!(f, "transport failure ({err})"),
        }
    }
}

impl From<&str> for CloseReason {
    fn from(reason: &str) -> Self {
        CloseReason::Requested(reason.to_string())
    }
}

impl From<String> for CloseReason {
    fn from(reason: String) -> Self {
        CloseReason::Requested(reason)
    }
}
