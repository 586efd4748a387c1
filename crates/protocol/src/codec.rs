//! Message Codec
//!
//! Wire shapes shared by DevTools (CDP) and WebDriver-BiDi:
//!
//! ```text
//! command   → {"id": 7, "method": "Page.navigate", "params": {...}, "sessionId"?: "..."}
//! response  ← {"id": 7, "result": {...}}
//!           ← {"id": 7, "error": {"code": -32000, "message": "..."}}            (CDP)
//!           ← {"type": "error", "id": 7, "error": "no such frame", "message": "..."} (BiDi)
//! event     ← {"method": "Page.loadEventFired", "params": {...}, "sessionId"?: "..."}
//! ```
//!
//! Decoding never panics; anything that is not one of the above is a
//! [`DecodeError`] for the dispatch loop to log and drop.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Command ID - monotonically increasing per session
pub type CommandId = u64;

/// Flat-mode target session from `Target.attachToTarget`
pub type SessionId = String;

/// Longest slice of a bad frame kept in a decode error
const SNIPPET_LEN: usize = 200;

/// A typed command: method name, params (`Self`) and result type in one place.
///
/// ```ignore
/// #[derive(Serialize)]
/// struct GetVersion;
///
/// impl Command for GetVersion {
///     const METHOD: &'static str = "Browser.getVersion";
///     type Response = serde_json::Value;
/// }
/// ```
pub trait Command: Serialize {
    const METHOD: &'static str;
    type Response: DeserializeOwned + Send + 'static;
}

/// Outbound command frame
#[derive(Debug, Clone, Serialize)]
pub struct CommandEnvelope {
    pub id: CommandId,
    pub method: String,
    pub params: Value,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

/// Error code as sent by the remote end: numeric for CDP, named for BiDi
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorCode {
    Number(i64),
    Name(String),
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Number(code) => write!(f, "{code}"),
            ErrorCode::Name(name) => f.write_str(name),
        }
    }
}

/// Structured error returned by the remote end for one command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.code, self.message)
    }
}

impl std::error::Error for RemoteError {}

/// Event pushed by the remote end (no command id)
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Value,
    pub session_id: Option<SessionId>,
}

/// A successfully classified inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Response {
        id: CommandId,
        outcome: std::result::Result<Value, RemoteError>,
    },
    Event(Notification),
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unrecognized frame shape: {0}")]
    Unrecognized(String),

    #[error("Remote error without command id: {0}")]
    Orphaned(RemoteError),
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(default)]
    id: Option<CommandId>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RawError>,
    #[serde(default)]
    message: Option<String>,
    #[serde(rename = "sessionId", default)]
    session_id: Option<SessionId>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawError {
    Structured {
        code: ErrorCode,
        #[serde(default)]
        message: String,
        #[serde(default)]
        data: Option<Value>,
    },
    Named(String),
}

impl RawError {
    fn into_remote(self, sibling_message: Option<String>) -> RemoteError {
        match self {
            RawError::Structured {
                code,
                message,
                data,
            } => RemoteError {
                code,
                message,
                data,
            },
            RawError::Named(name) => RemoteError {
                code: ErrorCode::Name(name),
                message: sibling_message.unwrap_or_default(),
                data: None,
            },
        }
    }
}

/// Classify one inbound frame.
pub fn decode(bytes: &[u8]) -> Result<Decoded, DecodeError> {
    let value: Value = serde_json::from_slice(bytes)?;
    if !value.is_object() {
        return Err(DecodeError::Unrecognized(snippet(bytes)));
    }
    let raw: RawFrame = serde_json::from_value(value)?;

    match (raw.id, raw.error, raw.method) {
        (Some(id), Some(error), _) => Ok(Decoded::Response {
            id,
            outcome: Err(error.into_remote(raw.message)),
        }),
        (Some(id), None, None) => Ok(Decoded::Response {
            id,
            outcome: Ok(raw.result.unwrap_or(Value::Null)),
        }),
        // An id next to a method is a command addressed to us; we never serve those.
        (Some(_), None, Some(_)) if raw.result.is_none() => {
            Err(DecodeError::Unrecognized(snippet(bytes)))
        }
        (Some(id), None, Some(_)) => Ok(Decoded::Response {
            id,
            outcome: Ok(raw.result.unwrap_or(Value::Null)),
        }),
        (None, Some(error), _) => Err(DecodeError::Orphaned(error.into_remote(raw.message))),
        (None, None, Some(method)) => Ok(Decoded::Event(Notification {
            method,
            params: raw.params.unwrap_or(Value::Null),
            session_id: raw.session_id,
        })),
        (None, None, None) => Err(DecodeError::Unrecognized(snippet(bytes))),
    }
}

/// Serialize an outbound command. Pure.
pub fn encode(envelope: &CommandEnvelope) -> serde_json::Result<String> {
    serde_json::to_string(envelope)
}

/// Turn caller params into the `params` object. `()` and `None` become `{}`.
pub fn params_value<P: Serialize + ?Sized>(params: &P) -> serde_json::Result<Value> {
    match serde_json::to_value(params)? {
        Value::Null => Ok(Value::Object(Map::new())),
        value => Ok(value),
    }
}

fn snippet(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).chars().take(SNIPPET_LEN).collect()
}
