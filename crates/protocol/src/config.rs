//! Session configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::codec::SessionId;

/// Per-connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Label used in logs
    pub id: String,

    /// Default bound on every `send`. `None` waits forever.
    pub command_timeout_ms: Option<u64>,

    /// Handlers slower than this get a warning
    pub slow_handler_threshold_ms: u64,

    /// Buffer of the lifecycle broadcast channel
    pub lifecycle_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            command_timeout_ms: Some(30_000),
            slow_handler_threshold_ms: 100,
            lifecycle_capacity: 64,
        }
    }
}

impl SessionConfig {
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn without_command_timeout(mut self) -> Self {
        self.command_timeout_ms = None;
        self
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms.map(Duration::from_millis)
    }

    pub fn slow_handler_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_handler_threshold_ms)
    }
}

/// Per-call options for `send_with`
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Overrides `SessionConfig::command_timeout_ms` for this call
    pub timeout: Option<Duration>,

    /// Abandons the wait when cancelled. The remote command keeps running.
    pub cancel: Option<CancellationToken>,

    /// Flat-mode target session to address
    pub session_id: Option<SessionId>,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn session(mut self, session_id: impl Into<SessionId>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}
