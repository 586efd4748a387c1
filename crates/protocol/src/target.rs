//! Target Session - one browser target multiplexed over a shared session
//!
//! DevTools flat mode: every command carries the target's `sessionId` and
//! every event the target emits comes back tagged with it. All target
//! sessions share the parent's connection, pending table and router.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::codec::{Command, SessionId};
use crate::config::SendOptions;
use crate::error::Result;
use crate::router::SubscriptionHandle;
use crate::session::Session;

/// Result of `Target.attachToTarget`
#[derive(Debug, Clone, Deserialize)]
struct AttachToTargetResult {
    #[serde(rename = "sessionId")]
    session_id: SessionId,
}

/// A [`Session`] bound to one flat-mode target
#[derive(Clone)]
pub struct TargetSession {
    session: Session,
    session_id: SessionId,
}

impl TargetSession {
    /// Wrap a `sessionId` obtained elsewhere.
    pub fn new(session: Session, session_id: impl Into<SessionId>) -> Self {
        Self {
            session,
            session_id: session_id.into(),
        }
    }

    /// Attach to a target in flat mode.
    pub async fn attach(session: Session, target_id: &str) -> Result<Self> {
        let result: AttachToTargetResult = session
            .send(
                "Target.attachToTarget",
                json!({
                    "targetId": target_id,
                    "flatten": true,
                }),
            )
            .await?;
        tracing::debug!(target_id, session_id = %result.session_id, "Attached to target");

        Ok(Self::new(session, result.session_id))
    }

    /// Enable domains in parallel. Individual failures are logged, not fatal.
    /// Returns how many were enabled.
    pub async fn enable_domains(&self, domains: &[&str]) -> usize {
        let enables = domains.iter().map(|domain| async move {
            self.send::<Value, _>(&format!("{}.enable", domain), ())
                .await
        });

        let results = futures_util::future::join_all(enables).await;
        let failures = results.iter().filter(|r| r.is_err()).count();
        if failures > 0 {
            tracing::warn!("Some domain enables failed: {}/{}", failures, results.len());
        }
        results.len() - failures
    }

    /// Send a command within this target's session.
    pub async fn send<R, P>(&self, method: &str, params: P) -> Result<R>
    where
        R: DeserializeOwned + Send + 'static,
        P: Serialize,
    {
        self.send_with(method, params, SendOptions::default()).await
    }

    /// `send` with options. Any `session_id` in `options` is replaced by this target's.
    pub async fn send_with<R, P>(&self, method: &str, params: P, options: SendOptions) -> Result<R>
    where
        R: DeserializeOwned + Send + 'static,
        P: Serialize,
    {
        let options = options.session(self.session_id.clone());
        self.session.send_with(method, params, options).await
    }

    pub async fn execute<C: Command>(&self, command: C) -> Result<C::Response> {
        self.send(C::METHOD, command).await
    }

    /// Subscribe to events emitted by this target only.
    pub fn subscribe<E, F, H>(&self, event: &str, filter: F, handler: H) -> Result<SubscriptionHandle>
    where
        E: DeserializeOwned + Send + Sync + 'static,
        F: Fn(&E) -> bool + Send + Sync + 'static,
        H: Fn(Arc<E>) + Send + Sync + 'static,
    {
        self.session
            .subscribe_scoped(event, self.session_id.clone(), filter, handler)
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.session.unsubscribe(handle)
    }

    /// Detach from the target. The parent session stays open.
    pub async fn detach(&self) -> Result<()> {
        self.session
            .send::<Value, _>(
                "Target.detachFromTarget",
                json!({ "sessionId": &self.session_id }),
            )
            .await?;
        Ok(())
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}
