//! Session - the public surface every domain module talks to
//!
//! Design decisions:
//! 1. One transport per session, one dispatch task reading it
//! 2. Many concurrent senders; responses matched by id, never by order
//! 3. Handlers run on a separate event task, so a slow event handler
//!    never holds up a response
//! 4. Fail fast - no retries, no reconnect. Let the caller decide.

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::Instrument;

use crate::codec::{self, Command, CommandEnvelope, CommandId, SessionId};
use crate::config::{SendOptions, SessionConfig};
use crate::dispatch;
use crate::error::{CloseReason, Error, Result};
use crate::events::{LifecycleBus, LifecycleEvent};
use crate::pending::PendingTable;
use crate::router::{EventRouter, SubscriptionHandle};
use crate::transport::{Frame, Transport, TransportSender, WebSocketTransport};

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Lifecycle: `Open -> Closing -> Closed`, never back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closing,
    Closed,
}

/// State shared between the façade, the reader and the event task
pub(crate) struct Shared {
    config: SessionConfig,
    state: AtomicU8,
    close_reason: OnceLock<CloseReason>,
    pub(crate) pending: PendingTable,
    pub(crate) router: EventRouter,
    sender: Box<dyn TransportSender>,
    pub(crate) shutdown: CancellationToken,
    lifecycle: LifecycleBus,
}

impl Shared {
    pub(crate) fn is_open(&self) -> bool {
        self.state.load(Ordering::SeqCst) == OPEN
    }

    fn state(&self) -> SessionState {
        match self.state.load(Ordering::SeqCst) {
            OPEN => SessionState::Open,
            CLOSING => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }

    fn closed_error(&self) -> Error {
        let reason = self
            .close_reason
            .get()
            .cloned()
            .unwrap_or(CloseReason::Requested("session closed".to_string()));
        Error::SessionClosed { reason }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(self.closed_error())
        }
    }

    /// Only the first caller does the work; everyone else returns at once.
    pub(crate) async fn close(&self, reason: CloseReason) {
        // Recorded before leaving OPEN so every closed_error sees it. First reason wins.
        let reason = self.close_reason.get_or_init(|| reason).clone();
        if self
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        tracing::info!(session = %self.config.id, "Closing session: {}", reason);
        self.lifecycle.publish(LifecycleEvent::Closing {
            reason: reason.clone(),
        });

        self.shutdown.cancel();
        let failed = self.pending.drain_all(reason.clone());
        self.router.clear();
        if let Err(e) = self.sender.close().await {
            tracing::debug!("Transport close failed: {}", e);
        }

        self.state.store(CLOSED, Ordering::SeqCst);
        self.lifecycle.publish(LifecycleEvent::Closed { reason });
        tracing::info!(session = %self.config.id, failed, "Session closed");
    }
}

/// Removes the pending entry unless disarmed. Covers timeout, cancel, and
/// the caller dropping the `send` future.
struct PendingGuard<'a> {
    pending: &'a PendingTable,
    id: CommandId,
    armed: bool,
}

impl PendingGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.pending.cancel(self.id) {
            tracing::debug!(id = self.id, "Command abandoned by caller");
        }
    }
}

/// A multiplexed protocol session. Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
    // Last clone dropped stops the dispatch loop
    _stop_on_drop: Arc<DropGuard>,
}

impl Session {
    /// Connect over WebSocket and start dispatching.
    pub async fn connect(endpoint: &str, config: SessionConfig) -> Result<Self> {
        let transport = WebSocketTransport::connect(endpoint).await?;
        Ok(Self::open(transport, config))
    }

    /// Start a session over an already connected transport.
    /// Must be called from within a tokio runtime.
    pub fn open(transport: Transport, config: SessionConfig) -> Self {
        let Transport { sender, receiver } = transport;
        let shutdown = CancellationToken::new();
        let span = tracing::info_span!("session", id = %config.id);

        let shared = Arc::new(Shared {
            router: EventRouter::new(config.slow_handler_threshold()),
            lifecycle: LifecycleBus::new(config.lifecycle_capacity),
            state: AtomicU8::new(OPEN),
            close_reason: OnceLock::new(),
            pending: PendingTable::new(),
            sender,
            shutdown: shutdown.clone(),
            config,
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch::run(shared.clone(), receiver, events_tx).instrument(span.clone()));
        tokio::spawn(dispatch::deliver(shared.clone(), events_rx).instrument(span));
        tracing::info!(session = %shared.config.id, "Session opened");

        Self {
            shared,
            _stop_on_drop: Arc::new(shutdown.drop_guard()),
        }
    }

    /// Send a command and wait for its result, with the default options.
    pub async fn send<R, P>(&self, method: &str, params: P) -> Result<R>
    where
        R: DeserializeOwned + Send + 'static,
        P: Serialize,
    {
        self.send_with(method, params, SendOptions::default()).await
    }

    /// Send a command and wait for its result.
    ///
    /// Fails without touching the transport once the session is closing.
    /// A timeout or cancellation only abandons the wait; the remote end
    /// still runs the command and its late response is dropped.
    pub async fn send_with<R, P>(&self, method: &str, params: P, options: SendOptions) -> Result<R>
    where
        R: DeserializeOwned + Send + 'static,
        P: Serialize,
    {
        let shared = &self.shared;
        shared.ensure_open()?;

        let SendOptions {
            timeout,
            cancel,
            session_id,
        } = options;
        if cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(Error::Cancelled {
                method: method.to_string(),
            });
        }

        let params = encode_params(method, params)?;
        let (id, rx) = shared.pending.register::<R>(method)?;
        let mut guard = PendingGuard {
            pending: &shared.pending,
            id,
            armed: true,
        };

        let envelope = CommandEnvelope {
            id,
            method: method.to_string(),
            params,
            session_id,
        };
        let text = codec::encode(&envelope).map_err(|source| Error::Encode {
            method: method.to_string(),
            source,
        })?;
        tracing::trace!("-> {}", text);

        if let Err(e) = shared.sender.send(Frame::Text(text)).await {
            if !shared.is_open() {
                return Err(shared.closed_error());
            }
            tracing::error!(id, method, "Failed to write command: {}", e);
            shared.close(CloseReason::Transport(e.to_string())).await;
            return Err(Error::Transport(e));
        }

        let timeout = timeout.or_else(|| shared.config.command_timeout());
        let outcome = tokio::select! {
            biased;
            outcome = rx => outcome,
            _ = cancelled(cancel) => {
                tracing::debug!(id, method, "Command cancelled");
                return Err(Error::Cancelled { method: method.to_string() });
            }
            _ = expired(timeout) => {
                let after = timeout.unwrap_or_default();
                tracing::warn!(id, method, "Command timed out after {:?}", after);
                return Err(Error::Timeout { method: method.to_string(), after });
            }
        };
        guard.disarm();

        // Completion slot dropped unfulfilled only happens on teardown
        outcome.unwrap_or_else(|_| Err(shared.closed_error()))
    }

    /// Send a typed command.
    pub async fn execute<C: Command>(&self, command: C) -> Result<C::Response> {
        self.send(C::METHOD, command).await
    }

    /// Send a typed command with per-call options.
    pub async fn execute_with<C: Command>(
        &self,
        command: C,
        options: SendOptions,
    ) -> Result<C::Response> {
        self.send_with(C::METHOD, command, options).await
    }

    /// Call `handler` for every `event` whose payload decodes as `E` and passes `filter`.
    ///
    /// Handlers run one at a time on the session's event task: a slow one
    /// delays later events (never responses), so keep them short or hand
    /// work off. A handler that needs the session should capture
    /// [`Session::downgrade`] rather than a clone; a captured clone keeps
    /// the session open after every other handle is dropped.
    pub fn subscribe<E, F, H>(&self, event: &str, filter: F, handler: H) -> Result<SubscriptionHandle>
    where
        E: DeserializeOwned + Send + Sync + 'static,
        F: Fn(&E) -> bool + Send + Sync + 'static,
        H: Fn(Arc<E>) + Send + Sync + 'static,
    {
        self.subscribe_in(event, None, filter, handler)
    }

    /// `subscribe` without a filter.
    pub fn subscribe_all<E, H>(&self, event: &str, handler: H) -> Result<SubscriptionHandle>
    where
        E: DeserializeOwned + Send + Sync + 'static,
        H: Fn(Arc<E>) + Send + Sync + 'static,
    {
        self.subscribe_in(event, None, |_: &E| true, handler)
    }

    /// `subscribe`, restricted to events tagged with a flat-mode `sessionId`.
    pub fn subscribe_scoped<E, F, H>(
        &self,
        event: &str,
        session_id: SessionId,
        filter: F,
        handler: H,
    ) -> Result<SubscriptionHandle>
    where
        E: DeserializeOwned + Send + Sync + 'static,
        F: Fn(&E) -> bool + Send + Sync + 'static,
        H: Fn(Arc<E>) + Send + Sync + 'static,
    {
        self.subscribe_in(event, Some(session_id), filter, handler)
    }

    /// Deliver matching events into a channel instead of a callback.
    /// The channel ends when the subscription is removed or the session closes.
    pub fn subscribe_channel<E, F>(
        &self,
        event: &str,
        filter: F,
    ) -> Result<(SubscriptionHandle, mpsc::UnboundedReceiver<Arc<E>>)>
    where
        E: DeserializeOwned + Send + Sync + 'static,
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.subscribe(event, filter, move |payload: Arc<E>| {
            let _ = tx.send(payload); // Receiver dropped: caller stopped listening
        })?;
        Ok((handle, rx))
    }

    /// Wait for the first `event` passing `filter`. Subscribe before
    /// triggering the command that causes it, or use this concurrently.
    pub async fn wait_for_event<E, F>(
        &self,
        event: &str,
        filter: F,
        timeout: Option<Duration>,
    ) -> Result<Arc<E>>
    where
        E: DeserializeOwned + Send + Sync + 'static,
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let handle = self.subscribe(event, filter, move |payload: Arc<E>| {
            if let Some(tx) = slot.lock().ok().and_then(|mut slot| slot.take()) {
                let _ = tx.send(payload);
            }
        })?;

        let timeout = timeout.or_else(|| self.shared.config.command_timeout());
        let outcome = tokio::select! {
            outcome = rx => outcome.map_err(|_| self.shared.closed_error()),
            _ = expired(timeout) => Err(Error::Timeout {
                method: event.to_string(),
                after: timeout.unwrap_or_default(),
            }),
        };
        self.unsubscribe(&handle);
        outcome
    }

    /// Remove a subscription. No-op if it is already gone or the session closed.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.shared.router.unsubscribe(handle)
    }

    /// Fail every pending command, drop every subscription, close the transport.
    /// Idempotent.
    pub async fn close(&self, reason: impl Into<CloseReason>) {
        self.shared.close(reason.into()).await;
    }

    /// A handle that does not keep the session open.
    pub fn downgrade(&self) -> WeakSession {
        WeakSession {
            shared: Arc::downgrade(&self.shared),
            stop_on_drop: Arc::downgrade(&self._stop_on_drop),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.config.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    /// Why the session closed, once it has
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.close_reason.get().cloned()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.shared.router.len()
    }

    /// Observe `Closing`/`Closed` transitions.
    pub fn lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.shared.lifecycle.subscribe()
    }

    fn subscribe_in<E, F, H>(
        &self,
        event: &str,
        scope: Option<SessionId>,
        filter: F,
        handler: H,
    ) -> Result<SubscriptionHandle>
    where
        E: DeserializeOwned + Send + Sync + 'static,
        F: Fn(&E) -> bool + Send + Sync + 'static,
        H: Fn(Arc<E>) + Send + Sync + 'static,
    {
        self.shared.ensure_open()?;
        let handle = self.shared.router.subscribe(event, scope, filter, handler);

        // Raced with close: the router may already have been cleared
        if !self.shared.is_open() {
            self.shared.router.unsubscribe(&handle);
            return Err(self.shared.closed_error());
        }
        Ok(handle)
    }
}

/// Non-owning [`Session`] handle, for use inside subscription handlers
#[derive(Clone)]
pub struct WeakSession {
    shared: Weak<Shared>,
    stop_on_drop: Weak<DropGuard>,
}

impl WeakSession {
    /// `None` once every `Session` handle has been dropped.
    pub fn upgrade(&self) -> Option<Session> {
        Some(Session {
            shared: self.shared.upgrade()?,
            _stop_on_drop: self.stop_on_drop.upgrade()?,
        })
    }
}

/// Consumes `params` so no caller value is held across the wait.
fn encode_params<P: Serialize>(method: &str, params: P) -> Result<serde_json::Value> {
    codec::params_value(&params).map_err(|source| Error::Encode {
        method: method.to_string(),
        source,
    })
}

fn cancelled(token: Option<CancellationToken>) -> impl Future<Output = ()> {
    async move {
        match token {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    }
}

fn expired(timeout: Option<Duration>) -> impl Future<Output = ()> {
    async move {
        match timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::transport::{MemoryPeer, MemoryTransport};
    use serde::Deserialize;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;
    use tokio::time::timeout;
    use tokio_test::{assert_pending, task};

    const BOUND: Duration = Duration::from_secs(2);

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    }

    fn open() -> (Session, MemoryPeer) {
        init_tracing();
        let (transport, peer) = MemoryTransport::pair();
        (Session::open(transport, SessionConfig::default()), peer)
    }

    fn id_of(command: &Value) -> CommandId {
        command["id"].as_u64().unwrap()
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Created {
        context: String,
    }

    #[tokio::test]
    async fn test_send_resolves_with_matching_response() {
        let (session, mut peer) = open();

        let call = tokio::spawn({
            let session = session.clone();
            async move {
                session
                    .send::<Created, _>("browsingContext.create", json!({"type": "tab"}))
                    .await
            }
        });

        let command = peer.next_command().await.unwrap();
        assert_eq!(command["id"], 1);
        assert_eq!(command["method"], "browsingContext.create");
        assert_eq!(command["params"], json!({"type": "tab"}));
        peer.respond(1, json!({"context": "abc"}));

        let created = call.await.unwrap().unwrap();
        assert_eq!(
            created,
            Created {
                context: "abc".to_string()
            }
        );
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_event_before_response_is_routed() {
        let (session, mut peer) = open();
        let (_handle, mut entries) = session
            .subscribe_channel::<Value, _>("log.entryAdded", |_| true)
            .unwrap();

        let first = tokio::spawn({
            let session = session.clone();
            async move { session.send::<Value, _>("session.status", ()).await }
        });
        let command = peer.next_command().await.unwrap();
        peer.respond(id_of(&command), json!({"ready": true}));
        first.await.unwrap().unwrap();

        let second = tokio::spawn({
            let session = session.clone();
            async move { session.send::<Value, _>("script.evaluate", json!({"expression": "1"})).await }
        });
        let command = peer.next_command().await.unwrap();
        assert_eq!(id_of(&command), 2);

        peer.emit("log.entryAdded", json!({"text": "hello"}));
        peer.respond(2, json!({"result": {"type": "number", "value": 1}}));

        let entry = timeout(BOUND, entries.recv()).await.unwrap().unwrap();
        assert_eq!(entry["text"], "hello");
        let result = second.await.unwrap().unwrap();
        assert_eq!(result["result"]["value"], 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reordered_responses_pair_by_id() {
        let (session, mut peer) = open();

        let calls: Vec<_> = (0..16u64)
            .map(|n| {
                let session = session.clone();
                tokio::spawn(async move {
                    let echoed: Value = session
                        .send("Runtime.evaluate", json!({"expression": n.to_string()}))
                        .await
                        .unwrap();
                    (n, echoed)
                })
            })
            .collect();

        let mut commands = peer.next_commands(16).await;
        let ids: Vec<_> = commands.iter().map(id_of).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 16);

        // Answer newest first, echoing what each command asked for
        commands.reverse();
        for command in &commands {
            peer.respond(id_of(command), json!({"echo": command["params"]["expression"]}));
        }

        for call in calls {
            let (n, echoed) = call.await.unwrap();
            assert_eq!(echoed["echo"], n.to_string());
        }
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_all_pending() {
        let (session, mut peer) = open();
        let mut lifecycle = session.lifecycle();

        let calls: Vec<_> = (0..5)
            .map(|_| {
                let session = session.clone();
                tokio::spawn(async move { session.send::<Value, _>("Page.reload", ()).await })
            })
            .collect();
        peer.next_commands(5).await;
        assert_eq!(session.pending_count(), 5);

        session.close("test finished").await;
        session.close("again").await;

        for call in calls {
            match call.await.unwrap() {
                Err(Error::SessionClosed { reason }) => {
                    assert_eq!(reason, CloseReason::Requested("test finished".into()))
                }
                other => panic!("expected session closed, got {:?}", other),
            }
        }
        assert_eq!(session.state(), SessionState::Closed);
        assert!(peer.is_closed());

        let late = session.send::<Value, _>("Page.reload", ()).await;
        assert!(matches!(late, Err(Error::SessionClosed { .. })));
        assert!(peer.try_next_command().is_none());

        // Exactly one transition pair despite two close calls
        assert!(matches!(lifecycle.recv().await, Ok(LifecycleEvent::Closing { .. })));
        assert!(matches!(lifecycle.recv().await, Ok(LifecycleEvent::Closed { .. })));
        assert!(lifecycle.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remote_disconnect_fails_pending_in_bounded_time() {
        let (session, mut peer) = open();
        let mut lifecycle = session.lifecycle();

        let call = tokio::spawn({
            let session = session.clone();
            async move { session.send::<Value, _>("browsingContext.navigate", json!({"url": "about:blank"})).await }
        });
        peer.next_command().await.unwrap();
        peer.disconnect();

        match timeout(BOUND, call).await.unwrap().unwrap() {
            Err(Error::SessionClosed { reason }) => assert_eq!(reason, CloseReason::RemoteClosed),
            other => panic!("expected session closed, got {:?}", other),
        }
        loop {
            if let LifecycleEvent::Closed { .. } = lifecycle.recv().await.unwrap() {
                break;
            }
        }
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.close_reason(), Some(CloseReason::RemoteClosed));
    }

    #[tokio::test]
    async fn test_transport_error_closes_session() {
        let (session, mut peer) = open();
        let call = tokio::spawn({
            let session = session.clone();
            async move { session.send::<Value, _>("Target.getTargets", ()).await }
        });
        peer.next_command().await.unwrap();
        peer.fail(TransportError::Closed);

        match timeout(BOUND, call).await.unwrap().unwrap() {
            Err(Error::SessionClosed {
                reason: CloseReason::Transport(_),
            }) => {}
            other => panic!("expected transport close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_response_is_dropped() {
        let (session, mut peer) = open();
        let call = tokio::spawn({
            let session = session.clone();
            async move { session.send::<Value, _>("Browser.getVersion", ()).await }
        });
        let command = peer.next_command().await.unwrap();

        peer.respond(777, json!({"stray": true}));
        peer.push_raw("garbage");
        peer.respond(id_of(&command), json!({"product": "Chrome"}));

        let version = timeout(BOUND, call).await.unwrap().unwrap().unwrap();
        assert_eq!(version["product"], "Chrome");
        assert!(session.is_open());
    }

    #[tokio::test]
    async fn test_protocol_error_reaches_only_its_caller() {
        let (session, mut peer) = open();
        let failing = tokio::spawn({
            let session = session.clone();
            async move { session.send::<Value, _>("Page.navigate", json!({"url": "bad"})).await }
        });
        let failing_cmd = peer.next_command().await.unwrap();
        let fine = tokio::spawn({
            let session = session.clone();
            async move { session.send::<Value, _>("Page.getFrameTree", ()).await }
        });
        let fine_cmd = peer.next_command().await.unwrap();

        peer.respond_error(id_of(&failing_cmd), -32000, "Cannot navigate to invalid URL");
        peer.respond(id_of(&fine_cmd), json!({"frameTree": {}}));

        match failing.await.unwrap() {
            Err(Error::Protocol { method, error }) => {
                assert_eq!(method, "Page.navigate");
                assert_eq!(error.message, "Cannot navigate to invalid URL");
            }
            other => panic!("expected protocol error, got {:?}", other),
        }
        assert!(fine.await.unwrap().is_ok());
        assert!(session.is_open());
    }

    #[tokio::test]
    async fn test_timeout_releases_pending_entry() {
        let (session, mut peer) = open();

        let result = session
            .send_with::<Value, _>(
                "Page.captureScreenshot",
                (),
                SendOptions::new().timeout(Duration::from_millis(50)),
            )
            .await;
        match result {
            Err(Error::Timeout { method, after }) => {
                assert_eq!(method, "Page.captureScreenshot");
                assert_eq!(after, Duration::from_millis(50));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(session.pending_count(), 0);

        // The late answer is noise; the session keeps working
        let late = peer.next_command().await.unwrap();
        peer.respond(id_of(&late), json!({"data": "..."}));

        let call = tokio::spawn({
            let session = session.clone();
            async move { session.send::<Value, _>("Browser.getVersion", ()).await }
        });
        let command = peer.next_command().await.unwrap();
        peer.respond(id_of(&command), json!({"product": "Chrome"}));
        assert!(call.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_cancellation_token() {
        let (session, mut peer) = open();
        let token = CancellationToken::new();

        let call = tokio::spawn({
            let session = session.clone();
            let token = token.clone();
            async move {
                session
                    .send_with::<Value, _>("Runtime.awaitPromise", (), SendOptions::new().cancel_on(token))
                    .await
            }
        });
        peer.next_command().await.unwrap();
        token.cancel();

        assert!(matches!(call.await.unwrap(), Err(Error::Cancelled { .. })));
        assert_eq!(session.pending_count(), 0);

        // Already-cancelled token never reaches the transport
        let result = session
            .send_with::<Value, _>("Runtime.evaluate", (), SendOptions::new().cancel_on(token))
            .await;
        assert!(matches!(result, Err(Error::Cancelled { .. })));
        assert!(peer.try_next_command().is_none());
    }

    #[tokio::test]
    async fn test_dropped_send_releases_pending_entry() {
        let (session, mut peer) = open();

        let mut call = task::spawn(session.send::<Value, _>("DOM.getDocument", ()));
        assert_pending!(call.poll());
        assert_eq!(session.pending_count(), 1);
        drop(call);
        assert_eq!(session.pending_count(), 0);

        let command = peer.next_command().await.unwrap();
        peer.respond(id_of(&command), json!({"root": {}}));
    }

    #[tokio::test]
    async fn test_subscriptions_after_close() {
        let (session, _peer) = open();
        let handle = session
            .subscribe_all("Page.loadEventFired", |_: Arc<Value>| {})
            .unwrap();
        assert_eq!(session.subscription_count(), 1);

        session.close("done").await;
        assert_eq!(session.subscription_count(), 0);
        assert!(!session.unsubscribe(&handle));
        assert!(matches!(
            session.subscribe_all("Page.loadEventFired", |_: Arc<Value>| {}),
            Err(Error::SessionClosed { .. })
        ));
    }

    #[tokio::test]
    async fn test_filtered_subscriptions() {
        #[derive(Deserialize)]
        struct Load {
            context: String,
        }

        let (session, peer) = open();
        let hits = Arc::new(AtomicUsize::new(0));
        let misses = Arc::new(AtomicUsize::new(0));
        for (wanted, counter) in [("abc", hits.clone()), ("xyz", misses.clone())] {
            session
                .subscribe(
                    "browsingContext.load",
                    move |e: &Load| e.context == wanted,
                    move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    },
                )
                .unwrap();
        }
        let (_, mut all) = session
            .subscribe_channel::<Value, _>("browsingContext.load", |_| true)
            .unwrap();

        peer.emit("browsingContext.load", json!({"context": "abc", "url": "about:blank"}));
        timeout(BOUND, all.recv()).await.unwrap().unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(misses.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_wait_for_event() {
        let (session, peer) = open();

        let waiter = tokio::spawn({
            let session = session.clone();
            async move {
                session
                    .wait_for_event::<Value, _>("Page.loadEventFired", |_| true, Some(BOUND))
                    .await
            }
        });
        while session.subscription_count() == 0 {
            tokio::task::yield_now().await;
        }
        peer.emit("Page.loadEventFired", json!({"timestamp": 1.5}));

        let event = waiter.await.unwrap().unwrap();
        assert_eq!(event["timestamp"], 1.5);
        assert_eq!(session.subscription_count(), 0);

        let missed = session
            .wait_for_event::<Value, _>("Page.loadEventFired", |_| true, Some(Duration::from_millis(20)))
            .await;
        assert!(matches!(missed, Err(Error::Timeout { .. })));
        assert_eq!(session.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_channel_subscription_ends_on_close() {
        let (session, _peer) = open();
        let (_, mut rx) = session
            .subscribe_channel::<Value, _>("Network.requestWillBeSent", |_| true)
            .unwrap();
        session.close("bye").await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_encode_failure_registers_nothing() {
        let (session, mut peer) = open();
        let mut bad = std::collections::HashMap::new();
        bad.insert(vec![1u8], "non-string keys do not serialize to JSON");

        let result = session.send::<Value, _>("Storage.setCookies", bad).await;
        assert!(matches!(result, Err(Error::Encode { .. })));
        assert_eq!(session.pending_count(), 0);
        assert!(peer.try_next_command().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_handler_does_not_delay_queued_response() {
        let (session, mut peer) = open();
        session
            .subscribe_all("log.entryAdded", |_: Arc<Value>| {
                std::thread::sleep(Duration::from_millis(1000));
            })
            .unwrap();

        let call = tokio::spawn({
            let session = session.clone();
            async move {
                session
                    .send_with::<Value, _>(
                        "script.evaluate",
                        json!({"expression": "1"}),
                        SendOptions::new().timeout(Duration::from_millis(250)),
                    )
                    .await
            }
        });
        let command = peer.next_command().await.unwrap();

        // The event is on the wire ahead of the response
        peer.emit("log.entryAdded", json!({"text": "slow"}));
        peer.respond(id_of(&command), json!({"result": {"type": "number", "value": 1}}));

        let result = timeout(BOUND, call).await.unwrap().unwrap().unwrap();
        assert_eq!(result["result"]["value"], 1);
    }

    #[tokio::test]
    async fn test_events_keep_arrival_order() {
        let (session, peer) = open();
        let (_, mut rx) = session
            .subscribe_channel::<Value, _>("Network.requestWillBeSent", |_| true)
            .unwrap();

        for n in 0..20 {
            peer.emit("Network.requestWillBeSent", json!({"requestId": n}));
        }
        for n in 0..20 {
            let event = timeout(BOUND, rx.recv()).await.unwrap().unwrap();
            assert_eq!(event["requestId"], n);
        }
    }

    #[tokio::test]
    async fn test_handler_holding_weak_session_does_not_keep_it_open() {
        let (session, peer) = open();
        let mut lifecycle = session.lifecycle();
        let weak = session.downgrade();

        // Handler removes itself through the weak handle
        let own: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));
        let handle = session
            .subscribe_all("Target.targetCreated", {
                let weak = weak.clone();
                let own = own.clone();
                move |_: Arc<Value>| {
                    let handle = own.lock().unwrap().take();
                    if let (Some(session), Some(handle)) = (weak.upgrade(), handle) {
                        session.unsubscribe(&handle);
                    }
                }
            })
            .unwrap();
        *own.lock().unwrap() = Some(handle);

        peer.emit("Target.targetCreated", json!({"targetInfo": {"targetId": "T1"}}));
        timeout(BOUND, async {
            while session.subscription_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        // A second live subscription still holding the weak handle
        let weak_in_handler = weak.clone();
        session
            .subscribe_all("Target.targetDestroyed", move |_: Arc<Value>| {
                let _ = weak_in_handler.upgrade();
            })
            .unwrap();

        drop(session);
        let reason = timeout(BOUND, async {
            loop {
                if let LifecycleEvent::Closed { reason } = lifecycle.recv().await.unwrap() {
                    break reason;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(reason, CloseReason::Requested("session dropped".into()));
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_see_the_real_close_reason() {
        let (session, _peer) = open();

        let watchers: Vec<_> = (0..8)
            .map(|_| {
                let session = session.clone();
                tokio::spawn(async move {
                    loop {
                        match session.subscribe_all("Page.loadEventFired", |_: Arc<Value>| {}) {
                            Ok(handle) => {
                                session.unsubscribe(&handle);
                                tokio::task::yield_now().await;
                            }
                            Err(Error::SessionClosed { reason }) => return reason,
                            Err(other) => panic!("unexpected error: {:?}", other),
                        }
                    }
                })
            })
            .collect();

        tokio::task::yield_now().await;
        let closers: Vec<_> = ["shutdown", "second"]
            .into_iter()
            .map(|reason| {
                let session = session.clone();
                tokio::spawn(async move { session.close(reason).await })
            })
            .collect();
        for closer in closers {
            closer.await.unwrap();
        }

        let recorded = session.close_reason().unwrap();
        assert!(matches!(&recorded, CloseReason::Requested(r) if r == "shutdown" || r == "second"));
        for watcher in watchers {
            assert_eq!(timeout(BOUND, watcher).await.unwrap().unwrap(), recorded);
        }
    }
}
