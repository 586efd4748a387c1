//! In-memory transport
//!
//! Channel-backed stand-in for a browser. The [`MemoryPeer`] plays the
//! remote end: it reads the commands a session wrote, and injects
//! responses and events in whatever order a test needs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::{Frame, Transport, TransportReceiver, TransportSender};
use crate::codec::CommandId;
use crate::error::TransportError;

type Inbound = Result<Frame, TransportError>;

pub struct MemoryTransport;

impl MemoryTransport {
    /// Create a connected transport and the peer that drives it.
    pub fn pair() -> (Transport, MemoryPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let transport = Transport::new(
            MemorySender {
                tx: out_tx,
                closed: closed.clone(),
            },
            MemoryReceiver { rx: in_rx },
        );
        let peer = MemoryPeer {
            outbound: out_rx,
            inbound: Some(in_tx),
            closed,
        };
        (transport, peer)
    }
}

struct MemorySender {
    tx: mpsc::UnboundedSender<Frame>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl TransportSender for MemorySender {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryReceiver {
    rx: mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait]
impl TransportReceiver for MemoryReceiver {
    async fn recv(&mut self) -> Option<Inbound> {
        self.rx.recv().await
    }
}

/// Remote end of a [`MemoryTransport`]
pub struct MemoryPeer {
    outbound: mpsc::UnboundedReceiver<Frame>,
    inbound: Option<mpsc::UnboundedSender<Inbound>>,
    closed: Arc<AtomicBool>,
}

impl MemoryPeer {
    /// Next command written by the session, parsed as JSON.
    /// `None` once the session side is gone.
    pub async fn next_command(&mut self) -> Option<Value> {
        let frame = self.outbound.recv().await?;
        serde_json::from_slice(frame.as_bytes()).ok()
    }

    /// A command already written, without waiting.
    pub fn try_next_command(&mut self) -> Option<Value> {
        let frame = self.outbound.try_recv().ok()?;
        serde_json::from_slice(frame.as_bytes()).ok()
    }

    /// Read `n` commands, in write order.
    pub async fn next_commands(&mut self, n: usize) -> Vec<Value> {
        let mut commands = Vec::with_capacity(n);
        while commands.len() < n {
            match self.next_command().await {
                Some(command) => commands.push(command),
                None => break,
            }
        }
        commands
    }

    /// Inject a raw text frame.
    pub fn push_raw(&self, text: impl Into<String>) {
        self.push(Ok(Frame::Text(text.into())));
    }

    /// Inject a JSON frame.
    pub fn push_json(&self, value: &Value) {
        self.push_raw(value.to_string());
    }

    /// Reply to a command with a result.
    pub fn respond(&self, id: CommandId, result: Value) {
        self.push_json(&json!({ "id": id, "result": result }));
    }

    /// Reply to a command with a CDP-style error.
    pub fn respond_error(&self, id: CommandId, code: i64, message: &str) {
        self.push_json(&json!({
            "id": id,
            "error": { "code": code, "message": message },
        }));
    }

    /// Emit an event.
    pub fn emit(&self, method: &str, params: Value) {
        self.push_json(&json!({ "method": method, "params": params }));
    }

    /// Emit an event tagged with a flat-mode session id.
    pub fn emit_scoped(&self, session_id: &str, method: &str, params: Value) {
        self.push_json(&json!({
            "method": method,
            "params": params,
            "sessionId": session_id,
        }));
    }

    /// Make the session's next read fail.
    pub fn fail(&self, error: TransportError) {
        self.push(Err(error));
    }

    /// End the inbound stream, as a remote close would.
    pub fn disconnect(&mut self) {
        self.inbound = None;
    }

    /// Whether the session closed its side.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn push(&self, item: Inbound) {
        if let Some(tx) = &self.inbound {
            // Receiver gone means the session already stopped reading
            let _ = tx.send(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip_through_peer() {
        let (mut transport, mut peer) = MemoryTransport::pair();

        transport
            .sender
            .send(Frame::Text(
                r#"{"id":1,"method":"Browser.getVersion","params":{}}"#.into(),
            ))
            .await
            .unwrap();
        let command = peer.next_command().await.unwrap();
        assert_eq!(command["method"], "Browser.getVersion");
        assert!(peer.try_next_command().is_none());

        peer.respond(1, json!({"product": "Chrome"}));
        let frame = transport.receiver.recv().await.unwrap().unwrap();
        let parsed: Value = serde_json::from_slice(frame.as_bytes()).unwrap();
        assert_eq!(parsed["result"]["product"], "Chrome");

        peer.disconnect();
        assert!(transport.receiver.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (transport, peer) = MemoryTransport::pair();
        transport.sender.close().await.unwrap();
        assert!(peer.is_closed());
        assert!(matches!(
            transport.sender.send(Frame::Text("{}".into())).await,
            Err(TransportError::Closed)
        ));
    }
}
