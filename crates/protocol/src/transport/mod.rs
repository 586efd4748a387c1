//! Transport boundary
//!
//! A transport is split in two halves up front: a shareable sender for the
//! many tasks issuing commands, and a receiver that is moved into the
//! dispatch loop. Owning the receiver by value is what makes "one reader
//! per session" hold.

pub mod memory;
pub mod websocket;

use async_trait::async_trait;

use crate::error::TransportError;

pub use memory::{MemoryPeer, MemoryTransport};
pub use websocket::WebSocketTransport;

/// One logical message on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Frame::Text(text) => text.as_bytes(),
            Frame::Binary(bytes) => bytes,
        }
    }
}

/// Write half. Called concurrently from every `send`.
#[async_trait]
pub trait TransportSender: Send + Sync {
    async fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Close the connection. Errors here are logged by the session, never surfaced.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Read half. `None` means the peer ended the stream cleanly.
#[async_trait]
pub trait TransportReceiver: Send {
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>>;
}

/// Both halves of a connected transport
pub struct Transport {
    pub sender: Box<dyn TransportSender>,
    pub receiver: Box<dyn TransportReceiver>,
}

impl Transport {
    pub fn new(
        sender: impl TransportSender + 'static,
        receiver: impl TransportReceiver + 'static,
    ) -> Self {
        Self {
            sender: Box::new(sender),
            receiver: Box::new(receiver),
        }
    }
}
