//! Dispatch Loop
//!
//! The only reader of the transport. Responses go to the pending table by
//! id; events are queued for the event task, which runs subscription
//! handlers in arrival order. A slow handler delays later events, never a
//! response. A bad frame is logged and skipped; only the transport ending
//! (or the session shutting down) stops the reader.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::codec::{self, Decoded, Notification};
use crate::error::CloseReason;
use crate::pending::PendingTable;
use crate::session::Shared;
use crate::transport::{Frame, TransportReceiver};

/// Read until the transport ends or shutdown is signalled, then close the session.
pub(crate) async fn run(
    shared: Arc<Shared>,
    mut receiver: Box<dyn TransportReceiver>,
    events: mpsc::UnboundedSender<Notification>,
) {
    tracing::debug!("Dispatch loop started");

    let reason = loop {
        tokio::select! {
            // Shutdown is only observed between frames
            biased;
            _ = shared.shutdown.cancelled() => break None,
            frame = receiver.recv() => match frame {
                Some(Ok(frame)) => route(&shared.pending, &events, &frame),
                None => {
                    tracing::info!("Transport closed by remote");
                    break Some(CloseReason::RemoteClosed);
                }
                Some(Err(e)) => {
                    tracing::error!("Transport error: {}", e);
                    break Some(CloseReason::Transport(e.to_string()));
                }
            }
        }
    };

    match reason {
        Some(reason) => shared.close(reason).await,
        // Every Session handle was dropped without an explicit close
        None if shared.is_open() => {
            shared
                .close(CloseReason::Requested("session dropped".to_string()))
                .await
        }
        None => {}
    }
    tracing::debug!("Dispatch loop stopped");
}

/// Run subscription handlers for queued events until shutdown.
pub(crate) async fn deliver(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<Notification>) {
    loop {
        tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            notification = events.recv() => match notification {
                Some(notification) => {
                    let invoked = shared.router.dispatch(&notification);
                    tracing::trace!(method = %notification.method, invoked, "Event dispatched");
                }
                // Reader gone
                None => break,
            }
        }
    }
    tracing::debug!("Event delivery stopped");
}

/// Decode one frame and hand it to whoever is waiting for it.
pub(crate) fn route(
    pending: &PendingTable,
    events: &mpsc::UnboundedSender<Notification>,
    frame: &Frame,
) {
    let bytes = frame.as_bytes();
    tracing::trace!("<- {}", String::from_utf8_lossy(bytes));

    match codec::decode(bytes) {
        Ok(Decoded::Response {
            id,
            outcome: Ok(result),
        }) => {
            pending.resolve(id, result);
        }
        Ok(Decoded::Response {
            id,
            outcome: Err(error),
        }) => {
            pending.fail(id, error);
        }
        Ok(Decoded::Event(notification)) => {
            if events.send(notification).is_err() {
                tracing::debug!("Event task stopped, dropping event");
            }
        }
        Err(e) => {
            tracing::warn!("Dropping undecodable frame: {}", e);
        }
    }
}
