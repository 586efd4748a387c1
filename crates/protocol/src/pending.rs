//! Pending-Command Table
//!
//! In-flight commands keyed by id. Each entry owns a type-erased completion
//! that deserializes the result into whatever the caller asked for and
//! fires the caller's oneshot. Entries leave the table exactly once: on
//! resolve, fail, cancel, or drain.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::codec::{CommandId, RemoteError};
use crate::error::{CloseReason, Error, Result};

/// Fires the waiting caller. Returns false if the caller already went away.
type Completion = Box<dyn FnOnce(Result<Value>) -> bool + Send + Sync>;

/// Receives the outcome of one registered command
pub type Waiter<T> = oneshot::Receiver<Result<T>>;

pub struct PendingCommand {
    pub id: CommandId,
    pub method: String,
    pub created_at: Instant,
    complete: Completion,
}

impl PendingCommand {
    fn finish(self, outcome: Result<Value>) {
        let elapsed = self.created_at.elapsed();
        let ok = outcome.is_ok();
        if (self.complete)(outcome) {
            tracing::debug!(
                id = self.id,
                method = %self.method,
                ok,
                "Command completed in {:?}",
                elapsed
            );
        } else {
            tracing::debug!(
                id = self.id,
                method = %self.method,
                "Caller gone before completion"
            );
        }
    }
}

pub struct PendingTable {
    next_id: AtomicU64,
    entries: DashMap<CommandId, PendingCommand>,
    closed: OnceLock<CloseReason>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    fn starting_at(first_id: CommandId) -> Self {
        Self {
            next_id: AtomicU64::new(first_id),
            entries: DashMap::new(),
            closed: OnceLock::new(),
        }
    }

    /// Allocate an id and park a completion slot for a `T` result.
    pub fn register<T>(&self, method: &str) -> Result<(CommandId, Waiter<T>)>
    where
        T: DeserializeOwned + Send + 'static,
    {
        if let Some(reason) = self.closed.get() {
            return Err(Error::SessionClosed {
                reason: reason.clone(),
            });
        }

        let id = self
            .next_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| id.checked_add(1))
            .map_err(|_| Error::IdsExhausted)?;

        let (tx, rx) = oneshot::channel();
        let decode_method = method.to_string();
        let complete: Completion = Box::new(move |outcome: Result<Value>| {
            let result = outcome.and_then(|value| {
                serde_json::from_value::<T>(value).map_err(|source| Error::Decode {
                    id,
                    method: decode_method,
                    source,
                })
            });
            tx.send(result).is_ok()
        });

        self.entries.insert(
            id,
            PendingCommand {
                id,
                method: method.to_string(),
                created_at: Instant::now(),
                complete,
            },
        );

        // Raced with drain_all: back out if the drain didn't already take us
        if let Some(reason) = self.closed.get() {
            if self.entries.remove(&id).is_some() {
                return Err(Error::SessionClosed {
                    reason: reason.clone(),
                });
            }
        }

        Ok((id, rx))
    }

    /// Deliver a successful result. False if nobody was waiting on `id`.
    pub fn resolve(&self, id: CommandId, result: Value) -> bool {
        match self.entries.remove(&id) {
            Some((_, pending)) => {
                pending.finish(Ok(result));
                true
            }
            None => {
                self.log_unknown(id);
                false
            }
        }
    }

    /// Deliver a remote error. False if nobody was waiting on `id`.
    pub fn fail(&self, id: CommandId, error: RemoteError) -> bool {
        match self.entries.remove(&id) {
            Some((_, pending)) => {
                let method = pending.method.clone();
                pending.finish(Err(Error::Protocol { method, error }));
                true
            }
            None => {
                self.log_unknown(id);
                false
            }
        }
    }

    /// Forget a command without completing it (timeout, cancel, dropped caller).
    pub fn cancel(&self, id: CommandId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Close the table and fail everything in it. Returns how many were failed.
    pub fn drain_all(&self, reason: CloseReason) -> usize {
        let reason = self.closed.get_or_init(|| reason).clone();

        let ids: Vec<CommandId> = self.entries.iter().map(|entry| *entry.key()).collect();
        let mut drained = 0;
        for id in ids {
            if let Some((_, pending)) = self.entries.remove(&id) {
                pending.finish(Err(Error::SessionClosed {
                    reason: reason.clone(),
                }));
                drained += 1;
            }
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get().is_some()
    }

    fn log_unknown(&self, id: CommandId) {
        if id < self.next_id.load(Ordering::SeqCst) {
            // Issued by us once: the caller timed out, cancelled, or this is a duplicate
            tracing::debug!(id, "Dropping late response");
        } else {
            tracing::warn!(id, "Received response for unknown command");
        }
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}
