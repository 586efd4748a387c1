//! Event Router
//!
//! Subscriptions keyed by event name. Each subscription names the payload
//! type it wants; a notification's params are deserialized at most once per
//! type and the `Arc` is shared by every subscriber of that type.
//!
//! No router lock is held while handlers run, so a handler may subscribe or
//! unsubscribe (itself included) without deadlocking.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::de::DeserializeOwned;

use crate::codec::{Notification, SessionId};

pub type SubscriptionId = u64;

/// Returned by `subscribe`; pass it back to `unsubscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    event: Arc<str>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn event(&self) -> &str {
        &self.event
    }
}

type CachedPayload = Option<Arc<dyn Any + Send + Sync>>;

/// One notification on its way through the router, with its decode cache
struct EventView<'a> {
    notification: &'a Notification,
    decoded: HashMap<TypeId, CachedPayload>,
}

impl<'a> EventView<'a> {
    fn new(notification: &'a Notification) -> Self {
        Self {
            notification,
            decoded: HashMap::new(),
        }
    }

    /// Payload as `E`, decoded on first request and reused afterwards.
    fn decode<E>(&mut self) -> Option<Arc<E>>
    where
        E: DeserializeOwned + Send + Sync + 'static,
    {
        let notification = self.notification;
        let cached = self
            .decoded
            .entry(TypeId::of::<E>())
            .or_insert_with(|| match E::deserialize(&notification.params) {
                Ok(event) => Some(Arc::new(event) as Arc<dyn Any + Send + Sync>),
                Err(e) => {
                    tracing::warn!(
                        method = %notification.method,
                        "Event payload does not fit {}: {}",
                        type_name::<E>(),
                        e
                    );
                    None
                }
            });
        cached.clone().and_then(|any| any.downcast::<E>().ok())
    }
}

/// Returns whether the handler ran.
type Deliver = Box<dyn Fn(&mut EventView<'_>) -> bool + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    scope: Option<SessionId>,
    active: AtomicBool,
    deliver: Deliver,
}

impl Subscription {
    fn accepts_scope(&self, notification: &Notification) -> bool {
        match &self.scope {
            Some(scope) => notification.session_id.as_deref() == Some(scope.as_str()),
            None => true,
        }
    }
}

pub struct EventRouter {
    next_id: AtomicU64,
    subscriptions: DashMap<String, Vec<Arc<Subscription>>>,
    slow_handler_threshold: Duration,
}

impl EventRouter {
    pub fn new(slow_handler_threshold: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscriptions: DashMap::new(),
            slow_handler_threshold,
        }
    }

    /// Register `handler` for `event`. Only notifications whose payload
    /// decodes as `E`, passes `filter`, and (when `scope` is set) carries
    /// that `sessionId` reach the handler.
    pub fn subscribe<E, F, H>(
        &self,
        event: &str,
        scope: Option<SessionId>,
        filter: F,
        handler: H,
    ) -> SubscriptionHandle
    where
        E: DeserializeOwned + Send + Sync + 'static,
        F: Fn(&E) -> bool + Send + Sync + 'static,
        H: Fn(Arc<E>) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let deliver: Deliver = Box::new(move |view| {
            let Some(payload) = view.decode::<E>() else {
                return false;
            };
            if !filter(payload.as_ref()) {
                return false;
            }
            handler(payload);
            true
        });

        self.subscriptions
            .entry(event.to_string())
            .or_default()
            .push(Arc::new(Subscription {
                id,
                scope,
                active: AtomicBool::new(true),
                deliver,
            }));
        tracing::debug!(id, event, "Subscribed");

        SubscriptionHandle {
            id,
            event: Arc::from(event),
        }
    }

    /// Remove exactly this subscription. False if it was already gone.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let removed = match self.subscriptions.get_mut(handle.event()) {
            Some(mut subs) => match subs.iter().position(|s| s.id == handle.id) {
                Some(pos) => {
                    let sub = subs.remove(pos);
                    sub.active.store(false, Ordering::SeqCst);
                    true
                }
                None => false,
            },
            None => false,
        };
        if removed {
            self.subscriptions
                .remove_if(handle.event(), |_, subs| subs.is_empty());
            tracing::debug!(id = handle.id, event = handle.event(), "Unsubscribed");
        }
        removed
    }

    /// Deliver one notification to every matching subscription.
    /// Returns how many handlers ran.
    pub fn dispatch(&self, notification: &Notification) -> usize {
        // Snapshot, then release the shard lock before running handlers
        let snapshot = match self.subscriptions.get(&notification.method) {
            Some(subs) => subs.value().clone(),
            None => return 0,
        };

        let mut view = EventView::new(notification);
        let mut invoked = 0;
        for sub in snapshot {
            // Unsubscribed by an earlier handler of this same notification
            if !sub.active.load(Ordering::SeqCst) || !sub.accepts_scope(notification) {
                continue;
            }

            let started = Instant::now();
            match catch_unwind(AssertUnwindSafe(|| (sub.deliver)(&mut view))) {
                Ok(true) => invoked += 1,
                Ok(false) => {}
                Err(panic) => {
                    tracing::error!(
                        subscription = sub.id,
                        method = %notification.method,
                        "Event handler panicked: {}",
                        panic_message(panic.as_ref())
                    );
                }
            }

            let elapsed = started.elapsed();
            if elapsed > self.slow_handler_threshold {
                tracing::warn!(
                    subscription = sub.id,
                    method = %notification.method,
                    "Slow event handler took {:?}; hand long work off to a task",
                    elapsed
                );
            }
        }
        invoked
    }

    /// Drop every subscription. In-progress dispatch skips them from here on.
    pub fn clear(&self) {
        for entry in self.subscriptions.iter() {
            for sub in entry.value() {
                sub.active.store(false, Ordering::SeqCst);
            }
        }
        self.subscriptions.clear();
    }

    /// Number of live subscriptions across all events
    pub fn len(&self) -> usize {
        self.subscriptions.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        *msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "<non-string panic>"
    }
}
