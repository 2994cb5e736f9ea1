//! Subscription registry
//!
//! Maps event type names to the handlers registered for them, in
//! registration order. Dispatch works on a snapshot of the handler list, so
//! handlers may subscribe or unsubscribe (themselves or others) while a frame
//! is being delivered.

use dashmap::DashMap;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{trace, warn};

use super::frame::EventFrame;

pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Identifies one registration. Unsubscribing twice is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    event_type: String,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }
}

#[derive(Clone)]
struct Registration {
    id: u64,
    handler: Handler,
}

pub struct SubscriptionRegistry {
    handlers: DashMap<String, Vec<Registration>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe<F>(&self, event_type: impl Into<String>, handler: F) -> SubscriptionHandle
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let event_type = event_type.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.handlers
            .entry(event_type.clone())
            .or_default()
            .push(Registration {
                id,
                handler: Arc::new(handler),
            });

        trace!(event_type = %event_type, subscription_id = id, "Subscribed");
        SubscriptionHandle { id, event_type }
    }

    /// Subscribe with the payload decoded into `T`. Payloads that do not
    /// decode are dropped for this handler only.
    pub fn subscribe_typed<T, F>(&self, event_type: impl Into<String>, handler: F) -> SubscriptionHandle
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let event_type = event_type.into();
        let label = event_type.clone();

        self.subscribe(event_type, move |payload: &Value| match T::deserialize(payload) {
            Ok(value) => handler(value),
            Err(e) => {
                warn!(event_type = %label, "Dropping payload that does not match the subscriber's type: {}", e);
            }
        })
    }

    /// Returns whether a registration was removed
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let removed = match self.handlers.get_mut(&handle.event_type) {
            Some(mut entry) => {
                let before = entry.len();
                entry.retain(|registration| registration.id != handle.id);
                before != entry.len()
            }
            None => false,
        };

        if removed {
            self.handlers
                .remove_if(&handle.event_type, |_, registrations| registrations.is_empty());
            trace!(event_type = %handle.event_type, subscription_id = handle.id, "Unsubscribed");
        }
        removed
    }

    pub fn handler_count(&self, event_type: &str) -> usize {
        self.handlers.get(event_type).map(|entry| entry.len()).unwrap_or(0)
    }

    /// Deliver a frame to every handler registered for its type when dispatch
    /// begins. A panicking handler is logged and skipped. Returns the number
    /// of handlers that completed.
    pub fn dispatch(&self, frame: &EventFrame) -> usize {
        let snapshot: Vec<Registration> = match self.handlers.get(&frame.event_type) {
            Some(entry) => entry.value().clone(),
            None => {
                trace!(event_type = %frame.event_type, "No subscribers, frame dropped");
                return 0;
            }
        };

        let mut delivered = 0;
        for registration in snapshot {
            let outcome = catch_unwind(AssertUnwindSafe(|| (registration.handler)(&frame.payload)));
            match outcome {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    warn!(
                        event_type = %frame.event_type,
                        subscription_id = registration.id,
                        "Subscriber handler panicked: {}",
                        panic_message(panic.as_ref())
                    );
                }
            }
        }
        delivered
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

/// Registration that is removed when dropped
pub struct Subscription {
    registry: Weak<SubscriptionRegistry>,
    handle: SubscriptionHandle,
}

impl Subscription {
    pub(crate) fn new(registry: &Arc<SubscriptionRegistry>, handle: SubscriptionHandle) -> Self {
        Self {
            registry: Arc::downgrade(registry),
            handle,
        }
    }

    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(&self.handle);
        }
    }
}
