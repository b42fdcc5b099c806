//! In-process event bus for lifecycle events.
//!
//! Delivery is synchronous on the publisher's task. Subscribers must stay
//! short; anything heavier hands off to its own queue. A panicking
//! subscriber is logged and never takes the publisher down.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Events emitted by the core, consumed by admin/UI collaborators.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    ServiceConnected {
        service: String,
        tool_count: usize,
    },
    ServiceDisconnected {
        service: String,
    },
    ServiceConnectionFailed {
        service: String,
        error: String,
        attempt: u32,
    },
    ServerAdded {
        name: String,
    },
    ServerRemoved {
        name: String,
    },
    ServerStatusChanged {
        name: String,
        status: String,
    },
    ServerToolsUpdated {
        name: String,
        tool_count: usize,
    },
    ServiceRestartRequested {
        service: String,
    },
    ConfigChange {
        added: Vec<String>,
        removed: Vec<String>,
    },
    ConnectionError {
        endpoint: String,
        error: String,
        class: String,
    },
    AuthenticationError {
        endpoint: String,
        error: String,
    },
    ConnectionRecovered {
        endpoint: String,
        attempts: u32,
    },
}

impl GatewayEvent {
    /// Stable wire name of the event, as consumed by the admin surface.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ServiceConnected { .. } => "service:connected",
            Self::ServiceDisconnected { .. } => "service:disconnected",
            Self::ServiceConnectionFailed { .. } => "service:connection:failed",
            Self::ServerAdded { .. } => "mcp:server:added",
            Self::ServerRemoved { .. } => "mcp:server:removed",
            Self::ServerStatusChanged { .. } => "mcp:server:status_changed",
            Self::ServerToolsUpdated { .. } => "mcp:server:tools:updated",
            Self::ServiceRestartRequested { .. } => "service:restart:requested",
            Self::ConfigChange { .. } => "configChange",
            Self::ConnectionError { .. } => "connectionError",
            Self::AuthenticationError { .. } => "authenticationError",
            Self::ConnectionRecovered { .. } => "connectionRecovered",
        }
    }
}

type Subscriber = Arc<dyn Fn(&GatewayEvent, DateTime<Utc>) + Send + Sync>;

/// Process-wide typed pub/sub. Cheap to clone; all clones share state.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

#[derive(Default)]
struct EventBusInner {
    subscribers: Mutex<Vec<(u64, Subscriber)>>,
    next_id: AtomicU64,
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for every event.
    pub fn subscribe<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&GatewayEvent, DateTime<Utc>) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().push((id, Arc::new(f)));
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.subscribers.lock().retain(|(sid, _)| *sid != id.0);
    }

    /// Deliver `event` to every subscriber, in subscription order.
    ///
    /// The subscriber list is snapshotted first so a subscriber may call
    /// back into the bus without deadlocking.
    pub fn publish(&self, event: GatewayEvent) {
        let timestamp = Utc::now();
        let snapshot: Vec<Subscriber> = self
            .inner
            .subscribers
            .lock()
            .iter()
            .map(|(_, f)| f.clone())
            .collect();

        for subscriber in snapshot {
            let outcome = catch_unwind(AssertUnwindSafe(|| subscriber(&event, timestamp)));
            if outcome.is_err() {
                tracing::error!(event = event.name(), "event subscriber panicked");
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}
