//! Typed publish/subscribe hub for lifecycle notifications.
//!
//! One [`EventBus`] is constructed alongside the server and shared by
//! reference. Each [`EventKind`] gets its own broadcast channel, created
//! on first use. Emitting never blocks: a subscriber that falls more than
//! the channel capacity behind skips the oldest events.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::session::SessionId;

/// Default per-kind channel capacity.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ServerStart,
    ServerStop,
    ServerError,
    SessionOpen,
    SessionClose,
    SessionError,
    MessageReceived,
    Custom,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::ServerStart,
        EventKind::ServerStop,
        EventKind::ServerError,
        EventKind::SessionOpen,
        EventKind::SessionClose,
        EventKind::SessionError,
        EventKind::MessageReceived,
        EventKind::Custom,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::ServerStart => "server_start",
            EventKind::ServerStop => "server_stop",
            EventKind::ServerError => "server_error",
            EventKind::SessionOpen => "session_open",
            EventKind::SessionClose => "session_close",
            EventKind::SessionError => "session_error",
            EventKind::MessageReceived => "message_received",
            EventKind::Custom => "custom",
        }
    }
}

/// What produced an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Server,
    Session(SessionId),
    Custom(String),
}

/// An immutable lifecycle notification.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub correlation_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub source: EventSource,
    pub properties: HashMap<String, Value>,
}

impl Event {
    /// Create an event stamped with a fresh correlation id and the current time.
    pub fn new(kind: EventKind, source: EventSource) -> Self {
        Self {
            kind,
            correlation_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source,
            properties: HashMap::new(),
        }
    }

    /// Application-defined event.
    pub fn custom(name: impl Into<String>) -> Self {
        Self::new(EventKind::Custom, EventSource::Custom(name.into()))
    }

    /// Attach a property.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Convenience accessor for string-valued properties.
    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.property(key).and_then(Value::as_str)
    }
}

/// Process-wide event hub keyed by [`EventKind`].
#[derive(Debug)]
pub struct EventBus {
    channels: DashMap<EventKind, broadcast::Sender<Arc<Event>>>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus whose per-kind channels buffer `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, kind: EventKind) -> broadcast::Sender<Arc<Event>> {
        self.channels
            .entry(kind)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Publish an event. Returns the number of subscribers it reached.
    pub fn emit(&self, event: Event) -> usize {
        let kind = event.kind;
        match self.sender(kind).send(Arc::new(event)) {
            Ok(n) => n,
            Err(_) => {
                tracing::trace!(kind = kind.as_str(), "event emitted with no subscribers");
                0
            }
        }
    }

    /// Subscribe to every event of `kind` emitted from now on.
    pub fn on_event(&self, kind: EventKind) -> EventSubscription {
        EventSubscription {
            kind,
            rx: self.sender(kind).subscribe(),
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.channels
            .get(&kind)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

/// A live subscription returned by [`EventBus::on_event`].
#[derive(Debug)]
pub struct EventSubscription {
    kind: EventKind,
    rx: broadcast::Receiver<Arc<Event>>,
}

impl EventSubscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Wait for the next event. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(
                        kind = self.kind.as_str(),
                        skipped = n,
                        "event subscriber lagged, dropped events"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next already-buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!(
                        kind = self.kind.as_str(),
                        skipped = n,
                        "event subscriber lagged, dropped events"
                    );
                }
                Err(_) => return None,
            }
        }
    }
}
