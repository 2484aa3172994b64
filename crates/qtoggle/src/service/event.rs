//! Service Events
//!
//! Port lifecycle and value changes are broadcast as events so that loggers,
//! history recorders and API layers can observe the runtime without being
//! called by it.

use qtoggle_expressions::Value;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use wildmatch::WildMatch;

/// Event type names
pub mod kinds {
    pub const PORT_ADD: &str = "Port/Add";
    pub const PORT_REMOVE: &str = "Port/Remove";
    pub const PORT_UPDATE: &str = "Port/Update";
    pub const VALUE_CHANGE: &str = "Port/ValueChange";
}

// ─────────────────────────────────────────────────────────────────────────────
// Event
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Event type identifier (see [`kinds`])
    pub event_type: String,

    /// Port id or service that generated the event
    pub source: String,

    pub data: serde_json::Value,

    /// Unix milliseconds
    pub timestamp: i64,
}

impl Event {
    pub fn new(
        event_type: impl Into<String>,
        source: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            source: source.into(),
            data,
            timestamp: crate::now_ms(),
        }
    }

    /// A port was added; `attrs` is the full attribute map
    pub fn port_add(port_id: &str, attrs: serde_json::Value) -> Self {
        Self::new(kinds::PORT_ADD, port_id, attrs)
    }

    pub fn port_remove(port_id: &str) -> Self {
        Self::new(kinds::PORT_REMOVE, port_id, serde_json::json!({ "id": port_id }))
    }

    /// An attribute of a port was changed
    pub fn port_update(port_id: &str, attrs: serde_json::Value) -> Self {
        Self::new(kinds::PORT_UPDATE, port_id, attrs)
    }

    pub fn value_change(port_id: &str, old: Option<Value>, new: Value) -> Self {
        Self::new(
            kinds::VALUE_CHANGE,
            port_id,
            serde_json::json!({
                "id": port_id,
                "old_value": old.map(|v| v.to_json()),
                "value": new.to_json(),
            }),
        )
    }

    /// Check if this event matches a subscription pattern
    ///
    /// Patterns are globs over the event type: `Port/ValueChange`, `Port/*`, `*`.
    pub fn matches(&self, pattern: &str) -> bool {
        pattern == "*" || WildMatch::new(pattern).matches(&self.event_type)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Event Publisher
// ─────────────────────────────────────────────────────────────────────────────

/// A handle for publishing events
#[derive(Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<Event>,
}

impl EventPublisher {
    pub fn new(tx: broadcast::Sender<Event>) -> Self {
        Self { tx }
    }

    /// Stand-alone publisher with its own channel
    pub fn detached(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event; having no subscribers is not an error
    pub fn publish(&self, event: Event) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Event dropped, no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("receivers", &self.tx.receiver_count())
            .finish()
    }
}
