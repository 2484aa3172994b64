//! Evaluation context.

use std::collections::HashMap;
use std::sync::Arc;

use crate::Value;

/// Snapshot of port values plus the current time, fed into the evaluator.
///
/// The value map is shared (`Arc`) so one snapshot per tick can be handed to
/// every port being re-evaluated without copying.
#[derive(Debug, Clone, Default)]
pub struct EvalContext {
    values: Arc<HashMap<String, Value>>,
    now_ms: i64,
    self_id: Option<String>,
    /// Overrides the owning port's value (used by transforms)
    self_value: Option<Value>,
}

impl EvalContext {
    /// Empty context at the given time
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms,
            ..Default::default()
        }
    }

    /// Context over a snapshot of `port id → last value`
    pub fn with_values(values: HashMap<String, Value>, now_ms: i64) -> Self {
        Self {
            values: Arc::new(values),
            now_ms,
            self_id: None,
            self_value: None,
        }
    }

    /// Bind the context to the port owning the expression
    pub fn for_port(&self, port_id: impl Into<String>) -> Self {
        Self {
            values: Arc::clone(&self.values),
            now_ms: self.now_ms,
            self_id: Some(port_id.into()),
            self_value: None,
        }
    }

    /// Context for a transform: only the port's own (raw) value is visible
    pub fn for_transform(port_id: impl Into<String>, value: Value, now_ms: i64) -> Self {
        Self {
            values: Arc::default(),
            now_ms,
            self_id: Some(port_id.into()),
            self_value: Some(value),
        }
    }

    pub fn now_ms(&self) -> i64 {
        self.now_ms
    }

    pub fn self_id(&self) -> Option<&str> {
        self.self_id.as_deref()
    }

    /// Value of a port as seen by this context
    pub fn port_value(&self, id: &str) -> Option<Value> {
        if self.self_id.as_deref() == Some(id) {
            if let Some(v) = self.self_value {
                return Some(v);
            }
        }
        self.values.get(id).copied()
    }

    /// Number of ports in the snapshot
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
