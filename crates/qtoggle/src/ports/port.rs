//! Port
//!
//! A port couples a driver with the attribute model, the transform pipelines
//! and two workers (write, eval). Reads are driven by the scheduler; writes and
//! evaluations go through bounded per-port queues. A per-port I/O lock keeps
//! reads and writes from overlapping.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use qtoggle_expressions::{DepSet, EvalContext, EvalError, Expression, Value, find_loop};
use qtoggle_persist::{Record, values_equal};
use serde_json::{Map, Value as JsonValue, json};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::attrs::{
    self, AttrDef, Choice, PortTraits, PortType, attrdefs_schema, check_number, standard_attrdefs,
};
use super::queue::BoundedQueue;
use super::sequence::Sequence;
use super::workers;
use crate::drivers::PortDriver;
use crate::error::{AttrError, AttrResult, PortError, PortResult};
use crate::service::Event;

// ─────────────────────────────────────────────────────────────────────────────
// Host
// ─────────────────────────────────────────────────────────────────────────────

/// What a port needs from the runtime that owns it
pub trait PortHost: Send + Sync + 'static {
    fn publish(&self, event: Event);

    /// A write finished; run the scheduler soon
    fn nudge(&self);

    /// Evaluate the port's expression at the next tick regardless of deps
    fn force_eval(&self, port_id: &str);

    /// Deps of the expression held by `port_id`, if any
    fn expression_deps(&self, port_id: &str) -> Option<DepSet>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Write Requests
// ─────────────────────────────────────────────────────────────────────────────

pub(super) struct WriteRequest {
    pub value: Value,
    pub done: oneshot::Sender<PortResult<()>>,
}

/// Completion of a queued write
#[derive(Debug)]
pub struct WriteCompletion(oneshot::Receiver<PortResult<()>>);

impl WriteCompletion {
    pub async fn wait(self) -> PortResult<()> {
        self.0.await.unwrap_or(Err(PortError::Cancelled))
    }
}

#[derive(Debug, Clone, Copy)]
enum Transform {
    Read,
    Write,
}

// ─────────────────────────────────────────────────────────────────────────────
// Port State
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct PortState {
    enabled: bool,
    persisted: bool,
    internal: bool,
    display_name: Option<String>,
    unit: Option<String>,
    tag: Option<String>,

    expression: Option<Expression>,
    expression_deps: DepSet,
    transform_read: Option<Expression>,
    transform_write: Option<Expression>,

    history_interval: i64,
    history_retention: i64,
    history_last_timestamp: i64,

    min: Option<f64>,
    max: Option<f64>,
    integer: bool,
    step: Option<f64>,
    choices: Option<Vec<Choice>>,

    last_read_value: Option<Value>,
    pending_value: Option<Value>,
    writing: bool,
}

impl PortState {
    fn new(integer: bool) -> Self {
        Self {
            enabled: true,
            persisted: false,
            internal: false,
            display_name: None,
            unit: None,
            tag: None,
            expression: None,
            expression_deps: DepSet::new(),
            transform_read: None,
            transform_write: None,
            history_interval: 0,
            history_retention: 0,
            history_last_timestamp: 0,
            min: None,
            max: None,
            integer,
            step: None,
            choices: None,
            last_read_value: None,
            pending_value: None,
            writing: false,
        }
    }
}

/// History settings of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistorySettings {
    /// Seconds between samples; -1 samples on every change, 0 disables
    pub interval: i64,
    /// Seconds to keep; 0 keeps everything
    pub retention: i64,
    /// Unix ms of the last sample
    pub last_timestamp: i64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Port
// ─────────────────────────────────────────────────────────────────────────────

pub struct Port {
    id: String,
    port_type: PortType,
    writable: bool,
    is_virtual: bool,
    driver: Arc<dyn PortDriver>,
    host: Weak<dyn PortHost>,

    state: RwLock<PortState>,
    attr_cache: DashMap<String, JsonValue>,
    schema_cache: Mutex<Option<JsonValue>>,

    io_lock: tokio::sync::Mutex<()>,
    pub(super) write_queue: BoundedQueue<WriteRequest>,
    pub(super) eval_queue: BoundedQueue<EvalContext>,
    pub(super) eval_pending: AtomicBool,
    save_asap: AtomicBool,

    tasks: Mutex<Vec<JoinHandle<()>>>,
    sequence: Mutex<Option<JoinHandle<()>>>,
}

impl Port {
    pub fn new(
        id: impl Into<String>,
        driver: Arc<dyn PortDriver>,
        is_virtual: bool,
        host: Weak<dyn PortHost>,
        queue_capacity: usize,
    ) -> Arc<Self> {
        let integer = driver.port_type() == PortType::Number && driver.is_integer();
        Arc::new(Self {
            id: id.into(),
            port_type: driver.port_type(),
            writable: driver.is_writable(),
            is_virtual,
            state: RwLock::new(PortState::new(integer)),
            attr_cache: DashMap::new(),
            schema_cache: Mutex::new(None),
            io_lock: tokio::sync::Mutex::new(()),
            write_queue: BoundedQueue::new(queue_capacity),
            eval_queue: BoundedQueue::new(queue_capacity),
            eval_pending: AtomicBool::new(false),
            save_asap: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            sequence: Mutex::new(None),
            driver,
            host,
        })
    }

    /// Spawn the write and eval workers
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        tasks.push(tokio::spawn(workers::write_loop(Arc::clone(self))));
        tasks.push(tokio::spawn(workers::eval_loop(Arc::clone(self))));
        debug!(port_id = %self.id, "Port workers started");
    }

    /// Cancel the sequence, reject queued writes and wait for the workers
    pub async fn stop(&self) {
        self.cancel_sequence();

        let rejected = self.write_queue.close();
        if !rejected.is_empty() {
            debug!(port_id = %self.id, count = rejected.len(), "Rejecting queued writes");
        }
        for req in rejected {
            let _ = req.done.send(Err(PortError::Cancelled));
        }
        self.eval_queue.close();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!(port_id = %self.id, error = %e, "Port worker ended abnormally");
            }
        }

        self.state.write().pending_value = None;
        debug!(port_id = %self.id, "Port stopped");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn port_type(&self) -> PortType {
        self.port_type
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_virtual(&self) -> bool {
        self.is_virtual
    }

    pub fn driver(&self) -> &Arc<dyn PortDriver> {
        &self.driver
    }

    pub fn is_enabled(&self) -> bool {
        self.state.read().enabled
    }

    pub fn is_persisted(&self) -> bool {
        self.state.read().persisted
    }

    pub fn is_internal(&self) -> bool {
        self.state.read().internal
    }

    pub fn last_read_value(&self) -> Option<Value> {
        self.state.read().last_read_value
    }

    /// Value being written, or next in line to be
    pub fn pending_value(&self) -> Option<Value> {
        self.state.read().pending_value
    }

    /// Store a freshly read value, returning the previous one
    pub(crate) fn set_last_read_value(&self, value: Value) -> Option<Value> {
        self.state.write().last_read_value.replace(value)
    }

    pub fn has_expression(&self) -> bool {
        self.state.read().expression.is_some()
    }

    /// Deps of the current expression, if there is one
    pub fn expression_deps(&self) -> Option<DepSet> {
        let state = self.state.read();
        state.expression.as_ref().map(|_| state.expression_deps.clone())
    }

    pub fn is_eval_pending(&self) -> bool {
        self.eval_pending.load(Ordering::SeqCst)
    }

    pub fn history(&self) -> HistorySettings {
        let state = self.state.read();
        HistorySettings {
            interval: state.history_interval,
            retention: state.history_retention,
            last_timestamp: state.history_last_timestamp,
        }
    }

    pub(crate) fn set_history_last_timestamp(&self, ts: i64) {
        self.state.write().history_last_timestamp = ts;
    }

    pub(crate) fn mark_save_asap(&self) {
        self.save_asap.store(true, Ordering::SeqCst);
    }

    /// Clear and return the "needs saving" flag
    pub(crate) fn take_save_asap(&self) -> bool {
        self.save_asap.swap(false, Ordering::SeqCst)
    }

    fn traits(&self) -> PortTraits {
        PortTraits {
            port_type: self.port_type,
            writable: self.writable,
        }
    }

    fn publish(&self, event: Event) {
        if let Some(host) = self.host.upgrade() {
            host.publish(event);
        }
    }

    pub(super) fn nudge_host(&self) {
        if let Some(host) = self.host.upgrade() {
            host.nudge();
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Attributes
    // ─────────────────────────────────────────────────────────────────────────

    /// Standard attributes that apply to this port, followed by driver attributes
    pub fn attrdefs(&self) -> Vec<AttrDef> {
        let traits = self.traits();
        standard_attrdefs()
            .iter()
            .filter(|d| d.is_enabled_for(&traits))
            .cloned()
            .chain(self.driver.additional_attrdefs())
            .collect()
    }

    pub fn attrdef(&self, name: &str) -> Option<AttrDef> {
        self.attrdefs().into_iter().find(|d| d.name == name)
    }

    /// JSON schema of the modifiable attributes
    pub fn schema(&self) -> JsonValue {
        let mut cache = self.schema_cache.lock();
        if let Some(schema) = cache.as_ref() {
            return schema.clone();
        }
        let schema = attrdefs_schema(&self.attrdefs());
        *cache = Some(schema.clone());
        schema
    }

    /// Drop cached attribute values (done at every tick)
    pub fn invalidate_attr_cache(&self) {
        self.attr_cache.clear();
    }

    fn invalidate_attrs(&self) {
        self.attr_cache.clear();
        *self.schema_cache.lock() = None;
    }

    /// Current value of an attribute; `None` when unknown or unset
    pub async fn get_attr(&self, name: &str) -> Option<JsonValue> {
        if let Some(cached) = self.attr_cache.get(name).map(|v| v.value().clone()) {
            return Some(cached);
        }

        let def = self.attrdef(name)?;
        let value = match self.get_standard(name) {
            Some(v) => v,
            None => self.driver.get_attr(name).await.unwrap_or(JsonValue::Null),
        };
        let value = match value {
            JsonValue::Null => def.default?,
            v => v,
        };

        self.attr_cache.insert(name.to_string(), value.clone());
        Some(value)
    }

    /// All attributes plus the current value
    pub async fn attrs_json(&self) -> JsonValue {
        let mut attrs = Map::new();
        for def in self.attrdefs() {
            if let Some(v) = self.get_attr(&def.name).await {
                attrs.insert(def.name, v);
            }
        }
        attrs.insert(
            "value".into(),
            self.last_read_value().map(|v| v.to_json()).unwrap_or(JsonValue::Null),
        );
        JsonValue::Object(attrs)
    }

    pub async fn set_attr(&self, name: &str, value: JsonValue) -> AttrResult<()> {
        let def = self
            .attrdef(name)
            .ok_or_else(|| AttrError::UnknownAttribute(name.to_string()))?;
        if !def.modifiable {
            return Err(AttrError::NotModifiable(name.to_string()));
        }
        def.validate(&value)?;

        self.apply_attr(name, &value).await?;
        self.invalidate_attrs();
        self.mark_save_asap();
        debug!(port_id = %self.id, attr = name, %value, "Attribute updated");

        let attrs = self.attrs_json().await;
        self.publish(Event::port_update(&self.id, attrs));
        Ok(())
    }

    /// Apply the attributes of a persisted record.
    ///
    /// Invalid entries are logged and skipped; `value` is left to the caller.
    pub async fn load_attrs(&self, record: &Record) {
        for name in attrs::load_order(record.keys().map(String::as_str)) {
            let Some(value) = record.get(name) else {
                continue;
            };
            if name == "history_last_timestamp" {
                let ts = value.as_f64().unwrap_or(0.0) as i64;
                self.set_history_last_timestamp(ts);
                continue;
            }
            let Some(def) = self.attrdef(name) else {
                if name != "id" && name != "value" {
                    debug!(port_id = %self.id, attr = name, "Ignoring unknown persisted attribute");
                }
                continue;
            };
            if !def.modifiable {
                continue;
            }

            let result = match def.validate(value) {
                Ok(()) => self.apply_attr(name, value).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(port_id = %self.id, attr = name, error = %e, "Ignoring persisted attribute");
            }
        }
        self.invalidate_attrs();
    }

    /// Record to persist: modifiable non-null attributes, id, history
    /// timestamp, and the value for persisted ports
    pub async fn to_record(&self) -> Record {
        let mut record = Record::new();
        record.insert("id".into(), json!(self.id));

        for def in self.attrdefs().into_iter().filter(|d| d.modifiable) {
            let value = match self.get_standard(&def.name) {
                Some(v) => v,
                None => self.driver.get_attr(&def.name).await.unwrap_or(JsonValue::Null),
            };
            if !value.is_null() {
                record.insert(def.name, value);
            }
        }

        let (last_ts, persisted, value) = {
            let state = self.state.read();
            (state.history_last_timestamp, state.persisted, state.last_read_value)
        };
        record.insert("history_last_timestamp".into(), json!(last_ts));
        if let Some(v) = value.filter(|_| persisted) {
            record.insert("value".into(), v.to_json());
        }
        record
    }

    fn get_standard(&self, name: &str) -> Option<JsonValue> {
        let state = self.state.read();
        let opt_str = |s: &Option<String>| s.as_ref().map_or(JsonValue::Null, |s| json!(s));
        let opt_num = |n: Option<f64>| n.map_or(JsonValue::Null, |n| json!(n));

        let value = match name {
            "id" => json!(self.id),
            "type" => json!(self.port_type.as_str()),
            "writable" => json!(self.writable),
            "virtual" => json!(self.is_virtual),
            "enabled" => json!(state.enabled),
            "persisted" => json!(state.persisted),
            "internal" => json!(state.internal),
            "display_name" => opt_str(&state.display_name),
            "unit" => opt_str(&state.unit),
            "tag" => opt_str(&state.tag),
            "expression" => state.expression.as_ref().map_or(JsonValue::Null, |e| json!(e.to_string())),
            "transform_read" => state.transform_read.as_ref().map_or(JsonValue::Null, |e| json!(e.to_string())),
            "transform_write" => state.transform_write.as_ref().map_or(JsonValue::Null, |e| json!(e.to_string())),
            "history_interval" => json!(state.history_interval),
            "history_retention" => json!(state.history_retention),
            "min" => opt_num(state.min),
            "max" => opt_num(state.max),
            "integer" => json!(state.integer),
            "step" => opt_num(state.step),
            "choices" => match &state.choices {
                Some(choices) => serde_json::to_value(choices).unwrap_or(JsonValue::Null),
                None => JsonValue::Null,
            },
            _ => return None,
        };
        Some(value)
    }

    async fn apply_attr(&self, name: &str, value: &JsonValue) -> AttrResult<()> {
        if !attrs::is_standard(name) {
            return self.driver.set_attr(name, value).await;
        }

        match name {
            "enabled" => return self.set_enabled(value.as_bool().unwrap_or(false)).await,
            "expression" => return self.set_expression(value.as_str()),
            "transform_read" => return self.set_transform(Transform::Read, value.as_str()),
            "transform_write" => return self.set_transform(Transform::Write, value.as_str()),
            _ => {}
        }

        let as_string = |v: &JsonValue| v.as_str().map(str::to_string);
        let as_int = |v: &JsonValue| v.as_f64().unwrap_or(0.0) as i64;
        let choices = match name {
            "choices" if !value.is_null() => Some(
                serde_json::from_value::<Vec<Choice>>(value.clone())
                    .map_err(|e| AttrError::invalid(name, e.to_string()))?,
            ),
            _ => None,
        };

        let mut state = self.state.write();
        match name {
            "display_name" => state.display_name = as_string(value),
            "unit" => state.unit = as_string(value),
            "tag" => state.tag = as_string(value),
            "persisted" => state.persisted = value.as_bool().unwrap_or(false),
            "internal" => state.internal = value.as_bool().unwrap_or(false),
            "history_interval" => state.history_interval = as_int(value),
            "history_retention" => state.history_retention = as_int(value),
            "min" => state.min = value.as_f64(),
            "max" => state.max = value.as_f64(),
            "step" => state.step = value.as_f64(),
            "integer" => state.integer = value.as_bool().unwrap_or(false),
            "choices" => state.choices = choices,
            _ => return Err(AttrError::NotModifiable(name.to_string())),
        }
        Ok(())
    }

    async fn set_enabled(&self, enabled: bool) -> AttrResult<()> {
        if self.is_enabled() == enabled {
            return Ok(());
        }

        let result = if enabled {
            self.driver.handle_enable().await
        } else {
            self.driver.handle_disable().await
        };
        result.map_err(|e| AttrError::invalid("enabled", e.to_string()))?;

        {
            let mut state = self.state.write();
            state.enabled = enabled;
            if !enabled {
                state.last_read_value = None;
            }
        }

        if enabled {
            info!(port_id = %self.id, "Port enabled");
            if let Some(host) = self.host.upgrade() {
                host.force_eval(&self.id);
            }
        } else {
            self.cancel_sequence();
            info!(port_id = %self.id, "Port disabled");
        }
        Ok(())
    }

    fn set_expression(&self, source: Option<&str>) -> AttrResult<()> {
        let Some(source) = source.filter(|s| !s.trim().is_empty()) else {
            let mut state = self.state.write();
            state.expression = None;
            state.expression_deps.clear();
            return Ok(());
        };

        let expr = qtoggle_expressions::parse(source, &self.id).map_err(|e| AttrError::Expression {
            attr: "expression".into(),
            source: e,
        })?;
        let deps = expr.deps();

        let host = self.host.upgrade();
        if let Some(host) = &host {
            if let Some(path) = find_loop(&self.id, &deps, |id| host.expression_deps(id)) {
                return Err(AttrError::CircularDependency { path });
            }
        }

        trace!(port_id = %self.id, expression = %expr, "Expression set");
        {
            let mut state = self.state.write();
            state.expression = Some(expr);
            state.expression_deps = deps;
        }
        if let Some(host) = host {
            host.force_eval(&self.id);
        }
        Ok(())
    }

    fn set_transform(&self, which: Transform, source: Option<&str>) -> AttrResult<()> {
        let attr = match which {
            Transform::Read => "transform_read",
            Transform::Write => "transform_write",
        };
        let expr = match source.filter(|s| !s.trim().is_empty()) {
            Some(src) => Some(
                qtoggle_expressions::parse_transform(src, &self.id).map_err(|e| {
                    AttrError::Expression {
                        attr: attr.into(),
                        source: e,
                    }
                })?,
            ),
            None => None,
        };

        let mut state = self.state.write();
        match which {
            Transform::Read => state.transform_read = expr,
            Transform::Write => state.transform_write = expr,
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Values
    // ─────────────────────────────────────────────────────────────────────────

    fn transform(&self, which: Transform, value: Value) -> PortResult<Value> {
        let mut state = self.state.write();
        let integer = state.integer;
        let expr = match which {
            Transform::Read => state.transform_read.as_mut(),
            Transform::Write => state.transform_write.as_mut(),
        };
        let value = match expr {
            Some(expr) => {
                let ctx = EvalContext::for_transform(self.id.as_str(), value, crate::now_ms());
                expr.eval(&ctx)
                    .map_err(|e| PortError::InvalidValue(format!("transform failed: {}", e)))?
            }
            None => value,
        };
        Ok(adapt_value(self.port_type, integer, value))
    }

    /// Read from the driver and apply `transform_read`
    pub async fn read_transformed_value(&self) -> PortResult<Value> {
        let raw = {
            let _io = self.io_lock.lock().await;
            self.driver.read_value().await?
        };
        self.transform(Transform::Read, raw)
    }

    fn check_writable(&self) -> PortResult<()> {
        if !self.is_enabled() {
            return Err(PortError::Disabled);
        }
        if !self.writable {
            return Err(PortError::NotWritable);
        }
        Ok(())
    }

    /// Queue a raw value for the driver.
    ///
    /// When the queue is full the oldest request is dropped and completes
    /// with `QueueFull`.
    pub fn enqueue_write(&self, value: Value) -> PortResult<WriteCompletion> {
        self.check_writable()?;

        let (done, rx) = oneshot::channel();
        match self.write_queue.push(WriteRequest { value, done }) {
            Ok(Some(dropped)) => {
                warn!(port_id = %self.id, value = %dropped.value, "Write queue full, dropping oldest");
                let _ = dropped.done.send(Err(PortError::QueueFull));
            }
            Ok(None) => {}
            Err(rejected) => {
                let _ = rejected.done.send(Err(PortError::Cancelled));
            }
        }

        // While a write is in flight its value stays pending; otherwise the
        // pending value is the queue head, which moves on eviction.
        let mut state = self.state.write();
        if !state.writing {
            state.pending_value = self.write_queue.peek_with(|r| r.value);
        }
        Ok(WriteCompletion(rx))
    }

    /// Apply `transform_write` and write through the queue
    pub async fn transform_and_write(&self, value: Value) -> PortResult<()> {
        let raw = self.transform(Transform::Write, value)?;
        self.enqueue_write(raw)?.wait().await
    }

    /// Write a value on behalf of a user, checking type, range and choices
    pub async fn set_value(&self, value: Value) -> PortResult<()> {
        self.check_writable()?;
        self.validate_value(value)?;
        self.transform_and_write(value).await
    }

    fn validate_value(&self, value: Value) -> PortResult<()> {
        let state = self.state.read();
        match (self.port_type, value) {
            (PortType::Boolean, Value::Bool(_)) => {}
            (PortType::Number, Value::Number(n)) => {
                check_number("value", n, state.min, state.max, state.integer, state.step)
                    .map_err(|e| PortError::InvalidValue(e.to_string()))?;
            }
            _ => {
                return Err(PortError::InvalidValue(format!(
                    "expected a {} value",
                    self.port_type
                )));
            }
        }
        if let Some(choices) = &state.choices {
            let json = value.to_json();
            if !choices.iter().any(|c| values_equal(&c.value, &json)) {
                return Err(PortError::InvalidValue(format!("{} is not an allowed choice", value)));
            }
        }
        Ok(())
    }

    /// Write a restored value straight to the driver and take it as read
    pub(crate) async fn restore_value(&self, value: Value) -> PortResult<()> {
        let value = {
            let state = self.state.read();
            adapt_value(self.port_type, state.integer, value)
        };
        if self.writable {
            let _io = self.io_lock.lock().await;
            self.driver.write_value(value).await?;
        }
        self.set_last_read_value(value);
        Ok(())
    }

    /// Perform one dequeued write and complete it
    pub(super) async fn process_write(&self, req: WriteRequest) {
        {
            let mut state = self.state.write();
            state.pending_value = Some(req.value);
            state.writing = true;
        }

        let result = {
            let _io = self.io_lock.lock().await;
            self.driver.write_value(req.value).await
        };
        match &result {
            Ok(()) => debug!(port_id = %self.id, value = %req.value, "Value written"),
            Err(e) => warn!(port_id = %self.id, value = %req.value, error = %e, "Write failed"),
        }
        let _ = req.done.send(result);

        {
            let mut state = self.state.write();
            state.writing = false;
            state.pending_value = self.write_queue.peek_with(|r| r.value);
        }
        self.nudge_host();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Evaluation
    // ─────────────────────────────────────────────────────────────────────────

    /// Queue an evaluation unless one is already pending
    pub(crate) fn enqueue_eval(&self, ctx: EvalContext) -> bool {
        if self.eval_pending.swap(true, Ordering::SeqCst) {
            return false;
        }
        if self.eval_queue.push(ctx).is_err() {
            self.eval_pending.store(false, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Evaluate the expression and write the result if it differs from the
    /// last read value
    pub(super) async fn evaluate(&self, ctx: &EvalContext) {
        if !self.is_enabled() {
            return;
        }

        let (result, integer) = {
            let mut state = self.state.write();
            let integer = state.integer;
            let Some(expr) = state.expression.as_mut() else {
                return;
            };
            (expr.eval(&ctx.for_port(self.id.as_str())), integer)
        };

        let value = match result {
            Ok(v) => adapt_value(self.port_type, integer, v),
            Err(EvalError::ValueUnavailable) => {
                trace!(port_id = %self.id, "Expression value unavailable");
                return;
            }
            Err(e) => {
                warn!(port_id = %self.id, error = %e, "Expression evaluation failed");
                return;
            }
        };

        if self.last_read_value() == Some(value) {
            return;
        }
        debug!(port_id = %self.id, %value, "Expression produced a new value");
        if let Err(e) = self.transform_and_write(value).await {
            warn!(port_id = %self.id, %value, error = %e, "Expression write failed");
        }
    }

    pub(crate) async fn heart_beat_second(&self) {
        self.driver.heart_beat_second().await;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sequences
    // ─────────────────────────────────────────────────────────────────────────

    /// Replace the running sequence; `None` only cancels
    pub fn set_sequence(self: &Arc<Self>, sequence: Option<Sequence>) -> PortResult<()> {
        self.cancel_sequence();
        let Some(sequence) = sequence else {
            return Ok(());
        };

        self.check_writable()?;
        for value in sequence.values() {
            self.validate_value(*value)?;
        }

        debug!(port_id = %self.id, steps = sequence.len(), repeat = sequence.repeat(), "Sequence started");
        let handle = tokio::spawn(sequence.run(Arc::downgrade(self)));
        *self.sequence.lock() = Some(handle);
        Ok(())
    }

    pub fn cancel_sequence(&self) {
        if let Some(handle) = self.sequence.lock().take() {
            if !handle.is_finished() {
                handle.abort();
                debug!(port_id = %self.id, "Sequence cancelled");
            }
        }
    }

    pub fn has_sequence(&self) -> bool {
        self.sequence.lock().as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.id)
            .field("type", &self.port_type)
            .field("driver", &self.driver.driver_name())
            .field("writable", &self.writable)
            .field("enabled", &self.is_enabled())
            .field("value", &self.last_read_value())
            .finish()
    }
}

/// Coerce a value to the port's type
pub fn adapt_value(port_type: PortType, integer: bool, value: Value) -> Value {
    match port_type {
        PortType::Boolean => Value::Bool(value.as_bool()),
        PortType::Number if integer => Value::Number(value.as_f64().trunc()),
        PortType::Number => Value::Number(value.as_f64()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::DummyDriver;
    use qtoggle_expressions::Dep;
    use std::collections::HashMap;
    use std::time::Duration;

    #[derive(Default)]
    struct TestHost {
        events: Mutex<Vec<Event>>,
        forced: Mutex<Vec<String>>,
        deps: Mutex<HashMap<String, DepSet>>,
    }

    impl PortHost for TestHost {
        fn publish(&self, event: Event) {
            self.events.lock().push(event);
        }

        fn nudge(&self) {}

        fn force_eval(&self, port_id: &str) {
            self.forced.lock().push(port_id.to_string());
        }

        fn expression_deps(&self, port_id: &str) -> Option<DepSet> {
            self.deps.lock().get(port_id).cloned()
        }
    }

    fn port_with(driver: DummyDriver, host: &Arc<TestHost>, capacity: usize) -> Arc<Port> {
        let weak: Weak<dyn PortHost> = Arc::downgrade(host) as Weak<dyn PortHost>;
        Port::new("p1", Arc::new(driver), false, weak, capacity)
    }

    #[tokio::test]
    async fn test_attr_dispatch() {
        let host = Arc::new(TestHost::default());
        let port = port_with(DummyDriver::new(PortType::Number).writable(), &host, 8);

        assert_eq!(port.get_attr("type").await, Some(json!("number")));
        assert_eq!(port.get_attr("history_interval").await, Some(json!(0)));
        assert_eq!(port.get_attr("display_name").await, None);
        assert_eq!(port.get_attr("fail_reads").await, Some(json!(false)));
        assert_eq!(port.get_attr("nonexistent").await, None);

        port.set_attr("display_name", json!("Boiler")).await.unwrap();
        assert_eq!(port.get_attr("display_name").await, Some(json!("Boiler")));
        assert!(port.take_save_asap());

        let events = host.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, crate::service::kinds::PORT_UPDATE);
        assert_eq!(events[0].data["display_name"], "Boiler");
    }

    #[tokio::test]
    async fn test_attr_errors() {
        let host = Arc::new(TestHost::default());
        let port = port_with(DummyDriver::new(PortType::Boolean), &host, 8);

        assert!(matches!(
            port.set_attr("nope", json!(1)).await,
            Err(AttrError::UnknownAttribute(_))
        ));
        assert!(matches!(
            port.set_attr("type", json!("number")).await,
            Err(AttrError::NotModifiable(_))
        ));
        assert!(matches!(
            port.set_attr("enabled", json!("yes")).await,
            Err(AttrError::InvalidValue { .. })
        ));
        // Read-only ports have no expression attribute
        assert!(matches!(
            port.set_attr("expression", json!("true")).await,
            Err(AttrError::UnknownAttribute(_))
        ));
        assert!(host.events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_expression_loop_rejected() {
        let host = Arc::new(TestHost::default());
        host.deps
            .lock()
            .insert("a".into(), DepSet::from([Dep::port("p1")]));
        let port = port_with(DummyDriver::new(PortType::Number).writable(), &host, 8);

        port.set_attr("expression", json!("ADD($x, 1)")).await.unwrap();
        assert_eq!(host.forced.lock().as_slice(), ["p1".to_string()]);

        let err = port.set_attr("expression", json!("$a")).await.unwrap_err();
        assert!(matches!(err, AttrError::CircularDependency { .. }));
        assert_eq!(port.get_attr("expression").await, Some(json!("ADD($x, 1)")));

        let err = port.set_attr("expression", json!("ADD($x")).await.unwrap_err();
        assert!(matches!(err, AttrError::Expression { .. }));
    }

    #[tokio::test]
    async fn test_transforms() {
        let host = Arc::new(TestHost::default());
        let driver = Arc::new(DummyDriver::new(PortType::Number).writable().with_value(5.0));
        let weak: Weak<dyn PortHost> = Arc::downgrade(&host) as Weak<dyn PortHost>;
        let port = Port::new("p1", driver.clone(), false, weak, 8);
        port.start();

        port.set_attr("transform_read", json!("MUL($, 2)")).await.unwrap();
        port.set_attr("transform_write", json!("DIV($, 2)")).await.unwrap();
        assert_eq!(port.read_transformed_value().await, Ok(Value::Number(10.0)));

        port.transform_and_write(Value::Number(30.0)).await.unwrap();
        assert_eq!(driver.writes(), vec![Value::Number(15.0)]);

        assert!(matches!(
            port.set_attr("transform_read", json!("ADD($, $other)")).await,
            Err(AttrError::Expression { .. })
        ));
        port.stop().await;
    }

    #[tokio::test]
    async fn test_set_value_constraints() {
        let host = Arc::new(TestHost::default());
        let port = port_with(DummyDriver::new(PortType::Number).writable(), &host, 8);
        port.start();

        port.set_attr("min", json!(0)).await.unwrap();
        port.set_attr("max", json!(10)).await.unwrap();
        assert!(matches!(port.set_value(Value::Number(11.0)).await, Err(PortError::InvalidValue(_))));
        assert!(matches!(port.set_value(Value::Bool(true)).await, Err(PortError::InvalidValue(_))));
        assert_eq!(port.set_value(Value::Number(3.0)).await, Ok(()));

        port.set_attr("enabled", json!(false)).await.unwrap();
        assert_eq!(port.set_value(Value::Number(3.0)).await, Err(PortError::Disabled));
        port.stop().await;
    }

    #[tokio::test]
    async fn test_write_queue_drops_oldest() {
        let host = Arc::new(TestHost::default());
        let driver = Arc::new(DummyDriver::new(PortType::Number).writable());
        let weak: Weak<dyn PortHost> = Arc::downgrade(&host) as Weak<dyn PortHost>;
        let port = Port::new("p1", driver.clone(), false, weak, 2);

        let w1 = port.enqueue_write(Value::Number(1.0)).unwrap();
        assert_eq!(port.pending_value(), Some(Value::Number(1.0)));
        let w2 = port.enqueue_write(Value::Number(2.0)).unwrap();
        assert_eq!(port.pending_value(), Some(Value::Number(1.0)));
        let w3 = port.enqueue_write(Value::Number(3.0)).unwrap();
        assert_eq!(port.pending_value(), Some(Value::Number(2.0)));

        port.start();

        assert_eq!(w1.wait().await, Err(PortError::QueueFull));
        assert_eq!(w2.wait().await, Ok(()));
        assert_eq!(w3.wait().await, Ok(()));
        assert_eq!(driver.writes(), vec![Value::Number(2.0), Value::Number(3.0)]);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(port.pending_value(), None);
        port.stop().await;
    }

    #[tokio::test]
    async fn test_stop_cancels_queued_writes() {
        let host = Arc::new(TestHost::default());
        let port = port_with(DummyDriver::new(PortType::Boolean).writable(), &host, 8);

        // Workers not started: requests stay queued
        let w1 = port.enqueue_write(Value::Bool(true)).unwrap();
        let w2 = port.enqueue_write(Value::Bool(false)).unwrap();
        port.stop().await;

        assert_eq!(w1.wait().await, Err(PortError::Cancelled));
        assert_eq!(w2.wait().await, Err(PortError::Cancelled));
        assert_eq!(port.pending_value(), None);
    }

    #[tokio::test]
    async fn test_record_round_trip() {
        let host = Arc::new(TestHost::default());
        let port = port_with(DummyDriver::new(PortType::Number).writable(), &host, 8);
        port.set_attr("persisted", json!(true)).await.unwrap();
        port.set_attr("unit", json!("°C")).await.unwrap();
        port.set_attr("expression", json!("ADD($x, 1)")).await.unwrap();
        port.set_last_read_value(Value::Number(42.0));

        let record = port.to_record().await;
        assert_eq!(record["id"], "p1");
        assert_eq!(record["unit"], "°C");
        assert_eq!(record["value"], json!(42));
        assert_eq!(record["history_last_timestamp"], json!(0));
        assert!(!record.contains_key("display_name"));
        assert!(!record.contains_key("type"));

        let other = Port::new(
            "p1",
            Arc::new(DummyDriver::new(PortType::Number).writable()),
            false,
            Arc::downgrade(&host) as Weak<dyn PortHost>,
            8,
        );
        other.load_attrs(&record).await;
        assert!(other.is_persisted());
        assert_eq!(other.get_attr("unit").await, Some(json!("°C")));
        assert_eq!(other.get_attr("expression").await, Some(json!("ADD($x, 1)")));
    }

    #[test]
    fn test_adapt_value() {
        assert_eq!(adapt_value(PortType::Boolean, false, Value::Number(2.0)), Value::Bool(true));
        assert_eq!(adapt_value(PortType::Number, true, Value::Number(-2.7)), Value::Number(-2.0));
        assert_eq!(adapt_value(PortType::Number, false, Value::Bool(true)), Value::Number(1.0));
    }
}
