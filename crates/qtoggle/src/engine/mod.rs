//! Core Runtime
//!
//! [`Core`] owns the port registry and everything shared between ports: the
//! driver registry, the persistence backend, the event publisher, the
//! force-eval set and the read-error backoff. It is cheap to clone and is
//! passed explicitly to whoever needs it.
//!
//! The tick scheduler lives in `update.rs`; the background loops that drive
//! it are in `services.rs`.

mod services;
mod update;

pub use services::{EventLogService, SaveLoopService, UpdateLoopService};

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, RwLock};
use qtoggle_expressions::{DepSet, Value};
use qtoggle_persist::{Filter, PersistDriver, Query, Record, SampleRange};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::config::{CoreConfig, PortConfig};
use crate::drivers::{DriverRegistry, PortDriver, VirtualDriver, VirtualPortDef};
use crate::error::{CoreError, CoreResult};
use crate::ports::{Port, PortHost, TimedSet};
use crate::service::{Event, EventPublisher, ServiceHandle, ServiceManager, ServiceResult};

/// Collection holding one record per port
pub const PORTS_COLLECTION: &str = "ports";
/// Collection holding virtual port definitions
pub const VPORTS_COLLECTION: &str = "vports";
/// Sample collection for port value history
pub const HISTORY_COLLECTION: &str = "value_history";

// ─────────────────────────────────────────────────────────────────────────────
// Core
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Core {
    inner: Arc<CoreInner>,
}

pub(crate) struct CoreInner {
    config: CoreConfig,
    ports: RwLock<BTreeMap<String, Arc<Port>>>,
    drivers: DriverRegistry,
    persist: Arc<dyn PersistDriver>,
    events: EventPublisher,

    /// Serializes `update()`; holds the last tick's whole second
    tick: tokio::sync::Mutex<i64>,
    force_eval_ports: Mutex<HashSet<String>>,
    force_eval_all: AtomicBool,
    asap_paused_until_ms: AtomicI64,
    backoff: TimedSet,

    update_loop: OnceLock<ServiceHandle>,
}

impl PortHost for CoreInner {
    fn publish(&self, event: Event) {
        self.events.publish(event);
    }

    fn nudge(&self) {
        if let Some(handle) = self.update_loop.get() {
            handle.force_tick();
        }
    }

    fn force_eval(&self, port_id: &str) {
        self.force_eval_ports.lock().insert(port_id.to_string());
    }

    fn expression_deps(&self, port_id: &str) -> Option<DepSet> {
        let port = self.ports.read().get(port_id).cloned()?;
        port.expression_deps()
    }
}

impl Core {
    pub fn new(
        config: CoreConfig,
        persist: Arc<dyn PersistDriver>,
        drivers: DriverRegistry,
        events: EventPublisher,
    ) -> Self {
        let backoff = TimedSet::new(config.read_backoff());
        Self {
            inner: Arc::new(CoreInner {
                config,
                ports: RwLock::new(BTreeMap::new()),
                drivers,
                persist,
                events,
                tick: tokio::sync::Mutex::new(0),
                force_eval_ports: Mutex::new(HashSet::new()),
                force_eval_all: AtomicBool::new(false),
                asap_paused_until_ms: AtomicI64::new(0),
                backoff,
                update_loop: OnceLock::new(),
            }),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.inner.config
    }

    pub fn persist(&self) -> &Arc<dyn PersistDriver> {
        &self.inner.persist
    }

    pub fn events(&self) -> &EventPublisher {
        &self.inner.events
    }

    /// Spawn the update, save and event-log loops on `manager`
    pub fn start_services(&self, manager: &ServiceManager) -> ServiceResult<()> {
        let update = manager.spawn(UpdateLoopService::new(self.clone()))?;
        if self.inner.update_loop.set(update).is_err() {
            warn!("Update loop was already attached");
        }
        manager.spawn(SaveLoopService::new(self.clone()))?;
        manager.spawn(EventLogService)?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Registry
    // ─────────────────────────────────────────────────────────────────────────

    pub fn port(&self, id: &str) -> Option<Arc<Port>> {
        self.inner.ports.read().get(id).cloned()
    }

    /// All ports, ordered by id
    pub fn ports(&self) -> Vec<Arc<Port>> {
        self.inner.ports.read().values().cloned().collect()
    }

    /// Load configured ports (after applying `mappings`) and stored virtual ports.
    ///
    /// A port that fails to load is skipped; its error is returned with the
    /// others.
    pub async fn load(
        &self,
        ports: &[PortConfig],
        mappings: &BTreeMap<String, String>,
    ) -> Vec<CoreError> {
        let mut errors = Vec::new();

        for collection in [PORTS_COLLECTION, VPORTS_COLLECTION] {
            if let Err(e) = self.inner.persist.ensure_index(collection, None).await {
                warn!(collection, error = %e, "Could not prepare collection");
            }
        }

        for port_config in ports {
            let id = match mappings.get(&port_config.id) {
                Some(mapped) if mapped.trim().is_empty() => {
                    errors.push(CoreError::port_load(&port_config.id, "empty mapping target"));
                    continue;
                }
                Some(mapped) => {
                    debug!(from = %port_config.id, to = %mapped, "Port id mapped");
                    mapped.clone()
                }
                None => port_config.id.clone(),
            };

            let result = match self.inner.drivers.create(&port_config.driver, &id, &port_config.settings) {
                Ok(driver) => self.add_port_inner(&id, driver, false, None).await,
                Err(CoreError::UnknownDriver(name)) => {
                    Err(CoreError::port_load(&id, format!("unknown driver {}", name)))
                }
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                error!(port_id = %id, error = %e, "Port not loaded");
                errors.push(e);
            }
        }

        match self.inner.persist.query(VPORTS_COLLECTION, &Query::new()).await {
            Ok(records) => {
                for record in records {
                    let def: VirtualPortDef = match serde_json::from_value(record.into()) {
                        Ok(def) => def,
                        Err(e) => {
                            warn!(error = %e, "Skipping malformed virtual port definition");
                            continue;
                        }
                    };
                    let id = def.id.clone();
                    if let Err(e) = self.add_virtual_inner(&def).await {
                        error!(port_id = %id, error = %e, "Virtual port not loaded");
                        errors.push(e);
                    }
                }
            }
            Err(e) => warn!(error = %e, "Could not query virtual ports"),
        }

        info!(ports = self.inner.ports.read().len(), failed = errors.len(), "Ports loaded");
        errors
    }

    /// Add a port backed by `driver`
    pub async fn add_port(&self, id: &str, driver: Arc<dyn PortDriver>) -> CoreResult<Arc<Port>> {
        self.add_port_inner(id, driver, false, None).await
    }

    /// Create a virtual port and store its definition
    pub async fn add_virtual_port(&self, def: VirtualPortDef) -> CoreResult<Arc<Port>> {
        let port = self.add_virtual_inner(&def).await?;

        let record = match serde_json::to_value(&def) {
            Ok(serde_json::Value::Object(record)) => record,
            _ => Record::new(),
        };
        self.inner
            .persist
            .replace(VPORTS_COLLECTION, &def.id, record)
            .await?;
        Ok(port)
    }

    async fn add_virtual_inner(&self, def: &VirtualPortDef) -> CoreResult<Arc<Port>> {
        let driver = Arc::new(VirtualDriver::from_def(def));
        let mut defaults = Record::new();
        for (key, value) in [
            ("min", def.min.map(|v| json!(v))),
            ("max", def.max.map(|v| json!(v))),
            ("step", def.step.map(|v| json!(v))),
            ("integer", Some(json!(def.integer))),
            ("choices", def.choices.as_ref().and_then(|c| serde_json::to_value(c).ok())),
        ] {
            if let Some(value) = value {
                defaults.insert(key.to_string(), value);
            }
        }
        self.add_port_inner(&def.id, driver, true, Some(defaults)).await
    }

    async fn add_port_inner(
        &self,
        id: &str,
        driver: Arc<dyn PortDriver>,
        is_virtual: bool,
        defaults: Option<Record>,
    ) -> CoreResult<Arc<Port>> {
        if id.trim().is_empty() {
            return Err(CoreError::port_load(id, "empty port id"));
        }
        if self.inner.ports.read().contains_key(id) {
            return Err(CoreError::port_load(id, "duplicate port id"));
        }

        let inner: Arc<CoreInner> = Arc::clone(&self.inner);
        let host: Weak<dyn PortHost> = Arc::downgrade(&inner) as Weak<dyn PortHost>;
        let port = Port::new(id, driver, is_virtual, host, self.inner.config.queue_capacity);

        if let Some(defaults) = &defaults {
            port.load_attrs(defaults).await;
        }
        let record = self.load_record(id).await;
        if let Some(record) = &record {
            port.load_attrs(record).await;
        }
        port.start();

        let stored_value = record
            .as_ref()
            .and_then(|r| r.get("value"))
            .and_then(Value::from_json);
        if let Some(value) = stored_value.filter(|_| port.is_persisted()) {
            match port.restore_value(value).await {
                Ok(()) => debug!(port_id = %id, %value, "Persisted value restored"),
                Err(e) => warn!(port_id = %id, error = %e, "Could not restore persisted value"),
            }
        }

        // Another load may have registered the id while this one was awaiting
        let inserted = {
            let mut ports = self.inner.ports.write();
            if ports.contains_key(id) {
                false
            } else {
                ports.insert(id.to_string(), Arc::clone(&port));
                true
            }
        };
        if !inserted {
            port.stop().await;
            return Err(CoreError::port_load(id, "duplicate port id"));
        }
        self.inner.force_eval(id);

        let attrs = port.attrs_json().await;
        self.inner.events.publish(Event::port_add(id, attrs));
        info!(port_id = %id, driver = port.driver().driver_name(), virtual_port = is_virtual, "Port added");
        Ok(port)
    }

    async fn load_record(&self, id: &str) -> Option<Record> {
        let query = Query::new().filter("id", json!(id)).limit(1);
        match self.inner.persist.query(PORTS_COLLECTION, &query).await {
            Ok(records) => records.into_iter().next(),
            Err(e) => {
                warn!(port_id = %id, error = %e, "Could not load port record");
                None
            }
        }
    }

    /// Remove a port, optionally purging its stored record and history
    pub async fn remove_port(&self, id: &str, persisted_data: bool) -> CoreResult<()> {
        let port = self
            .inner
            .ports
            .write()
            .remove(id)
            .ok_or_else(|| CoreError::NoSuchPort(id.to_string()))?;

        port.stop().await;
        self.inner.backoff.remove(id);
        self.inner.force_eval_ports.lock().remove(id);

        if persisted_data {
            let mut filter = Filter::new();
            filter.insert("id".into(), json!(id));
            let persist = &self.inner.persist;
            persist.remove(PORTS_COLLECTION, &filter).await?;
            if port.is_virtual() {
                persist.remove(VPORTS_COLLECTION, &filter).await?;
            }
            if persist.is_samples_supported() {
                let ids = [id.to_string()];
                persist
                    .remove_samples(HISTORY_COLLECTION, Some(ids.as_slice()), &SampleRange::default())
                    .await?;
            }
        }

        self.inner.events.publish(Event::port_remove(id));
        info!(port_id = %id, "Port removed");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Scheduling
    // ─────────────────────────────────────────────────────────────────────────

    /// Evaluate `port_id`'s expression at the next tick
    pub fn force_eval(&self, port_id: &str) {
        self.inner.force_eval(port_id);
    }

    /// Evaluate every expression at the next tick
    pub fn force_eval_all(&self) {
        self.inner.force_eval_all.store(true, Ordering::SeqCst);
    }

    /// Hold back expressions triggered only by the tick itself until `until_ms`
    pub fn pause_asap_eval(&self, until_ms: i64) {
        self.inner.asap_paused_until_ms.store(until_ms, Ordering::SeqCst);
        debug!(until_ms, "Asap evaluation paused");
    }

    /// Whether `port_id` is currently in the read-error backoff
    pub fn is_backing_off(&self, port_id: &str) -> bool {
        self.inner.backoff.contains(port_id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Persistence
    // ─────────────────────────────────────────────────────────────────────────

    /// Store ports marked for saving (all ports when `force`); returns how
    /// many were written
    pub async fn save_ports(&self, force: bool) -> usize {
        let mut saved = 0;
        for port in self.ports() {
            let dirty = port.take_save_asap();
            if !(dirty || force) {
                continue;
            }
            let record = port.to_record().await;
            match self.inner.persist.replace(PORTS_COLLECTION, port.id(), record).await {
                Ok(_) => saved += 1,
                Err(e) => {
                    warn!(port_id = %port.id(), error = %e, "Could not save port");
                    port.mark_save_asap();
                }
            }
        }
        if saved > 0 {
            debug!(count = saved, "Ports saved");
        }
        saved
    }

    /// Save everything and stop all ports
    pub async fn cleanup(&self) {
        self.save_ports(true).await;

        let ports: Vec<Arc<Port>> = {
            let mut registry = self.inner.ports.write();
            std::mem::take(&mut *registry).into_values().collect()
        };
        futures::future::join_all(ports.iter().map(|p| p.stop())).await;
        info!(count = ports.len(), "Ports stopped");
    }
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("ports", &self.inner.ports.read().len())
            .field("persist", &self.inner.persist.name())
            .finish()
    }
}
