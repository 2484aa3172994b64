//! Tick Scheduler
//!
//! One `update()` per tick, serialized by the tick lock:
//!
//! 1. seed the changed set with `asap` and `time_ms`, plus `time` (and the
//!    drivers' `heart_beat_second`) when a new wall-clock second started;
//! 2. read every enabled port that is not backing off and record value changes;
//! 3. build one value snapshot for the tick;
//! 4. enqueue an evaluation on every port whose expression depends on
//!    something that changed, or that was forced.
//!
//! After a stall the last tick second jumps to the current one: `time` and
//! the heart beats fire once, not once per missed second.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use futures::future::join_all;
use qtoggle_expressions::{Dep, EvalContext, Value};
use qtoggle_persist::{Sample, SampleRange};
use tracing::{debug, trace, warn};

use super::{Core, HISTORY_COLLECTION};
use crate::error::PortError;
use crate::ports::Port;
use crate::service::Event;

impl Core {
    /// Run one tick at the current time
    pub async fn update(&self) {
        self.update_at(crate::now_ms()).await;
    }

    /// Run one tick as if the time were `now_ms`
    pub async fn update_at(&self, now_ms: i64) {
        let inner = &self.inner;
        let mut last_tick_s = inner.tick.lock().await;

        let mut changed: HashSet<Dep> = HashSet::from([Dep::Asap, Dep::TimeMs]);
        let enabled: Vec<Arc<Port>> = self.ports().into_iter().filter(|p| p.is_enabled()).collect();

        let now_s = now_ms.div_euclid(1000);
        if now_s > *last_tick_s {
            *last_tick_s = now_s;
            changed.insert(Dep::Time);
            join_all(enabled.iter().map(|p| p.heart_beat_second())).await;
            self.sample_history(&enabled, now_ms).await;
        }

        // Reads
        let to_read: Vec<&Arc<Port>> = enabled
            .iter()
            .filter(|p| !inner.backoff.contains(p.id()))
            .collect();
        let results = join_all(to_read.iter().map(|p| async move {
            p.invalidate_attr_cache();
            p.read_transformed_value().await
        }))
        .await;

        for (port, result) in to_read.into_iter().zip(results) {
            match result {
                Ok(value) => {
                    let old = port.set_last_read_value(value);
                    if old != Some(value) {
                        changed.insert(Dep::port(port.id()));
                        self.handle_value_change(port, old, value, now_ms).await;
                    }
                }
                Err(PortError::SkipRead) => {}
                Err(e) => {
                    warn!(port_id = %port.id(), error = %e, "Read failed, backing off");
                    inner.backoff.insert(port.id());
                }
            }
        }

        // Evaluations
        let force_all = inner.force_eval_all.swap(false, Ordering::SeqCst);
        let forced: HashSet<String> = std::mem::take(&mut *inner.force_eval_ports.lock());
        let asap_paused = now_ms < inner.asap_paused_until_ms.load(Ordering::SeqCst);

        let values: HashMap<String, Value> = enabled
            .iter()
            .filter_map(|p| p.last_read_value().map(|v| (p.id().to_string(), v)))
            .collect();
        let snapshot = EvalContext::with_values(values, now_ms);

        let mut enqueued = 0usize;
        for port in &enabled {
            let Some(deps) = port.expression_deps() else {
                continue;
            };

            let is_forced = force_all || forced.contains(port.id());
            if !is_forced {
                let mut hits = deps.iter().filter(|d| changed.contains(*d)).peekable();
                if hits.peek().is_none() {
                    continue;
                }
                if asap_paused && hits.all(Dep::is_tick) {
                    continue;
                }
            }

            if port.enqueue_eval(snapshot.clone()) {
                enqueued += 1;
            } else if is_forced {
                // Carry the forced evaluation over to the next tick
                inner.force_eval_ports.lock().insert(port.id().to_string());
            }
        }

        if enqueued > 0 {
            trace!(count = enqueued, changed = changed.len(), "Evaluations enqueued");
        }
    }

    async fn handle_value_change(&self, port: &Arc<Port>, old: Option<Value>, value: Value, now_ms: i64) {
        debug!(port_id = %port.id(), ?old, %value, "Value changed");

        if !port.is_internal() {
            self.inner.events.publish(Event::value_change(port.id(), old, value));
        }
        if port.is_persisted() {
            port.mark_save_asap();
        }
        if port.history().interval == -1 {
            self.save_history_sample(port, value, now_ms).await;
        }
    }

    /// Sample ports with a periodic history interval that is due
    async fn sample_history(&self, ports: &[Arc<Port>], now_ms: i64) {
        if !self.inner.persist.is_samples_supported() {
            return;
        }
        for port in ports {
            let history = port.history();
            if history.interval <= 0 {
                continue;
            }
            if now_ms - history.last_timestamp < history.interval * 1000 {
                continue;
            }
            if let Some(value) = port.last_read_value() {
                self.save_history_sample(port, value, now_ms).await;
            }
        }
    }

    async fn save_history_sample(&self, port: &Arc<Port>, value: Value, now_ms: i64) {
        let persist = &self.inner.persist;
        if !persist.is_samples_supported() {
            return;
        }

        let sample = Sample {
            timestamp: now_ms,
            value: value.to_json(),
        };
        if let Err(e) = persist.save_sample(HISTORY_COLLECTION, port.id(), sample).await {
            warn!(port_id = %port.id(), error = %e, "Could not save history sample");
            return;
        }
        port.set_history_last_timestamp(now_ms);
        port.mark_save_asap();

        let retention = port.history().retention;
        if retention > 0 {
            let range = SampleRange {
                to: Some(now_ms - retention * 1000),
                ..Default::default()
            };
            let ids = [port.id().to_string()];
            match persist.remove_samples(HISTORY_COLLECTION, Some(ids.as_slice()), &range).await {
                Ok(0) => {}
                Ok(n) => trace!(port_id = %port.id(), count = n, "Old samples removed"),
                Err(e) => warn!(port_id = %port.id(), error = %e, "Could not prune history"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::drivers::{DriverRegistry, DummyDriver};
    use crate::ports::PortType;
    use crate::service::EventPublisher;
    use qtoggle_persist::{MemoryDriver, PersistDriver};
    use serde_json::json;
    use std::time::Duration;

    const T0: i64 = 1_700_000_000_250;

    fn core() -> Core {
        Core::new(
            CoreConfig::default(),
            Arc::new(MemoryDriver::new()),
            DriverRegistry::new(),
            EventPublisher::detached(64),
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn test_no_eval_without_changed_deps() {
        let core = core();
        let input = Arc::new(DummyDriver::new(PortType::Number).with_value(1.0));
        let output = Arc::new(DummyDriver::new(PortType::Number).writable());
        core.add_port("in", input.clone()).await.unwrap();
        let out = core.add_port("out", output.clone()).await.unwrap();
        out.set_attr("expression", json!("ADD($in, 1)")).await.unwrap();

        core.update_at(T0).await;
        settle().await;
        assert_eq!(output.writes(), vec![Value::Number(2.0)]);

        // Nothing changed: no evaluation is enqueued
        core.update_at(T0 + 50).await;
        assert!(!out.is_eval_pending());
        settle().await;
        assert_eq!(output.writes(), vec![Value::Number(2.0)]);

        input.set_value(5.0);
        core.update_at(T0 + 100).await;
        settle().await;
        assert_eq!(output.writes(), vec![Value::Number(2.0), Value::Number(6.0)]);
        core.cleanup().await;
    }

    #[tokio::test]
    async fn test_value_change_events() {
        let core = core();
        let mut events = core.events().subscribe();
        let driver = Arc::new(DummyDriver::new(PortType::Boolean).with_value(false));
        let port = core.add_port("door", driver.clone()).await.unwrap();
        let _ = events.recv().await.unwrap(); // Port/Add

        core.update_at(T0).await;
        let event = events.recv().await.unwrap();
        assert_eq!(event.event_type, crate::service::kinds::VALUE_CHANGE);
        assert_eq!(event.data["value"], json!(false));
        assert_eq!(event.data["old_value"], serde_json::Value::Null);

        port.set_attr("internal", json!(true)).await.unwrap();
        let _ = events.recv().await.unwrap(); // Port/Update
        driver.set_value(true);
        core.update_at(T0 + 50).await;
        assert!(events.try_recv().is_err());
        assert_eq!(port.last_read_value(), Some(Value::Bool(true)));
        core.cleanup().await;
    }

    #[tokio::test]
    async fn test_read_error_backoff() {
        let core = core();
        let driver = Arc::new(DummyDriver::new(PortType::Number).with_value(3.0));
        let port = core.add_port("temp", driver.clone()).await.unwrap();

        driver.set_fail_reads(true);
        core.update_at(T0).await;
        assert!(core.is_backing_off("temp"));
        assert_eq!(port.last_read_value(), None);

        // Still backing off: not read even though the driver recovered
        driver.set_fail_reads(false);
        core.update_at(T0 + 50).await;
        assert_eq!(port.last_read_value(), None);
        core.cleanup().await;
    }

    #[tokio::test]
    async fn test_history_on_change() {
        let persist: Arc<dyn PersistDriver> = Arc::new(MemoryDriver::new());
        let core = Core::new(
            CoreConfig::default(),
            Arc::clone(&persist),
            DriverRegistry::new(),
            EventPublisher::detached(16),
        );
        let driver = Arc::new(DummyDriver::new(PortType::Number).with_value(1.0));
        let port = core.add_port("meter", driver.clone()).await.unwrap();
        port.set_attr("history_interval", json!(-1)).await.unwrap();

        core.update_at(T0).await;
        driver.set_value(2.0);
        core.update_at(T0 + 50).await;
        core.update_at(T0 + 100).await;

        let samples = persist
            .get_samples_slice(HISTORY_COLLECTION, "meter", &SampleRange::default())
            .await
            .unwrap();
        let values: Vec<_> = samples.iter().map(|s| s.value.clone()).collect();
        assert_eq!(values, vec![json!(1), json!(2)]);
        assert_eq!(port.history().last_timestamp, T0 + 50);
        core.cleanup().await;
    }

    #[tokio::test]
    async fn test_force_eval_all() {
        let core = core();
        let output = Arc::new(DummyDriver::new(PortType::Number).writable());
        let out = core.add_port("out", output.clone()).await.unwrap();
        out.set_attr("expression", json!("ADD(40, 2)")).await.unwrap();

        core.update_at(T0).await;
        settle().await;
        assert_eq!(output.writes(), vec![Value::Number(42.0)]);

        // The port now reads 42, so re-evaluating produces no write
        core.update_at(T0 + 50).await;
        core.force_eval_all();
        core.update_at(T0 + 100).await;
        settle().await;
        assert_eq!(output.writes(), vec![Value::Number(42.0)]);
        core.cleanup().await;
    }

    #[tokio::test]
    async fn test_forced_eval_kept_while_pending() {
        let core = core();
        let output = Arc::new(DummyDriver::new(PortType::Number).writable());
        let out = core.add_port("out", output.clone()).await.unwrap();
        out.set_attr("expression", json!("ADD(40, 2)")).await.unwrap();

        // An evaluation is already queued when the forced one comes in
        assert!(out.enqueue_eval(EvalContext::with_values(HashMap::new(), T0)));
        core.force_eval("out");
        core.update_at(T0).await;
        assert!(core.inner.force_eval_ports.lock().contains("out"));

        settle().await;
        assert_eq!(output.writes(), vec![Value::Number(42.0)]);

        core.update_at(T0 + 50).await;
        assert!(!core.inner.force_eval_ports.lock().contains("out"));
        assert!(out.is_eval_pending());
        core.cleanup().await;
    }

    #[tokio::test]
    async fn test_missed_seconds_not_replayed() {
        let persist: Arc<dyn PersistDriver> = Arc::new(MemoryDriver::new());
        let core = Core::new(
            CoreConfig::default(),
            Arc::clone(&persist),
            DriverRegistry::new(),
            EventPublisher::detached(16),
        );
        let driver = Arc::new(DummyDriver::new(PortType::Number).with_value(7.0));
        let port = core.add_port("meter", driver).await.unwrap();
        port.set_attr("history_interval", json!(1)).await.unwrap();

        core.update_at(T0).await;
        core.update_at(T0 + 1_000).await;
        core.update_at(T0 + 6_000).await;
        assert_eq!(*core.inner.tick.lock().await, (T0 + 6_000) / 1000);

        let samples = persist
            .get_samples_slice(HISTORY_COLLECTION, "meter", &SampleRange::default())
            .await
            .unwrap();
        let stamps: Vec<i64> = samples.iter().map(|s| s.timestamp).collect();
        assert_eq!(stamps, vec![T0 + 1_000, T0 + 6_000]);
        core.cleanup().await;
    }
}
