//! Background loops driving the core.

use async_trait::async_trait;
use tracing::{debug, info};

use super::Core;
use crate::service::{Event, Service, ServiceResult, ServiceSpec, kinds};

// ─────────────────────────────────────────────────────────────────────────────
// Update Loop
// ─────────────────────────────────────────────────────────────────────────────

/// Runs `Core::update` every tick interval, and right away when a port
/// finishes a write
pub struct UpdateLoopService {
    core: Core,
}

impl UpdateLoopService {
    pub fn new(core: Core) -> Self {
        Self { core }
    }
}

#[async_trait]
impl Service for UpdateLoopService {
    fn spec(&self) -> ServiceSpec {
        ServiceSpec::new("update-loop").every(self.core.config().tick_interval())
    }

    async fn on_start(&mut self) -> ServiceResult<()> {
        info!(interval_ms = self.core.config().tick_interval, "Update loop started");
        Ok(())
    }

    async fn on_tick(&mut self) -> ServiceResult<()> {
        self.core.update().await;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Save Loop
// ─────────────────────────────────────────────────────────────────────────────

/// Saves ports marked dirty every persist interval, and all ports on stop
pub struct SaveLoopService {
    core: Core,
}

impl SaveLoopService {
    pub fn new(core: Core) -> Self {
        Self { core }
    }
}

#[async_trait]
impl Service for SaveLoopService {
    fn spec(&self) -> ServiceSpec {
        ServiceSpec::new("save-loop").every(self.core.config().persist_interval())
    }

    async fn on_stop(&mut self) -> ServiceResult<()> {
        let saved = self.core.save_ports(true).await;
        info!(count = saved, "Ports saved on shutdown");
        Ok(())
    }

    async fn on_tick(&mut self) -> ServiceResult<()> {
        self.core.save_ports(false).await;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Event Log
// ─────────────────────────────────────────────────────────────────────────────

/// Logs port events at debug level
pub struct EventLogService;

#[async_trait]
impl Service for EventLogService {
    fn spec(&self) -> ServiceSpec {
        ServiceSpec::new("event-log").subscribe("Port/*")
    }

    async fn on_event(&mut self, event: Event) -> ServiceResult<()> {
        match event.event_type.as_str() {
            kinds::VALUE_CHANGE => debug!(
                port_id = %event.source,
                value = %event.data["value"],
                "Port value changed"
            ),
            other => debug!(port_id = %event.source, event = other, "Port event"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::drivers::{DriverRegistry, DummyDriver};
    use crate::ports::PortType;
    use crate::service::ServiceManager;
    use qtoggle_expressions::Value;
    use qtoggle_persist::{MemoryDriver, PersistDriver, Query};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_loops_drive_core() {
        let manager = ServiceManager::new();
        let persist: Arc<dyn PersistDriver> = Arc::new(MemoryDriver::new());
        let config = CoreConfig {
            tick_interval: 10,
            persist_interval: 20,
            ..Default::default()
        };
        let core = Core::new(config, Arc::clone(&persist), DriverRegistry::new(), manager.event_publisher());

        let input = Arc::new(DummyDriver::new(PortType::Boolean).with_value(false));
        let output = Arc::new(DummyDriver::new(PortType::Boolean).writable());
        core.add_port("button", input.clone()).await.unwrap();
        let led = core.add_port("led", output.clone()).await.unwrap();
        led.set_attr("expression", serde_json::json!("NOT($button)")).await.unwrap();

        core.start_services(&manager).unwrap();
        assert_eq!(manager.len(), 3);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(output.writes().last(), Some(&Value::Bool(true)));

        input.set_value(true);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(output.writes().last(), Some(&Value::Bool(false)));

        manager.shutdown_all().await.unwrap();
        let stored = persist.query(crate::engine::PORTS_COLLECTION, &Query::new()).await.unwrap();
        assert_eq!(stored.len(), 2);
        core.cleanup().await;
    }
}
