//! Port Drivers
//!
//! A driver is the hardware (or software) end of a port: it reads and writes
//! raw values and may contribute its own attributes. Drivers are built from
//! configuration through the [`DriverRegistry`], keyed by driver name.

mod dummy;
mod virtual_port;

pub use dummy::DummyDriver;
pub use virtual_port::{VirtualDriver, VirtualPortDef};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use qtoggle_expressions::Value;
use serde_json::Map;

use crate::error::{AttrError, AttrResult, CoreError, CoreResult, PortError, PortResult};
use crate::ports::{AttrDef, PortType};

/// Driver-specific settings of a configured port (everything but `driver` and `id`)
pub type DriverSettings = Map<String, serde_json::Value>;

// ─────────────────────────────────────────────────────────────────────────────
// Port Driver Trait
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait PortDriver: Send + Sync + 'static {
    /// Name under which the driver is registered
    fn driver_name(&self) -> &'static str;

    fn port_type(&self) -> PortType;

    fn is_writable(&self) -> bool {
        false
    }

    /// Number ports only: values are whole numbers
    fn is_integer(&self) -> bool {
        false
    }

    /// Read the current raw value. `PortError::SkipRead` means "nothing new".
    async fn read_value(&self) -> PortResult<Value>;

    async fn write_value(&self, _value: Value) -> PortResult<()> {
        Err(PortError::NotWritable)
    }

    async fn handle_enable(&self) -> PortResult<()> {
        Ok(())
    }

    async fn handle_disable(&self) -> PortResult<()> {
        Ok(())
    }

    /// Called once per wall-clock second while the port is enabled
    async fn heart_beat_second(&self) {}

    /// Attributes this driver adds on top of the standard table
    fn additional_attrdefs(&self) -> Vec<AttrDef> {
        Vec::new()
    }

    async fn get_attr(&self, _name: &str) -> Option<serde_json::Value> {
        None
    }

    async fn set_attr(&self, name: &str, _value: &serde_json::Value) -> AttrResult<()> {
        Err(AttrError::UnknownAttribute(name.to_string()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Driver Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Builds a driver from a port's configured settings
pub type DriverFactory =
    Arc<dyn Fn(&DriverSettings) -> Result<Arc<dyn PortDriver>, String> + Send + Sync>;

/// Registry of available port drivers
pub struct DriverRegistry {
    factories: HashMap<String, DriverFactory>,
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverRegistry {
    /// Registry with the built-in `dummy` and `virtual` drivers
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register_fn("dummy", |settings| {
            Ok(Arc::new(DummyDriver::from_settings(settings)?) as Arc<dyn PortDriver>)
        });
        registry.register_fn("virtual", |settings| {
            Ok(Arc::new(VirtualDriver::from_settings(settings)?) as Arc<dyn PortDriver>)
        });
        registry
    }

    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, factory: DriverFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn register_fn<F>(&mut self, name: impl Into<String>, func: F)
    where
        F: Fn(&DriverSettings) -> Result<Arc<dyn PortDriver>, String> + Send + Sync + 'static,
    {
        self.register(name, Arc::new(func));
    }

    /// Build the driver for port `port_id`
    pub fn create(
        &self,
        driver: &str,
        port_id: &str,
        settings: &DriverSettings,
    ) -> CoreResult<Arc<dyn PortDriver>> {
        let factory = self
            .factories
            .get(driver)
            .ok_or_else(|| CoreError::UnknownDriver(driver.to_string()))?;
        (factory.as_ref())(settings).map_err(|reason| CoreError::port_load(port_id, reason))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(|s| s.as_str())
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.names().collect();
        names.sort();
        f.debug_struct("DriverRegistry").field("drivers", &names).finish()
    }
}

/// Deserialize driver settings into a typed struct
pub(crate) fn parse_settings<T: serde::de::DeserializeOwned>(
    settings: &DriverSettings,
) -> Result<T, String> {
    serde_json::from_value(serde_json::Value::Object(settings.clone())).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings(value: serde_json::Value) -> DriverSettings {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_builtin_drivers() {
        let registry = DriverRegistry::new();
        assert!(registry.contains("dummy"));
        assert!(registry.contains("virtual"));

        let driver = registry
            .create("dummy", "p1", &settings(json!({ "type": "number", "writable": true })))
            .unwrap();
        assert_eq!(driver.driver_name(), "dummy");
        assert_eq!(driver.port_type(), PortType::Number);
        assert!(driver.is_writable());
    }

    #[test]
    fn test_unknown_driver_and_bad_settings() {
        let registry = DriverRegistry::new();
        assert!(matches!(
            registry.create("gpio", "p1", &DriverSettings::new()),
            Err(CoreError::UnknownDriver(_))
        ));
        assert!(matches!(
            registry.create("dummy", "p1", &settings(json!({ "type": "string" }))),
            Err(CoreError::PortLoad { .. })
        ));
    }
}
