//! Configuration
//!
//! Loaded from a TOML file and overridden by `QTOGGLE_`-prefixed environment
//! variables, nested keys separated by `__` (`QTOGGLE_CORE__TICK_INTERVAL=100`).

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use qtoggle_persist::PersistConfig;
use serde::{Deserialize, Serialize};

use crate::drivers::DriverSettings;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub core: CoreConfig,
    pub persist: PersistConfig,
    pub log: LogConfig,
    /// Old port id → new port id, applied once at load
    pub port_mappings: BTreeMap<String, String>,
    pub ports: Vec<PortConfig>,
}

impl Config {
    /// Defaults, then the file (if it exists), then the environment
    pub fn load(path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed("QTOGGLE_").split("__")).extract()
    }

    /// The effective configuration as TOML
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Scheduler period (ms)
    pub tick_interval: u64,
    /// Save loop period (ms)
    pub persist_interval: u64,
    /// How long a port is left alone after a failed read (ms)
    pub read_backoff: u64,
    /// Capacity of each per-port write and eval queue
    pub queue_capacity: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            tick_interval: 50,
            persist_interval: 1000,
            read_backoff: 10_000,
            queue_capacity: 1024,
        }
    }
}

impl CoreConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval.max(1))
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_millis(self.persist_interval.max(1))
    }

    pub fn read_backoff(&self) -> Duration {
        Duration::from_millis(self.read_backoff)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter when `RUST_LOG` is not set
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// One configured port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    pub driver: String,
    pub id: String,
    /// Everything else goes to the driver
    #[serde(flatten)]
    pub settings: DriverSettings,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.core.tick_interval, 50);
        assert_eq!(config.core.queue_capacity, 1024);
        assert_eq!(config.persist.driver, "json");
        assert!(config.ports.is_empty());
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[core]
tick_interval = 100

[persist]
driver = "memory"

[port_mappings]
old = "new"

[[ports]]
driver = "dummy"
id = "relay1"
type = "boolean"
writable = true
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.core.tick_interval, 100);
        assert_eq!(config.core.persist_interval, 1000);
        assert_eq!(config.persist.driver, "memory");
        assert_eq!(config.port_mappings.get("old").map(String::as_str), Some("new"));

        let port = &config.ports[0];
        assert_eq!(port.driver, "dummy");
        assert_eq!(port.id, "relay1");
        assert_eq!(port.settings["type"], "boolean");
        assert_eq!(port.settings["writable"], true);

        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("tick_interval = 100"));
        assert!(rendered.contains("id = \"relay1\""));
    }
}
