//! qToggle Persistence
//!
//! A small document-store facade used for port configuration, device
//! attributes and value history. Records are JSON objects with a string `id`,
//! grouped in schemaless collections; samples are `(object id, timestamp, value)`
//! triples kept per collection.
//!
//! # Backends
//!
//! - `memory`: volatile, for tests and throwaway setups
//! - `json`: a single JSON document rewritten atomically on every change
//! - `redb`: an embedded key-value database, one table per collection

mod driver;
mod error;
mod filter;
mod json;
mod memory;
mod redb_driver;
mod store;

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use driver::{PersistDriver, Sample, SampleRange, record_id};
pub use error::{PersistError, PersistResult};
pub use filter::{Filter, Query, SortKey, compare_ids, matches, values_equal};
pub use json::JsonDriver;
pub use memory::MemoryDriver;
pub use redb_driver::RedbDriver;

/// A stored record
pub type Record = serde_json::Map<String, serde_json::Value>;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    /// `memory`, `json` or `redb`
    pub driver: String,

    /// Data file for the file-backed drivers
    pub file_path: PathBuf,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            driver: "json".to_string(),
            file_path: PathBuf::from("qtoggleserver-data.json"),
        }
    }
}

/// Build the configured backend. The caller still has to `init()` it.
pub fn open(config: &PersistConfig) -> PersistResult<Arc<dyn PersistDriver>> {
    let driver: Arc<dyn PersistDriver> = match config.driver.as_str() {
        "memory" => Arc::new(MemoryDriver::new()),
        "json" => Arc::new(JsonDriver::new(&config.file_path)),
        "redb" => Arc::new(RedbDriver::new(&config.file_path)),
        other => return Err(PersistError::UnknownDriver(other.to_string())),
    };
    tracing::debug!(driver = driver.name(), "Persistence driver selected");
    Ok(driver)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_by_name() {
        let mut config = PersistConfig {
            driver: "memory".into(),
            ..Default::default()
        };
        assert_eq!(open(&config).unwrap().name(), "memory");

        config.driver = "mongo".into();
        assert!(matches!(open(&config), Err(PersistError::UnknownDriver(_))));
    }
}
