//! Software-only ports created at runtime.
//!
//! A virtual port reads back whatever was last written to it. Its definition
//! (type and value constraints) lives in the `vports` collection so it can be
//! recreated on the next start.

use async_trait::async_trait;
use parking_lot::Mutex;
use qtoggle_expressions::Value;
use serde::{Deserialize, Serialize};

use super::{DriverSettings, PortDriver, parse_settings};
use crate::error::{PortError, PortResult};
use crate::ports::{Choice, PortType};

/// Persisted definition of a virtual port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualPortDef {
    pub id: String,
    #[serde(rename = "type")]
    pub port_type: PortType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default)]
    pub integer: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<Choice>>,
}

impl VirtualPortDef {
    pub fn new(id: impl Into<String>, port_type: PortType) -> Self {
        Self {
            id: id.into(),
            port_type,
            min: None,
            max: None,
            integer: false,
            step: None,
            choices: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct VirtualSettings {
    #[serde(rename = "type")]
    port_type: PortType,
    #[serde(default)]
    integer: bool,
}

#[derive(Debug)]
pub struct VirtualDriver {
    port_type: PortType,
    integer: bool,
    value: Mutex<Option<Value>>,
}

impl VirtualDriver {
    pub fn new(port_type: PortType, integer: bool) -> Self {
        Self {
            port_type,
            integer,
            value: Mutex::new(None),
        }
    }

    pub fn from_def(def: &VirtualPortDef) -> Self {
        Self::new(def.port_type, def.integer)
    }

    pub(crate) fn from_settings(settings: &DriverSettings) -> Result<Self, String> {
        let s: VirtualSettings = parse_settings(settings)?;
        Ok(Self::new(s.port_type, s.integer))
    }
}

#[async_trait]
impl PortDriver for VirtualDriver {
    fn driver_name(&self) -> &'static str {
        "virtual"
    }

    fn port_type(&self) -> PortType {
        self.port_type
    }

    fn is_writable(&self) -> bool {
        true
    }

    fn is_integer(&self) -> bool {
        self.integer
    }

    async fn read_value(&self) -> PortResult<Value> {
        (*self.value.lock()).ok_or(PortError::SkipRead)
    }

    async fn write_value(&self, value: Value) -> PortResult<()> {
        *self.value.lock() = Some(value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_back_written_value() {
        let driver = VirtualDriver::new(PortType::Number, false);
        assert_eq!(driver.read_value().await, Err(PortError::SkipRead));
        driver.write_value(Value::Number(7.5)).await.unwrap();
        assert_eq!(driver.read_value().await, Ok(Value::Number(7.5)));
    }

    #[test]
    fn test_def_serialization() {
        let mut def = VirtualPortDef::new("v1", PortType::Number);
        def.min = Some(0.0);
        let json = serde_json::to_value(&def).unwrap();
        assert_eq!(json["type"], "number");
        assert_eq!(json["min"], serde_json::json!(0.0));
        assert!(json.get("max").is_none());

        let back: VirtualPortDef = serde_json::from_value(json).unwrap();
        assert_eq!(back, def);
    }
}
