//! In-memory driver, useful for testing and for ports that only hold a value.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use qtoggle_expressions::Value;
use serde::Deserialize;

use super::{DriverSettings, PortDriver, parse_settings};
use crate::error::{AttrError, AttrResult, PortError, PortResult};
use crate::ports::{AttrDef, AttrType, PortType};

#[derive(Debug, Deserialize)]
struct DummySettings {
    #[serde(rename = "type", default = "default_type")]
    port_type: PortType,
    #[serde(default)]
    writable: bool,
    #[serde(default)]
    integer: bool,
    #[serde(default)]
    value: Option<serde_json::Value>,
}

fn default_type() -> PortType {
    PortType::Boolean
}

/// Holds a value in memory. Reads return it; writes replace it and are
/// recorded so they can be inspected.
#[derive(Debug)]
pub struct DummyDriver {
    port_type: PortType,
    writable: bool,
    integer: bool,
    value: Mutex<Option<Value>>,
    writes: Mutex<Vec<Value>>,
    fail_reads: AtomicBool,
}

impl DummyDriver {
    pub fn new(port_type: PortType) -> Self {
        Self {
            port_type,
            writable: false,
            integer: false,
            value: Mutex::new(None),
            writes: Mutex::new(Vec::new()),
            fail_reads: AtomicBool::new(false),
        }
    }

    pub fn writable(mut self) -> Self {
        self.writable = true;
        self
    }

    pub fn integer(mut self) -> Self {
        self.integer = true;
        self
    }

    pub fn with_value(self, value: impl Into<Value>) -> Self {
        *self.value.lock() = Some(value.into());
        self
    }

    pub(crate) fn from_settings(settings: &DriverSettings) -> Result<Self, String> {
        let s: DummySettings = parse_settings(settings)?;
        let mut driver = Self::new(s.port_type);
        driver.writable = s.writable;
        driver.integer = s.integer;
        if let Some(v) = s.value.filter(|v| !v.is_null()) {
            let value = Value::from_json(&v).ok_or_else(|| format!("invalid initial value: {}", v))?;
            *driver.value.lock() = Some(value);
        }
        Ok(driver)
    }

    /// Simulate the outside world changing the value
    pub fn set_value(&self, value: impl Into<Value>) {
        *self.value.lock() = Some(value.into());
    }

    pub fn value(&self) -> Option<Value> {
        *self.value.lock()
    }

    /// Every value written so far, oldest first
    pub fn writes(&self) -> Vec<Value> {
        self.writes.lock().clone()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PortDriver for DummyDriver {
    fn driver_name(&self) -> &'static str {
        "dummy"
    }

    fn port_type(&self) -> PortType {
        self.port_type
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn is_integer(&self) -> bool {
        self.integer
    }

    async fn read_value(&self) -> PortResult<Value> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(PortError::Read("simulated failure".into()));
        }
        self.value().ok_or(PortError::SkipRead)
    }

    async fn write_value(&self, value: Value) -> PortResult<()> {
        if !self.writable {
            return Err(PortError::NotWritable);
        }
        *self.value.lock() = Some(value);
        self.writes.lock().push(value);
        Ok(())
    }

    fn additional_attrdefs(&self) -> Vec<AttrDef> {
        vec![
            AttrDef::new("fail_reads", AttrType::Boolean)
                .modifiable()
                .description("Make every read fail"),
        ]
    }

    async fn get_attr(&self, name: &str) -> Option<serde_json::Value> {
        match name {
            "fail_reads" => Some(self.fail_reads.load(Ordering::SeqCst).into()),
            _ => None,
        }
    }

    async fn set_attr(&self, name: &str, value: &serde_json::Value) -> AttrResult<()> {
        match name {
            "fail_reads" => {
                let fail = value
                    .as_bool()
                    .ok_or_else(|| AttrError::invalid(name, "expected a boolean"))?;
                self.set_fail_reads(fail);
                Ok(())
            }
            _ => Err(AttrError::UnknownAttribute(name.to_string())),
        }
    }
}
