//! Timed value sequences.
//!
//! A sequence writes each of its values through the port's write pipeline,
//! waiting the paired delay after each one, and repeats the whole list
//! `repeat` times (forever when `repeat` is 0).

use std::sync::Weak;
use std::time::Duration;

use qtoggle_expressions::Value;
use tracing::{debug, warn};

use super::port::Port;
use crate::error::{PortError, PortResult};

#[derive(Debug, Clone, PartialEq)]
pub struct Sequence {
    values: Vec<Value>,
    delays: Vec<Duration>,
    repeat: u32,
}

impl Sequence {
    /// `delays_ms[i]` is the pause after writing `values[i]`
    pub fn new(values: Vec<Value>, delays_ms: Vec<u64>, repeat: u32) -> PortResult<Self> {
        if values.is_empty() {
            return Err(PortError::InvalidValue("empty sequence".into()));
        }
        if values.len() != delays_ms.len() {
            return Err(PortError::InvalidValue(format!(
                "{} values but {} delays",
                values.len(),
                delays_ms.len()
            )));
        }
        Ok(Self {
            values,
            delays: delays_ms.into_iter().map(Duration::from_millis).collect(),
            repeat,
        })
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn repeat(&self) -> u32 {
        self.repeat
    }

    /// Drive the sequence until it completes or the port goes away
    pub(super) async fn run(self, port: Weak<Port>) {
        let mut round = 0u32;
        loop {
            for (value, delay) in self.values.iter().zip(&self.delays) {
                let Some(port) = port.upgrade() else {
                    return;
                };
                if let Err(e) = port.transform_and_write(*value).await {
                    warn!(port_id = %port.id(), %value, error = %e, "Sequence write failed");
                    if matches!(e, PortError::Cancelled | PortError::Disabled) {
                        return;
                    }
                }
                drop(port);
                tokio::time::sleep(*delay).await;
            }

            round += 1;
            if self.repeat != 0 && round >= self.repeat {
                break;
            }
        }
        if let Some(port) = port.upgrade() {
            debug!(port_id = %port.id(), rounds = round, "Sequence finished");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::DummyDriver;
    use crate::ports::{PortHost, PortType};
    use std::sync::Arc;

    struct NoHost;

    impl PortHost for NoHost {
        fn publish(&self, _event: crate::service::Event) {}
        fn nudge(&self) {}
        fn force_eval(&self, _port_id: &str) {}
        fn expression_deps(&self, _port_id: &str) -> Option<qtoggle_expressions::DepSet> {
            None
        }
    }

    fn bools(values: &[bool]) -> Vec<Value> {
        values.iter().map(|b| Value::Bool(*b)).collect()
    }

    #[test]
    fn test_validation() {
        assert!(Sequence::new(vec![], vec![], 1).is_err());
        assert!(Sequence::new(bools(&[true]), vec![10, 20], 1).is_err());
        assert!(Sequence::new(bools(&[true, false]), vec![10, 20], 0).is_ok());
    }

    #[tokio::test]
    async fn test_runs_and_repeats() {
        let host: Arc<dyn PortHost> = Arc::new(NoHost);
        let driver = Arc::new(DummyDriver::new(PortType::Boolean).writable());
        let port = Port::new("led", driver.clone(), false, Arc::downgrade(&host), 16);
        port.start();

        let seq = Sequence::new(bools(&[true, false]), vec![5, 5], 2).unwrap();
        port.set_sequence(Some(seq)).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert_eq!(driver.writes(), bools(&[true, false, true, false]));
        assert!(!port.has_sequence());
        port.stop().await;
    }

    #[tokio::test]
    async fn test_cancel() {
        let host: Arc<dyn PortHost> = Arc::new(NoHost);
        let driver = Arc::new(DummyDriver::new(PortType::Boolean).writable());
        let port = Port::new("led", driver.clone(), false, Arc::downgrade(&host), 16);
        port.start();

        let seq = Sequence::new(bools(&[true, false]), vec![1000, 1000], 0).unwrap();
        port.set_sequence(Some(seq)).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(port.has_sequence());

        port.set_sequence(None).unwrap();
        assert!(!port.has_sequence());
        assert_eq!(driver.writes(), bools(&[true]));
        port.stop().await;
    }
}
