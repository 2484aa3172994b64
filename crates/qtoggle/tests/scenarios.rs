//! End-to-end behavior of the reactive core: ports, expressions, the tick
//! scheduler and persistence working together.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_test::{assert_err, assert_ok};

use qtoggle::config::CoreConfig;
use qtoggle::drivers::{DriverRegistry, DummyDriver};
use qtoggle::engine::PORTS_COLLECTION;
use qtoggle::ports::PortType;
use qtoggle::qtoggle_expressions::Value;
use qtoggle::qtoggle_persist::{MemoryDriver, PersistDriver, Record};
use qtoggle::service::EventPublisher;
use qtoggle::{AttrError, Core, PortError};

/// 250 ms past a whole second
const T0: i64 = 1_700_000_000_250;

fn core_with(persist: Arc<dyn PersistDriver>, queue_capacity: usize) -> Core {
    let config = CoreConfig {
        queue_capacity,
        ..Default::default()
    };
    Core::new(config, persist, DriverRegistry::new(), EventPublisher::detached(256))
}

fn core() -> Core {
    core_with(Arc::new(MemoryDriver::new()), 1024)
}

/// Let the per-port workers drain
async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

fn numbers(values: &[f64]) -> Vec<Value> {
    values.iter().map(|n| Value::Number(*n)).collect()
}

#[tokio::test]
async fn test_dependent_port_follows_input() {
    let core = core();
    let nid1 = Arc::new(DummyDriver::new(PortType::Number).with_value(4.0));
    let nid2 = Arc::new(DummyDriver::new(PortType::Number).writable());
    core.add_port("nid1", nid1.clone()).await.unwrap();
    let port2 = core.add_port("nid2", nid2.clone()).await.unwrap();
    assert_ok!(port2.set_attr("expression", json!("MUL($nid1, 10)")).await);

    core.update_at(T0).await;
    settle().await;
    assert_eq!(nid2.writes(), numbers(&[40.0]));

    nid1.set_value(6.0);
    core.update_at(T0 + 50).await;
    settle().await;
    assert_eq!(nid2.writes(), numbers(&[40.0, 60.0]));
    assert_eq!(nid2.writes().iter().filter(|v| **v == Value::Number(60.0)).count(), 1);

    core.cleanup().await;
}

#[tokio::test]
async fn test_disabled_port_does_not_evaluate() {
    let core = core();
    let driver = Arc::new(DummyDriver::new(PortType::Number).writable().with_value(4.0));
    let port = core.add_port("nid1", driver.clone()).await.unwrap();

    core.update_at(T0).await;
    assert_eq!(port.last_read_value(), Some(Value::Number(4.0)));

    assert_ok!(port.set_attr("expression", json!("MUL($, 10)")).await);
    assert_ok!(port.set_attr("enabled", json!(false)).await);
    core.update_at(T0 + 50).await;
    settle().await;
    assert!(driver.writes().is_empty());

    assert_ok!(port.set_attr("enabled", json!(true)).await);
    core.update_at(T0 + 100).await;
    settle().await;
    assert_eq!(driver.writes(), numbers(&[40.0]));

    core.cleanup().await;
}

#[tokio::test]
async fn test_circular_dependency_rejected() {
    let core = core();
    let a = core
        .add_port("a", Arc::new(DummyDriver::new(PortType::Number).writable()))
        .await
        .unwrap();
    let b = core
        .add_port("b", Arc::new(DummyDriver::new(PortType::Number).writable()))
        .await
        .unwrap();

    assert_ok!(a.set_attr("expression", json!("$b")).await);
    let err = assert_err!(b.set_attr("expression", json!("$a")).await);
    match err {
        AttrError::CircularDependency { path } => assert_eq!(path.first().map(String::as_str), Some("b")),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(b.get_attr("expression").await, None);
    assert!(!b.has_expression());

    core.cleanup().await;
}

#[tokio::test]
async fn test_asap_pause() {
    let core = core();
    let driver = Arc::new(DummyDriver::new(PortType::Number).writable());
    let port = core.add_port("clock", driver.clone()).await.unwrap();
    assert_ok!(port.set_attr("expression", json!("MILLISECOND()")).await);

    // Forced evaluation right after the expression is set
    core.update_at(T0).await;
    settle().await;
    assert_eq!(driver.writes(), numbers(&[250.0]));

    core.pause_asap_eval(T0 + 1000);
    core.update_at(T0 + 100).await;
    settle().await;
    assert_eq!(driver.writes(), numbers(&[250.0]));

    core.update_at(T0 + 1100).await;
    settle().await;
    assert_eq!(driver.writes(), numbers(&[250.0, 350.0]));

    core.cleanup().await;
}

#[tokio::test]
async fn test_full_write_queue_drops_oldest() {
    let core = core_with(Arc::new(MemoryDriver::new()), 2);
    let driver = Arc::new(DummyDriver::new(PortType::Number).writable());
    let port = core.add_port("out", driver.clone()).await.unwrap();

    let w1 = port.enqueue_write(Value::Number(1.0)).unwrap();
    let w2 = port.enqueue_write(Value::Number(2.0)).unwrap();
    let w3 = port.enqueue_write(Value::Number(3.0)).unwrap();
    assert_eq!(port.pending_value(), Some(Value::Number(2.0)));

    assert_eq!(w1.wait().await, Err(PortError::QueueFull));
    assert_ok!(w2.wait().await);
    assert_ok!(w3.wait().await);
    assert_eq!(driver.writes(), numbers(&[2.0, 3.0]));

    core.cleanup().await;
}

#[tokio::test]
async fn test_persisted_value_restored_on_load() {
    let persist: Arc<dyn PersistDriver> = Arc::new(MemoryDriver::new());
    let mut record = Record::new();
    record.insert("id".into(), json!("x"));
    record.insert("value".into(), json!(42));
    record.insert("persisted".into(), json!(true));
    assert_ok!(persist.replace(PORTS_COLLECTION, "x", record).await);

    let core = core_with(Arc::clone(&persist), 1024);
    let driver = Arc::new(DummyDriver::new(PortType::Number).writable());
    let port = core.add_port("x", driver.clone()).await.unwrap();

    assert_eq!(driver.writes(), numbers(&[42.0]));
    assert_eq!(port.last_read_value(), Some(Value::Number(42.0)));
    assert!(port.is_persisted());

    core.cleanup().await;
}

#[tokio::test]
async fn test_value_survives_restart() {
    let persist: Arc<dyn PersistDriver> = Arc::new(MemoryDriver::new());

    let core = core_with(Arc::clone(&persist), 1024);
    let driver = Arc::new(DummyDriver::new(PortType::Number).writable().with_value(7.0));
    let port = core.add_port("level", driver).await.unwrap();
    assert_ok!(port.set_attr("persisted", json!(true)).await);
    assert_ok!(port.set_attr("display_name", json!("Tank level")).await);
    core.update_at(T0).await;
    core.cleanup().await;

    let core = core_with(Arc::clone(&persist), 1024);
    let driver = Arc::new(DummyDriver::new(PortType::Number).writable());
    let port = core.add_port("level", driver.clone()).await.unwrap();
    assert_eq!(port.last_read_value(), Some(Value::Number(7.0)));
    assert_eq!(driver.writes(), numbers(&[7.0]));
    assert_eq!(port.get_attr("display_name").await, Some(json!("Tank level")));

    core.cleanup().await;
}

#[tokio::test]
async fn test_set_value_rejected_on_read_only_port() {
    let core = core();
    let port = core
        .add_port("sensor", Arc::new(DummyDriver::new(PortType::Number).with_value(1.0)))
        .await
        .unwrap();
    assert_eq!(port.set_value(Value::Number(2.0)).await, Err(PortError::NotWritable));
    core.cleanup().await;
}
