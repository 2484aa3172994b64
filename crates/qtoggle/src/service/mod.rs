//! Background Loops
//!
//! The update loop, the save loop and the event log run as services owned by
//! a [`ServiceManager`]. Each service gets its own task which calls
//! `on_start` once, then `on_tick` on its interval (or when a port asks for
//! an early tick), `on_event` for matching port events, and `on_stop` once
//! on shutdown.

mod event;
mod handle;
mod manager;

pub use event::*;
pub use handle::*;
pub use manager::*;

use std::time::Duration;

use async_trait::async_trait;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    #[error("Service already running: {0}")]
    AlreadyRunning(String),

    #[error("Service not running: {0}")]
    NotRunning(String),

    #[error("Service {0} did not stop in time")]
    ShutdownTimeout(String),

    #[error("Service {0} panicked")]
    Panicked(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

// ─────────────────────────────────────────────────────────────────────────────
// Service Specification
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub id: String,

    /// Period of `on_tick` calls; `None` for purely event-driven services
    pub tick_interval: Option<Duration>,

    /// Event type patterns, e.g. `Port/*`
    pub subscriptions: Vec<String>,

    /// Upper bound on `on_stop`
    pub stop_timeout: Duration,
}

impl ServiceSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tick_interval: None,
            subscriptions: Vec::new(),
            stop_timeout: Duration::from_secs(10),
        }
    }

    pub fn every(mut self, interval: Duration) -> Self {
        self.tick_interval = Some(interval);
        self
    }

    pub fn subscribe(mut self, pattern: impl Into<String>) -> Self {
        self.subscriptions.push(pattern.into());
        self
    }

    pub fn stop_within(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service Trait
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait Service: Send + 'static {
    fn spec(&self) -> ServiceSpec;

    /// An error here marks the service failed and it never ticks.
    async fn on_start(&mut self) -> ServiceResult<()> {
        Ok(())
    }

    async fn on_tick(&mut self) -> ServiceResult<()> {
        Ok(())
    }

    async fn on_event(&mut self, _event: Event) -> ServiceResult<()> {
        Ok(())
    }

    async fn on_stop(&mut self) -> ServiceResult<()> {
        Ok(())
    }
}
