//! Service Manager
//!
//! Owns the service tasks and the event bus. Services stop in reverse spawn
//! order.

use std::sync::Arc;
use std::sync::atomic::AtomicU8;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::handle::Command;
use super::{
    Event, EventPublisher, Service, ServiceError, ServiceHandle, ServiceResult, ServiceSpec,
    ServiceState,
};

const EVENT_CAPACITY: usize = 1024;
const COMMAND_CAPACITY: usize = 16;

struct Running {
    handle: ServiceHandle,
    task: JoinHandle<ServiceResult<()>>,
}

pub struct ServiceManager {
    services: DashMap<String, Running>,
    order: Mutex<Vec<String>>,
    events: broadcast::Sender<Event>,
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            services: DashMap::new(),
            order: Mutex::new(Vec::new()),
            events,
        }
    }

    /// Publisher feeding every subscribed service
    pub fn event_publisher(&self) -> EventPublisher {
        EventPublisher::new(self.events.clone())
    }

    pub fn spawn<S: Service>(&self, service: S) -> ServiceResult<ServiceHandle> {
        let spec = service.spec();
        if self.services.contains_key(&spec.id) {
            return Err(ServiceError::AlreadyRunning(spec.id));
        }

        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let state = Arc::new(AtomicU8::new(ServiceState::Starting as u8));
        let handle = ServiceHandle::new(&spec.id, tx, Arc::clone(&state));
        let events = self.events.subscribe();

        let id = spec.id.clone();
        let task = tokio::spawn(run(service, spec, rx, events, state));
        self.services.insert(
            id.clone(),
            Running {
                handle: handle.clone(),
                task,
            },
        );
        self.order.lock().push(id);
        Ok(handle)
    }

    async fn stop(&self, id: &str) -> ServiceResult<()> {
        let (_, running) = self
            .services
            .remove(id)
            .ok_or_else(|| ServiceError::NotRunning(id.to_string()))?;

        // A closed channel means the task already returned
        running.handle.request_stop().await;
        match running.task.await {
            Ok(result) => result,
            Err(e) => {
                error!(service_id = id, error = %e, "Service task panicked");
                Err(ServiceError::Panicked(id.to_string()))
            }
        }
    }

    /// Stop every service, most recently spawned first, returning the first
    /// error after all of them had their chance to stop
    pub async fn shutdown_all(&self) -> ServiceResult<()> {
        let ids: Vec<String> = std::mem::take(&mut *self.order.lock());
        info!(count = ids.len(), "Stopping services");

        let mut result = Ok(());
        for id in ids.iter().rev() {
            if let Err(e) = self.stop(id).await {
                warn!(service_id = %id, error = %e, "Service did not stop cleanly");
                result = result.and(Err(e));
            }
        }
        result
    }

    pub fn list(&self) -> Vec<(String, ServiceState)> {
        self.order
            .lock()
            .iter()
            .filter_map(|id| self.services.get(id).map(|s| (id.clone(), s.handle.state())))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service Task
// ─────────────────────────────────────────────────────────────────────────────

async fn run<S: Service>(
    mut service: S,
    spec: ServiceSpec,
    mut commands: mpsc::Receiver<Command>,
    mut events: broadcast::Receiver<Event>,
    state: Arc<AtomicU8>,
) -> ServiceResult<()> {
    let id = spec.id.as_str();

    if let Err(e) = service.on_start().await {
        error!(service_id = id, error = %e, "Service failed to start");
        ServiceState::Failed.store(&state);
        return Err(e);
    }
    ServiceState::Running.store(&state);
    debug!(service_id = id, "Service running");

    let mut timer = spec.tick_interval.map(|period| {
        let mut timer = tokio::time::interval(period);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        timer
    });
    let listening = !spec.subscriptions.is_empty();

    loop {
        let result = tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(Command::Tick) => service.on_tick().await,
                Some(Command::Stop) | None => break,
            },

            event = events.recv(), if listening => match event {
                Ok(event) if spec.subscriptions.iter().any(|p| event.matches(p)) => {
                    service.on_event(event).await
                }
                Ok(_) => Ok(()),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(service_id = id, skipped = n, "Event receiver lagged");
                    Ok(())
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            _ = async {
                match timer.as_mut() {
                    Some(timer) => timer.tick().await,
                    None => std::future::pending().await,
                }
            } => service.on_tick().await,
        };

        if let Err(e) = result {
            warn!(service_id = id, error = %e, "Service error");
        }
    }

    ServiceState::Stopping.store(&state);
    let stopped = tokio::time::timeout(spec.stop_timeout, service.on_stop()).await;
    let result = match stopped {
        Ok(result) => result,
        Err(_) => Err(ServiceError::ShutdownTimeout(spec.id.clone())),
    };

    match &result {
        Ok(()) => {
            ServiceState::Stopped.store(&state);
            debug!(service_id = id, "Service stopped");
        }
        Err(e) => {
            ServiceState::Failed.store(&state);
            error!(service_id = id, error = %e, "Service stop failed");
        }
    }
    result
}
