//! Handle to a spawned service.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceState {
    Starting = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
    Failed = 4,
}

impl ServiceState {
    fn load(cell: &AtomicU8) -> Self {
        match cell.load(Ordering::SeqCst) {
            0 => Self::Starting,
            1 => Self::Running,
            2 => Self::Stopping,
            3 => Self::Stopped,
            _ => Self::Failed,
        }
    }

    pub(super) fn store(self, cell: &AtomicU8) {
        cell.store(self as u8, Ordering::SeqCst);
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
            ServiceState::Failed => "failed",
        })
    }
}

pub(super) enum Command {
    /// Run `on_tick` now
    Tick,
    Stop,
}

/// Cloneable handle; the core keeps one to the update loop so that finished
/// writes are observed without waiting for the next interval.
#[derive(Clone)]
pub struct ServiceHandle {
    id: Arc<str>,
    commands: mpsc::Sender<Command>,
    state: Arc<AtomicU8>,
}

impl ServiceHandle {
    pub(super) fn new(id: &str, commands: mpsc::Sender<Command>, state: Arc<AtomicU8>) -> Self {
        Self {
            id: Arc::from(id),
            commands,
            state,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ServiceState {
        ServiceState::load(&self.state)
    }

    /// Request an early tick. False once the service is gone; a full command
    /// queue already holds a tick, so that still counts as delivered.
    pub fn force_tick(&self) -> bool {
        match self.commands.try_send(Command::Tick) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub(super) async fn request_stop(&self) -> bool {
        self.commands.send(Command::Stop).await.is_ok()
    }
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
