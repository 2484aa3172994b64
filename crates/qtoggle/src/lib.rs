//! qToggle Core
//!
//! The reactive runtime of a qToggle control node:
//! - typed I/O ports backed by drivers, with an attribute model and
//!   per-port write/eval pipelines (`ports`, `drivers`)
//! - the tick scheduler that polls ports and re-evaluates dependent
//!   expressions (`engine`)
//! - background services and port events (`service`)
//!
//! Expressions live in `qtoggle_expressions`, storage in `qtoggle_persist`.

pub use qtoggle_expressions;
pub use qtoggle_persist;

pub mod config;
pub mod drivers;
pub mod engine;
pub mod error;
pub mod ports;
pub mod service;

pub use config::Config;
pub use engine::Core;
pub use error::{AttrError, CoreError, PortError};

/// Current Unix time in milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
