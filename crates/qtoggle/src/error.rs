//! Error types for the port runtime.

use qtoggle_expressions::ParseError;
use qtoggle_persist::PersistError;

// ─────────────────────────────────────────────────────────────────────────────
// Port I/O
// ─────────────────────────────────────────────────────────────────────────────

/// Errors of the read/write pipelines
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PortError {
    /// Driver has nothing to report this time; not a failure
    #[error("Read skipped")]
    SkipRead,

    #[error("Read failed: {0}")]
    Read(String),

    #[error("Write failed: {0}")]
    Write(String),

    #[error("Operation timed out")]
    Timeout,

    /// Dropped from a full write queue in favor of a newer value
    #[error("Write queue full")]
    QueueFull,

    #[error("Cancelled")]
    Cancelled,

    #[error("Port is disabled")]
    Disabled,

    #[error("Port is not writable")]
    NotWritable,

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

pub type PortResult<T> = Result<T, PortError>;

// ─────────────────────────────────────────────────────────────────────────────
// Attributes
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AttrError {
    #[error("Unknown attribute: {0}")]
    UnknownAttribute(String),

    #[error("Attribute not modifiable: {0}")]
    NotModifiable(String),

    #[error("Invalid value for {attr}: {details}")]
    InvalidValue { attr: String, details: String },

    #[error("Invalid expression in {attr}: {source}")]
    Expression {
        attr: String,
        #[source]
        source: ParseError,
    },

    #[error("Circular dependency: {}", path.join(" -> "))]
    CircularDependency { path: Vec<String> },
}

impl AttrError {
    pub fn invalid(attr: impl Into<String>, details: impl Into<String>) -> Self {
        AttrError::InvalidValue {
            attr: attr.into(),
            details: details.into(),
        }
    }
}

pub type AttrResult<T> = Result<T, AttrError>;

// ─────────────────────────────────────────────────────────────────────────────
// Core
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A single port could not be loaded; other ports are unaffected
    #[error("Failed to load port {id}: {reason}")]
    PortLoad { id: String, reason: String },

    #[error("No such port: {0}")]
    NoSuchPort(String),

    #[error("Unknown driver: {0}")]
    UnknownDriver(String),

    #[error(transparent)]
    Attr(#[from] AttrError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),
}

impl CoreError {
    pub fn port_load(id: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        CoreError::PortLoad {
            id: id.into(),
            reason: reason.to_string(),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
