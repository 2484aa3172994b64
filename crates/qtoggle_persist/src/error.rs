//! Persistence errors.

/// Errors returned by persistence backends
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Duplicate record id: {0}")]
    DuplicateId(String),

    #[error("Samples not supported by this backend")]
    SamplesNotSupported,

    #[error("Unknown persistence driver: {0}")]
    UnknownDriver(String),

    #[error("Persistence backend not initialized")]
    NotInitialized,
}

impl PersistError {
    pub(crate) fn database(e: impl std::fmt::Display) -> Self {
        PersistError::Database(e.to_string())
    }
}

/// Result type for persistence operations
pub type PersistResult<T> = Result<T, PersistError>;
