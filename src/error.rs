//! Error Module
//!
//! Defines the error taxonomy and result alias used throughout the counter service.

use thiserror::Error;

/// Main error type for the counter service
#[derive(Error, Debug, Clone)]
pub enum CounterError {
    /// The coordination store could not be reached or rejected a read/write
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The distributed lock could not be obtained because of connectivity loss
    #[error("Lock acquisition failed: {0}")]
    LockAcquisitionFailed(String),

    /// The replica is draining and no longer starts increments
    #[error("Shutting down: {0}")]
    ShuttingDown(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("System error: {0}")]
    SystemError(String),

    #[error("Timeout error: {0}")]
    TimeoutError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for CounterError {
    fn from(err: std::io::Error) -> Self {
        CounterError::IoError(err.to_string())
    }
}

impl From<hyper::Error> for CounterError {
    fn from(err: hyper::Error) -> Self {
        CounterError::HttpError(err.to_string())
    }
}

impl From<serde_json::Error> for CounterError {
    fn from(err: serde_json::Error) -> Self {
        CounterError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CounterError {
    fn from(err: serde_yaml::Error) -> Self {
        CounterError::SerializationError(err.to_string())
    }
}

impl From<etcd_client::Error> for CounterError {
    fn from(err: etcd_client::Error) -> Self {
        CounterError::StoreUnavailable(err.to_string())
    }
}

impl CounterError {
    /// Message carried by the error, without the variant prefix
    pub fn message(&self) -> &str {
        match self {
            CounterError::StoreUnavailable(msg)
            | CounterError::LockAcquisitionFailed(msg)
            | CounterError::ShuttingDown(msg)
            | CounterError::SerializationError(msg)
            | CounterError::ConfigError(msg)
            | CounterError::IoError(msg)
            | CounterError::HttpError(msg)
            | CounterError::SystemError(msg)
            | CounterError::TimeoutError(msg)
            | CounterError::Internal(msg) => msg,
        }
    }
}

/// Result type alias for the counter service
pub type Result<T> = std::result::Result<T, CounterError>;
