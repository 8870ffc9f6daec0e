//! Error types for experiment data.

use thiserror::Error;

use crate::config::ConfigError;
use crate::service::ServiceError;

/// Errors raised by experiment data operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExpDataError {
    /// An argument had the wrong kind or shape.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A requested figure, analysis result, job or record is absent.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An entry with the same key already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The experiment service may only be bound once.
    #[error("An experiment service is already set")]
    ServiceAlreadySet,

    /// A call to the experiment service failed.
    #[error("Experiment service error: {0}")]
    Service(String),

    /// Error from the hardware abstraction layer.
    #[error("HAL error: {0}")]
    Hal(#[from] arvak_hal::HalError),

    /// Background jobs or analysis callbacks are still running.
    #[error("Outstanding background tasks: {0}")]
    Outstanding(String),

    /// The operation would wait on the analysis callback that invoked it.
    #[error("{0} cannot be called from inside an analysis callback")]
    InsideCallback(&'static str),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A figure could not be rendered to image bytes.
    #[error("Figure rendering failed: {0}")]
    Render(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<ServiceError> for ExpDataError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::NotFound(msg) => ExpDataError::NotFound(msg),
            ServiceError::AlreadyExists(msg) => ExpDataError::AlreadyExists(msg),
            other => ExpDataError::Service(other.to_string()),
        }
    }
}

/// Result type for experiment data operations.
pub type ExpDataResult<T> = Result<T, ExpDataError>;
