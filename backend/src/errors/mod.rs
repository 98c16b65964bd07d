//! Global application error types.
//!
//! `AppError` is the service-level taxonomy shared by every backend component.
//! Wire-level `AdapterError`s are folded into it at the edge of the services.
//! Staleness is not an error: data served past its freshness window carries a
//! `stale` flag instead.

use adapters::AdapterError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    /// A backend could not be reached, refused our credentials, or answered
    /// with something unusable.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn is_transport(&self) -> bool {
        matches!(self, AppError::Transport(_))
    }
}

impl From<AdapterError> for AppError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::NotFound(what) => AppError::NotFound(what),
            AdapterError::Validation(msg) => AppError::Validation(msg),
            AdapterError::NotConfigured(what) => AppError::Config(format!("{} is not configured", what)),
            other => AppError::Transport(other.to_string()),
        }
    }
}
