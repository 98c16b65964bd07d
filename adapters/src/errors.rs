//! Custom error types specific to the `adapters` crate.
//!
//! This module defines errors that can occur during node connection, RPC calls,
//! REST requests or data conversions within the adapter layer, providing a unified
//! error handling mechanism for all backend interactions.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    /// The backend could not be reached (connection refused, TLS failure, DNS...).
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out")]
    Timeout,

    /// The backend rejected our credentials (macaroon or API key).
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Not found: {0}")]
    NotFound(String),

    /// Conflicting or missing parameters, caught before anything goes on the wire.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} is not configured")]
    NotConfigured(String),
}

impl AdapterError {
    /// True for failures that say "the backend is unreachable or refusing us",
    /// as opposed to "the backend answered and the answer was bad".
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            AdapterError::Transport(_)
                | AdapterError::Timeout
                | AdapterError::Auth(_)
                | AdapterError::Http { .. }
                | AdapterError::Io(_)
                | AdapterError::NotConfigured(_)
        )
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AdapterError::Timeout
        } else if err.is_decode() {
            AdapterError::Parse(err.to_string())
        } else if let Some(status) = err.status() {
            AdapterError::Http {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            AdapterError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for AdapterError {
    fn from(err: serde_json::Error) -> Self {
        AdapterError::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_class_excludes_answered_requests() {
        assert!(AdapterError::Timeout.is_transport());
        assert!(AdapterError::Transport("refused".into()).is_transport());
        assert!(AdapterError::Http {
            status: 503,
            body: String::new()
        }
        .is_transport());
        assert!(!AdapterError::NotFound("node".into()).is_transport());
        assert!(!AdapterError::Validation("both filters".into()).is_transport());
        assert!(!AdapterError::Parse("eof".into()).is_transport());
    }
}
