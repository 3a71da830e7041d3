//! Error types for execution backends

use thiserror::Error;

/// Result type alias for backend operations
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors that can occur when talking to an execution backend
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend could not be reached
    #[error("backend request failed: {0}")]
    Transient(#[from] reqwest::Error),

    /// The backend answered with an error status code
    #[error("backend error (status {status}): {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Error body returned by the backend
        message: String,
    },

    /// The backend returned data in an unexpected shape
    #[error("unexpected backend state: {0}")]
    State(String),

    /// Unit of work not found
    #[error("unit not found: {0}")]
    NotFound(String),

    /// The backend cannot express this kind of work
    #[error("unsupported by backend: {0}")]
    Unsupported(String),
}

impl BackendError {
    /// Create an API error from status code and message
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Check if this error is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_)) || matches!(self, Self::Api { status: 404, .. })
    }

    /// Check if retrying on the next poll may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_)) || matches!(self, Self::Api { status, .. } if *status >= 500)
    }
}
