//! Error types for provisioning calls.

use callsheet_abstraction::OperationError;
use thiserror::Error;

/// Result type for provisioning calls.
pub type Result<T> = std::result::Result<T, ProvisioningError>;

/// Errors raised while talking to a provisioning API.
#[derive(Debug, Error)]
pub enum ProvisioningError {
    /// The API answered with a non-success status.
    #[error("Request failed ({status}): {reason}")]
    Request {
        /// HTTP status code.
        status: u16,
        /// Reason phrase, with the API's error message when it sent one.
        reason: String,
    },

    /// The request could not be sent or the response could not be read.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// No token could be obtained for an audience.
    #[error("Token error for audience '{audience}': {message}")]
    Token {
        /// The audience (resource) the token was requested for.
        audience: String,
        /// What went wrong.
        message: String,
    },
}

impl From<ProvisioningError> for OperationError {
    fn from(err: ProvisioningError) -> Self {
        match err {
            ProvisioningError::Request { status, reason } => Self::Request { status, reason },
            ProvisioningError::Http(e) => Self::Transport(e.to_string()),
            ProvisioningError::Token { .. } => Self::Configuration(err.to_string()),
        }
    }
}
