//! Client error types.

use thiserror::Error;

/// Registry client error type.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not found upstream: {0}")]
    NotFound(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status} from {url}: {body}")]
    UnexpectedStatus {
        status: u16,
        url: String,
        body: String,
    },

    #[error("token negotiation failed: {0}")]
    TokenNegotiation(String),

    #[error("digest mismatch: expected {expected}, actual {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("validation error: {0}")]
    Validation(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type alias for client operations.
pub type ClientResult<T> = std::result::Result<T, ClientError>;
