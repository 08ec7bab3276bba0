//! Error types for the auth crate.

use thiserror::Error;

/// Auth subsystem error type.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("key parsing error: {0}")]
    KeyParsing(String),

    #[error("no issuer keys configured for this audience")]
    NoIssuerKeys,

    #[error("audience is not configured")]
    MissingAudience,

    #[error("token signing error: {0}")]
    Signing(String),

    #[error("identity serialization error: {0}")]
    Identity(String),

    #[error("unknown auth driver: {0}")]
    UnknownDriver(String),
}

/// Result type alias for auth operations.
pub type AuthResult<T> = std::result::Result<T, AuthError>;
