//! API error types.

use crate::{API_VERSION_HEADER, API_VERSION_VALUE};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use wharf_core::error::{ErrorEnvelope, RegistryError, RegistryErrorCode};

/// API error type.
///
/// Registry-visible failures carry a [`RegistryError`] from the closed code
/// set; everything else is an internal error that surfaces as a generic 500
/// and is logged with context.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Registry(RegistryError),

    /// Like `Registry` with `UNAUTHORIZED`, plus a `WWW-Authenticate`
    /// challenge telling the client where to obtain a token.
    #[error("{error}")]
    Challenge {
        error: RegistryError,
        challenge: String,
    },

    /// Malformed request outside the registry error vocabulary, e.g. invalid
    /// pagination parameters. Reported as HTTP 400.
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        Self::Registry(e)
    }
}

impl From<wharf_metadata::MetadataError> for ApiError {
    fn from(e: wharf_metadata::MetadataError) -> Self {
        Self::Internal(format!("metadata: {e}"))
    }
}

impl From<wharf_storage::StorageError> for ApiError {
    fn from(e: wharf_storage::StorageError) -> Self {
        // a storage miss for content the DB knows about violates the one
        // tolerated inconsistency direction, so it is never a 404
        Self::Internal(format!("storage: {e}"))
    }
}

impl From<wharf_auth::AuthError> for ApiError {
    fn from(e: wharf_auth::AuthError) -> Self {
        Self::Internal(format!("auth: {e}"))
    }
}

impl From<wharf_client::ClientError> for ApiError {
    fn from(e: wharf_client::ClientError) -> Self {
        Self::Internal(format!("peer: {e}"))
    }
}

fn envelope_response(status: StatusCode, error: RegistryError) -> Response {
    let body = serde_json::to_vec(&ErrorEnvelope::from(error)).unwrap_or_default();
    let mut response = Response::new(axum::body::Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response.headers_mut().insert(
        API_VERSION_HEADER,
        HeaderValue::from_static(API_VERSION_VALUE),
    );
    response
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Registry(error) => {
                let status = StatusCode::from_u16(error.http_status())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                envelope_response(status, error)
            }
            Self::Challenge { error, challenge } => {
                let mut response = envelope_response(StatusCode::UNAUTHORIZED, error);
                if let Ok(value) = HeaderValue::from_str(&challenge) {
                    response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
                }
                response
            }
            Self::BadRequest(msg) => {
                // outside the closed code set; the status is what matters here
                envelope_response(
                    StatusCode::BAD_REQUEST,
                    RegistryErrorCode::Unsupported.with(msg),
                )
            }
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "request failed with internal error");
                let mut response = Response::new(axum::body::Body::from("internal server error"));
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response.headers_mut().insert(
                    API_VERSION_HEADER,
                    HeaderValue::from_static(API_VERSION_VALUE),
                );
                response
            }
        }
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
