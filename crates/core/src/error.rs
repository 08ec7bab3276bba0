//! The registry v2 error vocabulary.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of error codes that can appear in a [`RegistryError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegistryErrorCode {
    #[serde(rename = "BLOB_UNKNOWN")]
    BlobUnknown,
    #[serde(rename = "BLOB_UPLOAD_INVALID")]
    BlobUploadInvalid,
    #[serde(rename = "BLOB_UPLOAD_UNKNOWN")]
    BlobUploadUnknown,
    #[serde(rename = "DIGEST_INVALID")]
    DigestInvalid,
    #[serde(rename = "MANIFEST_BLOB_UNKNOWN")]
    ManifestBlobUnknown,
    #[serde(rename = "MANIFEST_INVALID")]
    ManifestInvalid,
    #[serde(rename = "MANIFEST_UNKNOWN")]
    ManifestUnknown,
    #[serde(rename = "MANIFEST_UNVERIFIED")]
    ManifestUnverified,
    #[serde(rename = "NAME_INVALID")]
    NameInvalid,
    #[serde(rename = "NAME_UNKNOWN")]
    NameUnknown,
    #[serde(rename = "SIZE_INVALID")]
    SizeInvalid,
    #[serde(rename = "TAG_INVALID")]
    TagInvalid,
    #[serde(rename = "UNAUTHORIZED")]
    Unauthorized,
    #[serde(rename = "DENIED")]
    Denied,
    #[serde(rename = "UNSUPPORTED")]
    Unsupported,
}

impl RegistryErrorCode {
    /// The default human-readable message for this code.
    pub fn message(&self) -> &'static str {
        match self {
            Self::BlobUnknown => "blob unknown to registry",
            Self::BlobUploadInvalid => "blob upload invalid",
            Self::BlobUploadUnknown => "blob upload unknown to registry",
            Self::DigestInvalid => "provided digest did not match uploaded content",
            Self::ManifestBlobUnknown => "manifest blob unknown to registry",
            Self::ManifestInvalid => "manifest invalid",
            Self::ManifestUnknown => "manifest unknown",
            Self::ManifestUnverified => "manifest failed signature verification",
            Self::NameInvalid => "invalid repository name",
            Self::NameUnknown => "repository name not known to registry",
            Self::SizeInvalid => "provided length did not match content length",
            Self::TagInvalid => "manifest tag did not match URI",
            Self::Unauthorized => "authentication required",
            Self::Denied => "requested access to the resource is denied",
            Self::Unsupported => "operation is unsupported",
        }
    }

    /// The HTTP status code this error is reported with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::BlobUnknown => 404,
            Self::BlobUploadInvalid => 422,
            Self::BlobUploadUnknown => 404,
            Self::DigestInvalid => 422,
            Self::ManifestBlobUnknown => 404,
            Self::ManifestInvalid => 422,
            Self::ManifestUnknown => 404,
            Self::ManifestUnverified => 422,
            Self::NameInvalid => 422,
            Self::NameUnknown => 404,
            Self::SizeInvalid => 422,
            Self::TagInvalid => 422,
            Self::Unauthorized => 401,
            Self::Denied => 403,
            Self::Unsupported => 501,
        }
    }

    /// Construct a [`RegistryError`] with this code and an optional detail.
    pub fn with(self, detail: impl Into<String>) -> RegistryError {
        let detail = detail.into();
        RegistryError {
            code: self,
            message: self.message().to_string(),
            detail: if detail.is_empty() { None } else { Some(detail) },
        }
    }
}

/// The error type expected by clients of the docker-registry v2 API.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryError {
    pub code: RegistryErrorCode,
    pub message: String,
    pub detail: Option<String>,
}

impl RegistryError {
    /// The HTTP status code for this error.
    pub fn http_status(&self) -> u16 {
        self.code.http_status()
    }
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {}", self.message, detail),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for RegistryError {}

/// The `{"errors":[...]}` envelope used on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub errors: Vec<RegistryError>,
}

impl From<RegistryError> for ErrorEnvelope {
    fn from(e: RegistryError) -> Self {
        Self { errors: vec![e] }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_serialization() {
        let err = RegistryErrorCode::ManifestBlobUnknown.with("sha256:abc");
        let json = serde_json::to_value(ErrorEnvelope::from(err)).unwrap();
        assert_eq!(json["errors"][0]["code"], "MANIFEST_BLOB_UNKNOWN");
        assert_eq!(json["errors"][0]["detail"], "sha256:abc");
    }

    #[test]
    fn test_empty_detail_is_omitted() {
        let err = RegistryErrorCode::ManifestUnknown.with("");
        assert_eq!(err.detail, None);
        assert_eq!(err.http_status(), 404);
    }
}
