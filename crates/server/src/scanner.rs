//! Vulnerability scanner client.

use crate::error::{ApiError, ApiResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use wharf_core::Severity;

/// The request handed to the scanner for one manifest: its digest plus
/// fetchable URLs for every directly referenced blob.
#[derive(Clone, Debug, Serialize)]
pub struct ScannerManifest {
    pub digest: String,
    pub layers: Vec<ScannerLayer>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ScannerLayer {
    pub digest: String,
    pub url: String,
}

/// Indexing state reported by the scanner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanState {
    Indexed,
    Pending,
    Errored,
}

/// The external vulnerability scanner seam.
#[async_trait]
pub trait VulnerabilityScanner: Send + Sync {
    /// Submit the manifest (idempotently) and report its indexing state.
    async fn check_manifest_state(&self, manifest: &ScannerManifest) -> ApiResult<ScanState>;

    /// The severity of the finished report, or `None` if the scanner has no
    /// report for this digest.
    async fn get_vulnerability_report(&self, digest: &str) -> ApiResult<Option<Severity>>;
}

#[derive(Deserialize)]
struct IndexReportResponse {
    state: String,
}

#[derive(Deserialize)]
struct VulnReportResponse {
    #[serde(default)]
    severity: Option<String>,
}

/// HTTP implementation speaking a Clair-style index/report API.
pub struct HttpScanner {
    base_url: String,
    http: reqwest::Client,
}

impl HttpScanner {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl VulnerabilityScanner for HttpScanner {
    async fn check_manifest_state(&self, manifest: &ScannerManifest) -> ApiResult<ScanState> {
        let url = format!("{}/indexer/api/v1/index_report", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(manifest)
            .send()
            .await
            .map_err(|e| ApiError::Internal(format!("scanner: {e}")))?;
        if !response.status().is_success() {
            return Err(ApiError::Internal(format!(
                "scanner returned status {} for {}",
                response.status(),
                manifest.digest
            )));
        }
        let body: IndexReportResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Internal(format!("scanner: {e}")))?;
        Ok(match body.state.as_str() {
            "IndexFinished" => ScanState::Indexed,
            "IndexError" => ScanState::Errored,
            _ => ScanState::Pending,
        })
    }

    async fn get_vulnerability_report(&self, digest: &str) -> ApiResult<Option<Severity>> {
        let url = format!(
            "{}/matcher/api/v1/vulnerability_report/{digest}",
            self.base_url
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ApiError::Internal(format!("scanner: {e}")))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ApiError::Internal(format!(
                "scanner returned status {} for report {digest}",
                response.status()
            )));
        }
        let body: VulnReportResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Internal(format!("scanner: {e}")))?;
        Ok(match body.severity {
            Some(s) => Some(
                Severity::parse(&s)
                    .ok_or_else(|| ApiError::Internal(format!("scanner sent unknown severity {s}")))?,
            ),
            None => Some(Severity::Clean),
        })
    }
}
