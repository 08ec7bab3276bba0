//! HTTP client for one repository on one registry.

use crate::error::{ClientError, ClientResult};
use bytes::Bytes;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tokio::sync::Mutex;
use wharf_core::manifest::{ManifestReference, media_type};

#[derive(Deserialize)]
struct TokenEndpointResponse {
    token: String,
}

/// Client for a single repository on a single registry host.
///
/// Talks the registry v2 wire protocol; obtains a pull-scoped bearer token
/// from the host's token endpoint on first use and caches it for the
/// lifetime of the client.
pub struct RepoClient {
    http: reqwest::Client,
    base_url: Url,
    host: String,
    repo: String,
    credentials: Option<(String, String)>,
    cached_token: Mutex<Option<String>>,
}

impl RepoClient {
    /// Create a client for `repo` (full name, `<account>/<path>`) on the
    /// registry at `base_url`.
    pub fn new(
        base_url: &str,
        repo: &str,
        credentials: Option<(String, String)>,
    ) -> ClientResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ClientError::TokenNegotiation(format!("invalid base URL: {e}")))?;
        let host = base_url
            .host_str()
            .ok_or_else(|| ClientError::TokenNegotiation("base URL has no host".into()))?
            .to_string();
        Ok(Self {
            http: reqwest::Client::new(),
            base_url,
            host,
            repo: repo.to_string(),
            credentials,
            cached_token: Mutex::new(None),
        })
    }

    /// The registry host this client talks to. Part of validation cache keys.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The repository this client is bound to. Part of validation cache keys.
    pub fn repo(&self) -> &str {
        &self.repo
    }

    fn url(&self, path: &str) -> ClientResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| ClientError::TokenNegotiation(format!("invalid URL path: {e}")))
    }

    async fn bearer_token(&self) -> ClientResult<Option<String>> {
        let Some((username, password)) = &self.credentials else {
            return Ok(None);
        };

        let mut cached = self.cached_token.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(Some(token.clone()));
        }

        let url = self.url(&format!(
            "/token?service={}&scope=repository:{}:pull",
            self.host, self.repo
        ))?;
        let response = self
            .http
            .get(url.clone())
            .basic_auth(username, Some(password))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ClientError::TokenNegotiation(format!(
                "status {} from {}",
                response.status(),
                url
            )));
        }
        let body: TokenEndpointResponse = response
            .json()
            .await
            .map_err(|e| ClientError::TokenNegotiation(e.to_string()))?;

        *cached = Some(body.token.clone());
        Ok(Some(body.token))
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        accept: Option<&str>,
    ) -> ClientResult<reqwest::Response> {
        let url = self.url(path)?;
        let mut builder = self.http.request(method, url.clone());
        if let Some(token) = self.bearer_token().await? {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(accept) = accept {
            builder = builder.header(ACCEPT, accept);
        }
        let response = builder.send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(ClientError::NotFound(url.to_string())),
            status if status.is_success() => Ok(response),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(ClientError::UnexpectedStatus {
                    status: status.as_u16(),
                    url: url.to_string(),
                    body,
                })
            }
        }
    }

    fn manifest_accept() -> String {
        [
            media_type::DOCKER_MANIFEST,
            media_type::DOCKER_MANIFEST_LIST,
            media_type::OCI_MANIFEST,
            media_type::OCI_INDEX,
        ]
        .join(", ")
    }

    /// Download a manifest. Returns its bytes and media type.
    pub async fn download_manifest(
        &self,
        reference: &ManifestReference,
    ) -> ClientResult<(Bytes, String)> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/v2/{}/manifests/{}", self.repo, reference),
                Some(&Self::manifest_accept()),
            )
            .await?;
        let media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(media_type::DOCKER_MANIFEST)
            .to_string();
        let bytes = response.bytes().await?;
        Ok((bytes, media_type))
    }

    /// Probe whether a manifest exists, without downloading it.
    pub async fn manifest_exists(&self, reference: &ManifestReference) -> ClientResult<bool> {
        let result = self
            .request(
                reqwest::Method::HEAD,
                &format!("/v2/{}/manifests/{}", self.repo, reference),
                Some(&Self::manifest_accept()),
            )
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Download a blob's full contents.
    pub async fn download_blob(&self, digest: &str) -> ClientResult<Bytes> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/v2/{}/blobs/{}", self.repo, digest),
                None,
            )
            .await?;
        Ok(response.bytes().await?)
    }
}
