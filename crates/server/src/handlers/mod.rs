//! Registry v2 API handlers.
//!
//! Repository names contain slashes, which rules out typed route segments;
//! everything under `/v2/` goes through a fallback dispatcher that picks the
//! handler from the trailing path components.

pub mod base;
pub mod blobs;
pub mod manifests;
pub mod tags;
pub mod uploads;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::{API_VERSION_HEADER, API_VERSION_VALUE};
use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use wharf_core::manifest::validate_repo_name;

/// Largest manifest body accepted.
const MAX_MANIFEST_SIZE: usize = 8 * 1024 * 1024;
/// Largest blob body accepted in one request.
const MAX_BLOB_BODY_SIZE: usize = 1024 * 1024 * 1024;

/// A repository path split into its account and in-account parts.
pub(crate) struct RepoPath {
    pub account: String,
    pub repo: String,
    pub full: String,
}

fn parse_repo_path(segments: &[&str]) -> ApiResult<RepoPath> {
    let full = segments.join("/");
    validate_repo_name(&full)?;
    if segments.len() < 2 {
        return Err(wharf_core::error::RegistryErrorCode::NameInvalid
            .with(format!("{full}: a repository name needs an account part"))
            .into());
    }
    Ok(RepoPath {
        account: segments[0].to_string(),
        repo: segments[1..].join("/"),
        full,
    })
}

fn plain_not_found() -> Response {
    let mut response = StatusCode::NOT_FOUND.into_response();
    response.headers_mut().insert(
        API_VERSION_HEADER,
        HeaderValue::from_static(API_VERSION_VALUE),
    );
    response
}

/// Extract a query parameter, undoing percent-encoding.
pub(crate) fn query_param(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        if k == key {
            Some(percent_decode(v))
        } else {
            None
        }
    })
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3).and_then(|h| {
                    std::str::from_utf8(h)
                        .ok()
                        .and_then(|h| u8::from_str_radix(h, 16).ok())
                });
                match hex {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                    }
                    None => {
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

async fn read_body(req: Request, limit: usize) -> ApiResult<Bytes> {
    axum::body::to_bytes(req.into_body(), limit)
        .await
        .map_err(|e| ApiError::BadRequest(format!("cannot read request body: {e}")))
}

/// Fallback dispatcher for all `/v2/<name>/...` routes.
pub async fn registry_fallback(State(state): State<AppState>, req: Request) -> Response {
    match dispatch(state, req).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn dispatch(state: AppState, req: Request) -> ApiResult<Response> {
    let method = req.method().clone();
    let headers: HeaderMap = req.headers().clone();
    let path = req.uri().path().trim_end_matches('/').to_string();
    let query = req.uri().query().unwrap_or("").to_string();

    let Some(rest) = path.strip_prefix("/v2/") else {
        return Ok(plain_not_found());
    };
    let segments: Vec<&str> = rest.split('/').collect();
    let n = segments.len();

    // …/tags/list
    if n >= 3 && segments[n - 2] == "tags" && segments[n - 1] == "list" {
        if method != Method::GET {
            return Ok(plain_not_found());
        }
        let repo_path = parse_repo_path(&segments[..n - 2])?;
        return tags::list_tags(&state, &headers, &repo_path, &query).await;
    }

    // …/blobs/uploads: start an upload
    if n >= 3 && segments[n - 2] == "blobs" && segments[n - 1] == "uploads" {
        if method != Method::POST {
            return Ok(plain_not_found());
        }
        let repo_path = parse_repo_path(&segments[..n - 2])?;
        let body = read_body(req, MAX_BLOB_BODY_SIZE).await?;
        return uploads::start_upload(&state, &headers, &repo_path, &query, body).await;
    }

    // …/blobs/uploads/<uuid>: upload session operations
    if n >= 4 && segments[n - 3] == "blobs" && segments[n - 2] == "uploads" {
        let upload_id = segments[n - 1].to_string();
        let repo_path = parse_repo_path(&segments[..n - 3])?;
        if method == Method::PATCH {
            let body = read_body(req, MAX_BLOB_BODY_SIZE).await?;
            return uploads::append_chunk(&state, &headers, &repo_path, &upload_id, body).await;
        }
        if method == Method::PUT {
            let body = read_body(req, MAX_BLOB_BODY_SIZE).await?;
            return uploads::finalize_upload(&state, &headers, &repo_path, &upload_id, &query, body)
                .await;
        }
        if method == Method::GET {
            return uploads::upload_status(&state, &headers, &repo_path, &upload_id).await;
        }
        if method == Method::DELETE {
            return uploads::abort_upload(&state, &headers, &repo_path, &upload_id).await;
        }
        return Ok(plain_not_found());
    }

    // …/manifests/<reference>
    if n >= 3 && segments[n - 2] == "manifests" {
        let reference = segments[n - 1].to_string();
        let repo_path = parse_repo_path(&segments[..n - 2])?;
        if method == Method::GET {
            return manifests::get_manifest(&state, &headers, &repo_path, &reference, true).await;
        }
        if method == Method::HEAD {
            return manifests::get_manifest(&state, &headers, &repo_path, &reference, false).await;
        }
        if method == Method::PUT {
            let body = read_body(req, MAX_MANIFEST_SIZE).await?;
            return manifests::put_manifest(&state, &headers, &repo_path, &reference, body).await;
        }
        if method == Method::DELETE {
            return manifests::delete_manifest(&state, &headers, &repo_path, &reference).await;
        }
        return Ok(plain_not_found());
    }

    // …/blobs/<digest>
    if n >= 3 && segments[n - 2] == "blobs" {
        let digest = segments[n - 1].to_string();
        let repo_path = parse_repo_path(&segments[..n - 2])?;
        if method == Method::GET {
            return blobs::get_blob(&state, &headers, &repo_path, &digest, true).await;
        }
        if method == Method::HEAD {
            return blobs::get_blob(&state, &headers, &repo_path, &digest, false).await;
        }
        if method == Method::DELETE {
            return blobs::delete_blob(&state, &headers, &repo_path, &digest).await;
        }
        return Ok(plain_not_found());
    }

    Ok(plain_not_found())
}
