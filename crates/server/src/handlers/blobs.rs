//! Blob read and delete endpoints.

use super::RepoPath;
use crate::auth::authorize_repo_action;
use crate::error::ApiResult;
use crate::state::AppState;
use axum::body::Body;
use axum::http::{HeaderMap, Response as HttpResponse, StatusCode, header};
use axum::response::{IntoResponse, Response};
use wharf_core::digest::Digest;
use wharf_core::error::RegistryErrorCode;
use wharf_core::scope::Action;
use wharf_metadata::models::BlobRow;

fn blob_response(blob: &BlobRow, contents: Option<bytes::Bytes>) -> ApiResult<Response> {
    let body = match contents {
        Some(bytes) => Body::from(bytes),
        None => Body::empty(),
    };
    let response = HttpResponse::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, blob.size_bytes)
        .header("Docker-Content-Digest", blob.digest.clone())
        .body(body)
        .map_err(|e| crate::error::ApiError::Internal(e.to_string()))?;
    Ok(response)
}

/// `GET|HEAD /v2/<name>/blobs/<digest>`.
///
/// On replica accounts a local miss triggers replication-on-read; concurrent
/// requests for the same digest coalesce into one upstream fetch.
pub async fn get_blob(
    state: &AppState,
    headers: &HeaderMap,
    repo_path: &RepoPath,
    digest_str: &str,
    include_body: bool,
) -> ApiResult<Response> {
    authorize_repo_action(state, headers, &repo_path.full, Action::Pull)?;
    let account = state
        .db
        .get_account(&repo_path.account)
        .await?
        .ok_or_else(|| RegistryErrorCode::NameUnknown.with(repo_path.full.clone()))?;
    let digest = Digest::parse(digest_str)?;

    let repo = state.db.get_repository(&account.name, &repo_path.repo).await?;

    if let Some(repo) = &repo {
        if let Some(blob) = state.db.get_blob_in_repo(repo.id, &digest.to_string()).await? {
            if !blob.storage_id.is_empty() {
                let contents = if include_body {
                    Some(state.storage.read_blob(&account.name, &blob.storage_id).await?)
                } else {
                    None
                };
                return blob_response(&blob, contents);
            }
            // fall through: the blob is mid-replication, join the wait below
        }
    }

    if account.is_replica() {
        let repo = match repo {
            Some(repo) => repo,
            None => {
                state
                    .db
                    .find_or_create_repository(&account.name, &repo_path.repo)
                    .await?
            }
        };
        let blob = state.processor().replicate_blob(&account, &repo, &digest).await?;
        let contents = if include_body {
            Some(state.storage.read_blob(&account.name, &blob.storage_id).await?)
        } else {
            None
        };
        return blob_response(&blob, contents);
    }

    match repo {
        None => Err(RegistryErrorCode::NameUnknown.with(repo_path.full.clone()).into()),
        Some(_) => Err(RegistryErrorCode::BlobUnknown.with(digest.to_string()).into()),
    }
}

/// `DELETE /v2/<name>/blobs/<digest>` removes the blob from this repository.
/// The blob itself is garbage-collected once nothing mounts it anymore.
pub async fn delete_blob(
    state: &AppState,
    headers: &HeaderMap,
    repo_path: &RepoPath,
    digest_str: &str,
) -> ApiResult<Response> {
    authorize_repo_action(state, headers, &repo_path.full, Action::Delete)?;
    let account = state
        .db
        .get_account(&repo_path.account)
        .await?
        .ok_or_else(|| RegistryErrorCode::NameUnknown.with(repo_path.full.clone()))?;
    let repo = state
        .db
        .get_repository(&account.name, &repo_path.repo)
        .await?
        .ok_or_else(|| RegistryErrorCode::NameUnknown.with(repo_path.full.clone()))?;
    let digest = Digest::parse(digest_str)?;

    let blob = state
        .db
        .get_blob_in_repo(repo.id, &digest.to_string())
        .await?
        .ok_or_else(|| RegistryErrorCode::BlobUnknown.with(digest.to_string()))?;
    state.db.unmount_blob(blob.id, repo.id).await?;
    Ok(StatusCode::ACCEPTED.into_response())
}
