//! Blob upload endpoints, monolithic and chunked.

use super::{RepoPath, query_param};
use crate::auth::authorize_repo_action;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Response as HttpResponse, StatusCode, header};
use axum::response::{IntoResponse, Response};
use time::OffsetDateTime;
use uuid::Uuid;
use wharf_core::digest::Digest;
use wharf_core::error::RegistryErrorCode;
use wharf_core::scope::Action;
use wharf_metadata::models::{AccountRow, RepositoryRow, UploadRow};

fn range_header(size_bytes: i64) -> String {
    format!("0-{}", size_bytes.saturating_sub(1).max(0))
}

fn accepted_response(repo_full: &str, upload: &UploadRow) -> ApiResult<Response> {
    HttpResponse::builder()
        .status(StatusCode::ACCEPTED)
        .header(
            header::LOCATION,
            format!("/v2/{}/blobs/uploads/{}", repo_full, upload.id),
        )
        .header("Docker-Upload-UUID", upload.id.to_string())
        .header(header::RANGE, range_header(upload.size_bytes))
        .body(Body::empty())
        .map_err(|e| ApiError::Internal(e.to_string()))
}

fn created_response(repo_full: &str, digest: &str) -> ApiResult<Response> {
    HttpResponse::builder()
        .status(StatusCode::CREATED)
        .header(header::LOCATION, format!("/v2/{repo_full}/blobs/{digest}"))
        .header("Docker-Content-Digest", digest.to_string())
        .body(Body::empty())
        .map_err(|e| ApiError::Internal(e.to_string()))
}

async fn load_upload_for_repo(
    state: &AppState,
    repo: &RepositoryRow,
    upload_id: &str,
) -> ApiResult<UploadRow> {
    let id = Uuid::parse_str(upload_id).map_err(|_| {
        ApiError::Registry(RegistryErrorCode::BlobUploadInvalid.with(upload_id.to_string()))
    })?;
    let upload = state
        .db
        .get_upload(id)
        .await?
        .ok_or_else(|| RegistryErrorCode::BlobUploadUnknown.with(upload_id.to_string()))?;
    if upload.repo_id != repo.id {
        return Err(RegistryErrorCode::BlobUploadInvalid
            .with("upload belongs to a different repository")
            .into());
    }
    Ok(upload)
}

async fn account_and_repo(
    state: &AppState,
    repo_path: &RepoPath,
) -> ApiResult<(AccountRow, RepositoryRow)> {
    let account = state
        .db
        .get_account(&repo_path.account)
        .await?
        .ok_or_else(|| RegistryErrorCode::NameUnknown.with(repo_path.full.clone()))?;
    let repo = state
        .db
        .find_or_create_repository(&account.name, &repo_path.repo)
        .await?;
    Ok((account, repo))
}

/// `POST /v2/<name>/blobs/uploads/`.
///
/// Without a `digest` parameter this opens a chunked upload session. With
/// one, the request body is the whole blob (monolithic upload).
pub async fn start_upload(
    state: &AppState,
    headers: &HeaderMap,
    repo_path: &RepoPath,
    query: &str,
    body: Bytes,
) -> ApiResult<Response> {
    authorize_repo_action(state, headers, &repo_path.full, Action::Push)?;
    let (account, repo) = account_and_repo(state, repo_path).await?;

    let upload = UploadRow {
        id: Uuid::new_v4(),
        repo_id: repo.id,
        storage_id: Uuid::new_v4().to_string(),
        size_bytes: body.len() as i64,
        digest: query_param(query, "digest").unwrap_or_default(),
        updated_at: OffsetDateTime::now_utc(),
    };

    match query_param(query, "digest") {
        Some(digest_str) => {
            let digest = Digest::parse(&digest_str)?;
            state
                .storage
                .write_blob(&account.name, &upload.storage_id, body)
                .await?;
            state.db.create_upload(&upload).await?;
            let blob = state
                .processor()
                .finalize_blob_upload(&account, &repo, &upload, &digest)
                .await?;
            created_response(&repo_path.full, &blob.digest)
        }
        None => {
            if !body.is_empty() {
                state
                    .storage
                    .append_to_blob(&account.name, &upload.storage_id, body)
                    .await?;
            }
            state.db.create_upload(&upload).await?;
            accepted_response(&repo_path.full, &upload)
        }
    }
}

/// `PATCH /v2/<name>/blobs/uploads/<uuid>` appends one chunk.
pub async fn append_chunk(
    state: &AppState,
    headers: &HeaderMap,
    repo_path: &RepoPath,
    upload_id: &str,
    body: Bytes,
) -> ApiResult<Response> {
    authorize_repo_action(state, headers, &repo_path.full, Action::Push)?;
    let (account, repo) = account_and_repo(state, repo_path).await?;
    let mut upload = load_upload_for_repo(state, &repo, upload_id).await?;

    upload.size_bytes += body.len() as i64;
    state
        .storage
        .append_to_blob(&account.name, &upload.storage_id, body)
        .await?;
    state
        .db
        .update_upload_progress(upload.id, upload.size_bytes, OffsetDateTime::now_utc())
        .await?;
    accepted_response(&repo_path.full, &upload)
}

/// `PUT /v2/<name>/blobs/uploads/<uuid>?digest=...` finalizes the upload.
/// A request body, if present, is the final chunk.
pub async fn finalize_upload(
    state: &AppState,
    headers: &HeaderMap,
    repo_path: &RepoPath,
    upload_id: &str,
    query: &str,
    body: Bytes,
) -> ApiResult<Response> {
    authorize_repo_action(state, headers, &repo_path.full, Action::Push)?;
    let (account, repo) = account_and_repo(state, repo_path).await?;
    let mut upload = load_upload_for_repo(state, &repo, upload_id).await?;

    let digest_str = query_param(query, "digest").ok_or_else(|| {
        ApiError::Registry(
            RegistryErrorCode::BlobUploadInvalid.with("finalize requires a digest parameter"),
        )
    })?;
    let digest = Digest::parse(&digest_str)?;

    if !body.is_empty() {
        upload.size_bytes += body.len() as i64;
        state
            .storage
            .append_to_blob(&account.name, &upload.storage_id, body)
            .await?;
    }

    let blob = state
        .processor()
        .finalize_blob_upload(&account, &repo, &upload, &digest)
        .await?;
    created_response(&repo_path.full, &blob.digest)
}

/// `GET /v2/<name>/blobs/uploads/<uuid>` reports upload progress.
pub async fn upload_status(
    state: &AppState,
    headers: &HeaderMap,
    repo_path: &RepoPath,
    upload_id: &str,
) -> ApiResult<Response> {
    authorize_repo_action(state, headers, &repo_path.full, Action::Push)?;
    let (_, repo) = account_and_repo(state, repo_path).await?;
    let upload = load_upload_for_repo(state, &repo, upload_id).await?;

    HttpResponse::builder()
        .status(StatusCode::NO_CONTENT)
        .header("Docker-Upload-UUID", upload.id.to_string())
        .header(header::RANGE, range_header(upload.size_bytes))
        .body(Body::empty())
        .map_err(|e| ApiError::Internal(e.to_string()))
}

/// `DELETE /v2/<name>/blobs/uploads/<uuid>` aborts the upload.
pub async fn abort_upload(
    state: &AppState,
    headers: &HeaderMap,
    repo_path: &RepoPath,
    upload_id: &str,
) -> ApiResult<Response> {
    authorize_repo_action(state, headers, &repo_path.full, Action::Push)?;
    let (account, repo) = account_and_repo(state, repo_path).await?;
    let upload = load_upload_for_repo(state, &repo, upload_id).await?;

    state.db.delete_upload(upload.id).await?;
    state
        .storage
        .abort_blob_upload(&account.name, &upload.storage_id)
        .await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
