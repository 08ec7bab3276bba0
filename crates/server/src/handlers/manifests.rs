//! Manifest endpoints.

use super::RepoPath;
use crate::auth::authorize_repo_action;
use crate::error::ApiResult;
use crate::processor::IncomingManifest;
use crate::state::AppState;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, HeaderValue, Response as HttpResponse, StatusCode, header};
use axum::response::{IntoResponse, Response};
use time::OffsetDateTime;
use wharf_core::error::RegistryErrorCode;
use wharf_core::manifest::ManifestReference;
use wharf_core::scope::Action;

fn manifest_response(
    media_type: &str,
    digest: &str,
    contents: Bytes,
    include_body: bool,
) -> ApiResult<Response> {
    let length = contents.len();
    let body = if include_body {
        Body::from(contents)
    } else {
        Body::empty()
    };
    let response = HttpResponse::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, media_type)
        .header(header::CONTENT_LENGTH, length)
        .header("Docker-Content-Digest", digest)
        .body(body)
        .map_err(|e| crate::error::ApiError::Internal(e.to_string()))?;
    Ok(response)
}

/// `GET|HEAD /v2/<name>/manifests/<reference>`.
///
/// On replica accounts a local miss triggers replication-on-read from the
/// upstream peer.
pub async fn get_manifest(
    state: &AppState,
    headers: &HeaderMap,
    repo_path: &RepoPath,
    reference_str: &str,
    include_body: bool,
) -> ApiResult<Response> {
    authorize_repo_action(state, headers, &repo_path.full, Action::Pull)?;
    let account = state
        .db
        .get_account(&repo_path.account)
        .await?
        .ok_or_else(|| RegistryErrorCode::NameUnknown.with(repo_path.full.clone()))?;
    let reference = ManifestReference::parse(reference_str)?;

    let repo = state.db.get_repository(&account.name, &repo_path.repo).await?;
    if let Some(repo) = &repo {
        let digest = match &reference {
            ManifestReference::Digest(d) => Some(d.to_string()),
            ManifestReference::Tag(t) => {
                state.db.get_tag(repo.id, t).await?.map(|tag| tag.digest)
            }
        };
        if let Some(digest) = digest {
            if let Some(manifest) = state.db.get_manifest(repo.id, &digest).await? {
                let contents = state
                    .storage
                    .read_manifest(&account.name, &repo.name, &digest)
                    .await?;
                return manifest_response(&manifest.media_type, &digest, contents, include_body);
            }
        }
    }

    if account.is_replica() {
        let (row, contents, media_type) = state
            .processor()
            .replicate_manifest(&account, &repo_path.repo, &reference)
            .await?;
        return manifest_response(&media_type, &row.digest, contents, include_body);
    }

    match repo {
        None => Err(RegistryErrorCode::NameUnknown.with(repo_path.full.clone()).into()),
        Some(_) => Err(RegistryErrorCode::ManifestUnknown
            .with(reference.to_string())
            .into()),
    }
}

/// `PUT /v2/<name>/manifests/<reference>`.
pub async fn put_manifest(
    state: &AppState,
    headers: &HeaderMap,
    repo_path: &RepoPath,
    reference_str: &str,
    contents: Bytes,
) -> ApiResult<Response> {
    authorize_repo_action(state, headers, &repo_path.full, Action::Push)?;
    let account = state
        .db
        .get_account(&repo_path.account)
        .await?
        .ok_or_else(|| RegistryErrorCode::NameUnknown.with(repo_path.full.clone()))?;
    let reference = ManifestReference::parse(reference_str)?;

    let media_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| RegistryErrorCode::ManifestInvalid.with("missing Content-Type header"))?
        .to_string();

    let manifest = state
        .processor()
        .validate_and_store_manifest(
            &account,
            IncomingManifest {
                repo_name: repo_path.repo.clone(),
                reference,
                media_type,
                contents,
                pushed_at: OffsetDateTime::now_utc(),
            },
        )
        .await?;

    let mut response = HttpResponse::builder()
        .status(StatusCode::CREATED)
        .header(
            header::LOCATION,
            format!("/v2/{}/manifests/{}", repo_path.full, manifest.digest),
        )
        .body(Body::empty())
        .map_err(|e| crate::error::ApiError::Internal(e.to_string()))?;
    if let Ok(value) = HeaderValue::from_str(&manifest.digest) {
        response.headers_mut().insert("Docker-Content-Digest", value);
    }
    Ok(response)
}

/// `DELETE /v2/<name>/manifests/<digest>`. Deleting by tag is unsupported.
pub async fn delete_manifest(
    state: &AppState,
    headers: &HeaderMap,
    repo_path: &RepoPath,
    reference_str: &str,
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

    let reference = ManifestReference::parse(reference_str)?;
    let Some(digest) = reference.as_digest() else {
        return Err(RegistryErrorCode::Unsupported
            .with("manifests can only be deleted by digest")
            .into());
    };

    state
        .processor()
        .delete_manifest(&account, &repo, &digest.to_string())
        .await?;
    Ok(StatusCode::ACCEPTED.into_response())
}
