//! Tag listing with pagination.

use super::{RepoPath, query_param};
use crate::auth::authorize_repo_action;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use wharf_core::error::RegistryErrorCode;
use wharf_core::scope::Action;

#[derive(Serialize)]
struct TagListResponse {
    name: String,
    tags: Vec<String>,
}

/// `GET /v2/<name>/tags/list` with `?n=` / `?last=` pagination.
pub async fn list_tags(
    state: &AppState,
    headers: &HeaderMap,
    repo_path: &RepoPath,
    query: &str,
) -> ApiResult<Response> {
    authorize_repo_action(state, headers, &repo_path.full, Action::Pull)?;

    let limit: Option<u32> = match query_param(query, "n") {
        Some(raw) => {
            let n: i64 = raw
                .parse()
                .map_err(|_| ApiError::BadRequest(format!("invalid value for n: {raw}")))?;
            if n < 1 {
                return Err(ApiError::BadRequest(format!(
                    "n must be positive, got {n}"
                )));
            }
            Some(n.min(u32::MAX as i64) as u32)
        }
        None => None,
    };
    let last = query_param(query, "last").unwrap_or_default();

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

    // fetch one extra entry to learn whether a next page exists
    let fetch_limit = limit.map(|n| n.saturating_add(1)).unwrap_or(u32::MAX);
    let mut tags = state.db.list_tag_names(repo.id, &last, fetch_limit).await?;

    let mut next_link = None;
    if let Some(n) = limit {
        if tags.len() as u32 > n {
            tags.truncate(n as usize);
            let page_last = tags.last().cloned().unwrap_or_default();
            next_link = Some(format!(
                "</v2/{}/tags/list?last={}&n={}>; rel=\"next\"",
                repo_path.full, page_last, n
            ));
        }
    }

    let mut response = Json(TagListResponse {
        name: repo_path.full.clone(),
        tags,
    })
    .into_response();
    if let Some(link) = next_link {
        if let Ok(value) = HeaderValue::from_str(&link) {
            response.headers_mut().insert(header::LINK, value);
        }
    }
    Ok(response)
}
