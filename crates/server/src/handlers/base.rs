//! Version check and token endpoint.

use crate::auth::{audience_for_request, authenticate};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use wharf_auth::{Audience, Authorization, Permission, TokenResponse, UserIdentity};
use wharf_core::error::RegistryErrorCode;
use wharf_core::scope::{Action, Scope, ScopeSet};

/// `GET /v2/` - readiness probe. Succeeds for any valid token.
pub async fn api_version_check(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    authenticate(&state, &headers)?;
    Ok(Json(serde_json::json!({})).into_response())
}

/// Liveness probe, intentionally unauthenticated.
pub async fn health_check() -> &'static str {
    "ok"
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    if value.len() < 6 || !value[..6].eq_ignore_ascii_case("basic ") {
        return None;
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(value[6..].trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// `GET /token` - issue a bearer token for the requested scopes.
///
/// Requested scopes the user has no permission for are silently dropped, so
/// docker clients that optimistically request `pull,push` still get a usable
/// pull token.
pub async fn issue_token(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> ApiResult<Json<TokenResponse>> {
    let (username, password) = basic_credentials(&headers).ok_or_else(|| {
        ApiError::Registry(RegistryErrorCode::Unauthorized.with("no credentials provided"))
    })?;
    let identity = state
        .auth_driver
        .authenticate_user(&username, &password)
        .await
        .map_err(ApiError::Registry)?;

    let mut audience = audience_for_request(&state, &headers);
    if let Some((_, service)) = params.iter().find(|(k, _)| k == "service") {
        audience = if *service == state.config.api_public_hostname {
            Audience::Local
        } else if Some(service.as_str()) == state.config.anycast_public_hostname.as_deref() {
            Audience::Anycast
        } else {
            return Err(ApiError::BadRequest(format!(
                "cannot issue tokens for service {service}"
            )));
        };
    }

    let mut scope_set = ScopeSet::new();
    for (_, value) in params.iter().filter(|(k, _)| k == "scope") {
        let Some(requested) = Scope::parse(value) else {
            // unparseable scopes are ignored, like unauthorized ones
            continue;
        };
        if let Some(granted) = filter_scope(&state, identity.as_ref(), &requested).await? {
            scope_set.add(granted);
        }
    }

    let response = state.token_engine.issue(&Authorization {
        user_identity: identity,
        scope_set,
        audience,
    })?;
    Ok(Json(response))
}

/// Reduce a requested scope to the actions the user actually holds.
async fn filter_scope(
    state: &AppState,
    identity: &dyn UserIdentity,
    requested: &Scope,
) -> ApiResult<Option<Scope>> {
    if requested.resource_type != "repository" {
        return Ok(None);
    }
    let account_name = requested.resource_name.split('/').next().unwrap_or("");
    let Some(account) = state.db.get_account(account_name).await? else {
        return Ok(None);
    };

    let mut granted = Vec::new();
    for action in &requested.actions {
        // content in replica accounts is written by replication, never by
        // direct pushes
        if account.is_replica() && *action != Action::Pull {
            continue;
        }
        let perm = match action {
            Action::Pull => Permission::Pull,
            Action::Push => Permission::Push,
            Action::Delete => Permission::Delete,
        };
        if identity.has_permission(perm, &account.auth_tenant_id) {
            granted.push(*action);
        }
    }

    if granted.is_empty() {
        Ok(None)
    } else {
        Ok(Some(Scope::new(
            &requested.resource_type,
            &requested.resource_name,
            &granted,
        )))
    }
}
