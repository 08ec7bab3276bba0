//! Request authorization.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use wharf_auth::{Audience, Authorization};
use wharf_core::error::RegistryErrorCode;
use wharf_core::scope::{Action, Scope};

/// Extract the bearer token from the Authorization header.
/// Per RFC 6750, the "Bearer" scheme is case-insensitive.
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            if v.len() >= 7 && v[..7].eq_ignore_ascii_case("bearer ") {
                Some(&v[7..])
            } else {
                None
            }
        })
}

/// Which audience the request addresses, judged by its Host header.
pub fn audience_for_request(state: &AppState, headers: &HeaderMap) -> Audience {
    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h))
        .unwrap_or("");
    if Some(host) == state.config.anycast_public_hostname.as_deref() {
        Audience::Anycast
    } else {
        Audience::Local
    }
}

fn challenge(state: &AppState, audience: Audience, scope: Option<&Scope>) -> String {
    let service = match audience {
        Audience::Anycast => state
            .config
            .anycast_public_hostname
            .clone()
            .unwrap_or_else(|| state.config.api_public_hostname.clone()),
        Audience::Local => state.config.api_public_hostname.clone(),
    };
    let mut value = format!(
        "Bearer realm=\"https://{}/token\",service=\"{}\"",
        state.config.api_public_hostname, service
    );
    if let Some(scope) = scope {
        value.push_str(&format!(",scope=\"{scope}\""));
    }
    value
}

/// Verify the request's bearer token, without requiring any scope.
pub fn authenticate(state: &AppState, headers: &HeaderMap) -> ApiResult<Authorization> {
    let audience = audience_for_request(state, headers);
    let token = extract_bearer_token(headers).ok_or_else(|| ApiError::Challenge {
        error: RegistryErrorCode::Unauthorized.with("no bearer token found in request headers"),
        challenge: challenge(state, audience, None),
    })?;

    state
        .token_engine
        .verify(audience, token, state.auth_driver.as_ref())
        .map_err(|error| ApiError::Challenge {
            error,
            challenge: challenge(state, audience, None),
        })
}

/// Verify the request's bearer token and require `action` on the repository.
pub fn authorize_repo_action(
    state: &AppState,
    headers: &HeaderMap,
    repo_full_name: &str,
    action: Action,
) -> ApiResult<Authorization> {
    let audience = audience_for_request(state, headers);
    let needed = Scope::new("repository", repo_full_name, &[action]);

    let token = extract_bearer_token(headers).ok_or_else(|| ApiError::Challenge {
        error: RegistryErrorCode::Unauthorized.with("no bearer token found in request headers"),
        challenge: challenge(state, audience, Some(&needed)),
    })?;

    let authz = state
        .token_engine
        .verify(audience, token, state.auth_driver.as_ref())
        .map_err(|error| ApiError::Challenge {
            error,
            challenge: challenge(state, audience, Some(&needed)),
        })?;

    if !authz.scope_set.grants("repository", repo_full_name, action) {
        return Err(RegistryErrorCode::Denied
            .with(format!("token does not grant {action} on {repo_full_name}"))
            .into());
    }
    Ok(authz)
}
