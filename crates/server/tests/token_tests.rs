//! Tests for the token endpoint and key rotation.

mod common;

use axum::body::{Body, Bytes};
use axum::http::{Method, Request, StatusCode, header};
use base64::Engine;
use common::*;
use tower::ServiceExt;
use wharf_auth::keys::IssuerKey;
use wharf_auth::{Audience, Authorization, TokenEngine, auth_driver_from_config};
use wharf_core::scope::{Action, Scope, ScopeSet};

#[tokio::test]
async fn test_token_endpoint_requires_credentials() {
    let server = TestServer::new("registry.example.org").await;
    server.create_account("test1").await;

    // no credentials at all
    let request = Request::builder()
        .method(Method::GET)
        .uri("/token?service=registry.example.org")
        .body(Body::empty())
        .unwrap();
    let response = server.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // wrong password
    let basic = base64::engine::general_purpose::STANDARD.encode("alice:wrong");
    let request = Request::builder()
        .method(Method::GET)
        .uri("/token?service=registry.example.org")
        .header(header::AUTHORIZATION, format!("Basic {basic}"))
        .body(Body::empty())
        .unwrap();
    let response = server.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_token_for_unknown_service_is_refused() {
    let server = TestServer::new("registry.example.org").await;
    let basic = base64::engine::general_purpose::STANDARD
        .encode(format!("alice:{TEST_PASSWORD}"));
    let request = Request::builder()
        .method(Method::GET)
        .uri("/token?service=somebody-else.example.org")
        .header(header::AUTHORIZATION, format!("Basic {basic}"))
        .body(Body::empty())
        .unwrap();
    let response = server.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_scopes_for_unknown_accounts_are_dropped() {
    let server = TestServer::new("registry.example.org").await;
    server.create_account("test1").await;

    // nosuch does not exist; the token comes back without that scope
    let token = server
        .get_token(
            "alice",
            &["repository:test1/foo:pull", "repository:nosuch/foo:pull"],
        )
        .await;

    let (status, _, _) = server
        .request(
            Method::GET,
            "/v2/nosuch/foo/tags/list",
            Some(&token),
            None,
            Bytes::new(),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_issuer_key_rotation() {
    let (_, old_pem) = IssuerKey::generate_ed25519().unwrap();
    let (_, new_pem) = IssuerKey::generate_ed25519().unwrap();

    // the server accepts both keys, signing with the new one
    let server = TestServerBuilder::new("registry.example.org")
        .issuer_keys(vec![new_pem.clone(), old_pem.clone()])
        .build()
        .await;
    server.create_account("test1").await;

    // forge a token as the pre-rotation deployment would have issued it:
    // same hostname, but only the old key configured
    let mut old_config = (*server.state.config).clone();
    old_config.issuer_keys = vec![old_pem];
    let old_engine = TokenEngine::new(&old_config).unwrap();
    let driver = auth_driver_from_config(&old_config.auth).unwrap();
    let identity = driver
        .authenticate_user("alice", TEST_PASSWORD)
        .await
        .unwrap();
    let mut scope_set = ScopeSet::new();
    scope_set.add(Scope::new("repository", "test1/foo", &[Action::Pull]));
    let old_token = old_engine
        .issue(&Authorization {
            user_identity: identity,
            scope_set,
            audience: Audience::Local,
        })
        .unwrap();

    // the pre-rotation token still verifies
    let (status, _, _) = server
        .request(Method::GET, "/v2/", Some(&old_token.token), None, Bytes::new())
        .await;
    assert_eq!(status, StatusCode::OK);

    // newly issued tokens carry the new key's fingerprint
    let fresh = server.get_token("alice", &[]).await;
    let header = jsonwebtoken::decode_header(&fresh).unwrap();
    let new_key = IssuerKey::from_pem(&new_pem).unwrap();
    assert_eq!(header.kid.as_deref(), Some(new_key.fingerprint()));
}

#[tokio::test]
async fn test_token_is_bound_to_its_audience() {
    // two deployments with different hostnames but the same signing key
    let (_, pem) = IssuerKey::generate_ed25519().unwrap();
    let server_a = TestServerBuilder::new("a.example.org")
        .issuer_keys(vec![pem.clone()])
        .build()
        .await;
    let server_b = TestServerBuilder::new("b.example.org")
        .issuer_keys(vec![pem])
        .build()
        .await;
    server_a.create_account("test1").await;
    server_b.create_account("test1").await;

    let token_for_a = server_a.get_token("alice", &[]).await;
    let (status, _, _) = server_a
        .request(Method::GET, "/v2/", Some(&token_for_a), None, Bytes::new())
        .await;
    assert_eq!(status, StatusCode::OK);

    // same key, wrong audience claim
    let (status, _, _) = server_b
        .request(Method::GET, "/v2/", Some(&token_for_a), None, Bytes::new())
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
