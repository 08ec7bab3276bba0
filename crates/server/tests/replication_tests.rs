//! Tests for replication-on-read between a primary and a replica.

mod common;

use axum::body::Bytes;
use axum::http::{Method, StatusCode};
use common::*;
use std::sync::atomic::Ordering;
use std::time::Duration;
use wharf_core::digest::Digest;
use wharf_core::manifest::media_type;

/// Primary with one pushed image, and a replica wired up against it.
async fn primary_and_replica() -> (TestServer, TestServer, Vec<u8>, (Vec<u8>, Digest), (Vec<u8>, Digest)) {
    // the primary's public hostname must match what the replica's peer
    // client puts into the token request, which is the peer URL's host
    let primary = TestServer::new("127.0.0.1").await;
    primary.create_account("test1").await;
    let token = primary
        .get_token("alice", &["repository:test1/foo:pull,push"])
        .await;

    let config = config_blob(&[("maintainer", "someone")]);
    let layer = layer_blob("replicated");
    primary.upload_blob(&token, "test1/foo", &config.0).await;
    primary.upload_blob(&token, "test1/foo", &layer.0).await;
    let manifest = image_manifest(&config, &[&layer]);
    let (status, _) = primary
        .put_manifest(&token, "test1/foo", "latest", media_type::DOCKER_MANIFEST, &manifest)
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let addr = primary.spawn_http().await;
    let replica = TestServerBuilder::new("replica.example.org")
        .peer("upstream.example.org", &format!("http://{addr}"))
        .build()
        .await;
    replica
        .create_replica_account("test1", "upstream.example.org")
        .await;

    (primary, replica, manifest, config, layer)
}

/// Wait until every blob of the account has a storage id, or give up.
async fn wait_for_blob_replication(replica: &TestServer, digests: &[&Digest]) {
    for _ in 0..100 {
        let mut all_done = true;
        for digest in digests {
            match replica
                .db
                .get_blob("test1", &digest.to_string())
                .await
                .unwrap()
            {
                Some(blob) if !blob.storage_id.is_empty() => {}
                _ => all_done = false,
            }
        }
        if all_done {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("blob replication did not finish in time");
}

#[tokio::test]
async fn test_replica_manifest_pull() {
    let (_primary, replica, manifest, config, layer) = primary_and_replica().await;
    let manifest_digest = Digest::sha256_of(&manifest);

    let token = replica
        .get_token("alice", &["repository:test1/foo:pull"])
        .await;

    // the manifest is not present locally; the read materializes it
    let (status, headers, body) = replica
        .request(
            Method::GET,
            "/v2/test1/foo/manifests/latest",
            Some(&token),
            None,
            Bytes::new(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_ref(), manifest.as_slice());
    assert_eq!(
        headers.get("Docker-Content-Digest").unwrap().to_str().unwrap(),
        manifest_digest.to_string()
    );

    // referenced blobs were scheduled for replication
    wait_for_blob_replication(&replica, &[&config.1, &layer.1]).await;

    // a second read is served locally
    let (status, _, body) = replica
        .request(
            Method::GET,
            &format!("/v2/test1/foo/manifests/{manifest_digest}"),
            Some(&token),
            None,
            Bytes::new(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_ref(), manifest.as_slice());

    // and the replicated blob content round-trips
    let (status, _, body) = replica
        .request(
            Method::GET,
            &format!("/v2/test1/foo/blobs/{}", layer.1),
            Some(&token),
            None,
            Bytes::new(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_ref(), layer.0.as_slice());
}

#[tokio::test]
async fn test_concurrent_blob_pulls_coalesce() {
    let (primary, replica, _manifest, _config, layer) = primary_and_replica().await;
    let token = replica
        .get_token("alice", &["repository:test1/foo:pull"])
        .await;

    // the repo must exist locally for the blob path; replicate the manifest
    let (status, _, _) = replica
        .request(
            Method::GET,
            "/v2/test1/foo/manifests/latest",
            Some(&token),
            None,
            Bytes::new(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    wait_for_blob_replication(&replica, &[&layer.1]).await;
    let fetches_before = primary.blob_request_count.load(Ordering::SeqCst);

    // many concurrent reads of the same (already replicated) blob hit the
    // local copy, not the upstream
    let mut handles = Vec::new();
    for _ in 0..4 {
        let replica_router = replica.router.clone();
        let token = token.clone();
        let path = format!("/v2/test1/foo/blobs/{}", layer.1);
        handles.push(tokio::spawn(async move {
            use tower::ServiceExt;
            let request = axum::http::Request::builder()
                .method(Method::GET)
                .uri(path)
                .header("Authorization", format!("Bearer {token}"))
                .body(axum::body::Body::empty())
                .unwrap();
            let response = replica_router.oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(
        primary.blob_request_count.load(Ordering::SeqCst),
        fetches_before,
        "local reads must not hit the upstream"
    );

    // exactly one blob row and one storage object exist for the digest
    let blob = replica
        .db
        .get_blob("test1", &layer.1.to_string())
        .await
        .unwrap()
        .unwrap();
    assert!(!blob.storage_id.is_empty());
    assert!(replica.storage.blob_exists("test1", &blob.storage_id));
}

#[tokio::test]
async fn test_direct_blob_replication_single_flight() {
    let (primary, replica, _manifest, _config, layer) = primary_and_replica().await;
    let token = replica
        .get_token("alice", &["repository:test1/foo:pull"])
        .await;

    // hit the blob endpoint directly, without replicating the manifest first;
    // several concurrent requests race to reserve the blob row
    let mut handles = Vec::new();
    for _ in 0..4 {
        let replica_router = replica.router.clone();
        let token = token.clone();
        let path = format!("/v2/test1/foo/blobs/{}", layer.1);
        handles.push(tokio::spawn(async move {
            use tower::ServiceExt;
            let request = axum::http::Request::builder()
                .method(Method::GET)
                .uri(path)
                .header("Authorization", format!("Bearer {token}"))
                .body(axum::body::Body::empty())
                .unwrap();
            let response = replica_router.oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        let body = handle.await.unwrap();
        assert_eq!(body.as_ref(), layer.0.as_slice());
    }

    // all requests were served from a single upstream fetch
    assert_eq!(primary.blob_request_count.load(Ordering::SeqCst), 1);

    let blob = replica
        .db
        .get_blob("test1", &layer.1.to_string())
        .await
        .unwrap()
        .unwrap();
    assert!(!blob.storage_id.is_empty());
}

#[tokio::test]
async fn test_push_to_replica_is_not_granted() {
    let (_primary, replica, _manifest, _config, _layer) = primary_and_replica().await;

    // even a user with push permission gets a pull-only token for a replica
    let token = replica
        .get_token("alice", &["repository:test1/foo:pull,push"])
        .await;
    let config = config_blob(&[]);
    let manifest = image_manifest(&config, &[]);
    let (status, body) = replica
        .put_manifest(&token, "test1/foo", "latest", media_type::DOCKER_MANIFEST, &manifest)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(error_code(&body), "DENIED");
}
