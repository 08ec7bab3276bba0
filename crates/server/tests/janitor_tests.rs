//! Tests for the janitor sweeps.

mod common;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{Method, StatusCode};
use common::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use time::{Duration, OffsetDateTime};
use wharf_core::Severity;
use wharf_core::digest::Digest;
use wharf_core::manifest::media_type;
use wharf_metadata::models::ManifestRow;
use wharf_server::error::ApiResult;
use wharf_server::janitor::{Janitor, SweepOutcome};
use wharf_server::scanner::{ScanState, ScannerManifest, VulnerabilityScanner};
use wharf_storage::StorageDriver;

/// A clock the test can move forward.
#[derive(Clone)]
struct TestClock(Arc<Mutex<OffsetDateTime>>);

impl TestClock {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(OffsetDateTime::now_utc())))
    }

    fn advance(&self, by: Duration) {
        *self.0.lock().unwrap() += by;
    }

    fn now(&self) -> OffsetDateTime {
        *self.0.lock().unwrap()
    }
}

fn janitor_for(server: &TestServer, clock: &TestClock) -> Janitor {
    let clock = clock.clone();
    Janitor::new(
        server.state.config.clone(),
        server.db.clone(),
        server.storage.clone() as Arc<dyn StorageDriver>,
        None,
    )
    .with_clock(Arc::new(move || clock.now()))
}

#[tokio::test]
async fn test_manifest_validation_sweep() {
    let server = TestServer::new("registry.example.org").await;
    server.create_account("test1").await;
    let token = server
        .get_token("alice", &["repository:test1/foo:pull,push"])
        .await;

    let config = config_blob(&[]);
    let layer = layer_blob("v");
    server.upload_blob(&token, "test1/foo", &config.0).await;
    server.upload_blob(&token, "test1/foo", &layer.0).await;
    let manifest = image_manifest(&config, &[&layer]);
    let digest = Digest::sha256_of(&manifest).to_string();
    let (status, _) = server
        .put_manifest(&token, "test1/foo", "latest", media_type::DOCKER_MANIFEST, &manifest)
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let clock = TestClock::new();
    let janitor = janitor_for(&server, &clock);
    let repo = server.db.get_repository("test1", "foo").await.unwrap().unwrap();

    // freshly validated, nothing to do
    assert_eq!(
        janitor.validate_next_manifest().await.unwrap(),
        SweepOutcome::Idle
    );

    // a day later the manifest is due; a healthy registry only gets its
    // timestamp bumped
    clock.advance(Duration::hours(25));
    let before = server.db.get_manifest(repo.id, &digest).await.unwrap().unwrap();
    assert_eq!(
        janitor.validate_next_manifest().await.unwrap(),
        SweepOutcome::Done
    );
    let after = server.db.get_manifest(repo.id, &digest).await.unwrap().unwrap();
    assert!(after.validated_at > before.validated_at);
    assert_eq!(after.validation_error_message, "");
    assert_eq!(after.size_bytes, before.size_bytes);

    // corrupt the stored bytes; the next validation records the error but
    // still bumps the timestamp, so the sweep cannot livelock on it
    server
        .storage
        .write_manifest("test1", "foo", &digest, Bytes::from_static(b"garbage"))
        .await
        .unwrap();
    clock.advance(Duration::hours(25));
    assert!(janitor.validate_next_manifest().await.is_err());
    let broken = server.db.get_manifest(repo.id, &digest).await.unwrap().unwrap();
    assert!(!broken.validation_error_message.is_empty());
    assert!(broken.validated_at > after.validated_at);

    // just validated (with error): not due again until the retry window
    assert_eq!(
        janitor.validate_next_manifest().await.unwrap(),
        SweepOutcome::Idle
    );
    clock.advance(Duration::minutes(11));
    assert!(janitor.validate_next_manifest().await.is_err());
}

async fn push_image(
    server: &TestServer,
    token: &str,
    repo: &str,
    reference: &str,
    seed: &str,
) -> (Vec<u8>, Digest) {
    let config = config_blob(&[("seed", seed)]);
    server.upload_blob(token, repo, &config.0).await;
    let manifest = image_manifest(&config, &[]);
    let digest = Digest::sha256_of(&manifest);
    let reference = if reference.is_empty() {
        digest.to_string()
    } else {
        reference.to_string()
    };
    let (status, _) = server
        .put_manifest(token, repo, &reference, media_type::DOCKER_MANIFEST, &manifest)
        .await;
    assert_eq!(status, StatusCode::CREATED);
    (manifest, digest)
}

#[tokio::test]
async fn test_replica_sync_topological_deletion() {
    let primary = TestServer::new("127.0.0.1").await;
    primary.create_account("test1").await;
    let token = primary
        .get_token("alice", &["repository:test1/foo:pull,push,delete"])
        .await;

    let (child, child_digest) = push_image(&primary, &token, "test1/foo", "", "c").await;
    let list = manifest_list(&[(&child_digest, child.len())]);
    let list_digest = Digest::sha256_of(&list);
    let (status, _) = primary
        .put_manifest(&token, "test1/foo", "multi", media_type::DOCKER_MANIFEST_LIST, &list)
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
    let pull_token = replica
        .get_token("alice", &["repository:test1/foo:pull"])
        .await;

    // replicate the list (children come along)
    let (status, _, _) = replica
        .request(
            Method::GET,
            "/v2/test1/foo/manifests/multi",
            Some(&pull_token),
            None,
            Bytes::new(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let repo = replica.db.get_repository("test1", "foo").await.unwrap().unwrap();
    assert_eq!(replica.db.list_manifests(repo.id).await.unwrap().len(), 2);

    // delete both upstream, list first
    for digest in [&list_digest, &child_digest] {
        let (status, _, _) = primary
            .request(
                Method::DELETE,
                &format!("/v2/test1/foo/manifests/{digest}"),
                Some(&token),
                None,
                Bytes::new(),
            )
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    let clock = TestClock::new();
    let janitor = janitor_for(&replica, &clock);

    // the sync deletes the list before the child and leaves nothing behind
    assert_eq!(
        janitor.sync_manifests_in_next_repo().await.unwrap(),
        SweepOutcome::Done
    );
    assert!(replica.db.list_manifests(repo.id).await.unwrap().is_empty());
    assert!(
        replica
            .storage
            .read_manifest("test1", "foo", &list_digest.to_string())
            .await
            .is_err()
    );

    // rescheduled an hour out; nothing due right now
    assert_eq!(
        janitor.sync_manifests_in_next_repo().await.unwrap(),
        SweepOutcome::Idle
    );

    // with no upstream changes, the next run deletes nothing
    clock.advance(Duration::hours(2));
    assert_eq!(
        janitor.sync_manifests_in_next_repo().await.unwrap(),
        SweepOutcome::Done
    );
}

#[tokio::test]
async fn test_replica_sync_reports_stuck_deletions() {
    let primary = TestServer::new("127.0.0.1").await;
    primary.create_account("test1").await;
    let token = primary
        .get_token("alice", &["repository:test1/foo:pull,push"])
        .await;

    let (child, child_digest) = push_image(&primary, &token, "test1/foo", "", "c2").await;
    let list = manifest_list(&[(&child_digest, child.len())]);
    let (status, _) = primary
        .put_manifest(&token, "test1/foo", "multi", media_type::DOCKER_MANIFEST_LIST, &list)
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let list_digest = Digest::sha256_of(&list);

    let addr = primary.spawn_http().await;
    let replica = TestServerBuilder::new("replica.example.org")
        .peer("upstream.example.org", &format!("http://{addr}"))
        .build()
        .await;
    replica
        .create_replica_account("test1", "upstream.example.org")
        .await;
    let pull_token = replica
        .get_token("alice", &["repository:test1/foo:pull"])
        .await;
    let (status, _, _) = replica
        .request(
            Method::GET,
            "/v2/test1/foo/manifests/multi",
            Some(&pull_token),
            None,
            Bytes::new(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    // fabricate a local child the primary never had, referenced by the
    // still-existing list: the sync wants to delete it but never can
    let repo = replica.db.get_repository("test1", "foo").await.unwrap().unwrap();
    let phantom_digest = Digest::sha256_of(b"phantom").to_string();
    let now = OffsetDateTime::now_utc();
    let mut tx = replica.db.begin_ingest().await.unwrap();
    tx.insert_manifest_if_missing(&ManifestRow {
        repo_id: repo.id,
        digest: phantom_digest.clone(),
        media_type: media_type::DOCKER_MANIFEST.into(),
        size_bytes: 7,
        pushed_at: now,
        validated_at: now,
        validation_error_message: String::new(),
        next_vuln_check_at: None,
        vuln_status: "Pending".into(),
    })
    .await
    .unwrap();
    tx.insert_manifest_manifest_ref(repo.id, &list_digest.to_string(), &phantom_digest)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let clock = TestClock::new();
    let janitor = janitor_for(&replica, &clock);

    let err = janitor.sync_manifests_in_next_repo().await.unwrap_err();
    assert!(err.to_string().contains(&phantom_digest));

    // the stuck manifest is still there
    assert!(
        replica
            .db
            .get_manifest(repo.id, &phantom_digest)
            .await
            .unwrap()
            .is_some()
    );
}

/// Scanner stub with per-digest programmable results.
struct FakeScanner {
    results: Mutex<HashMap<String, (ScanState, Severity)>>,
}

impl FakeScanner {
    fn new() -> Self {
        Self {
            results: Mutex::new(HashMap::new()),
        }
    }

    fn set(&self, digest: &str, state: ScanState, severity: Severity) {
        self.results
            .lock()
            .unwrap()
            .insert(digest.to_string(), (state, severity));
    }

    fn lookup(&self, digest: &str) -> (ScanState, Severity) {
        self.results
            .lock()
            .unwrap()
            .get(digest)
            .copied()
            .unwrap_or((ScanState::Indexed, Severity::Clean))
    }
}

#[async_trait]
impl VulnerabilityScanner for FakeScanner {
    async fn check_manifest_state(&self, manifest: &ScannerManifest) -> ApiResult<ScanState> {
        Ok(self.lookup(&manifest.digest).0)
    }

    async fn get_vulnerability_report(&self, digest: &str) -> ApiResult<Option<Severity>> {
        Ok(Some(self.lookup(digest).1))
    }
}

async fn run_vuln_sweeps_until_idle(janitor: &Janitor) {
    for _ in 0..20 {
        match janitor
            .check_vulnerabilities_for_next_manifest()
            .await
            .unwrap()
        {
            SweepOutcome::Done => continue,
            SweepOutcome::Idle => return,
        }
    }
    panic!("vulnerability sweep did not drain");
}

#[tokio::test]
async fn test_vulnerability_merge() {
    let server = TestServer::new("registry.example.org").await;
    server.create_account("test1").await;
    let token = server
        .get_token("alice", &["repository:test1/foo:pull,push"])
        .await;

    let (m1, m1_digest) = push_image(&server, &token, "test1/foo", "", "m1").await;
    let (m2, m2_digest) = push_image(&server, &token, "test1/foo", "", "m2").await;
    let list = manifest_list(&[(&m1_digest, m1.len()), (&m2_digest, m2.len())]);
    let list_digest = Digest::sha256_of(&list);
    let (status, _) = server
        .put_manifest(&token, "test1/foo", "multi", media_type::DOCKER_MANIFEST_LIST, &list)
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let scanner = Arc::new(FakeScanner::new());
    scanner.set(&m1_digest.to_string(), ScanState::Indexed, Severity::Low);
    scanner.set(&m2_digest.to_string(), ScanState::Indexed, Severity::High);

    let clock = TestClock::new();
    let clock_for_janitor = clock.clone();
    let janitor = Janitor::new(
        server.state.config.clone(),
        server.db.clone(),
        server.storage.clone() as Arc<dyn StorageDriver>,
        Some(scanner.clone()),
    )
    .with_clock(Arc::new(move || clock_for_janitor.now()));

    // first pass scans everything once; the list may have been merged before
    // its children had results, so give it a second pass
    run_vuln_sweeps_until_idle(&janitor).await;
    clock.advance(Duration::hours(2));
    run_vuln_sweeps_until_idle(&janitor).await;

    let repo = server.db.get_repository("test1", "foo").await.unwrap().unwrap();
    let status_of = |digest: String| {
        let db = server.db.clone();
        let repo_id = repo.id;
        async move {
            db.get_manifest(repo_id, &digest)
                .await
                .unwrap()
                .unwrap()
                .vuln_status
        }
    };
    assert_eq!(status_of(m1_digest.to_string()).await, "Low");
    assert_eq!(status_of(m2_digest.to_string()).await, "High");
    // low + high merge to high
    assert_eq!(status_of(list_digest.to_string()).await, "High");

    // a pending child dominates the merge
    let (m3, m3_digest) = push_image(&server, &token, "test1/foo", "", "m3").await;
    scanner.set(&m3_digest.to_string(), ScanState::Pending, Severity::Clean);
    let list2 = manifest_list(&[
        (&m1_digest, m1.len()),
        (&m2_digest, m2.len()),
        (&m3_digest, m3.len()),
    ]);
    let list2_digest = Digest::sha256_of(&list2);
    let (status, _) = server
        .put_manifest(&token, "test1/foo", "multi2", media_type::DOCKER_MANIFEST_LIST, &list2)
        .await;
    assert_eq!(status, StatusCode::CREATED);

    run_vuln_sweeps_until_idle(&janitor).await;
    clock.advance(Duration::minutes(3));
    run_vuln_sweeps_until_idle(&janitor).await;

    assert_eq!(status_of(m3_digest.to_string()).await, "Pending");
    assert_eq!(status_of(list2_digest.to_string()).await, "Pending");
}

#[tokio::test]
async fn test_blob_storage_gc() {
    let server = TestServer::new("registry.example.org").await;
    server.create_account("test1").await;
    let token = server
        .get_token("alice", &["repository:test1/foo:pull,push"])
        .await;

    // a blob nothing references
    let contents = b"unreferenced blob".to_vec();
    let digest = server.upload_blob(&token, "test1/foo", &contents).await;
    let blob = server.db.get_blob("test1", &digest).await.unwrap().unwrap();
    let storage_id = blob.storage_id.clone();
    assert!(server.storage.blob_exists("test1", &storage_id));

    let clock = TestClock::new();
    let janitor = janitor_for(&server, &clock);

    // the mount sweep drops the unreferenced mount
    assert_eq!(
        janitor.sweep_blob_mounts_in_next_repo().await.unwrap(),
        SweepOutcome::Done
    );

    // first storage sweep only marks; the blob survives the grace period
    assert_eq!(
        janitor.sweep_blob_storage_in_next_account().await.unwrap(),
        SweepOutcome::Done
    );
    let marked = server.db.get_blob("test1", &digest).await.unwrap().unwrap();
    assert!(marked.can_be_deleted_at.is_some());
    assert!(server.storage.blob_exists("test1", &storage_id));

    // past the grace period the row goes first, then the object
    clock.advance(Duration::hours(2));
    assert_eq!(
        janitor.sweep_blob_storage_in_next_account().await.unwrap(),
        SweepOutcome::Done
    );
    assert!(server.db.get_blob("test1", &digest).await.unwrap().is_none());
    assert!(!server.storage.blob_exists("test1", &storage_id));

    // a storage object the DB never heard of gets the same two-phase
    // treatment
    server
        .storage
        .write_blob("test1", "orphan-object", Bytes::from_static(b"orphan"))
        .await
        .unwrap();
    clock.advance(Duration::hours(2));
    assert_eq!(
        janitor.sweep_blob_storage_in_next_account().await.unwrap(),
        SweepOutcome::Done
    );
    assert!(server.storage.blob_exists("test1", "orphan-object"));
    clock.advance(Duration::hours(2));
    assert_eq!(
        janitor.sweep_blob_storage_in_next_account().await.unwrap(),
        SweepOutcome::Done
    );
    assert!(!server.storage.blob_exists("test1", "orphan-object"));
}

#[tokio::test]
async fn test_blobs_referenced_by_manifests_survive_gc() {
    let server = TestServer::new("registry.example.org").await;
    server.create_account("test1").await;
    let token = server
        .get_token("alice", &["repository:test1/foo:pull,push"])
        .await;

    let config = config_blob(&[]);
    let layer = layer_blob("keep-me");
    server.upload_blob(&token, "test1/foo", &config.0).await;
    server.upload_blob(&token, "test1/foo", &layer.0).await;
    let manifest = image_manifest(&config, &[&layer]);
    let (status, _) = server
        .put_manifest(&token, "test1/foo", "latest", media_type::DOCKER_MANIFEST, &manifest)
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let clock = TestClock::new();
    let janitor = janitor_for(&server, &clock);

    janitor.sweep_blob_mounts_in_next_repo().await.unwrap();
    janitor.sweep_blob_storage_in_next_account().await.unwrap();
    clock.advance(Duration::hours(2));
    janitor.sweep_blob_storage_in_next_account().await.unwrap();

    // both blobs are still referenced and stay alive
    for digest in [&config.1, &layer.1] {
        let blob = server
            .db
            .get_blob("test1", &digest.to_string())
            .await
            .unwrap()
            .unwrap();
        assert!(blob.can_be_deleted_at.is_none());
        assert!(server.storage.blob_exists("test1", &blob.storage_id));
    }
}
