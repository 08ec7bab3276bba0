//! In-process test server.

use axum::Router;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Method, Request, StatusCode, header};
use axum::middleware::{self, Next};
use base64::Engine;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;
use tower::ServiceExt;
use wharf_auth::keys::IssuerKey;
use wharf_auth::{TokenEngine, auth_driver_from_config};
use wharf_core::Configuration;
use wharf_core::config::{AuthConfig, PeerConfig, StaticUser, StorageConfig};
use wharf_core::digest::Digest;
use wharf_metadata::models::AccountRow;
use wharf_metadata::{MetadataStore, SqliteStore};
use wharf_server::{AppState, create_router};
use wharf_storage::InMemoryDriver;

pub const TEST_PASSWORD: &str = "secret";

/// Default test users: `alice` can do everything on `tenant1`, `reader` can
/// only pull, `replicator` is the peer replication user.
fn default_users() -> Vec<StaticUser> {
    let full: HashMap<String, Vec<String>> = [(
        "tenant1".to_string(),
        vec![
            "pull".to_string(),
            "push".to_string(),
            "delete".to_string(),
            "change".to_string(),
        ],
    )]
    .into_iter()
    .collect();
    let pull_only: HashMap<String, Vec<String>> =
        [("tenant1".to_string(), vec!["pull".to_string()])]
            .into_iter()
            .collect();

    vec![
        StaticUser {
            username: "alice".into(),
            password: TEST_PASSWORD.into(),
            grants: full,
        },
        StaticUser {
            username: "reader".into(),
            password: TEST_PASSWORD.into(),
            grants: pull_only.clone(),
        },
        StaticUser {
            username: "replicator".into(),
            password: TEST_PASSWORD.into(),
            grants: pull_only,
        },
    ]
}

pub struct TestServerBuilder {
    hostname: String,
    issuer_keys: Vec<String>,
    peers: HashMap<String, PeerConfig>,
}

impl TestServerBuilder {
    pub fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            issuer_keys: Vec::new(),
            peers: HashMap::new(),
        }
    }

    /// Use this ordered issuer key list instead of a generated one.
    pub fn issuer_keys(mut self, pems: Vec<String>) -> Self {
        self.issuer_keys = pems;
        self
    }

    /// Register an upstream peer.
    pub fn peer(mut self, hostname: &str, url: &str) -> Self {
        self.peers.insert(
            hostname.to_string(),
            PeerConfig {
                url: url.to_string(),
                username: "replicator".into(),
                password: TEST_PASSWORD.into(),
            },
        );
        self
    }

    pub async fn build(self) -> TestServer {
        let tmp = TempDir::new().unwrap();
        let issuer_keys = if self.issuer_keys.is_empty() {
            let (_, pem) = IssuerKey::generate_ed25519().unwrap();
            vec![pem]
        } else {
            self.issuer_keys
        };

        let config = Configuration {
            listen_address: "127.0.0.1:0".into(),
            api_public_hostname: self.hostname.clone(),
            anycast_public_hostname: None,
            database_path: tmp.path().join("wharf.db").to_str().unwrap().to_string(),
            issuer_keys,
            anycast_issuer_keys: Vec::new(),
            peers: self.peers,
            default_manifest_quota: 100,
            storage: StorageConfig::Memory,
            auth: AuthConfig::Static {
                users: default_users(),
            },
            scanner_url: None,
        };

        let db: Arc<dyn MetadataStore> =
            Arc::new(SqliteStore::new(&config.database_path).await.unwrap());
        let storage = Arc::new(InMemoryDriver::new());
        let auth_driver = auth_driver_from_config(&config.auth).unwrap();
        let token_engine = TokenEngine::new(&config).unwrap();

        let state = AppState::new(
            config,
            db.clone(),
            storage.clone(),
            auth_driver,
            token_engine,
            None,
        );

        let blob_request_count = Arc::new(AtomicUsize::new(0));
        let counter = blob_request_count.clone();
        let router = create_router(state.clone()).layer(middleware::from_fn(
            move |req: axum::extract::Request, next: Next| {
                let counter = counter.clone();
                async move {
                    if req.method() == Method::GET && req.uri().path().contains("/blobs/") {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                    next.run(req).await
                }
            },
        ));

        TestServer {
            state,
            router,
            db,
            storage,
            blob_request_count,
            _tmp: tmp,
        }
    }
}

pub struct TestServer {
    pub state: AppState,
    pub router: Router,
    pub db: Arc<dyn MetadataStore>,
    pub storage: Arc<InMemoryDriver>,
    /// GET requests on blob routes, for single-flight assertions.
    pub blob_request_count: Arc<AtomicUsize>,
    _tmp: TempDir,
}

impl TestServer {
    pub async fn new(hostname: &str) -> Self {
        TestServerBuilder::new(hostname).build().await
    }

    /// Serve this router on a real socket, for peer-to-peer tests.
    pub async fn spawn_http(&self) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = self.router.clone();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    pub async fn create_account(&self, name: &str) {
        self.db
            .create_account(&AccountRow {
                name: name.to_string(),
                auth_tenant_id: "tenant1".to_string(),
                upstream_peer_hostname: String::new(),
                external_peer_url: String::new(),
                required_labels: String::new(),
                in_maintenance: false,
                next_blob_sweep_at: None,
            })
            .await
            .unwrap();
    }

    pub async fn create_replica_account(&self, name: &str, upstream_hostname: &str) {
        self.db
            .create_account(&AccountRow {
                name: name.to_string(),
                auth_tenant_id: "tenant1".to_string(),
                upstream_peer_hostname: upstream_hostname.to_string(),
                external_peer_url: String::new(),
                required_labels: String::new(),
                in_maintenance: false,
                next_blob_sweep_at: None,
            })
            .await
            .unwrap();
    }

    /// Issue a raw request against the in-process router.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        token: Option<&str>,
        content_type: Option<&str>,
        body: Bytes,
    ) -> (StatusCode, HeaderMap, Bytes) {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(content_type) = content_type {
            builder = builder.header(header::CONTENT_TYPE, content_type);
        }
        let request = builder.body(Body::from(body)).unwrap();

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, headers, body)
    }

    /// Fetch a bearer token from the token endpoint.
    pub async fn get_token(&self, username: &str, scopes: &[&str]) -> String {
        let mut path = format!(
            "/token?service={}",
            self.state.config.api_public_hostname
        );
        for scope in scopes {
            path.push_str(&format!("&scope={scope}"));
        }
        let basic = base64::engine::general_purpose::STANDARD
            .encode(format!("{username}:{TEST_PASSWORD}"));
        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .header(header::AUTHORIZATION, format!("Basic {basic}"))
            .body(Body::empty())
            .unwrap();

        let response = self.router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK, "token endpoint refused");
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        parsed["token"].as_str().unwrap().to_string()
    }

    /// Upload a blob monolithically and return its digest string.
    pub async fn upload_blob(&self, token: &str, repo_full: &str, contents: &[u8]) -> String {
        let digest = Digest::sha256_of(contents);
        let (status, _, body) = self
            .request(
                Method::POST,
                &format!("/v2/{repo_full}/blobs/uploads?digest={digest}"),
                Some(token),
                Some("application/octet-stream"),
                Bytes::copy_from_slice(contents),
            )
            .await;
        assert_eq!(
            status,
            StatusCode::CREATED,
            "blob upload failed: {}",
            String::from_utf8_lossy(&body)
        );
        digest.to_string()
    }

    /// Push a manifest and return the response status plus body.
    pub async fn put_manifest(
        &self,
        token: &str,
        repo_full: &str,
        reference: &str,
        media_type: &str,
        contents: &[u8],
    ) -> (StatusCode, Bytes) {
        let (status, _, body) = self
            .request(
                Method::PUT,
                &format!("/v2/{repo_full}/manifests/{reference}"),
                Some(token),
                Some(media_type),
                Bytes::copy_from_slice(contents),
            )
            .await;
        (status, body)
    }
}

/// Extract the error code of a registry error envelope.
pub fn error_code(body: &Bytes) -> String {
    let parsed: serde_json::Value = serde_json::from_slice(body).unwrap();
    parsed["errors"][0]["code"].as_str().unwrap().to_string()
}

/// Extract the error detail of a registry error envelope.
pub fn error_detail(body: &Bytes) -> String {
    let parsed: serde_json::Value = serde_json::from_slice(body).unwrap();
    parsed["errors"][0]["detail"].as_str().unwrap_or("").to_string()
}
