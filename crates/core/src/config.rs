//! Startup configuration.
//!
//! The configuration is an immutable value object built once at startup and
//! passed by reference (usually inside an `Arc`) to every component.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level configuration for a Wharf deployment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Configuration {
    /// Address the HTTP server binds to.
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Public hostname under which this API is reachable. Used as token
    /// audience and issuer basis.
    pub api_public_hostname: String,
    /// Optional anycast hostname served by a group of peered deployments.
    #[serde(default)]
    pub anycast_public_hostname: Option<String>,
    /// Path of the SQLite metadata database.
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Ordered issuer key PEMs for the local audience. The first key signs
    /// new tokens; all keys verify.
    pub issuer_keys: Vec<String>,
    /// Ordered issuer key PEMs for the anycast audience.
    #[serde(default)]
    pub anycast_issuer_keys: Vec<String>,
    /// Known upstream peers, keyed by hostname.
    #[serde(default)]
    pub peers: HashMap<String, PeerConfig>,
    /// Manifest-count quota applied to auth tenants without an explicit
    /// quota row.
    #[serde(default = "default_manifest_quota")]
    pub default_manifest_quota: u64,
    /// Storage driver selection.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Auth driver selection.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Base URL of the vulnerability scanner, if any.
    #[serde(default)]
    pub scanner_url: Option<String>,
}

/// Connection settings for one upstream peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Base URL, e.g. `https://registry.example.org`.
    pub url: String,
    /// User name for replication pulls.
    pub username: String,
    /// Password for replication pulls.
    pub password: String,
}

/// Storage backend selection.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage rooted at `path`.
    Filesystem { path: String },
    /// In-memory storage. Data does not survive a restart.
    Memory,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: "./data/storage".to_string(),
        }
    }
}

impl StorageConfig {
    /// The driver name used for registry lookup.
    pub fn driver_name(&self) -> &'static str {
        match self {
            Self::Filesystem { .. } => "filesystem",
            Self::Memory => "memory",
        }
    }
}

/// Auth driver selection.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "lowercase")]
pub enum AuthConfig {
    /// Static user list, checked against config at request time.
    Static { users: Vec<StaticUser> },
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::Static { users: Vec::new() }
    }
}

impl AuthConfig {
    pub fn driver_name(&self) -> &'static str {
        match self {
            Self::Static { .. } => "static",
        }
    }
}

/// One user entry of the static auth driver.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StaticUser {
    pub username: String,
    pub password: String,
    /// Permissions granted per auth tenant: tenant id -> granted permission
    /// names (`pull`, `push`, `delete`, `change`).
    #[serde(default)]
    pub grants: HashMap<String, Vec<String>>,
}

fn default_listen_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_database_path() -> String {
    "./data/wharf.db".to_string()
}

fn default_manifest_quota() -> u64 {
    100
}

impl Configuration {
    /// Issuer string expected in tokens for the local audience.
    pub fn local_issuer(&self) -> String {
        format!("wharf-api@{}", self.api_public_hostname)
    }
}
