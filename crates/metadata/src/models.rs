//! Database models mapping to the metadata schema.

use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// Account record. The top-level tenancy unit.
#[derive(Debug, Clone, FromRow)]
pub struct AccountRow {
    pub name: String,
    pub auth_tenant_id: String,
    /// Hostname of the upstream peer if this account is a replica, else empty.
    pub upstream_peer_hostname: String,
    /// URL of an external (non-peer) upstream if this account replicates one, else empty.
    pub external_peer_url: String,
    /// Comma-separated label names every pushed image must carry, or empty.
    pub required_labels: String,
    pub in_maintenance: bool,
    pub next_blob_sweep_at: Option<OffsetDateTime>,
}

impl AccountRow {
    /// Whether this account replicates content from an upstream.
    pub fn is_replica(&self) -> bool {
        !self.upstream_peer_hostname.is_empty() || !self.external_peer_url.is_empty()
    }

    /// The required label names, split out of their comma-separated form.
    pub fn required_label_names(&self) -> Vec<&str> {
        if self.required_labels.is_empty() {
            Vec::new()
        } else {
            self.required_labels.split(',').collect()
        }
    }
}

/// Repository record. Created lazily on first push or replication.
#[derive(Debug, Clone, FromRow)]
pub struct RepositoryRow {
    pub id: i64,
    pub account_name: String,
    pub name: String,
    pub next_manifest_sync_at: Option<OffsetDateTime>,
    pub next_blob_mount_sweep_at: Option<OffsetDateTime>,
}

impl RepositoryRow {
    /// The full repository name as it appears in URLs, `<account>/<repo>`.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.account_name, self.name)
    }
}

/// Blob record. Owned by the account, shared across its repos via mounts.
#[derive(Debug, Clone, FromRow)]
pub struct BlobRow {
    pub id: i64,
    pub account_name: String,
    pub digest: String,
    pub size_bytes: i64,
    /// Storage object id, or empty while the blob is being materialized by
    /// replication. The empty storage id doubles as the single-flight marker.
    pub storage_id: String,
    pub pushed_at: OffsetDateTime,
    pub validated_at: OffsetDateTime,
    pub validation_error_message: String,
    /// Set once the blob has zero mounts; storage GC waits for this to pass.
    pub can_be_deleted_at: Option<OffsetDateTime>,
}

/// Manifest record.
#[derive(Debug, Clone, FromRow)]
pub struct ManifestRow {
    pub repo_id: i64,
    pub digest: String,
    pub media_type: String,
    /// Own byte length plus the declared sizes of all direct references.
    pub size_bytes: i64,
    pub pushed_at: OffsetDateTime,
    pub validated_at: OffsetDateTime,
    pub validation_error_message: String,
    pub next_vuln_check_at: Option<OffsetDateTime>,
    pub vuln_status: String,
}

/// Tag record. A mutable alias for a manifest within a repository.
#[derive(Debug, Clone, FromRow)]
pub struct TagRow {
    pub repo_id: i64,
    pub name: String,
    pub digest: String,
    pub pushed_at: OffsetDateTime,
}

/// Edge from a manifest to a blob it references.
#[derive(Debug, Clone, FromRow)]
pub struct ManifestBlobRefRow {
    pub repo_id: i64,
    pub digest: String,
    pub blob_id: i64,
}

/// Edge from a manifest list to a child manifest.
#[derive(Debug, Clone, FromRow)]
pub struct ManifestManifestRefRow {
    pub repo_id: i64,
    pub parent_digest: String,
    pub child_digest: String,
}

/// Upload session record for a blob upload in progress.
#[derive(Debug, Clone, FromRow)]
pub struct UploadRow {
    pub id: Uuid,
    pub repo_id: i64,
    pub storage_id: String,
    pub size_bytes: i64,
    /// Digest declared by the client so far, or empty.
    pub digest: String,
    pub updated_at: OffsetDateTime,
}

/// Manifest-count quota for one auth tenant.
#[derive(Debug, Clone, FromRow)]
pub struct QuotaRow {
    pub auth_tenant_id: String,
    pub manifests: i64,
}
