//! Blob and blob-mount operations.

use crate::error::MetadataResult;
use crate::models::BlobRow;
use async_trait::async_trait;
use time::OffsetDateTime;

/// Repository for blob rows and their mounts.
#[async_trait]
pub trait BlobRepo: Send + Sync {
    /// Insert a fully-materialized blob row, returning its id. If a row for
    /// `(account, digest)` already exists, the existing id is returned and the
    /// row is left unchanged.
    async fn insert_blob(&self, blob: &BlobRow) -> MetadataResult<i64>;

    /// Reserve a blob row with an empty storage id for replication.
    ///
    /// Returns `Some(id)` if this call created the reservation, `None` if a
    /// row for `(account, digest)` already existed. The row's uniqueness is
    /// the single-flight coordination point for concurrent replications.
    async fn try_reserve_blob(
        &self,
        account_name: &str,
        digest: &str,
        pushed_at: OffsetDateTime,
    ) -> MetadataResult<Option<i64>>;

    /// Get a blob by account and digest.
    async fn get_blob(&self, account_name: &str, digest: &str)
        -> MetadataResult<Option<BlobRow>>;

    /// Get a blob by digest, restricted to blobs mounted in the given repo.
    async fn get_blob_in_repo(
        &self,
        repo_id: i64,
        digest: &str,
    ) -> MetadataResult<Option<BlobRow>>;

    /// Fill in storage id, size and validation time after the blob's content
    /// has been persisted. Only takes effect while the row's storage id is
    /// still empty; returns whether this call won. A losing caller must clean
    /// up its own storage object.
    async fn mark_blob_materialized(
        &self,
        blob_id: i64,
        storage_id: &str,
        size_bytes: i64,
        validated_at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Delete a blob row together with its mounts. Fails with a constraint
    /// error while a manifest still references the blob. Storage cleanup is
    /// the caller's business and must happen after this returns.
    async fn delete_blob(&self, blob_id: i64) -> MetadataResult<()>;

    /// Mount a blob into a repo. Mounting twice is a no-op.
    async fn mount_blob(&self, blob_id: i64, repo_id: i64) -> MetadataResult<()>;

    /// Remove a single blob mount, as the user-facing blob delete does.
    /// Returns whether a mount existed.
    async fn unmount_blob(&self, blob_id: i64, repo_id: i64) -> MetadataResult<bool>;

    /// Remove mounts in this repo whose blob is no longer referenced by any
    /// manifest in the repo. Returns the number of removed mounts.
    async fn unmount_unreferenced_blobs(&self, repo_id: i64) -> MetadataResult<u64>;

    /// Mark blobs of this account that have zero mounts for deletion at
    /// `delete_at`, and clear the mark from blobs that have regained a mount.
    /// Returns the number of newly marked blobs.
    async fn mark_unmounted_blobs(
        &self,
        account_name: &str,
        delete_at: OffsetDateTime,
    ) -> MetadataResult<u64>;

    /// Blobs of this account whose deletion mark has passed and that still
    /// have zero mounts.
    async fn blobs_ready_for_deletion(
        &self,
        account_name: &str,
        now: OffsetDateTime,
    ) -> MetadataResult<Vec<BlobRow>>;

    /// All blobs directly referenced by the given manifest.
    async fn blobs_for_manifest(
        &self,
        repo_id: i64,
        manifest_digest: &str,
    ) -> MetadataResult<Vec<BlobRow>>;

    /// Every storage id the database knows for this account: materialized
    /// blobs plus upload staging objects. Storage objects outside this set
    /// are orphans.
    async fn known_storage_ids(&self, account_name: &str) -> MetadataResult<Vec<String>>;

    /// Reconcile orphan marks with the current orphan set: storage ids that
    /// stopped being orphans lose their mark, new orphans are marked with
    /// `delete_at`, existing marks keep their original deadline.
    async fn reconcile_unknown_blob_marks(
        &self,
        account_name: &str,
        orphan_storage_ids: &[String],
        delete_at: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// Orphan storage ids whose mark has passed.
    async fn unknown_blobs_ready_for_deletion(
        &self,
        account_name: &str,
        now: OffsetDateTime,
    ) -> MetadataResult<Vec<String>>;

    /// Drop the mark after the storage object has been removed.
    async fn delete_unknown_blob_mark(
        &self,
        account_name: &str,
        storage_id: &str,
    ) -> MetadataResult<()>;
}
