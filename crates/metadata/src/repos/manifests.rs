//! Manifest operations.

use crate::error::MetadataResult;
use crate::models::ManifestRow;
use async_trait::async_trait;
use time::OffsetDateTime;

/// Repository for manifest rows and their reference graph.
#[async_trait]
pub trait ManifestRepo: Send + Sync {
    /// Get a manifest by repo and digest.
    async fn get_manifest(
        &self,
        repo_id: i64,
        digest: &str,
    ) -> MetadataResult<Option<ManifestRow>>;

    /// All manifests in a repo.
    async fn list_manifests(&self, repo_id: i64) -> MetadataResult<Vec<ManifestRow>>;

    /// Delete a manifest row. Tags and outgoing reference edges go with it;
    /// the delete fails with a constraint error while another manifest still
    /// references this one as a child.
    async fn delete_manifest(&self, repo_id: i64, digest: &str) -> MetadataResult<bool>;

    /// All `(parent_digest, child_digest)` edges in a repo.
    async fn manifest_manifest_refs(
        &self,
        repo_id: i64,
    ) -> MetadataResult<Vec<(String, String)>>;

    /// Stored vulnerability statuses of the direct children of a manifest.
    async fn child_vuln_statuses(
        &self,
        repo_id: i64,
        parent_digest: &str,
    ) -> MetadataResult<Vec<String>>;

    /// The manifest most overdue for revalidation: last validated before
    /// `success_cutoff`, or before `error_cutoff` with a recorded validation
    /// error. Prior failures are preferred, then older validations.
    async fn next_manifest_for_validation(
        &self,
        success_cutoff: OffsetDateTime,
        error_cutoff: OffsetDateTime,
    ) -> MetadataResult<Option<ManifestRow>>;

    /// Record the outcome of a validation run. The timestamp is bumped even
    /// on failure so the validation loop cannot get stuck on one item.
    async fn update_validation(
        &self,
        repo_id: i64,
        digest: &str,
        validated_at: OffsetDateTime,
        error_message: &str,
    ) -> MetadataResult<()>;

    /// The manifest most overdue for a vulnerability check at `now`.
    /// Manifests that were never checked come first.
    async fn next_manifest_for_vuln_check(
        &self,
        now: OffsetDateTime,
    ) -> MetadataResult<Option<ManifestRow>>;

    /// Record the outcome of a vulnerability check.
    async fn update_vuln_status(
        &self,
        repo_id: i64,
        digest: &str,
        vuln_status: &str,
        next_check_at: OffsetDateTime,
    ) -> MetadataResult<()>;
}
