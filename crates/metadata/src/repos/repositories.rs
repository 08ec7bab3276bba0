//! Repository-entity operations.

use crate::error::MetadataResult;
use crate::models::RepositoryRow;
use async_trait::async_trait;
use time::OffsetDateTime;

/// Repository for repository rows.
#[async_trait]
pub trait RepositoryRepo: Send + Sync {
    /// Find a repository by account and name, creating it if missing.
    async fn find_or_create_repository(
        &self,
        account_name: &str,
        name: &str,
    ) -> MetadataResult<RepositoryRow>;

    /// Get a repository by account and name.
    async fn get_repository(
        &self,
        account_name: &str,
        name: &str,
    ) -> MetadataResult<Option<RepositoryRow>>;

    /// Get a repository by id.
    async fn get_repository_by_id(&self, id: i64) -> MetadataResult<Option<RepositoryRow>>;

    /// The replica repository whose manifest sync is most overdue at `now`.
    /// Repositories that were never synced come first. Only repositories of
    /// replica accounts are considered.
    async fn next_repo_for_manifest_sync(
        &self,
        now: OffsetDateTime,
    ) -> MetadataResult<Option<RepositoryRow>>;

    /// Record when the repository's next manifest sync is due.
    async fn set_next_manifest_sync_at(
        &self,
        repo_id: i64,
        next: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// The repository whose blob mount sweep is most overdue at `now`.
    async fn next_repo_for_blob_mount_sweep(
        &self,
        now: OffsetDateTime,
    ) -> MetadataResult<Option<RepositoryRow>>;

    /// Record when the repository's next blob mount sweep is due.
    async fn set_next_blob_mount_sweep_at(
        &self,
        repo_id: i64,
        next: OffsetDateTime,
    ) -> MetadataResult<()>;
}
