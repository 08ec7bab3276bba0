//! Tag operations.

use crate::error::MetadataResult;
use crate::models::TagRow;
use async_trait::async_trait;

/// Repository for tag rows.
#[async_trait]
pub trait TagRepo: Send + Sync {
    /// Get a tag by repo and name.
    async fn get_tag(&self, repo_id: i64, name: &str) -> MetadataResult<Option<TagRow>>;

    /// Tag names of a repo in lexicographic order, starting strictly after
    /// `last` (empty string for the beginning), at most `limit` entries.
    async fn list_tag_names(
        &self,
        repo_id: i64,
        last: &str,
        limit: u32,
    ) -> MetadataResult<Vec<String>>;

    /// All tags pointing at the given manifest.
    async fn tags_for_manifest(&self, repo_id: i64, digest: &str) -> MetadataResult<Vec<TagRow>>;
}
