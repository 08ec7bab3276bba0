//! Blob upload session operations.

use crate::error::MetadataResult;
use crate::models::UploadRow;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for upload sessions.
#[async_trait]
pub trait UploadRepo: Send + Sync {
    /// Create an upload session.
    async fn create_upload(&self, upload: &UploadRow) -> MetadataResult<()>;

    /// Get an upload session by id.
    async fn get_upload(&self, id: Uuid) -> MetadataResult<Option<UploadRow>>;

    /// Update the byte count after a chunk has been appended.
    async fn update_upload_progress(
        &self,
        id: Uuid,
        size_bytes: i64,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// Delete an upload session, on finalize or abort.
    async fn delete_upload(&self, id: Uuid) -> MetadataResult<()>;

    /// Upload sessions not touched since `cutoff`, for timeout cleanup.
    async fn stale_uploads(
        &self,
        cutoff: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<UploadRow>>;
}
