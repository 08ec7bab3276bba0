//! Storage driver trait definition.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;

/// Backend-agnostic storage of blob and manifest content.
///
/// Blobs are addressed by `(account, storage_id)` where the storage id is an
/// opaque value chosen at upload time; manifests are addressed by
/// `(account, repo, digest)`. Chunked uploads accumulate via
/// [`append_to_blob`](StorageDriver::append_to_blob) under the upload's
/// storage id until they are finalized or aborted.
#[async_trait]
pub trait StorageDriver: Send + Sync + 'static {
    /// Read a blob's full contents.
    async fn read_blob(&self, account: &str, storage_id: &str) -> StorageResult<Bytes>;

    /// Write a blob in one piece, replacing any previous content.
    async fn write_blob(&self, account: &str, storage_id: &str, data: Bytes) -> StorageResult<()>;

    /// Append a chunk to a blob under construction. Creates the object if it
    /// does not exist yet.
    async fn append_to_blob(
        &self,
        account: &str,
        storage_id: &str,
        data: Bytes,
    ) -> StorageResult<()>;

    /// Drop a blob under construction. Missing objects are not an error.
    async fn abort_blob_upload(&self, account: &str, storage_id: &str) -> StorageResult<()>;

    /// Delete a blob. Missing objects are not an error; the DB row is gone by
    /// the time this is called, and a leftover object is cleaned by the next
    /// storage sweep.
    async fn delete_blob(&self, account: &str, storage_id: &str) -> StorageResult<()>;

    /// A URL under which the blob can be fetched by an external party, e.g.
    /// the vulnerability scanner. Drivers without a URL-capable backend
    /// return [`StorageError::CannotGenerateUrl`](crate::StorageError::CannotGenerateUrl).
    async fn url_for_blob(&self, account: &str, storage_id: &str) -> StorageResult<String>;

    /// Read stored manifest bytes.
    async fn read_manifest(&self, account: &str, repo: &str, digest: &str)
        -> StorageResult<Bytes>;

    /// Persist manifest bytes.
    async fn write_manifest(
        &self,
        account: &str,
        repo: &str,
        digest: &str,
        contents: Bytes,
    ) -> StorageResult<()>;

    /// Delete stored manifest bytes. Missing objects are not an error.
    async fn delete_manifest(&self, account: &str, repo: &str, digest: &str) -> StorageResult<()>;

    /// All blob storage ids present for an account. Drives orphan detection:
    /// objects present in storage but absent from the database are cleaned by
    /// the storage sweep.
    async fn list_blob_storage_ids(&self, account: &str) -> StorageResult<Vec<String>>;

    /// Static identifier of the backend, for logs and metrics.
    fn name(&self) -> &'static str;
}
