//! In-memory storage backend.
//!
//! Used by the test suites and usable for throwaway deployments. Contents do
//! not survive a restart.

use crate::error::{StorageError, StorageResult};
use crate::traits::StorageDriver;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::RwLock;

/// Map-backed storage driver.
pub struct InMemoryDriver {
    objects: RwLock<HashMap<String, Bytes>>,
}

impl InMemoryDriver {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
        }
    }

    fn blob_key(account: &str, storage_id: &str) -> String {
        format!("{account}/blobs/{storage_id}")
    }

    fn manifest_key(account: &str, repo: &str, digest: &str) -> String {
        format!("{account}/repos/{repo}/manifests/{digest}")
    }

    /// Number of stored objects. Test helper.
    pub fn object_count(&self) -> usize {
        self.objects.read().unwrap().len()
    }

    /// Whether a blob object exists. Test helper.
    pub fn blob_exists(&self, account: &str, storage_id: &str) -> bool {
        self.objects
            .read()
            .unwrap()
            .contains_key(&Self::blob_key(account, storage_id))
    }

    fn get(&self, key: &str) -> StorageResult<Bytes> {
        self.objects
            .read()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn put(&self, key: String, data: Bytes) {
        self.objects.write().unwrap().insert(key, data);
    }

    fn remove(&self, key: &str) {
        self.objects.write().unwrap().remove(key);
    }
}

impl Default for InMemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageDriver for InMemoryDriver {
    async fn read_blob(&self, account: &str, storage_id: &str) -> StorageResult<Bytes> {
        self.get(&Self::blob_key(account, storage_id))
    }

    async fn write_blob(&self, account: &str, storage_id: &str, data: Bytes) -> StorageResult<()> {
        self.put(Self::blob_key(account, storage_id), data);
        Ok(())
    }

    async fn append_to_blob(
        &self,
        account: &str,
        storage_id: &str,
        data: Bytes,
    ) -> StorageResult<()> {
        let key = Self::blob_key(account, storage_id);
        let mut objects = self.objects.write().unwrap();
        let mut buf = BytesMut::from(objects.get(&key).map(|b| b.as_ref()).unwrap_or_default());
        buf.extend_from_slice(&data);
        objects.insert(key, buf.freeze());
        Ok(())
    }

    async fn abort_blob_upload(&self, account: &str, storage_id: &str) -> StorageResult<()> {
        self.remove(&Self::blob_key(account, storage_id));
        Ok(())
    }

    async fn delete_blob(&self, account: &str, storage_id: &str) -> StorageResult<()> {
        self.remove(&Self::blob_key(account, storage_id));
        Ok(())
    }

    async fn url_for_blob(&self, account: &str, storage_id: &str) -> StorageResult<String> {
        // not fetchable by anyone, but stable and unique, which is all the
        // scanner request construction needs in tests
        Ok(format!("blob://{account}/{storage_id}"))
    }

    async fn read_manifest(
        &self,
        account: &str,
        repo: &str,
        digest: &str,
    ) -> StorageResult<Bytes> {
        self.get(&Self::manifest_key(account, repo, digest))
    }

    async fn write_manifest(
        &self,
        account: &str,
        repo: &str,
        digest: &str,
        contents: Bytes,
    ) -> StorageResult<()> {
        self.put(Self::manifest_key(account, repo, digest), contents);
        Ok(())
    }

    async fn delete_manifest(&self, account: &str, repo: &str, digest: &str) -> StorageResult<()> {
        self.remove(&Self::manifest_key(account, repo, digest));
        Ok(())
    }

    async fn list_blob_storage_ids(&self, account: &str) -> StorageResult<Vec<String>> {
        let prefix = format!("{account}/blobs/");
        let objects = self.objects.read().unwrap();
        Ok(objects
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .map(|id| id.to_string())
            .collect())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_then_read() {
        let driver = InMemoryDriver::new();
        driver
            .append_to_blob("a", "u", Bytes::from_static(b"ab"))
            .await
            .unwrap();
        driver
            .append_to_blob("a", "u", Bytes::from_static(b"cd"))
            .await
            .unwrap();
        assert_eq!(driver.read_blob("a", "u").await.unwrap().as_ref(), b"abcd");
    }

    #[tokio::test]
    async fn test_accounts_are_isolated() {
        let driver = InMemoryDriver::new();
        driver
            .write_blob("a1", "x", Bytes::from_static(b"1"))
            .await
            .unwrap();
        assert!(driver.read_blob("a2", "x").await.is_err());
    }
}
