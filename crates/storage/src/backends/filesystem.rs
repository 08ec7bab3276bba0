//! Local filesystem storage backend.

use crate::error::{StorageError, StorageResult};
use crate::traits::StorageDriver;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Stores blobs and manifests as plain files under a root directory.
///
/// Layout:
/// ```text
/// <root>/<account>/blobs/<storage_id>
/// <root>/<account>/repos/<repo...>/manifests/<digest>
/// ```
pub struct FilesystemDriver {
    root: PathBuf,
}

impl FilesystemDriver {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn blob_path(&self, account: &str, storage_id: &str) -> PathBuf {
        self.root.join(account).join("blobs").join(storage_id)
    }

    fn manifest_path(&self, account: &str, repo: &str, digest: &str) -> PathBuf {
        self.root
            .join(account)
            .join("repos")
            .join(repo)
            .join("manifests")
            .join(digest)
    }

    async fn write_file(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // write to a sibling temp file first so readers never observe a
        // half-written object
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read_file(&self, path: &Path, what: String) -> StorageResult<Bytes> {
        match tokio::fs::read(path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(what))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_file(&self, path: &Path) -> StorageResult<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StorageDriver for FilesystemDriver {
    async fn read_blob(&self, account: &str, storage_id: &str) -> StorageResult<Bytes> {
        let path = self.blob_path(account, storage_id);
        self.read_file(&path, format!("blob {account}/{storage_id}")).await
    }

    async fn write_blob(&self, account: &str, storage_id: &str, data: Bytes) -> StorageResult<()> {
        let path = self.blob_path(account, storage_id);
        self.write_file(&path, &data).await
    }

    async fn append_to_blob(
        &self,
        account: &str,
        storage_id: &str,
        data: Bytes,
    ) -> StorageResult<()> {
        let path = self.blob_path(account, storage_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn abort_blob_upload(&self, account: &str, storage_id: &str) -> StorageResult<()> {
        self.delete_file(&self.blob_path(account, storage_id)).await
    }

    async fn delete_blob(&self, account: &str, storage_id: &str) -> StorageResult<()> {
        self.delete_file(&self.blob_path(account, storage_id)).await
    }

    async fn url_for_blob(&self, _account: &str, _storage_id: &str) -> StorageResult<String> {
        Err(StorageError::CannotGenerateUrl)
    }

    async fn read_manifest(
        &self,
        account: &str,
        repo: &str,
        digest: &str,
    ) -> StorageResult<Bytes> {
        let path = self.manifest_path(account, repo, digest);
        self.read_file(&path, format!("manifest {account}/{repo}/{digest}")).await
    }

    async fn write_manifest(
        &self,
        account: &str,
        repo: &str,
        digest: &str,
        contents: Bytes,
    ) -> StorageResult<()> {
        let path = self.manifest_path(account, repo, digest);
        self.write_file(&path, &contents).await
    }

    async fn delete_manifest(&self, account: &str, repo: &str, digest: &str) -> StorageResult<()> {
        self.delete_file(&self.manifest_path(account, repo, digest)).await
    }

    async fn list_blob_storage_ids(&self, account: &str) -> StorageResult<Vec<String>> {
        let dir = self.root.join(account).join("blobs");
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                // temp files from in-flight writes are not objects
                if !name.ends_with(".tmp") {
                    ids.push(name.to_string());
                }
            }
        }
        Ok(ids)
    }

    fn name(&self) -> &'static str {
        "filesystem"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_blob_lifecycle() {
        let dir = tempdir().unwrap();
        let driver = FilesystemDriver::new(dir.path());

        driver
            .write_blob("acct", "id1", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert_eq!(driver.read_blob("acct", "id1").await.unwrap().as_ref(), b"hello");

        driver.delete_blob("acct", "id1").await.unwrap();
        assert!(driver.read_blob("acct", "id1").await.unwrap_err().is_not_found());
        // deleting again is fine
        driver.delete_blob("acct", "id1").await.unwrap();
    }

    #[tokio::test]
    async fn test_append_accumulates() {
        let dir = tempdir().unwrap();
        let driver = FilesystemDriver::new(dir.path());

        driver
            .append_to_blob("acct", "up1", Bytes::from_static(b"hel"))
            .await
            .unwrap();
        driver
            .append_to_blob("acct", "up1", Bytes::from_static(b"lo"))
            .await
            .unwrap();
        assert_eq!(driver.read_blob("acct", "up1").await.unwrap().as_ref(), b"hello");

        driver.abort_blob_upload("acct", "up1").await.unwrap();
        assert!(driver.read_blob("acct", "up1").await.is_err());
    }

    #[tokio::test]
    async fn test_manifest_paths_allow_nested_repos() {
        let dir = tempdir().unwrap();
        let driver = FilesystemDriver::new(dir.path());

        driver
            .write_manifest("acct", "lib/app", "sha256:abc", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        assert_eq!(
            driver
                .read_manifest("acct", "lib/app", "sha256:abc")
                .await
                .unwrap()
                .as_ref(),
            b"{}"
        );
    }

    #[tokio::test]
    async fn test_no_blob_urls() {
        let dir = tempdir().unwrap();
        let driver = FilesystemDriver::new(dir.path());
        assert!(matches!(
            driver.url_for_blob("acct", "id1").await,
            Err(StorageError::CannotGenerateUrl)
        ));
    }
}
