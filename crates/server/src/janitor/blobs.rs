//! Blob mount sweep and blob storage GC.

use super::{
    BLOB_DELETION_GRACE, BLOB_MOUNT_SWEEP_INTERVAL, BLOB_SWEEP_INTERVAL, Janitor, SweepOutcome,
    UPLOAD_TIMEOUT,
};
use crate::error::ApiResult;
use std::collections::HashSet;

impl Janitor {
    /// Drop blob mounts that no manifest in the repo references anymore.
    /// Unmounted blobs become candidates for the storage sweep.
    pub async fn sweep_blob_mounts_in_next_repo(&self) -> ApiResult<SweepOutcome> {
        let repo = match self.db.next_repo_for_blob_mount_sweep(self.now()).await? {
            Some(repo) => repo,
            None => return Ok(SweepOutcome::Idle),
        };

        let removed = self.db.unmount_unreferenced_blobs(repo.id).await?;
        if removed > 0 {
            tracing::info!(
                repo = %repo.full_name(),
                removed,
                "removed unreferenced blob mounts"
            );
        }
        self.db
            .set_next_blob_mount_sweep_at(repo.id, self.now() + BLOB_MOUNT_SWEEP_INTERVAL)
            .await?;
        Ok(SweepOutcome::Done)
    }

    /// Garbage-collect blob storage for the account whose sweep is most
    /// overdue.
    ///
    /// Unmounted blobs are first marked with a deletion time one grace period
    /// out (protecting blobs mid-upload); on a later sweep, rows past their
    /// mark are deleted - DB row first, then the storage object. Storage
    /// objects the database does not know about are orphans from crashed
    /// writes and are removed as well.
    pub async fn sweep_blob_storage_in_next_account(&self) -> ApiResult<SweepOutcome> {
        let account = match self.db.next_account_for_blob_sweep(self.now()).await? {
            Some(account) => account,
            None => return Ok(SweepOutcome::Idle),
        };

        // abandoned upload sessions first, so their staging objects stop
        // counting as known
        for upload in self.db.stale_uploads(self.now() - UPLOAD_TIMEOUT, 100).await? {
            if let Some(repo) = self.db.get_repository_by_id(upload.repo_id).await? {
                if repo.account_name == account.name {
                    tracing::info!(
                        account = %account.name,
                        upload_id = %upload.id,
                        "dropping abandoned upload session"
                    );
                    self.db.delete_upload(upload.id).await?;
                    self.storage
                        .abort_blob_upload(&account.name, &upload.storage_id)
                        .await?;
                }
            }
        }

        let marked = self
            .db
            .mark_unmounted_blobs(&account.name, self.now() + BLOB_DELETION_GRACE)
            .await?;
        if marked > 0 {
            tracing::info!(account = %account.name, marked, "marked unmounted blobs for deletion");
        }

        for blob in self.db.blobs_ready_for_deletion(&account.name, self.now()).await? {
            // DB row first. If the storage delete fails afterwards, the
            // leftover object is an orphan and the next sweep removes it;
            // the other order could lose content the DB still promises.
            self.db.delete_blob(blob.id).await?;
            if !blob.storage_id.is_empty() {
                self.storage.delete_blob(&account.name, &blob.storage_id).await?;
            }
            tracing::info!(
                account = %account.name,
                digest = %blob.digest,
                "deleted unmounted blob"
            );
        }

        // objects present in storage but absent from the DB are orphans;
        // they get a grace period too, so a write that has reached storage
        // but not the DB yet is not shot down mid-flight
        let known: HashSet<String> = self
            .db
            .known_storage_ids(&account.name)
            .await?
            .into_iter()
            .collect();
        let orphans: Vec<String> = self
            .storage
            .list_blob_storage_ids(&account.name)
            .await?
            .into_iter()
            .filter(|id| !known.contains(id))
            .collect();
        self.db
            .reconcile_unknown_blob_marks(&account.name, &orphans, self.now() + BLOB_DELETION_GRACE)
            .await?;
        for storage_id in self
            .db
            .unknown_blobs_ready_for_deletion(&account.name, self.now())
            .await?
        {
            tracing::info!(
                account = %account.name,
                storage_id = %storage_id,
                "deleting orphaned storage object"
            );
            self.storage.delete_blob(&account.name, &storage_id).await?;
            self.db
                .delete_unknown_blob_mark(&account.name, &storage_id)
                .await?;
        }

        self.db
            .set_next_blob_sweep_at(&account.name, self.now() + BLOB_SWEEP_INTERVAL)
            .await?;
        Ok(SweepOutcome::Done)
    }
}
