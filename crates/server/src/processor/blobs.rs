//! Blob upload finalization and replication.

use super::Processor;
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;
use wharf_core::digest::Digest;
use wharf_core::error::RegistryErrorCode;
use wharf_metadata::models::{AccountRow, BlobRow, RepositoryRow, UploadRow};

/// How long a competing replication waits for the winner before taking over.
const REPLICATION_POLL_INTERVAL: Duration = Duration::from_millis(250);
const REPLICATION_POLL_ATTEMPTS: u32 = 40;

impl Processor {
    /// Turn a finished upload session into a blob.
    ///
    /// The staged content is read back from storage and checked against the
    /// digest the client declared. On mismatch the staged object and the
    /// session are dropped and the client gets `DIGEST_INVALID`.
    pub async fn finalize_blob_upload(
        &self,
        account: &AccountRow,
        repo: &RepositoryRow,
        upload: &UploadRow,
        declared_digest: &Digest,
    ) -> ApiResult<BlobRow> {
        let contents = self.storage().read_blob(&account.name, &upload.storage_id).await?;

        if !declared_digest.matches(&contents) {
            self.storage()
                .abort_blob_upload(&account.name, &upload.storage_id)
                .await?;
            self.db().delete_upload(upload.id).await?;
            return Err(RegistryErrorCode::DigestInvalid
                .with(format!("expected digest {declared_digest}"))
                .into());
        }

        let digest_str = declared_digest.to_string();
        let now = OffsetDateTime::now_utc();

        let blob_id = match self.db().get_blob(&account.name, &digest_str).await? {
            Some(existing) if !existing.storage_id.is_empty() => {
                // already present; the staged copy is redundant
                self.storage()
                    .abort_blob_upload(&account.name, &upload.storage_id)
                    .await?;
                existing.id
            }
            Some(pending) => {
                // a replication reserved this digest; the upload wins the race
                // if the row is still empty, otherwise our copy is redundant
                let won = self
                    .db()
                    .mark_blob_materialized(
                        pending.id,
                        &upload.storage_id,
                        contents.len() as i64,
                        now,
                    )
                    .await?;
                if !won {
                    self.storage()
                        .abort_blob_upload(&account.name, &upload.storage_id)
                        .await?;
                }
                pending.id
            }
            None => {
                self.db()
                    .insert_blob(&BlobRow {
                        id: 0,
                        account_name: account.name.clone(),
                        digest: digest_str.clone(),
                        size_bytes: contents.len() as i64,
                        storage_id: upload.storage_id.clone(),
                        pushed_at: now,
                        validated_at: now,
                        validation_error_message: String::new(),
                        can_be_deleted_at: None,
                    })
                    .await?
            }
        };

        self.db().mount_blob(blob_id, repo.id).await?;
        self.db().delete_upload(upload.id).await?;
        metrics::BLOBS_STORED.with_label_values(&["upload"]).inc();

        self.db()
            .get_blob(&account.name, &digest_str)
            .await?
            .ok_or_else(|| ApiError::Internal(format!("blob {digest_str} vanished after finalize")))
    }

    /// Materialize a blob from the upstream peer, coalescing concurrent
    /// requests for the same `(account, digest)` into one upstream fetch.
    ///
    /// The uniqueness of the reserved row is the coordination point: whoever
    /// inserts the row fetches from upstream; everyone else polls the row
    /// until its storage id is filled in. If the winner dies, a waiter takes
    /// over after the polling window.
    pub async fn replicate_blob(
        &self,
        account: &AccountRow,
        repo: &RepositoryRow,
        digest: &Digest,
    ) -> ApiResult<BlobRow> {
        let digest_str = digest.to_string();
        let now = OffsetDateTime::now_utc();

        if let Some(id) = self
            .db()
            .try_reserve_blob(&account.name, &digest_str, now)
            .await?
        {
            self.db().mount_blob(id, repo.id).await?;
            return self.materialize_pending_blob(account, repo, id, digest).await;
        }

        // a row already exists: either the blob is materialized, or someone
        // else is working on it
        for _attempt in 0..REPLICATION_POLL_ATTEMPTS {
            let blob = self
                .db()
                .get_blob(&account.name, &digest_str)
                .await?
                .ok_or_else(|| {
                    // the winner failed and dropped the row; the caller can retry
                    ApiError::Registry(RegistryErrorCode::BlobUnknown.with(digest_str.clone()))
                })?;
            if !blob.storage_id.is_empty() {
                self.db().mount_blob(blob.id, repo.id).await?;
                return Ok(blob);
            }
            tokio::time::sleep(REPLICATION_POLL_INTERVAL).await;
        }

        // the reservation looks abandoned (e.g. the reserving process died
        // mid-replication); take over materialization
        let blob = self
            .db()
            .get_blob(&account.name, &digest_str)
            .await?
            .ok_or_else(|| {
                ApiError::Registry(RegistryErrorCode::BlobUnknown.with(digest_str.clone()))
            })?;
        if !blob.storage_id.is_empty() {
            self.db().mount_blob(blob.id, repo.id).await?;
            return Ok(blob);
        }
        self.db().mount_blob(blob.id, repo.id).await?;
        self.materialize_pending_blob(account, repo, blob.id, digest).await
    }

    /// Fetch the blob's bytes from upstream and fill in the reserved row.
    pub(crate) async fn materialize_pending_blob(
        &self,
        account: &AccountRow,
        repo: &RepositoryRow,
        blob_id: i64,
        digest: &Digest,
    ) -> ApiResult<BlobRow> {
        let digest_str = digest.to_string();
        let client = self.peer_client(account, &repo.name)?;

        let contents = match client.download_blob(&digest_str).await {
            Ok(contents) => contents,
            Err(e) => {
                // drop the reservation so a later request can retry; this
                // fails harmlessly if a manifest already references the row
                if let Err(cleanup) = self.db().delete_blob(blob_id).await {
                    tracing::debug!(
                        blob_id,
                        error = %cleanup,
                        "keeping pending blob row after failed replication"
                    );
                }
                if e.is_not_found() {
                    return Err(ApiError::Registry(
                        RegistryErrorCode::BlobUnknown.with(digest_str),
                    ));
                }
                return Err(e.into());
            }
        };

        if !digest.matches(&contents) {
            if let Err(cleanup) = self.db().delete_blob(blob_id).await {
                tracing::debug!(blob_id, error = %cleanup, "cleanup after digest mismatch failed");
            }
            return Err(ApiError::Internal(format!(
                "upstream sent wrong content for blob {digest_str}"
            )));
        }

        let storage_id = Uuid::new_v4().to_string();
        let size = contents.len() as i64;
        self.storage()
            .write_blob(&account.name, &storage_id, contents)
            .await?;

        let won = self
            .db()
            .mark_blob_materialized(blob_id, &storage_id, size, OffsetDateTime::now_utc())
            .await?;
        if !won {
            // someone else filled the row first; our object is an orphan and
            // gets removed right away rather than waiting for the sweep
            self.storage().delete_blob(&account.name, &storage_id).await?;
        } else {
            metrics::BLOBS_STORED.with_label_values(&["replication"]).inc();
        }

        self.db()
            .get_blob(&account.name, &digest_str)
            .await?
            .ok_or_else(|| {
                ApiError::Internal(format!("blob {digest_str} vanished during replication"))
            })
    }
}
