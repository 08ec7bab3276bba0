//! Manifest ingest, replication and deletion.

use super::Processor;
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use bytes::Bytes;
use time::OffsetDateTime;
use wharf_core::Severity;
use wharf_core::digest::Digest;
use wharf_core::error::RegistryErrorCode;
use wharf_core::manifest::{ManifestReference, ParsedManifest, PlatformFilter};
use wharf_metadata::models::{AccountRow, ManifestRow, RepositoryRow};

/// A manifest uploaded by a user, or downloaded from a peer registry in the
/// case of replication.
pub struct IncomingManifest {
    pub repo_name: String,
    pub reference: ManifestReference,
    pub media_type: String,
    pub contents: Bytes,
    /// Usually now, but controllable for tests.
    pub pushed_at: OffsetDateTime,
}

impl Processor {
    /// Refuse the push if it would put the account's auth tenant over its
    /// manifest-count quota.
    async fn check_manifest_quota(&self, account: &AccountRow) -> ApiResult<()> {
        let limit = match self.db().get_quota(&account.auth_tenant_id).await? {
            Some(quota) => quota.manifests as u64,
            None => self.config.default_manifest_quota,
        };
        let used = self
            .db()
            .manifest_count_for_tenant(&account.auth_tenant_id)
            .await?;
        if used >= limit {
            return Err(RegistryErrorCode::Denied
                .with(format!(
                    "manifest quota exceeded (quota = {limit}, usage = {used})"
                ))
                .into());
        }
        Ok(())
    }

    /// Validate the given manifest and store it under the given reference.
    ///
    /// If the reference is a digest it must match the computed digest.
    /// Otherwise a tag with that name is created pointing at the manifest.
    /// The whole row work runs in one transaction; the storage write is the
    /// final step before commit, so a failed storage write aborts the ingest
    /// without leaving a dangling row.
    pub async fn validate_and_store_manifest(
        &self,
        account: &AccountRow,
        incoming: IncomingManifest,
    ) -> ApiResult<ManifestRow> {
        self.check_manifest_quota(account).await?;
        let repo = self
            .db()
            .find_or_create_repository(&account.name, &incoming.repo_name)
            .await?;

        let (manifest, desc) = ParsedManifest::parse(&incoming.media_type, &incoming.contents)?;
        if let Some(expected) = incoming.reference.as_digest() {
            if *expected != desc.digest {
                return Err(RegistryErrorCode::DigestInvalid
                    .with(format!("actual manifest digest is {}", desc.digest))
                    .into());
            }
        }
        let digest_str = desc.digest.to_string();

        let mut tx = self.db().begin_ingest().await?;

        // map each referenced blob to its row id, for the reference edges
        let mut blob_edges: Vec<i64> = Vec::new();

        if account.is_replica() {
            // a manifest pushed into a replica account is being replicated
            // from upstream; referenced blobs will be materialized later, so
            // rows are reserved now and the existence checks are skipped
            for blob_ref in manifest.blob_references() {
                let blob_id = tx
                    .ensure_blob_reserved(
                        &account.name,
                        &blob_ref.digest.to_string(),
                        incoming.pushed_at,
                    )
                    .await?;
                tx.mount_blob(blob_id, repo.id).await?;
                blob_edges.push(blob_id);
            }
        } else {
            for blob_ref in manifest.blob_references() {
                let blob = tx
                    .get_blob_in_repo(repo.id, &blob_ref.digest.to_string())
                    .await?
                    .ok_or_else(|| {
                        RegistryErrorCode::ManifestBlobUnknown.with(blob_ref.digest.to_string())
                    })?;
                blob_edges.push(blob.id);
            }
            for child in manifest.manifest_references(&PlatformFilter::default()) {
                if !tx.manifest_exists(repo.id, &child.digest.to_string()).await? {
                    return Err(RegistryErrorCode::ManifestBlobUnknown
                        .with(child.digest.to_string())
                        .into());
                }
            }

            let required_labels = account.required_label_names();
            if !required_labels.is_empty() {
                if let Some(config_desc) = manifest.config_descriptor() {
                    let missing = self
                        .missing_required_labels(
                            &mut tx,
                            account,
                            &config_desc.digest,
                            &required_labels,
                        )
                        .await?;
                    if !missing.is_empty() {
                        return Err(RegistryErrorCode::ManifestInvalid
                            .with(format!("missing required labels: {}", missing.join(", ")))
                            .into());
                    }
                }
                // manifest lists only reference other manifests, they don't
                // have labels themselves
            }
        }

        let size_bytes = incoming.contents.len() as i64
            + manifest
                .references()
                .iter()
                .map(|r| r.size as i64)
                .sum::<i64>();

        let row = ManifestRow {
            repo_id: repo.id,
            digest: digest_str.clone(),
            media_type: incoming.media_type.clone(),
            size_bytes,
            pushed_at: incoming.pushed_at,
            validated_at: incoming.pushed_at,
            validation_error_message: String::new(),
            next_vuln_check_at: None,
            vuln_status: Severity::Pending.as_str().to_string(),
        };
        tx.insert_manifest_if_missing(&row).await?;

        for blob_id in blob_edges {
            tx.insert_manifest_blob_ref(repo.id, &digest_str, blob_id).await?;
        }
        for child in manifest.manifest_references(&PlatformFilter::default()) {
            tx.insert_manifest_manifest_ref(repo.id, &digest_str, &child.digest.to_string())
                .await?;
        }

        if let ManifestReference::Tag(tag) = &incoming.reference {
            tx.upsert_tag(repo.id, tag, &digest_str, incoming.pushed_at).await?;
        }

        // storage persistence is the last step; on failure the dropped
        // transaction rolls everything back
        self.storage()
            .write_manifest(
                &account.name,
                &incoming.repo_name,
                &digest_str,
                incoming.contents.clone(),
            )
            .await?;
        tx.commit().await?;

        let origin = if account.is_replica() { "replication" } else { "push" };
        metrics::MANIFESTS_STORED.with_label_values(&[origin]).inc();
        Ok(row)
    }

    /// Read the manifest's config blob and report which of the required
    /// labels it does not carry.
    async fn missing_required_labels(
        &self,
        tx: &mut wharf_metadata::IngestTx,
        account: &AccountRow,
        config_digest: &Digest,
        required: &[&str],
    ) -> ApiResult<Vec<String>> {
        let blob = tx
            .get_blob(&account.name, &config_digest.to_string())
            .await?
            .filter(|b| !b.storage_id.is_empty())
            .ok_or_else(|| {
                RegistryErrorCode::ManifestBlobUnknown.with(config_digest.to_string())
            })?;
        let contents = self.storage().read_blob(&account.name, &blob.storage_id).await?;

        #[derive(serde::Deserialize)]
        struct ImageConfig {
            #[serde(default)]
            config: ImageConfigInner,
        }
        #[derive(Default, serde::Deserialize)]
        struct ImageConfigInner {
            #[serde(default)]
            labels: std::collections::HashMap<String, serde_json::Value>,
        }

        let parsed: ImageConfig = serde_json::from_slice(&contents)
            .map_err(|e| RegistryErrorCode::ManifestInvalid.with(format!("config blob: {e}")))?;

        Ok(required
            .iter()
            .filter(|label| !parsed.config.labels.contains_key(**label))
            .map(|label| label.to_string())
            .collect())
    }

    /// Materialize a manifest from the upstream peer.
    ///
    /// Referenced child manifests are replicated first (depth-first) so the
    /// reference graph never points at missing rows; referenced blobs are
    /// scheduled for asynchronous replication before returning.
    pub async fn replicate_manifest(
        &self,
        account: &AccountRow,
        repo_name: &str,
        reference: &ManifestReference,
    ) -> ApiResult<(ManifestRow, Bytes, String)> {
        let client = self.peer_client(account, repo_name)?;
        let (contents, media_type) = match client.download_manifest(reference).await {
            Ok(result) => result,
            Err(e) if e.is_not_found() => {
                return Err(RegistryErrorCode::ManifestUnknown
                    .with(reference.to_string())
                    .into());
            }
            Err(e) => return Err(e.into()),
        };

        let (manifest, _) = ParsedManifest::parse(&media_type, &contents)?;

        let repo = self
            .db()
            .find_or_create_repository(&account.name, repo_name)
            .await?;
        for child in manifest.manifest_references(&PlatformFilter::default()) {
            let child_digest = child.digest.to_string();
            if self.db().get_manifest(repo.id, &child_digest).await?.is_none() {
                let child_ref = ManifestReference::Digest(child.digest.clone());
                Box::pin(self.replicate_manifest(account, repo_name, &child_ref)).await?;
            }
        }

        let row = self
            .validate_and_store_manifest(
                account,
                IncomingManifest {
                    repo_name: repo_name.to_string(),
                    reference: reference.clone(),
                    media_type: media_type.clone(),
                    contents: contents.clone(),
                    pushed_at: OffsetDateTime::now_utc(),
                },
            )
            .await?;

        for blob_ref in manifest.blob_references() {
            let processor = self.clone();
            let account = account.clone();
            let repo = repo.clone();
            let digest = blob_ref.digest.clone();
            tokio::spawn(async move {
                if let Err(e) = processor.replicate_blob(&account, &repo, &digest).await {
                    tracing::warn!(
                        account = %account.name,
                        repo = %repo.name,
                        digest = %digest,
                        error = %e,
                        "background blob replication failed"
                    );
                }
            });
        }

        Ok((row, contents, media_type))
    }

    /// Delete a manifest: row first, then the storage object.
    pub async fn delete_manifest(
        &self,
        account: &AccountRow,
        repo: &RepositoryRow,
        digest: &str,
    ) -> ApiResult<()> {
        let deleted = self
            .db()
            .delete_manifest(repo.id, digest)
            .await
            .map_err(|e| match e {
                wharf_metadata::MetadataError::Constraint(_) => ApiError::Registry(
                    RegistryErrorCode::ManifestInvalid
                        .with("manifest is still referenced by another manifest"),
                ),
                other => other.into(),
            })?;
        if !deleted {
            return Err(RegistryErrorCode::ManifestUnknown.with(digest).into());
        }
        self.storage()
            .delete_manifest(&account.name, &repo.name, digest)
            .await?;
        Ok(())
    }

    /// Re-check a stored manifest: the stored bytes must still produce the
    /// row's digest, parse under the recorded media type, and reference only
    /// content the database knows about.
    pub async fn validate_existing_manifest(
        &self,
        account: &AccountRow,
        repo: &RepositoryRow,
        manifest_row: &ManifestRow,
    ) -> ApiResult<()> {
        let contents = self
            .storage()
            .read_manifest(&account.name, &repo.name, &manifest_row.digest)
            .await?;

        let digest = Digest::parse(&manifest_row.digest)
            .map_err(|e| ApiError::Internal(format!("stored digest is malformed: {e}")))?;
        if !digest.matches(&contents) {
            return Err(ApiError::Internal(format!(
                "stored contents of manifest {} do not match its digest",
                manifest_row.digest
            )));
        }

        let (manifest, _) = ParsedManifest::parse(&manifest_row.media_type, &contents)?;
        for blob_ref in manifest.blob_references() {
            if self
                .db()
                .get_blob_in_repo(repo.id, &blob_ref.digest.to_string())
                .await?
                .is_none()
            {
                return Err(ApiError::Internal(format!(
                    "manifest {} references unknown blob {}",
                    manifest_row.digest, blob_ref.digest
                )));
            }
        }
        for child in manifest.manifest_references(&PlatformFilter::default()) {
            if self
                .db()
                .get_manifest(repo.id, &child.digest.to_string())
                .await?
                .is_none()
            {
                return Err(ApiError::Internal(format!(
                    "manifest {} references unknown manifest {}",
                    manifest_row.digest, child.digest
                )));
            }
        }
        Ok(())
    }
}
