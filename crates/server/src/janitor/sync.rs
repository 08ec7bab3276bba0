//! Replica manifest sync sweep.

use super::{Janitor, MANIFEST_SYNC_INTERVAL, SweepOutcome};
use crate::error::{ApiError, ApiResult};
use std::collections::{HashMap, HashSet};
use wharf_core::digest::Digest;
use wharf_core::manifest::ManifestReference;
use wharf_metadata::models::{AccountRow, RepositoryRow};

impl Janitor {
    /// Sync the replica repository whose manifest sync is most overdue:
    /// probe the primary for every local manifest and replicate deletions.
    ///
    /// Accounts in maintenance skip the sync but still advance the schedule.
    pub async fn sync_manifests_in_next_repo(&self) -> ApiResult<SweepOutcome> {
        let repo = match self.db.next_repo_for_manifest_sync(self.now()).await? {
            Some(repo) => repo,
            None => return Ok(SweepOutcome::Idle),
        };
        let account = self.db.get_account(&repo.account_name).await?.ok_or_else(|| {
            ApiError::Internal(format!("cannot find account for repo {}", repo.full_name()))
        })?;

        let sync_result = if account.in_maintenance {
            Ok(())
        } else {
            self.perform_manifest_sync(&account, &repo).await
        };

        // reschedule even after errors, so one broken repo cannot starve the rest
        self.db
            .set_next_manifest_sync_at(repo.id, self.now() + MANIFEST_SYNC_INTERVAL)
            .await?;
        sync_result?;
        Ok(SweepOutcome::Done)
    }

    async fn perform_manifest_sync(
        &self,
        account: &AccountRow,
        repo: &RepositoryRow,
    ) -> ApiResult<()> {
        let manifests = self.db.list_manifests(repo.id).await?;
        let client = self.processor().peer_client(account, &repo.name)?;

        let mut shall_delete: HashSet<String> = HashSet::new();
        for manifest in &manifests {
            let digest = Digest::parse(&manifest.digest)
                .map_err(|e| ApiError::Internal(format!("stored digest is malformed: {e}")))?;
            let exists = client
                .manifest_exists(&ManifestReference::Digest(digest))
                .await
                .map_err(|e| {
                    ApiError::Internal(format!(
                        "cannot check existence of manifest {}/{} on primary account: {e}",
                        repo.full_name(),
                        manifest.digest
                    ))
                })?;
            if !exists {
                shall_delete.insert(manifest.digest.clone());
            }
        }
        if shall_delete.is_empty() {
            return Ok(());
        }

        tracing::info!(
            repo = %repo.full_name(),
            count = shall_delete.len(),
            "deleting manifests that were deleted on the primary account"
        );

        let mut parents_of: HashMap<String, Vec<String>> = HashMap::new();
        for (parent, child) in self.db.manifest_manifest_refs(repo.id).await? {
            parents_of.entry(child).or_default().push(parent);
        }

        // parents must go before their children, otherwise the child delete
        // trips the reference constraints
        let mut deleted: HashSet<String> = HashSet::new();
        while !shall_delete.is_empty() {
            let mut deleted_something = false;

            let candidates: Vec<String> = shall_delete.iter().cloned().collect();
            for digest in candidates {
                let blocked = parents_of
                    .get(&digest)
                    .is_some_and(|parents| parents.iter().any(|p| !deleted.contains(p)));
                if blocked {
                    continue;
                }

                // row first: a concurrent push that re-attaches a reference
                // fails against the committed delete instead of racing the
                // storage removal. The leftover storage object after a crash
                // is picked up by the blob/storage sweeps (the DB is the
                // source of truth, so nobody observes it).
                self.db.delete_manifest(repo.id, &digest).await.map_err(|e| {
                    ApiError::Internal(format!(
                        "cannot remove deleted manifest {} in repo {} from DB: {e}",
                        digest,
                        repo.full_name()
                    ))
                })?;
                self.storage
                    .delete_manifest(&account.name, &repo.name, &digest)
                    .await
                    .map_err(|e| {
                        ApiError::Internal(format!(
                            "cannot remove deleted manifest {} in repo {} from storage: {e}",
                            digest,
                            repo.full_name()
                        ))
                    })?;

                shall_delete.remove(&digest);
                deleted.insert(digest);
                deleted_something = true;
            }

            if !deleted_something {
                let mut stuck: Vec<String> = shall_delete.into_iter().collect();
                stuck.sort();
                return Err(ApiError::Internal(format!(
                    "cannot remove deleted manifests [{}] in repo {} because they are still being \
                     referenced by other manifests (this smells like an inconsistency on the \
                     primary account)",
                    stuck.join(", "),
                    repo.full_name()
                )));
            }
        }
        Ok(())
    }
}
