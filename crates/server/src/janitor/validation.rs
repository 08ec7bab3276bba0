//! Manifest revalidation sweep.

use super::{Janitor, MANIFEST_VALIDATION_INTERVAL, MANIFEST_VALIDATION_RETRY, SweepOutcome};
use crate::error::{ApiError, ApiResult};

impl Janitor {
    /// Revalidate the manifest whose validation is most overdue.
    ///
    /// Manifests are validated once every 24 hours; failed validations are
    /// rechecked after 10 minutes, and always take precedence. The timestamp
    /// is bumped even on failure so one broken manifest cannot livelock the
    /// sweep.
    pub async fn validate_next_manifest(&self) -> ApiResult<SweepOutcome> {
        let now = self.now();
        let manifest = match self
            .db
            .next_manifest_for_validation(
                now - MANIFEST_VALIDATION_INTERVAL,
                now - MANIFEST_VALIDATION_RETRY,
            )
            .await?
        {
            Some(manifest) => manifest,
            None => return Ok(SweepOutcome::Idle),
        };

        let repo = self
            .db
            .get_repository_by_id(manifest.repo_id)
            .await?
            .ok_or_else(|| {
                ApiError::Internal(format!(
                    "cannot find repo {} for manifest {}",
                    manifest.repo_id, manifest.digest
                ))
            })?;
        let account = self.db.get_account(&repo.account_name).await?.ok_or_else(|| {
            ApiError::Internal(format!(
                "cannot find account for manifest {}/{}",
                repo.full_name(),
                manifest.digest
            ))
        })?;

        match self
            .processor()
            .validate_existing_manifest(&account, &repo, &manifest)
            .await
        {
            Ok(()) => {
                self.db
                    .update_validation(repo.id, &manifest.digest, self.now(), "")
                    .await?;
                Ok(SweepOutcome::Done)
            }
            Err(e) => {
                let message = e.to_string();
                self.db
                    .update_validation(repo.id, &manifest.digest, self.now(), &message)
                    .await?;
                Err(ApiError::Internal(format!(
                    "while validating manifest {}/{}: {message}",
                    repo.full_name(),
                    manifest.digest
                )))
            }
        }
    }
}
