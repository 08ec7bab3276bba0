//! Vulnerability check sweep.

use super::{
    Janitor, SweepOutcome, VULN_PENDING_RECHECK, VULN_RECHECK_INTERVAL, VULN_REPLICATION_GRACE,
};
use crate::error::{ApiError, ApiResult};
use crate::scanner::{ScanState, ScannerLayer, ScannerManifest};
use wharf_core::Severity;
use wharf_core::digest::Digest;

impl Janitor {
    /// Refresh the vulnerability status of the manifest whose check is most
    /// overdue, by submitting its blobs to the scanner and merging the result
    /// with the statuses of its child manifests.
    pub async fn check_vulnerabilities_for_next_manifest(&self) -> ApiResult<SweepOutcome> {
        let Some(scanner) = self.scanner.clone() else {
            return Ok(SweepOutcome::Idle);
        };

        let manifest = match self.db.next_manifest_for_vuln_check(self.now()).await? {
            Some(manifest) => manifest,
            None => return Ok(SweepOutcome::Idle),
        };

        let repo = self
            .db
            .get_repository_by_id(manifest.repo_id)
            .await?
            .ok_or_else(|| {
                ApiError::Internal(format!("cannot find repo for manifest {}", manifest.digest))
            })?;
        let account = self.db.get_account(&repo.account_name).await?.ok_or_else(|| {
            ApiError::Internal(format!("cannot find account for repo {}", repo.full_name()))
        })?;

        // maintenance blocks all activity on the account's contents
        if account.in_maintenance {
            self.db
                .update_vuln_status(
                    repo.id,
                    &manifest.digest,
                    &manifest.vuln_status,
                    self.now() + VULN_RECHECK_INTERVAL,
                )
                .await?;
            return Ok(SweepOutcome::Done);
        }

        // all directly referenced blobs must be in storage before the scanner
        // can fetch them
        let mut blobs = self.db.blobs_for_manifest(repo.id, &manifest.digest).await?;
        let mut retried_replication = false;
        loop {
            let Some(pending) = blobs.iter().find(|b| b.storage_id.is_empty()) else {
                break;
            };

            let replication_deadline = manifest.pushed_at + VULN_REPLICATION_GRACE;
            if self.now() < replication_deadline {
                // whoever replicated the manifest is probably still working
                // on the blobs; come back once the grace window is over
                self.db
                    .update_vuln_status(
                        repo.id,
                        &manifest.digest,
                        &manifest.vuln_status,
                        replication_deadline,
                    )
                    .await?;
                return Ok(SweepOutcome::Done);
            }

            if retried_replication {
                // replication succeeded but the row still looks pending;
                // defer without error rather than spinning here
                self.db
                    .update_vuln_status(
                        repo.id,
                        &manifest.digest,
                        &manifest.vuln_status,
                        self.now() + VULN_PENDING_RECHECK,
                    )
                    .await?;
                return Ok(SweepOutcome::Done);
            }

            let digest = Digest::parse(&pending.digest)
                .map_err(|e| ApiError::Internal(format!("stored digest is malformed: {e}")))?;
            self.processor()
                .replicate_blob(&account, &repo, &digest)
                .await?;
            retried_replication = true;
            blobs = self.db.blobs_for_manifest(repo.id, &manifest.digest).await?;
        }

        let mut severities: Vec<Severity> = Vec::new();
        for status in self.db.child_vuln_statuses(repo.id, &manifest.digest).await? {
            severities.push(Severity::parse(&status).ok_or_else(|| {
                ApiError::Internal(format!("stored vulnerability status is malformed: {status}"))
            })?);
        }

        if !blobs.is_empty() {
            let mut layers = Vec::with_capacity(blobs.len());
            for blob in &blobs {
                let url = self.storage.url_for_blob(&account.name, &blob.storage_id).await?;
                layers.push(ScannerLayer {
                    digest: blob.digest.clone(),
                    url,
                });
            }
            let scanner_manifest = ScannerManifest {
                digest: manifest.digest.clone(),
                layers,
            };

            match scanner.check_manifest_state(&scanner_manifest).await? {
                ScanState::Errored => {
                    self.db
                        .update_vuln_status(
                            repo.id,
                            &manifest.digest,
                            &manifest.vuln_status,
                            self.now() + VULN_RECHECK_INTERVAL,
                        )
                        .await?;
                    return Err(ApiError::Internal(format!(
                        "scanner reports indexing of {} as errored",
                        manifest.digest
                    )));
                }
                ScanState::Pending => severities.push(Severity::Pending),
                ScanState::Indexed => {
                    let severity = scanner
                        .get_vulnerability_report(&manifest.digest)
                        .await?
                        .ok_or_else(|| {
                            ApiError::Internal(format!(
                                "scanner reports indexing of {} as finished, but the \
                                 vulnerability report is missing",
                                manifest.digest
                            ))
                        })?;
                    severities.push(severity);
                }
            }
        }

        let merged = Severity::merge_all(severities);
        let next_check_at = if merged == Severity::Pending {
            // indexing is not finished yet; look again shortly
            self.now() + VULN_PENDING_RECHECK
        } else {
            // statuses can change when the scanner learns new vulnerabilities
            self.now() + VULN_RECHECK_INTERVAL
        };
        self.db
            .update_vuln_status(repo.id, &manifest.digest, merged.as_str(), next_check_at)
            .await?;
        Ok(SweepOutcome::Done)
    }
}
