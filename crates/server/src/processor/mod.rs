//! The transactional engine for ingest and replication.
//!
//! Everything that creates or mutates manifests and blobs funnels through
//! here, both from the API handlers and from the janitor. The processor owns
//! the ordering rules: for writes the DB work happens first and storage
//! persistence is the final step before commit; deletions remove the DB row
//! before the storage object.

mod blobs;
mod manifests;

pub use manifests::IncomingManifest;

use crate::error::{ApiError, ApiResult};
use std::sync::Arc;
use wharf_client::RepoClient;
use wharf_core::Configuration;
use wharf_metadata::MetadataStore;
use wharf_metadata::models::AccountRow;
use wharf_storage::StorageDriver;

/// The ingest/replication engine.
#[derive(Clone)]
pub struct Processor {
    config: Arc<Configuration>,
    db: Arc<dyn MetadataStore>,
    storage: Arc<dyn StorageDriver>,
}

impl Processor {
    pub fn new(
        config: Arc<Configuration>,
        db: Arc<dyn MetadataStore>,
        storage: Arc<dyn StorageDriver>,
    ) -> Self {
        Self {
            config,
            db,
            storage,
        }
    }

    pub(crate) fn db(&self) -> &dyn MetadataStore {
        self.db.as_ref()
    }

    pub(crate) fn storage(&self) -> &dyn StorageDriver {
        self.storage.as_ref()
    }

    /// Build a client for the repository on this replica account's upstream.
    pub(crate) fn peer_client(
        &self,
        account: &AccountRow,
        repo_name: &str,
    ) -> ApiResult<RepoClient> {
        let upstream_repo = format!("{}/{}", account.name, repo_name);
        if !account.upstream_peer_hostname.is_empty() {
            let peer = self
                .config
                .peers
                .get(&account.upstream_peer_hostname)
                .ok_or_else(|| {
                    ApiError::Internal(format!(
                        "no peer configured for hostname {}",
                        account.upstream_peer_hostname
                    ))
                })?;
            return Ok(RepoClient::new(
                &peer.url,
                &upstream_repo,
                Some((peer.username.clone(), peer.password.clone())),
            )?);
        }
        if !account.external_peer_url.is_empty() {
            return Ok(RepoClient::new(
                &account.external_peer_url,
                &upstream_repo,
                None,
            )?);
        }
        Err(ApiError::Internal(format!(
            "account {} is not a replica",
            account.name
        )))
    }
}
