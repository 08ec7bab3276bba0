//! Application state shared across handlers.

use crate::processor::Processor;
use crate::scanner::VulnerabilityScanner;
use std::sync::Arc;
use wharf_auth::{AuthDriver, TokenEngine};
use wharf_core::Configuration;
use wharf_metadata::MetadataStore;
use wharf_storage::StorageDriver;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<Configuration>,
    /// Metadata store.
    pub db: Arc<dyn MetadataStore>,
    /// Object storage driver.
    pub storage: Arc<dyn StorageDriver>,
    /// Auth driver for credential checks and identity decoding.
    pub auth_driver: Arc<dyn AuthDriver>,
    /// Token issuer/verifier.
    pub token_engine: Arc<TokenEngine>,
    /// Vulnerability scanner, if one is configured.
    pub scanner: Option<Arc<dyn VulnerabilityScanner>>,
}

impl AppState {
    pub fn new(
        config: Configuration,
        db: Arc<dyn MetadataStore>,
        storage: Arc<dyn StorageDriver>,
        auth_driver: Arc<dyn AuthDriver>,
        token_engine: TokenEngine,
        scanner: Option<Arc<dyn VulnerabilityScanner>>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            db,
            storage,
            auth_driver,
            token_engine: Arc::new(token_engine),
            scanner,
        }
    }

    /// The transactional ingest/replication engine over this state.
    pub fn processor(&self) -> Processor {
        Processor::new(self.config.clone(), self.db.clone(), self.storage.clone())
    }
}
