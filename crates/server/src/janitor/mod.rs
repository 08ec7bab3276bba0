//! Background maintenance sweeps.
//!
//! Each sweep processes at most one work item per invocation and reports
//! [`SweepOutcome::Idle`] when there is nothing to do, so the runner can back
//! off. Item errors never crash the process; they are recorded and the sweep
//! moves on next time around.

mod blobs;
mod sync;
mod validation;
mod vuln;

use crate::error::ApiResult;
use crate::metrics;
use crate::processor::Processor;
use crate::scanner::VulnerabilityScanner;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use wharf_core::Configuration;
use wharf_metadata::MetadataStore;
use wharf_storage::StorageDriver;

/// Revalidate manifests this long after the last successful validation.
pub(crate) const MANIFEST_VALIDATION_INTERVAL: time::Duration = time::Duration::hours(24);
/// Recheck failed validations after this long.
pub(crate) const MANIFEST_VALIDATION_RETRY: time::Duration = time::Duration::minutes(10);
/// Replica repositories sync against their primary this often.
pub(crate) const MANIFEST_SYNC_INTERVAL: time::Duration = time::Duration::hours(1);
/// Vulnerability statuses are refreshed this often.
pub(crate) const VULN_RECHECK_INTERVAL: time::Duration = time::Duration::hours(1);
/// While the scanner is still indexing, come back this quickly.
pub(crate) const VULN_PENDING_RECHECK: time::Duration = time::Duration::minutes(2);
/// Grace given to a freshly replicated manifest whose blobs are not here yet.
pub(crate) const VULN_REPLICATION_GRACE: time::Duration = time::Duration::minutes(10);
/// Blob mounts are swept per repo this often.
pub(crate) const BLOB_MOUNT_SWEEP_INTERVAL: time::Duration = time::Duration::hours(1);
/// Blob storage is swept per account this often.
pub(crate) const BLOB_SWEEP_INTERVAL: time::Duration = time::Duration::hours(1);
/// Unmounted blobs survive at least this long before storage GC.
pub(crate) const BLOB_DELETION_GRACE: time::Duration = time::Duration::hours(1);
/// Upload sessions not touched for this long are abandoned and cleaned up.
pub(crate) const UPLOAD_TIMEOUT: time::Duration = time::Duration::hours(24);

/// What a sweep invocation accomplished.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SweepOutcome {
    /// One work item was processed.
    Done,
    /// Nothing was due; the caller should back off.
    Idle,
}

/// Time source, swappable in tests.
pub type Clock = Arc<dyn Fn() -> OffsetDateTime + Send + Sync>;

/// The janitor: background reconciliation against persisted state.
pub struct Janitor {
    pub(crate) config: Arc<Configuration>,
    pub(crate) db: Arc<dyn MetadataStore>,
    pub(crate) storage: Arc<dyn StorageDriver>,
    pub(crate) scanner: Option<Arc<dyn VulnerabilityScanner>>,
    clock: Clock,
}

impl Janitor {
    pub fn new(
        config: Arc<Configuration>,
        db: Arc<dyn MetadataStore>,
        storage: Arc<dyn StorageDriver>,
        scanner: Option<Arc<dyn VulnerabilityScanner>>,
    ) -> Self {
        Self {
            config,
            db,
            storage,
            scanner,
            clock: Arc::new(OffsetDateTime::now_utc),
        }
    }

    /// Replace the time source. Test hook.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub(crate) fn now(&self) -> OffsetDateTime {
        (self.clock)()
    }

    pub(crate) fn processor(&self) -> Processor {
        Processor::new(self.config.clone(), self.db.clone(), self.storage.clone())
    }

    async fn run_sweep(&self, sweep: SweepKind) -> ApiResult<SweepOutcome> {
        match sweep {
            SweepKind::ManifestValidation => self.validate_next_manifest().await,
            SweepKind::ManifestSync => self.sync_manifests_in_next_repo().await,
            SweepKind::VulnCheck => self.check_vulnerabilities_for_next_manifest().await,
            SweepKind::BlobMountSweep => self.sweep_blob_mounts_in_next_repo().await,
            SweepKind::BlobStorageSweep => self.sweep_blob_storage_in_next_account().await,
        }
    }

    /// Run all sweeps until `shutdown` flips to true. Each sweep runs in its
    /// own task; shutdown is honored between items, never mid-item.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let mut handles = Vec::new();
        for sweep in SweepKind::ALL {
            let janitor = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(sweep_loop(janitor, sweep, shutdown)));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum SweepKind {
    ManifestValidation,
    ManifestSync,
    VulnCheck,
    BlobMountSweep,
    BlobStorageSweep,
}

impl SweepKind {
    const ALL: [SweepKind; 5] = [
        SweepKind::ManifestValidation,
        SweepKind::ManifestSync,
        SweepKind::VulnCheck,
        SweepKind::BlobMountSweep,
        SweepKind::BlobStorageSweep,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::ManifestValidation => "manifest_validation",
            Self::ManifestSync => "manifest_sync",
            Self::VulnCheck => "vuln_check",
            Self::BlobMountSweep => "blob_mount_sweep",
            Self::BlobStorageSweep => "blob_storage_sweep",
        }
    }
}

const IDLE_BACKOFF_MIN: Duration = Duration::from_secs(5);
const IDLE_BACKOFF_MAX: Duration = Duration::from_secs(300);
const ERROR_BACKOFF: Duration = Duration::from_secs(30);

async fn sweep_loop(janitor: Arc<Janitor>, sweep: SweepKind, mut shutdown: watch::Receiver<bool>) {
    let name = sweep.name();
    let mut idle_backoff = IDLE_BACKOFF_MIN;
    loop {
        if *shutdown.borrow() {
            return;
        }

        let delay = match janitor.run_sweep(sweep).await {
            Ok(SweepOutcome::Done) => {
                metrics::JANITOR_SWEEP_RUNS.with_label_values(&[name, "done"]).inc();
                idle_backoff = IDLE_BACKOFF_MIN;
                Duration::ZERO
            }
            Ok(SweepOutcome::Idle) => {
                metrics::JANITOR_SWEEP_RUNS.with_label_values(&[name, "idle"]).inc();
                tracing::debug!(sweep = name, "nothing to do - slowing down");
                idle_backoff = (idle_backoff * 2).min(IDLE_BACKOFF_MAX);
                idle_backoff
            }
            Err(e) => {
                metrics::JANITOR_SWEEP_RUNS.with_label_values(&[name, "error"]).inc();
                tracing::error!(sweep = name, error = %e, "sweep item failed");
                ERROR_BACKOFF
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return,
        }
    }
}
