//! Account and quota operations.

use crate::error::MetadataResult;
use crate::models::{AccountRow, QuotaRow};
use async_trait::async_trait;
use time::OffsetDateTime;

/// Repository for account and quota operations.
#[async_trait]
pub trait AccountRepo: Send + Sync {
    /// Create an account. Fails with a constraint error if the name is taken.
    async fn create_account(&self, account: &AccountRow) -> MetadataResult<()>;

    /// Get an account by name.
    async fn get_account(&self, name: &str) -> MetadataResult<Option<AccountRow>>;

    /// Set or clear the maintenance flag.
    async fn set_in_maintenance(&self, name: &str, in_maintenance: bool) -> MetadataResult<()>;

    /// The account whose blob sweep is most overdue, if any is due at `now`.
    /// Accounts that were never swept come first.
    async fn next_account_for_blob_sweep(
        &self,
        now: OffsetDateTime,
    ) -> MetadataResult<Option<AccountRow>>;

    /// Record when the account's next blob sweep is due.
    async fn set_next_blob_sweep_at(
        &self,
        name: &str,
        next: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// Get the quota row for an auth tenant, if one was configured.
    async fn get_quota(&self, auth_tenant_id: &str) -> MetadataResult<Option<QuotaRow>>;

    /// Create or replace the quota row for an auth tenant.
    async fn set_quota(&self, quota: &QuotaRow) -> MetadataResult<()>;

    /// Count the manifests in all accounts belonging to an auth tenant.
    async fn manifest_count_for_tenant(&self, auth_tenant_id: &str) -> MetadataResult<u64>;
}
