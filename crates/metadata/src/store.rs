//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::models::*;
use crate::repos::{AccountRepo, BlobRepo, ManifestRepo, RepositoryRepo, TagRepo, UploadRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, Transaction};
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore:
    AccountRepo + RepositoryRepo + BlobRepo + ManifestRepo + TagRepo + UploadRepo + Send + Sync
{
    /// Apply pending migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity.
    async fn health_check(&self) -> MetadataResult<()>;

    /// Open a transaction for a manifest ingest. The transaction serializes
    /// against all other writers; storage writes that must be covered by the
    /// ingest happen between the last row operation and `commit`.
    async fn begin_ingest(&self) -> MetadataResult<IngestTx>;
}

/// Forward-only numbered migrations, applied in order at startup.
const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    r#"
    CREATE TABLE accounts (
        name                    TEXT NOT NULL PRIMARY KEY,
        auth_tenant_id          TEXT NOT NULL,
        upstream_peer_hostname  TEXT NOT NULL DEFAULT '',
        external_peer_url       TEXT NOT NULL DEFAULT '',
        required_labels         TEXT NOT NULL DEFAULT '',
        in_maintenance          INTEGER NOT NULL DEFAULT 0,
        next_blob_sweep_at      TEXT
    );

    CREATE TABLE repos (
        id                        INTEGER PRIMARY KEY AUTOINCREMENT,
        account_name              TEXT NOT NULL REFERENCES accounts(name),
        name                      TEXT NOT NULL,
        next_manifest_sync_at     TEXT,
        next_blob_mount_sweep_at  TEXT,
        UNIQUE (account_name, name)
    );

    CREATE TABLE blobs (
        id                        INTEGER PRIMARY KEY AUTOINCREMENT,
        account_name              TEXT NOT NULL REFERENCES accounts(name),
        digest                    TEXT NOT NULL,
        size_bytes                INTEGER NOT NULL DEFAULT 0,
        storage_id                TEXT NOT NULL DEFAULT '',
        pushed_at                 TEXT NOT NULL,
        validated_at              TEXT NOT NULL,
        validation_error_message  TEXT NOT NULL DEFAULT '',
        can_be_deleted_at         TEXT,
        UNIQUE (account_name, digest)
    );

    CREATE TABLE blob_mounts (
        blob_id  INTEGER NOT NULL REFERENCES blobs(id),
        repo_id  INTEGER NOT NULL REFERENCES repos(id) ON DELETE CASCADE,
        UNIQUE (blob_id, repo_id)
    );

    CREATE TABLE manifests (
        repo_id                   INTEGER NOT NULL REFERENCES repos(id) ON DELETE CASCADE,
        digest                    TEXT NOT NULL,
        media_type                TEXT NOT NULL,
        size_bytes                INTEGER NOT NULL,
        pushed_at                 TEXT NOT NULL,
        validated_at              TEXT NOT NULL,
        validation_error_message  TEXT NOT NULL DEFAULT '',
        next_vuln_check_at        TEXT,
        vuln_status               TEXT NOT NULL DEFAULT 'Pending',
        PRIMARY KEY (repo_id, digest)
    );

    CREATE TABLE tags (
        repo_id    INTEGER NOT NULL,
        name       TEXT NOT NULL,
        digest     TEXT NOT NULL,
        pushed_at  TEXT NOT NULL,
        PRIMARY KEY (repo_id, name),
        FOREIGN KEY (repo_id, digest) REFERENCES manifests(repo_id, digest) ON DELETE CASCADE
    );

    CREATE TABLE manifest_blob_refs (
        repo_id  INTEGER NOT NULL,
        digest   TEXT NOT NULL,
        blob_id  INTEGER NOT NULL REFERENCES blobs(id),
        UNIQUE (repo_id, digest, blob_id),
        FOREIGN KEY (repo_id, digest) REFERENCES manifests(repo_id, digest) ON DELETE CASCADE
    );

    CREATE TABLE manifest_manifest_refs (
        repo_id        INTEGER NOT NULL,
        parent_digest  TEXT NOT NULL,
        child_digest   TEXT NOT NULL,
        UNIQUE (repo_id, parent_digest, child_digest),
        FOREIGN KEY (repo_id, parent_digest) REFERENCES manifests(repo_id, digest) ON DELETE CASCADE,
        FOREIGN KEY (repo_id, child_digest) REFERENCES manifests(repo_id, digest)
    );

    CREATE TABLE uploads (
        id          TEXT NOT NULL PRIMARY KEY,
        repo_id     INTEGER NOT NULL REFERENCES repos(id) ON DELETE CASCADE,
        storage_id  TEXT NOT NULL,
        size_bytes  INTEGER NOT NULL DEFAULT 0,
        digest      TEXT NOT NULL DEFAULT '',
        updated_at  TEXT NOT NULL
    );

    CREATE TABLE quotas (
        auth_tenant_id  TEXT NOT NULL PRIMARY KEY,
        manifests       INTEGER NOT NULL
    );

    CREATE TABLE unknown_blobs (
        account_name       TEXT NOT NULL REFERENCES accounts(name),
        storage_id         TEXT NOT NULL,
        can_be_deleted_at  TEXT NOT NULL,
        PRIMARY KEY (account_name, storage_id)
    );

    CREATE INDEX idx_manifests_validated_at ON manifests (validated_at);
    CREATE INDEX idx_manifests_next_vuln_check_at ON manifests (next_vuln_check_at);
    CREATE INDEX idx_blob_mounts_repo ON blob_mounts (repo_id);
    CREATE INDEX idx_manifest_blob_refs_blob ON manifest_blob_refs (blob_id);
    "#,
)];

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (and create, if missing) the database at `path` and bring the
    /// schema up to date.
    pub async fn new(path: &str) -> MetadataResult<Self> {
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{path}?mode=rwc"))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // SQLite permits limited write concurrency; a single connection
            // avoids persistent "database is locked" failures and gives the
            // ingest transaction serializable semantics.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        MetadataStore::migrate(&store).await?;
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER NOT NULL PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        for (version, sql) in MIGRATIONS {
            let applied: Option<(i64,)> =
                sqlx::query_as("SELECT version FROM schema_migrations WHERE version = ?")
                    .bind(version)
                    .fetch_optional(&self.pool)
                    .await?;
            if applied.is_some() {
                continue;
            }

            tracing::info!(version = *version, "applying schema migration");
            sqlx::raw_sql(sql).execute(&self.pool).await?;
            sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?, ?)")
                .bind(version)
                .bind(OffsetDateTime::now_utc())
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn begin_ingest(&self) -> MetadataResult<IngestTx> {
        let tx = self.pool.begin().await?;
        Ok(IngestTx { tx })
    }
}

#[async_trait]
impl AccountRepo for SqliteStore {
    async fn create_account(&self, account: &AccountRow) -> MetadataResult<()> {
        sqlx::query(
            "INSERT INTO accounts (name, auth_tenant_id, upstream_peer_hostname,
                external_peer_url, required_labels, in_maintenance, next_blob_sweep_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&account.name)
        .bind(&account.auth_tenant_id)
        .bind(&account.upstream_peer_hostname)
        .bind(&account.external_peer_url)
        .bind(&account.required_labels)
        .bind(account.in_maintenance)
        .bind(account.next_blob_sweep_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_account(&self, name: &str) -> MetadataResult<Option<AccountRow>> {
        let row = sqlx::query_as::<_, AccountRow>("SELECT * FROM accounts WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn set_in_maintenance(&self, name: &str, in_maintenance: bool) -> MetadataResult<()> {
        let result = sqlx::query("UPDATE accounts SET in_maintenance = ? WHERE name = ?")
            .bind(in_maintenance)
            .bind(name)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(format!("account {name}")));
        }
        Ok(())
    }

    async fn next_account_for_blob_sweep(
        &self,
        now: OffsetDateTime,
    ) -> MetadataResult<Option<AccountRow>> {
        let row = sqlx::query_as::<_, AccountRow>(
            "SELECT * FROM accounts
              WHERE next_blob_sweep_at IS NULL OR next_blob_sweep_at < ?
              ORDER BY next_blob_sweep_at IS NULL DESC, next_blob_sweep_at ASC
              LIMIT 1",
        )
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn set_next_blob_sweep_at(
        &self,
        name: &str,
        next: OffsetDateTime,
    ) -> MetadataResult<()> {
        sqlx::query("UPDATE accounts SET next_blob_sweep_at = ? WHERE name = ?")
            .bind(next)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_quota(&self, auth_tenant_id: &str) -> MetadataResult<Option<QuotaRow>> {
        let row = sqlx::query_as::<_, QuotaRow>("SELECT * FROM quotas WHERE auth_tenant_id = ?")
            .bind(auth_tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn set_quota(&self, quota: &QuotaRow) -> MetadataResult<()> {
        sqlx::query(
            "INSERT INTO quotas (auth_tenant_id, manifests) VALUES (?, ?)
             ON CONFLICT (auth_tenant_id) DO UPDATE SET manifests = excluded.manifests",
        )
        .bind(&quota.auth_tenant_id)
        .bind(quota.manifests)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn manifest_count_for_tenant(&self, auth_tenant_id: &str) -> MetadataResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM manifests m
              JOIN repos r ON m.repo_id = r.id
              JOIN accounts a ON r.account_name = a.name
              WHERE a.auth_tenant_id = ?",
        )
        .bind(auth_tenant_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }
}

#[async_trait]
impl RepositoryRepo for SqliteStore {
    async fn find_or_create_repository(
        &self,
        account_name: &str,
        name: &str,
    ) -> MetadataResult<RepositoryRow> {
        sqlx::query(
            "INSERT INTO repos (account_name, name) VALUES (?, ?)
             ON CONFLICT (account_name, name) DO NOTHING",
        )
        .bind(account_name)
        .bind(name)
        .execute(&self.pool)
        .await?;

        self.get_repository(account_name, name)
            .await?
            .ok_or_else(|| {
                MetadataError::Internal(format!("repo {account_name}/{name} vanished after insert"))
            })
    }

    async fn get_repository(
        &self,
        account_name: &str,
        name: &str,
    ) -> MetadataResult<Option<RepositoryRow>> {
        let row = sqlx::query_as::<_, RepositoryRow>(
            "SELECT * FROM repos WHERE account_name = ? AND name = ?",
        )
        .bind(account_name)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_repository_by_id(&self, id: i64) -> MetadataResult<Option<RepositoryRow>> {
        let row = sqlx::query_as::<_, RepositoryRow>("SELECT * FROM repos WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn next_repo_for_manifest_sync(
        &self,
        now: OffsetDateTime,
    ) -> MetadataResult<Option<RepositoryRow>> {
        let row = sqlx::query_as::<_, RepositoryRow>(
            "SELECT r.* FROM repos r
              JOIN accounts a ON r.account_name = a.name
              WHERE (r.next_manifest_sync_at IS NULL OR r.next_manifest_sync_at < ?)
                AND (a.upstream_peer_hostname != '' OR a.external_peer_url != '')
              ORDER BY r.next_manifest_sync_at IS NULL DESC, r.next_manifest_sync_at ASC
              LIMIT 1",
        )
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn set_next_manifest_sync_at(
        &self,
        repo_id: i64,
        next: OffsetDateTime,
    ) -> MetadataResult<()> {
        sqlx::query("UPDATE repos SET next_manifest_sync_at = ? WHERE id = ?")
            .bind(next)
            .bind(repo_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn next_repo_for_blob_mount_sweep(
        &self,
        now: OffsetDateTime,
    ) -> MetadataResult<Option<RepositoryRow>> {
        let row = sqlx::query_as::<_, RepositoryRow>(
            "SELECT * FROM repos
              WHERE next_blob_mount_sweep_at IS NULL OR next_blob_mount_sweep_at < ?
              ORDER BY next_blob_mount_sweep_at IS NULL DESC, next_blob_mount_sweep_at ASC
              LIMIT 1",
        )
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn set_next_blob_mount_sweep_at(
        &self,
        repo_id: i64,
        next: OffsetDateTime,
    ) -> MetadataResult<()> {
        sqlx::query("UPDATE repos SET next_blob_mount_sweep_at = ? WHERE id = ?")
            .bind(next)
            .bind(repo_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl BlobRepo for SqliteStore {
    async fn insert_blob(&self, blob: &BlobRow) -> MetadataResult<i64> {
        let result = sqlx::query(
            "INSERT INTO blobs (account_name, digest, size_bytes, storage_id,
                pushed_at, validated_at, validation_error_message)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (account_name, digest) DO NOTHING",
        )
        .bind(&blob.account_name)
        .bind(&blob.digest)
        .bind(blob.size_bytes)
        .bind(&blob.storage_id)
        .bind(blob.pushed_at)
        .bind(blob.validated_at)
        .bind(&blob.validation_error_message)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(result.last_insert_rowid());
        }
        let existing = self
            .get_blob(&blob.account_name, &blob.digest)
            .await?
            .ok_or_else(|| {
                MetadataError::Internal(format!("blob {} vanished after insert", blob.digest))
            })?;
        Ok(existing.id)
    }

    async fn try_reserve_blob(
        &self,
        account_name: &str,
        digest: &str,
        pushed_at: OffsetDateTime,
    ) -> MetadataResult<Option<i64>> {
        let result = sqlx::query(
            "INSERT INTO blobs (account_name, digest, storage_id, pushed_at, validated_at)
             VALUES (?, ?, '', ?, ?)
             ON CONFLICT (account_name, digest) DO NOTHING",
        )
        .bind(account_name)
        .bind(digest)
        .bind(pushed_at)
        .bind(pushed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            Ok(Some(result.last_insert_rowid()))
        } else {
            Ok(None)
        }
    }

    async fn get_blob(
        &self,
        account_name: &str,
        digest: &str,
    ) -> MetadataResult<Option<BlobRow>> {
        let row = sqlx::query_as::<_, BlobRow>(
            "SELECT * FROM blobs WHERE account_name = ? AND digest = ?",
        )
        .bind(account_name)
        .bind(digest)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_blob_in_repo(
        &self,
        repo_id: i64,
        digest: &str,
    ) -> MetadataResult<Option<BlobRow>> {
        let row = sqlx::query_as::<_, BlobRow>(
            "SELECT b.* FROM blobs b
              JOIN blob_mounts m ON b.id = m.blob_id
              WHERE m.repo_id = ? AND b.digest = ?",
        )
        .bind(repo_id)
        .bind(digest)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn mark_blob_materialized(
        &self,
        blob_id: i64,
        storage_id: &str,
        size_bytes: i64,
        validated_at: OffsetDateTime,
    ) -> MetadataResult<bool> {
        let result = sqlx::query(
            "UPDATE blobs SET storage_id = ?, size_bytes = ?, validated_at = ?,
                validation_error_message = ''
             WHERE id = ? AND storage_id = ''",
        )
        .bind(storage_id)
        .bind(size_bytes)
        .bind(validated_at)
        .bind(blob_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_blob(&self, blob_id: i64) -> MetadataResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM blob_mounts WHERE blob_id = ?")
            .bind(blob_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM blobs WHERE id = ?")
            .bind(blob_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn mount_blob(&self, blob_id: i64, repo_id: i64) -> MetadataResult<()> {
        sqlx::query("INSERT OR IGNORE INTO blob_mounts (blob_id, repo_id) VALUES (?, ?)")
            .bind(blob_id)
            .bind(repo_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn unmount_blob(&self, blob_id: i64, repo_id: i64) -> MetadataResult<bool> {
        let result = sqlx::query("DELETE FROM blob_mounts WHERE blob_id = ? AND repo_id = ?")
            .bind(blob_id)
            .bind(repo_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn unmount_unreferenced_blobs(&self, repo_id: i64) -> MetadataResult<u64> {
        let result = sqlx::query(
            "DELETE FROM blob_mounts
              WHERE repo_id = ?
                AND blob_id NOT IN (SELECT blob_id FROM manifest_blob_refs WHERE repo_id = ?)",
        )
        .bind(repo_id)
        .bind(repo_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn mark_unmounted_blobs(
        &self,
        account_name: &str,
        delete_at: OffsetDateTime,
    ) -> MetadataResult<u64> {
        let mut tx = self.pool.begin().await?;

        // a blob that regained a mount since the last sweep is no longer garbage
        sqlx::query(
            "UPDATE blobs SET can_be_deleted_at = NULL
              WHERE account_name = ? AND can_be_deleted_at IS NOT NULL
                AND id IN (SELECT blob_id FROM blob_mounts)",
        )
        .bind(account_name)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            "UPDATE blobs SET can_be_deleted_at = ?
              WHERE account_name = ? AND can_be_deleted_at IS NULL
                AND id NOT IN (SELECT blob_id FROM blob_mounts)",
        )
        .bind(delete_at)
        .bind(account_name)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn blobs_ready_for_deletion(
        &self,
        account_name: &str,
        now: OffsetDateTime,
    ) -> MetadataResult<Vec<BlobRow>> {
        let rows = sqlx::query_as::<_, BlobRow>(
            "SELECT * FROM blobs
              WHERE account_name = ? AND can_be_deleted_at IS NOT NULL AND can_be_deleted_at < ?
                AND id NOT IN (SELECT blob_id FROM blob_mounts)
              ORDER BY id",
        )
        .bind(account_name)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn blobs_for_manifest(
        &self,
        repo_id: i64,
        manifest_digest: &str,
    ) -> MetadataResult<Vec<BlobRow>> {
        let rows = sqlx::query_as::<_, BlobRow>(
            "SELECT b.* FROM blobs b
              JOIN manifest_blob_refs r ON b.id = r.blob_id
              WHERE r.repo_id = ? AND r.digest = ?
              ORDER BY b.id",
        )
        .bind(repo_id)
        .bind(manifest_digest)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn known_storage_ids(&self, account_name: &str) -> MetadataResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT storage_id FROM blobs WHERE account_name = ? AND storage_id != ''
             UNION
             SELECT u.storage_id FROM uploads u
              JOIN repos r ON u.repo_id = r.id
              WHERE r.account_name = ?",
        )
        .bind(account_name)
        .bind(account_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(s,)| s).collect())
    }

    async fn reconcile_unknown_blob_marks(
        &self,
        account_name: &str,
        orphan_storage_ids: &[String],
        delete_at: OffsetDateTime,
    ) -> MetadataResult<()> {
        let mut tx = self.pool.begin().await?;

        let marked: Vec<(String,)> =
            sqlx::query_as("SELECT storage_id FROM unknown_blobs WHERE account_name = ?")
                .bind(account_name)
                .fetch_all(&mut *tx)
                .await?;

        for (storage_id,) in &marked {
            if !orphan_storage_ids.contains(storage_id) {
                sqlx::query(
                    "DELETE FROM unknown_blobs WHERE account_name = ? AND storage_id = ?",
                )
                .bind(account_name)
                .bind(storage_id)
                .execute(&mut *tx)
                .await?;
            }
        }
        for storage_id in orphan_storage_ids {
            sqlx::query(
                "INSERT OR IGNORE INTO unknown_blobs (account_name, storage_id, can_be_deleted_at)
                 VALUES (?, ?, ?)",
            )
            .bind(account_name)
            .bind(storage_id)
            .bind(delete_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn unknown_blobs_ready_for_deletion(
        &self,
        account_name: &str,
        now: OffsetDateTime,
    ) -> MetadataResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT storage_id FROM unknown_blobs
              WHERE account_name = ? AND can_be_deleted_at < ?
              ORDER BY storage_id",
        )
        .bind(account_name)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(s,)| s).collect())
    }

    async fn delete_unknown_blob_mark(
        &self,
        account_name: &str,
        storage_id: &str,
    ) -> MetadataResult<()> {
        sqlx::query("DELETE FROM unknown_blobs WHERE account_name = ? AND storage_id = ?")
            .bind(account_name)
            .bind(storage_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ManifestRepo for SqliteStore {
    async fn get_manifest(
        &self,
        repo_id: i64,
        digest: &str,
    ) -> MetadataResult<Option<ManifestRow>> {
        let row = sqlx::query_as::<_, ManifestRow>(
            "SELECT * FROM manifests WHERE repo_id = ? AND digest = ?",
        )
        .bind(repo_id)
        .bind(digest)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_manifests(&self, repo_id: i64) -> MetadataResult<Vec<ManifestRow>> {
        let rows = sqlx::query_as::<_, ManifestRow>(
            "SELECT * FROM manifests WHERE repo_id = ? ORDER BY digest",
        )
        .bind(repo_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn delete_manifest(&self, repo_id: i64, digest: &str) -> MetadataResult<bool> {
        let result = sqlx::query("DELETE FROM manifests WHERE repo_id = ? AND digest = ?")
            .bind(repo_id)
            .bind(digest)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn manifest_manifest_refs(
        &self,
        repo_id: i64,
    ) -> MetadataResult<Vec<(String, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT parent_digest, child_digest FROM manifest_manifest_refs WHERE repo_id = ?",
        )
        .bind(repo_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn child_vuln_statuses(
        &self,
        repo_id: i64,
        parent_digest: &str,
    ) -> MetadataResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT m.vuln_status FROM manifests m
              JOIN manifest_manifest_refs r
                ON m.repo_id = r.repo_id AND m.digest = r.child_digest
              WHERE r.repo_id = ? AND r.parent_digest = ?",
        )
        .bind(repo_id)
        .bind(parent_digest)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(s,)| s).collect())
    }

    async fn next_manifest_for_validation(
        &self,
        success_cutoff: OffsetDateTime,
        error_cutoff: OffsetDateTime,
    ) -> MetadataResult<Option<ManifestRow>> {
        // oldest first, but always prefer to recheck a failed validation
        let row = sqlx::query_as::<_, ManifestRow>(
            "SELECT * FROM manifests
              WHERE validated_at < ? OR (validated_at < ? AND validation_error_message != '')
              ORDER BY validation_error_message != '' DESC, validated_at ASC
              LIMIT 1",
        )
        .bind(success_cutoff)
        .bind(error_cutoff)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn update_validation(
        &self,
        repo_id: i64,
        digest: &str,
        validated_at: OffsetDateTime,
        error_message: &str,
    ) -> MetadataResult<()> {
        sqlx::query(
            "UPDATE manifests SET validated_at = ?, validation_error_message = ?
              WHERE repo_id = ? AND digest = ?",
        )
        .bind(validated_at)
        .bind(error_message)
        .bind(repo_id)
        .bind(digest)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn next_manifest_for_vuln_check(
        &self,
        now: OffsetDateTime,
    ) -> MetadataResult<Option<ManifestRow>> {
        let row = sqlx::query_as::<_, ManifestRow>(
            "SELECT * FROM manifests
              WHERE next_vuln_check_at IS NULL OR next_vuln_check_at < ?
              ORDER BY next_vuln_check_at IS NULL DESC, next_vuln_check_at ASC
              LIMIT 1",
        )
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn update_vuln_status(
        &self,
        repo_id: i64,
        digest: &str,
        vuln_status: &str,
        next_check_at: OffsetDateTime,
    ) -> MetadataResult<()> {
        sqlx::query(
            "UPDATE manifests SET vuln_status = ?, next_vuln_check_at = ?
              WHERE repo_id = ? AND digest = ?",
        )
        .bind(vuln_status)
        .bind(next_check_at)
        .bind(repo_id)
        .bind(digest)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TagRepo for SqliteStore {
    async fn get_tag(&self, repo_id: i64, name: &str) -> MetadataResult<Option<TagRow>> {
        let row =
            sqlx::query_as::<_, TagRow>("SELECT * FROM tags WHERE repo_id = ? AND name = ?")
                .bind(repo_id)
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }

    async fn list_tag_names(
        &self,
        repo_id: i64,
        last: &str,
        limit: u32,
    ) -> MetadataResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM tags WHERE repo_id = ? AND name > ? ORDER BY name LIMIT ?",
        )
        .bind(repo_id)
        .bind(last)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(n,)| n).collect())
    }

    async fn tags_for_manifest(
        &self,
        repo_id: i64,
        digest: &str,
    ) -> MetadataResult<Vec<TagRow>> {
        let rows = sqlx::query_as::<_, TagRow>(
            "SELECT * FROM tags WHERE repo_id = ? AND digest = ? ORDER BY name",
        )
        .bind(repo_id)
        .bind(digest)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl UploadRepo for SqliteStore {
    async fn create_upload(&self, upload: &UploadRow) -> MetadataResult<()> {
        sqlx::query(
            "INSERT INTO uploads (id, repo_id, storage_id, size_bytes, digest, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(upload.id)
        .bind(upload.repo_id)
        .bind(&upload.storage_id)
        .bind(upload.size_bytes)
        .bind(&upload.digest)
        .bind(upload.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_upload(&self, id: uuid::Uuid) -> MetadataResult<Option<UploadRow>> {
        let row = sqlx::query_as::<_, UploadRow>("SELECT * FROM uploads WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn update_upload_progress(
        &self,
        id: uuid::Uuid,
        size_bytes: i64,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<()> {
        sqlx::query("UPDATE uploads SET size_bytes = ?, updated_at = ? WHERE id = ?")
            .bind(size_bytes)
            .bind(updated_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_upload(&self, id: uuid::Uuid) -> MetadataResult<()> {
        sqlx::query("DELETE FROM uploads WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn stale_uploads(
        &self,
        cutoff: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<UploadRow>> {
        let rows = sqlx::query_as::<_, UploadRow>(
            "SELECT * FROM uploads WHERE updated_at < ? ORDER BY updated_at LIMIT ?",
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

/// Transaction wrapper for manifest ingest.
///
/// Holds the single database connection for its whole lifetime, which under
/// SQLite gives the ingest serializable semantics against all other writers.
/// Dropping the wrapper without committing rolls everything back.
pub struct IngestTx {
    tx: Transaction<'static, Sqlite>,
}

impl IngestTx {
    /// Get a blob by digest, restricted to blobs mounted in the given repo.
    pub async fn get_blob_in_repo(
        &mut self,
        repo_id: i64,
        digest: &str,
    ) -> MetadataResult<Option<BlobRow>> {
        let row = sqlx::query_as::<_, BlobRow>(
            "SELECT b.* FROM blobs b
              JOIN blob_mounts m ON b.id = m.blob_id
              WHERE m.repo_id = ? AND b.digest = ?",
        )
        .bind(repo_id)
        .bind(digest)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    /// Get a blob by account and digest.
    pub async fn get_blob(
        &mut self,
        account_name: &str,
        digest: &str,
    ) -> MetadataResult<Option<BlobRow>> {
        let row = sqlx::query_as::<_, BlobRow>(
            "SELECT * FROM blobs WHERE account_name = ? AND digest = ?",
        )
        .bind(account_name)
        .bind(digest)
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(row)
    }

    /// Ensure a blob row exists for `(account, digest)`, reserving an empty
    /// one if necessary, and return its id. Used on the replica ingest path
    /// where referenced blobs are materialized later.
    pub async fn ensure_blob_reserved(
        &mut self,
        account_name: &str,
        digest: &str,
        pushed_at: OffsetDateTime,
    ) -> MetadataResult<i64> {
        let result = sqlx::query(
            "INSERT INTO blobs (account_name, digest, storage_id, pushed_at, validated_at)
             VALUES (?, ?, '', ?, ?)
             ON CONFLICT (account_name, digest) DO NOTHING",
        )
        .bind(account_name)
        .bind(digest)
        .bind(pushed_at)
        .bind(pushed_at)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(result.last_insert_rowid());
        }
        let (id,): (i64,) =
            sqlx::query_as("SELECT id FROM blobs WHERE account_name = ? AND digest = ?")
                .bind(account_name)
                .bind(digest)
                .fetch_one(&mut *self.tx)
                .await?;
        Ok(id)
    }

    /// Mount a blob into a repo. Mounting twice is a no-op.
    pub async fn mount_blob(&mut self, blob_id: i64, repo_id: i64) -> MetadataResult<()> {
        sqlx::query("INSERT OR IGNORE INTO blob_mounts (blob_id, repo_id) VALUES (?, ?)")
            .bind(blob_id)
            .bind(repo_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    /// Whether a manifest row exists.
    pub async fn manifest_exists(&mut self, repo_id: i64, digest: &str) -> MetadataResult<bool> {
        let row: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM manifests WHERE repo_id = ? AND digest = ?")
                .bind(repo_id)
                .bind(digest)
                .fetch_optional(&mut *self.tx)
                .await?;
        Ok(row.is_some())
    }

    /// Insert a manifest row if it is not present yet. Idempotent on
    /// `(repo_id, digest)`; returns whether a row was created.
    pub async fn insert_manifest_if_missing(
        &mut self,
        manifest: &ManifestRow,
    ) -> MetadataResult<bool> {
        let result = sqlx::query(
            "INSERT INTO manifests (repo_id, digest, media_type, size_bytes,
                pushed_at, validated_at, validation_error_message, next_vuln_check_at, vuln_status)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (repo_id, digest) DO NOTHING",
        )
        .bind(manifest.repo_id)
        .bind(&manifest.digest)
        .bind(&manifest.media_type)
        .bind(manifest.size_bytes)
        .bind(manifest.pushed_at)
        .bind(manifest.validated_at)
        .bind(&manifest.validation_error_message)
        .bind(manifest.next_vuln_check_at)
        .bind(&manifest.vuln_status)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record that the manifest references a blob.
    pub async fn insert_manifest_blob_ref(
        &mut self,
        repo_id: i64,
        digest: &str,
        blob_id: i64,
    ) -> MetadataResult<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO manifest_blob_refs (repo_id, digest, blob_id) VALUES (?, ?, ?)",
        )
        .bind(repo_id)
        .bind(digest)
        .bind(blob_id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    /// Record that the manifest list references a child manifest.
    pub async fn insert_manifest_manifest_ref(
        &mut self,
        repo_id: i64,
        parent_digest: &str,
        child_digest: &str,
    ) -> MetadataResult<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO manifest_manifest_refs (repo_id, parent_digest, child_digest)
             VALUES (?, ?, ?)",
        )
        .bind(repo_id)
        .bind(parent_digest)
        .bind(child_digest)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    /// Create or move a tag. Readers observe either the old or the new
    /// mapping, never a half-applied one.
    pub async fn upsert_tag(
        &mut self,
        repo_id: i64,
        name: &str,
        digest: &str,
        pushed_at: OffsetDateTime,
    ) -> MetadataResult<()> {
        sqlx::query(
            "INSERT INTO tags (repo_id, name, digest, pushed_at) VALUES (?, ?, ?, ?)
             ON CONFLICT (repo_id, name) DO UPDATE SET
                digest = excluded.digest, pushed_at = excluded.pushed_at",
        )
        .bind(repo_id)
        .bind(name)
        .bind(digest)
        .bind(pushed_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    /// Commit. The storage write belonging to this ingest must have succeeded
    /// before this is called.
    pub async fn commit(self) -> MetadataResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn test_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta.db");
        let store = SqliteStore::new(path.to_str().unwrap()).await.unwrap();
        (dir, store)
    }

    fn test_account(name: &str) -> AccountRow {
        AccountRow {
            name: name.to_string(),
            auth_tenant_id: "tenant1".to_string(),
            upstream_peer_hostname: String::new(),
            external_peer_url: String::new(),
            required_labels: String::new(),
            in_maintenance: false,
            next_blob_sweep_at: None,
        }
    }

    fn test_blob(account: &str, digest: &str) -> BlobRow {
        let now = OffsetDateTime::now_utc();
        BlobRow {
            id: 0,
            account_name: account.to_string(),
            digest: digest.to_string(),
            size_bytes: 4,
            storage_id: "sid".to_string(),
            pushed_at: now,
            validated_at: now,
            validation_error_message: String::new(),
            can_be_deleted_at: None,
        }
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let (_dir, store) = test_store().await;
        MetadataStore::migrate(&store).await.unwrap();
        store.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn test_find_or_create_repository_is_idempotent() {
        let (_dir, store) = test_store().await;
        store.create_account(&test_account("acct")).await.unwrap();

        let r1 = store.find_or_create_repository("acct", "app").await.unwrap();
        let r2 = store.find_or_create_repository("acct", "app").await.unwrap();
        assert_eq!(r1.id, r2.id);
        assert_eq!(r1.full_name(), "acct/app");
    }

    #[tokio::test]
    async fn test_blob_reservation_single_flight() {
        let (_dir, store) = test_store().await;
        store.create_account(&test_account("acct")).await.unwrap();
        let now = OffsetDateTime::now_utc();

        let first = store
            .try_reserve_blob("acct", "sha256:aaaa", now)
            .await
            .unwrap();
        assert!(first.is_some());
        let second = store
            .try_reserve_blob("acct", "sha256:aaaa", now)
            .await
            .unwrap();
        assert!(second.is_none());

        let blob = store.get_blob("acct", "sha256:aaaa").await.unwrap().unwrap();
        assert_eq!(blob.storage_id, "");
    }

    #[tokio::test]
    async fn test_tag_pagination() {
        let (_dir, store) = test_store().await;
        store.create_account(&test_account("acct")).await.unwrap();
        let repo = store.find_or_create_repository("acct", "app").await.unwrap();
        let now = OffsetDateTime::now_utc();

        let digest = "sha256:cafe";
        let mut tx = store.begin_ingest().await.unwrap();
        tx.insert_manifest_if_missing(&ManifestRow {
            repo_id: repo.id,
            digest: digest.to_string(),
            media_type: "application/vnd.oci.image.manifest.v1+json".to_string(),
            size_bytes: 10,
            pushed_at: now,
            validated_at: now,
            validation_error_message: String::new(),
            next_vuln_check_at: None,
            vuln_status: "Pending".to_string(),
        })
        .await
        .unwrap();
        for name in ["v1", "v3", "v2"] {
            tx.upsert_tag(repo.id, name, digest, now).await.unwrap();
        }
        tx.commit().await.unwrap();

        let all = store.list_tag_names(repo.id, "", 10).await.unwrap();
        assert_eq!(all, vec!["v1", "v2", "v3"]);
        let page = store.list_tag_names(repo.id, "v1", 1).await.unwrap();
        assert_eq!(page, vec!["v2"]);
        let empty = store.list_tag_names(repo.id, "v3", 10).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_blob_mount_gc_cycle() {
        let (_dir, store) = test_store().await;
        store.create_account(&test_account("acct")).await.unwrap();
        let repo = store.find_or_create_repository("acct", "app").await.unwrap();

        let blob_id = store.insert_blob(&test_blob("acct", "sha256:bb")).await.unwrap();
        store.mount_blob(blob_id, repo.id).await.unwrap();

        // nothing references the mount, so the sweep removes it
        let removed = store.unmount_unreferenced_blobs(repo.id).await.unwrap();
        assert_eq!(removed, 1);

        let now = OffsetDateTime::now_utc();
        let marked = store
            .mark_unmounted_blobs("acct", now - time::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(marked, 1);

        let ready = store.blobs_ready_for_deletion("acct", now).await.unwrap();
        assert_eq!(ready.len(), 1);
        store.delete_blob(ready[0].id).await.unwrap();
        assert!(store.get_blob("acct", "sha256:bb").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deleting_referenced_child_manifest_fails() {
        let (_dir, store) = test_store().await;
        store.create_account(&test_account("acct")).await.unwrap();
        let repo = store.find_or_create_repository("acct", "app").await.unwrap();
        let now = OffsetDateTime::now_utc();

        let mut tx = store.begin_ingest().await.unwrap();
        for digest in ["sha256:child", "sha256:parent"] {
            tx.insert_manifest_if_missing(&ManifestRow {
                repo_id: repo.id,
                digest: digest.to_string(),
                media_type: "application/vnd.oci.image.index.v1+json".to_string(),
                size_bytes: 10,
                pushed_at: now,
                validated_at: now,
                validation_error_message: String::new(),
                next_vuln_check_at: None,
                vuln_status: "Pending".to_string(),
            })
            .await
            .unwrap();
        }
        tx.insert_manifest_manifest_ref(repo.id, "sha256:parent", "sha256:child")
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let err = store.delete_manifest(repo.id, "sha256:child").await.unwrap_err();
        assert!(matches!(err, MetadataError::Constraint(_)));

        // parent first, then the child goes through
        assert!(store.delete_manifest(repo.id, "sha256:parent").await.unwrap());
        assert!(store.delete_manifest(repo.id, "sha256:child").await.unwrap());
    }
}
