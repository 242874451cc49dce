//! SQLite-backed shared key pool using sqlx.
//!
//! Schema:
//! - `pool_keys(api_key PK, label, exhausted_until, lease_count, last_leased_at, created_at)`
//! - `job_keys(job_id PK, key_fingerprint, reported_at)`
//!
//! Every process pointed at the same database file draws from the same pool.
//! Leasing is a single `UPDATE … RETURNING` statement so selection and the
//! lease counter bump happen atomically under SQLite's write lock.

use crate::KeyInfo;
use async_trait::async_trait;
use rendergate_types::{ApiKey, JobRef, JobReporter, KeyPool, traits::Result};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::str::FromStr;
use std::time::Duration;

/// A persistent [`KeyPool`] and [`JobReporter`] backed by `SQLite`.
pub struct SqliteKeyPool {
    /// Connection pool to the `SQLite` database.
    pool: SqlitePool,
    /// Cooldown applied by [`KeyPool::mark_exhausted`].
    cooldown: Duration,
}

impl SqliteKeyPool {
    /// Connects to a `SQLite` database (e.g. `"sqlite:./pool.db"` or `"sqlite::memory:"`).
    ///
    /// Automatically creates the database file if it does not exist and runs
    /// migrations to create the schema.
    ///
    /// # Errors
    ///
    /// Returns a [`sqlx::Error`] if the connection or table creation fails.
    pub async fn new(
        database_url: &str,
        cooldown: Duration,
    ) -> std::result::Result<Self, sqlx::Error> {
        let in_memory = database_url.contains(":memory:");
        let mut opts = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            opts = opts.journal_mode(SqliteJournalMode::Wal);
        }
        // Each in-memory connection is its own database.
        let mut pool_opts = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            pool_opts = pool_opts.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_opts
            .connect_with(opts)
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool, cooldown })
    }

    /// Run schema migrations (idempotent).
    async fn migrate(pool: &SqlitePool) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS pool_keys (
                api_key         TEXT    PRIMARY KEY,
                label           TEXT,
                exhausted_until INTEGER,
                lease_count     INTEGER NOT NULL DEFAULT 0,
                last_leased_at  INTEGER,
                created_at      INTEGER NOT NULL DEFAULT (unixepoch())
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS job_keys (
                job_id          TEXT    PRIMARY KEY,
                key_fingerprint TEXT    NOT NULL,
                reported_at     INTEGER NOT NULL DEFAULT (unixepoch())
            )",
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Adds a key, or updates the label of an existing one.
    ///
    /// # Errors
    ///
    /// Returns `GenError::Storage` on database failure.
    pub async fn add_key(&self, key: &ApiKey, label: Option<&str>) -> Result<()> {
        sqlx::query(
            "INSERT INTO pool_keys (api_key, label) VALUES (?, ?)
             ON CONFLICT(api_key) DO UPDATE SET
                 label = COALESCE(excluded.label, pool_keys.label)",
        )
        .bind(key.expose())
        .bind(label)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Removes a key. Returns `true` if it was present.
    ///
    /// # Errors
    ///
    /// Returns `GenError::Storage` on database failure.
    pub async fn remove_key(&self, key: &ApiKey) -> Result<bool> {
        let res = sqlx::query("DELETE FROM pool_keys WHERE api_key = ?")
            .bind(key.expose())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Lists the pool with fingerprints only.
    ///
    /// # Errors
    ///
    /// Returns `GenError::Storage` on database failure.
    pub async fn list_keys(&self) -> Result<Vec<KeyInfo>> {
        let rows: Vec<(String, Option<String>, bool, i64)> = sqlx::query_as(
            "SELECT api_key, label,
                    exhausted_until IS NOT NULL AND exhausted_until > unixepoch(),
                    lease_count
             FROM pool_keys ORDER BY created_at, api_key",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(key, label, exhausted, lease_count)| KeyInfo {
                fingerprint: ApiKey::from(key).fingerprint(),
                label,
                exhausted,
                lease_count: u64::try_from(lease_count).unwrap_or(0),
            })
            .collect())
    }

    /// Clears every cooldown. Returns the number of keys put back into rotation.
    ///
    /// # Errors
    ///
    /// Returns `GenError::Storage` on database failure.
    pub async fn reset_exhausted(&self) -> Result<u64> {
        let res = sqlx::query(
            "UPDATE pool_keys SET exhausted_until = NULL WHERE exhausted_until IS NOT NULL",
        )
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    /// Fingerprint of the key that last serviced `job`.
    ///
    /// # Errors
    ///
    /// Returns `GenError::Storage` on database failure.
    pub async fn job_key(&self, job: &JobRef) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT key_fingerprint FROM job_keys WHERE job_id = ?")
                .bind(job.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(fp,)| fp))
    }

    fn cooldown_secs(&self) -> i64 {
        i64::try_from(self.cooldown.as_secs()).unwrap_or(i64::MAX)
    }
}

#[async_trait]
impl KeyPool for SqliteKeyPool {
    async fn lease(&self) -> Result<Option<ApiKey>> {
        let row: Option<(String,)> = sqlx::query_as(
            "UPDATE pool_keys
             SET lease_count = lease_count + 1, last_leased_at = unixepoch()
             WHERE api_key = (
                 SELECT api_key FROM pool_keys
                 WHERE exhausted_until IS NULL OR exhausted_until <= unixepoch()
                 ORDER BY RANDOM() LIMIT 1
             )
             RETURNING api_key",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(key,)| ApiKey::from(key)))
    }

    async fn mark_exhausted(&self, key: &ApiKey) -> Result<()> {
        sqlx::query("UPDATE pool_keys SET exhausted_until = unixepoch() + ? WHERE api_key = ?")
            .bind(self.cooldown_secs())
            .bind(key.expose())
            .execute(&self.pool)
            .await?;
        tracing::debug!(key = %key, cooldown = ?self.cooldown, "key marked exhausted");
        Ok(())
    }
}

#[async_trait]
impl JobReporter for SqliteKeyPool {
    async fn report_key_for_job(&self, job: &JobRef, key: &ApiKey) -> Result<()> {
        sqlx::query(
            "INSERT INTO job_keys (job_id, key_fingerprint) VALUES (?, ?)
             ON CONFLICT(job_id) DO UPDATE SET
                 key_fingerprint = excluded.key_fingerprint,
                 reported_at = unixepoch()",
        )
        .bind(job.as_str())
        .bind(key.fingerprint())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn mem(cooldown_secs: u64) -> SqliteKeyPool {
        SqliteKeyPool::new("sqlite::memory:", Duration::from_secs(cooldown_secs))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_lease_empty() {
        let p = mem(60).await;
        assert!(p.lease().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_add_and_lease() {
        let p = mem(60).await;
        p.add_key(&ApiKey::new("AIza-key-0001"), Some("team-a"))
            .await
            .unwrap();
        let key = p.lease().await.unwrap().unwrap();
        assert_eq!(key.expose(), "AIza-key-0001");
    }

    #[tokio::test]
    async fn test_exhausted_key_not_leased() {
        let p = mem(3600).await;
        let a = ApiKey::new("key-a");
        let b = ApiKey::new("key-b");
        p.add_key(&a, None).await.unwrap();
        p.add_key(&b, None).await.unwrap();
        p.mark_exhausted(&a).await.unwrap();
        for _ in 0..10 {
            assert_eq!(p.lease().await.unwrap().unwrap(), b);
        }
        p.mark_exhausted(&b).await.unwrap();
        assert!(p.lease().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_zero_cooldown_returns_immediately() {
        let p = mem(0).await;
        let a = ApiKey::new("key-a");
        p.add_key(&a, None).await.unwrap();
        p.mark_exhausted(&a).await.unwrap();
        assert_eq!(p.lease().await.unwrap(), Some(a));
    }

    #[tokio::test]
    async fn test_mark_exhausted_idempotent() {
        let p = mem(3600).await;
        let a = ApiKey::new("key-a");
        p.add_key(&a, None).await.unwrap();
        p.mark_exhausted(&a).await.unwrap();
        p.mark_exhausted(&a).await.unwrap();
        p.mark_exhausted(&ApiKey::new("unknown")).await.unwrap();
        let keys = p.list_keys().await.unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].exhausted);
    }

    #[tokio::test]
    async fn test_list_keys_counts_leases_and_hides_secret() {
        let p = mem(60).await;
        p.add_key(&ApiKey::new("secret-value-9876"), Some("ops"))
            .await
            .unwrap();
        p.lease().await.unwrap();
        p.lease().await.unwrap();
        let keys = p.list_keys().await.unwrap();
        assert_eq!(keys[0].fingerprint, "…9876");
        assert_eq!(keys[0].label.as_deref(), Some("ops"));
        assert_eq!(keys[0].lease_count, 2);
        assert!(!keys[0].exhausted);
    }

    #[tokio::test]
    async fn test_add_key_keeps_label_on_conflict() {
        let p = mem(60).await;
        let k = ApiKey::new("key-a");
        p.add_key(&k, Some("first")).await.unwrap();
        p.add_key(&k, None).await.unwrap();
        let keys = p.list_keys().await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].label.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_remove_key() {
        let p = mem(60).await;
        let k = ApiKey::new("key-a");
        p.add_key(&k, None).await.unwrap();
        assert!(p.remove_key(&k).await.unwrap());
        assert!(!p.remove_key(&k).await.unwrap());
        assert!(p.lease().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reset_exhausted() {
        let p = mem(3600).await;
        let k = ApiKey::new("key-a");
        p.add_key(&k, None).await.unwrap();
        p.mark_exhausted(&k).await.unwrap();
        assert_eq!(p.reset_exhausted().await.unwrap(), 1);
        assert_eq!(p.lease().await.unwrap(), Some(k));
    }

    #[tokio::test]
    async fn test_job_report_roundtrip() {
        let p = mem(60).await;
        let job = JobRef::new("job-7");
        p.report_key_for_job(&job, &ApiKey::new("abcd-1111"))
            .await
            .unwrap();
        p.report_key_for_job(&job, &ApiKey::new("abcd-2222"))
            .await
            .unwrap();
        assert_eq!(p.job_key(&job).await.unwrap().as_deref(), Some("…2222"));
        assert!(p.job_key(&JobRef::new("missing")).await.unwrap().is_none());
    }
}
