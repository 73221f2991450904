//! Durable key/value cache over SQLite
//!
//! One `catalog_kv` table with an optional unix-seconds expiry column.
//! Expired rows are treated as missing on read and cleaned up in place;
//! TTL resolution is one second, which is ample for day-scale catalog
//! lifetimes.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use coordcheck_common::Result;
use sqlx::SqlitePool;
use tracing::info;

use super::kv::KvCache;

pub struct SqliteCache {
    pool: SqlitePool,
}

impl SqliteCache {
    /// Open (creating if needed) the catalog database at `path`
    pub async fn open(path: &Path) -> Result<Self> {
        let newly_created = !path.exists();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db_url = format!("sqlite://{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&db_url).await?;

        if newly_created {
            info!("Initialized new catalog database: {}", path.display());
        } else {
            info!("Opened existing catalog database: {}", path.display());
        }

        sqlx::query("PRAGMA busy_timeout = 5000")
            .execute(&pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS catalog_kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn unix_now() -> i64 {
    coordcheck_common::time::unix_now()
}

#[async_trait]
impl KvCache for SqliteCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String, Option<i64>)> =
            sqlx::query_as("SELECT value, expires_at FROM catalog_kv WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((value, expires_at)) => {
                if let Some(at) = expires_at {
                    if at <= unix_now() {
                        sqlx::query("DELETE FROM catalog_kv WHERE key = ?")
                            .bind(key)
                            .execute(&self.pool)
                            .await?;
                        return Ok(None);
                    }
                }
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|d| unix_now() + d.as_secs() as i64);
        sqlx::query(
            r#"
            INSERT INTO catalog_kv (key, value, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM catalog_kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        // Sequential point reads keep the input order contract simple; the
        // pool round-trips are local file reads
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_cache() -> (tempfile::TempDir, SqliteCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = SqliteCache::open(&dir.path().join("catalog.db"))
            .await
            .unwrap();
        (dir, cache)
    }

    #[tokio::test]
    async fn test_roundtrip_and_missing() {
        let (_dir, cache) = temp_cache().await;

        assert_eq!(cache.get("absent").await.unwrap(), None);

        cache.set("wifi:aa:bb", "{\"lat\":1.0}", None).await.unwrap();
        assert_eq!(
            cache.get("wifi:aa:bb").await.unwrap().as_deref(),
            Some("{\"lat\":1.0}")
        );
    }

    #[tokio::test]
    async fn test_expired_entry_reads_as_missing() {
        let (_dir, cache) = temp_cache().await;

        // Zero TTL expires within the same second boundary check
        cache
            .set("gone", "v", Some(Duration::from_secs(0)))
            .await
            .unwrap();
        assert_eq!(cache.get("gone").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_mget_order() {
        let (_dir, cache) = temp_cache().await;
        cache.set("k1", "a", None).await.unwrap();
        cache.set("k3", "c", None).await.unwrap();

        let got = cache
            .mget(&["k1".into(), "k2".into(), "k3".into()])
            .await
            .unwrap();
        assert_eq!(got, vec![Some("a".into()), None, Some("c".into())]);
    }
}
