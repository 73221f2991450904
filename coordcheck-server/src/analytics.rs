//! Analytics store contract and implementations
//!
//! The analytics store is an append sink: batched inserts of verdict
//! records and per-source statistics. Writes are best-effort; a failed
//! batch is logged and discarded by the caller, never retried.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use coordcheck_common::model::{PointStatsRecord, VerdictRecord};
use coordcheck_common::{Error, Result};
use sqlx::SqlitePool;
use tracing::info;

#[async_trait]
pub trait AnalyticsStore: Send + Sync {
    /// Append a batch of verdict records, preserving slice order
    async fn insert_verdicts(&self, records: &[VerdictRecord]) -> Result<()>;

    /// Append a batch of per-source statistics rows
    async fn insert_point_stats(&self, records: &[PointStatsRecord]) -> Result<()>;
}

/// SQLite-backed analytics store
pub struct SqliteAnalytics {
    pool: SqlitePool,
}

impl SqliteAnalytics {
    /// Open (creating if needed) the analytics database at `path`
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db_url = format!("sqlite://{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&db_url).await?;
        info!("Opened analytics database: {}", path.display());

        sqlx::query("PRAGMA busy_timeout = 5000")
            .execute(&pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS validation_requests (
                device_id TEXT NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                accuracy REAL NOT NULL,
                timestamp INTEGER NOT NULL,
                has_wifi INTEGER NOT NULL,
                has_bt INTEGER NOT NULL,
                has_cell INTEGER NOT NULL,
                result TEXT NOT NULL,
                confidence REAL NOT NULL,
                flow_type TEXT NOT NULL,
                insert_time TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS source_stats (
                type TEXT NOT NULL,
                point_id TEXT NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                observations INTEGER NOT NULL,
                last_updated TEXT NOT NULL
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

#[async_trait]
impl AnalyticsStore for SqliteAnalytics {
    async fn insert_verdicts(&self, records: &[VerdictRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for r in records {
            sqlx::query(
                r#"
                INSERT INTO validation_requests (
                    device_id, latitude, longitude, accuracy, timestamp,
                    has_wifi, has_bt, has_cell, result, confidence, flow_type, insert_time
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&r.device_id)
            .bind(r.latitude)
            .bind(r.longitude)
            .bind(r.accuracy)
            .bind(r.timestamp)
            .bind(r.has_wifi)
            .bind(r.has_bt)
            .bind(r.has_cell)
            .bind(r.verdict.as_str())
            .bind(r.confidence)
            .bind(&r.flow_type)
            .bind(r.insert_time.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_point_stats(&self, records: &[PointStatsRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for r in records {
            sqlx::query(
                r#"
                INSERT INTO source_stats (
                    type, point_id, latitude, longitude, observations, last_updated
                ) VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(r.source_type.as_key_token())
            .bind(&r.source_id)
            .bind(r.latitude)
            .bind(r.longitude)
            .bind(r.observations)
            .bind(r.last_updated.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

/// In-memory analytics store for tests and standalone operation
#[derive(Default)]
pub struct MemoryAnalytics {
    verdicts: Mutex<Vec<VerdictRecord>>,
    point_stats: Mutex<Vec<PointStatsRecord>>,
    fail_writes: AtomicBool,
}

impl MemoryAnalytics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent inserts fail, to exercise best-effort paths
    pub fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }

    pub fn verdicts(&self) -> Vec<VerdictRecord> {
        self.verdicts.lock().expect("verdicts lock poisoned").clone()
    }

    pub fn point_stats(&self) -> Vec<PointStatsRecord> {
        self.point_stats
            .lock()
            .expect("point stats lock poisoned")
            .clone()
    }
}

#[async_trait]
impl AnalyticsStore for MemoryAnalytics {
    async fn insert_verdicts(&self, records: &[VerdictRecord]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Internal("analytics store unavailable".into()));
        }
        self.verdicts
            .lock()
            .expect("verdicts lock poisoned")
            .extend_from_slice(records);
        Ok(())
    }

    async fn insert_point_stats(&self, records: &[PointStatsRecord]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Internal("analytics store unavailable".into()));
        }
        self.point_stats
            .lock()
            .expect("point stats lock poisoned")
            .extend_from_slice(records);
        Ok(())
    }
}
