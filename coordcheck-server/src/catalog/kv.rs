//! Key/value cache contract and the in-process implementation
//!
//! The catalog consumes its backing store through this trait. The contract
//! mirrors a networked cache: values are strings, entries may carry a TTL,
//! a missing key is `Ok(None)` (never an error), writes are
//! last-writer-wins, and `mget` preserves input order with a per-slot
//! sentinel for misses.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use coordcheck_common::Result;
use tokio::sync::RwLock;

#[async_trait]
pub trait KvCache: Send + Sync {
    /// Fetch one value; `Ok(None)` means the key is absent or expired
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store one value, replacing any existing entry
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Remove one key; absent keys are not an error
    async fn delete(&self, key: &str) -> Result<()>;

    /// Fetch many values, preserving input order; misses are `None`
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>>;
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.map(|t| Instant::now() < t).unwrap_or(true)
    }
}

/// In-process cache used for tests and standalone operation
///
/// Expired entries are dropped lazily on read and swept opportunistically
/// on write, keeping reads on the shared lock.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| e.live())
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.retain(|_, e| e.live());
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>> {
        let entries = self.entries.read().await;
        Ok(keys
            .iter()
            .map(|k| {
                entries
                    .get(k)
                    .filter(|e| e.live())
                    .map(|e| e.value.clone())
            })
            .collect())
    }
}
