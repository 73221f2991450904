//! Catalog store: typed access to the anchor map and related entities
//!
//! Values are self-describing JSON behind a stable key schema. The key
//! formats are an operational contract (operators inspect them out of
//! band):
//!
//! | Entity        | Key                                  | TTL              |
//! |---------------|--------------------------------------|------------------|
//! | Anchor WIFI   | `wifi:<bssid>`                       | 30 days          |
//! | Anchor CELL   | `cell:<cellid>:<lac>`                | 30 days          |
//! | Anchor BLE    | `bt:<mac>`                           | 30 days          |
//! | Observation   | `observation:<object>:<type>:<id>`   | TimeWindowHours  |
//! | Device last   | `device:<id>:last_known`             | 7 days           |
//! | Companion set | `companions:<object>`                | none             |
//! | Absolute      | `absolute:<type>:<id>`               | until expires_at |
//!
//! Writes are last-writer-wins; there is no compare-and-swap. Lost updates
//! between concurrent writers are tolerated: anchors are statistical and
//! converge under subsequent reports.

pub mod kv;
pub mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use coordcheck_common::model::{
    AbsoluteOverride, Anchor, CompanionEntry, DeviceLastPosition, ObservationAggregate, SourceRef,
    SourceType,
};
use coordcheck_common::{time, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use kv::{KvCache, MemoryCache};
pub use sqlite::SqliteCache;

/// Anchor lifetime in the catalog
pub const ANCHOR_TTL: Duration = Duration::from_secs(30 * 24 * 3600);
/// Device last-known-position lifetime
pub const DEVICE_LAST_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Typed catalog over a [`KvCache`] backend
pub struct CatalogStore {
    kv: Arc<dyn KvCache>,
}

impl CatalogStore {
    pub fn new(kv: Arc<dyn KvCache>) -> Self {
        Self { kv }
    }

    // ------------------------------------------------------------------
    // Key schema
    // ------------------------------------------------------------------

    /// Anchor key: `wifi:<bssid>` / `cell:<cellid>:<lac>` / `bt:<mac>`
    pub fn anchor_key(source: &SourceRef) -> String {
        match source.source_type {
            SourceType::Wifi => format!("wifi:{}", source.source_id),
            SourceType::Cell => format!("cell:{}", source.source_id),
            SourceType::Ble => format!("bt:{}", source.source_id),
        }
    }

    fn observation_key(object_id: &str, source: &SourceRef) -> String {
        format!(
            "observation:{}:{}:{}",
            object_id,
            source.source_type.as_key_token(),
            source.source_id
        )
    }

    fn device_key(device_id: &str) -> String {
        format!("device:{}:last_known", device_id)
    }

    fn companions_key(object_id: &str) -> String {
        format!("companions:{}", object_id)
    }

    fn absolute_key(source: &SourceRef) -> String {
        format!(
            "absolute:{}:{}",
            source.source_type.as_key_token(),
            source.source_id
        )
    }

    // ------------------------------------------------------------------
    // JSON plumbing
    // ------------------------------------------------------------------

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.kv.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.kv.set(key, &raw, ttl).await
    }

    // ------------------------------------------------------------------
    // Anchors
    // ------------------------------------------------------------------

    pub async fn get_anchor(&self, source: &SourceRef) -> Result<Option<Anchor>> {
        self.get_json(&Self::anchor_key(source)).await
    }

    pub async fn put_anchor(&self, source: &SourceRef, anchor: &Anchor) -> Result<()> {
        self.set_json(&Self::anchor_key(source), anchor, Some(ANCHOR_TTL))
            .await
    }

    /// Batch anchor fetch for hot paths, preserving input order
    ///
    /// A slot is `None` for unknown sources; a corrupt stored value is also
    /// treated as a miss rather than failing the whole batch.
    pub async fn mget_anchors(&self, sources: &[SourceRef]) -> Result<Vec<Option<Anchor>>> {
        let keys: Vec<String> = sources.iter().map(Self::anchor_key).collect();
        let raw = self.kv.mget(&keys).await?;
        Ok(raw
            .into_iter()
            .map(|slot| slot.and_then(|s| serde_json::from_str(&s).ok()))
            .collect())
    }

    // ------------------------------------------------------------------
    // Observation aggregates
    // ------------------------------------------------------------------

    pub async fn get_observation(
        &self,
        object_id: &str,
        source: &SourceRef,
    ) -> Result<Option<ObservationAggregate>> {
        self.get_json(&Self::observation_key(object_id, source))
            .await
    }

    pub async fn put_observation(
        &self,
        aggregate: &ObservationAggregate,
        window: Duration,
    ) -> Result<()> {
        let source = SourceRef {
            source_type: aggregate.source_type,
            source_id: aggregate.source_id.clone(),
        };
        self.set_json(
            &Self::observation_key(&aggregate.object_id, &source),
            aggregate,
            Some(window),
        )
        .await
    }

    // ------------------------------------------------------------------
    // Device last-known position
    // ------------------------------------------------------------------

    pub async fn get_last_position(&self, device_id: &str) -> Result<Option<DeviceLastPosition>> {
        self.get_json(&Self::device_key(device_id)).await
    }

    pub async fn put_last_position(
        &self,
        device_id: &str,
        position: &DeviceLastPosition,
    ) -> Result<()> {
        self.set_json(&Self::device_key(device_id), position, Some(DEVICE_LAST_TTL))
            .await
    }

    // ------------------------------------------------------------------
    // Companion sets
    // ------------------------------------------------------------------

    pub async fn get_companions(&self, object_id: &str) -> Result<Vec<CompanionEntry>> {
        Ok(self
            .get_json(&Self::companions_key(object_id))
            .await?
            .unwrap_or_default())
    }

    /// Add a source to the object's companion set if not already present
    pub async fn add_companion(&self, object_id: &str, source: &SourceRef) -> Result<()> {
        let mut companions = self.get_companions(object_id).await?;
        let already = companions
            .iter()
            .any(|c| c.source_type == source.source_type && c.source_id == source.source_id);
        if already {
            return Ok(());
        }
        companions.push(CompanionEntry {
            source_type: source.source_type,
            source_id: source.source_id.clone(),
            first_seen: time::now(),
        });
        self.set_json(&Self::companions_key(object_id), &companions, None)
            .await
    }

    // ------------------------------------------------------------------
    // Absolute overrides
    // ------------------------------------------------------------------

    pub async fn get_absolute(&self, source: &SourceRef) -> Result<Option<AbsoluteOverride>> {
        self.get_json(&Self::absolute_key(source)).await
    }

    /// Store an operator override; the TTL derives from `expires_at` and a
    /// write with non-positive remaining lifetime is silently discarded
    pub async fn put_absolute(
        &self,
        source: &SourceRef,
        absolute: &AbsoluteOverride,
    ) -> Result<()> {
        let remaining = absolute.expires_at.timestamp() - time::unix_now();
        if remaining <= 0 {
            return Ok(());
        }
        self.set_json(
            &Self::absolute_key(source),
            absolute,
            Some(Duration::from_secs(remaining as u64)),
        )
        .await
    }

    pub async fn delete_absolute(&self, source: &SourceRef) -> Result<()> {
        self.kv.delete(&Self::absolute_key(source)).await
    }
}
