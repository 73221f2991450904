//! Validation engine: layered plausibility checks for position reports
//!
//! Layer 1 rejects reports from the future or older than the configured
//! window. Layer 2 checks kinematic plausibility against the device's last
//! accepted position (great-circle distance over elapsed time). Layer 3
//! corroborates the report against the learned anchor catalog: every known
//! source raises confidence, every unknown source is handed back to the
//! caller for background learning.
//!
//! The engine itself performs no writes; the facade schedules side effects
//! from the returned outcome so that cancellation of a request never
//! leaves a half-applied update.

use std::sync::Arc;

use coordcheck_common::model::{
    Anchor, AnchorKind, PositionReport, SourceRef, ValidateResponse, Verdict,
};
use coordcheck_common::params::ConfigRegistry;
use coordcheck_common::{time, Result};

use crate::catalog::CatalogStore;

/// Earth radius used for great-circle distances, km
const EARTH_RADIUS_KM: f64 = 6371.0;

/// A source present in the report but absent from the catalog
///
/// Carries everything needed to seed an anchor at the reported position.
#[derive(Debug, Clone)]
pub struct UnknownSource {
    pub source: SourceRef,
    pub kind: AnchorKind,
    pub rssi: Option<i32>,
}

/// Result of one validation, before side effects
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub response: ValidateResponse,
    /// Catalog misses to learn in the background (empty when INVALID)
    pub unknown_sources: Vec<UnknownSource>,
    /// Whether at least one reported source matched a known anchor
    pub corroborated: bool,
}

pub struct ValidationEngine {
    catalog: Arc<CatalogStore>,
    config: Arc<ConfigRegistry>,
}

impl ValidationEngine {
    pub fn new(catalog: Arc<CatalogStore>, config: Arc<ConfigRegistry>) -> Self {
        Self { catalog, config }
    }

    /// Validate one report and produce a confidence-weighted verdict
    pub async fn validate(&self, report: &PositionReport) -> Result<ValidationOutcome> {
        let settings = self.config.snapshot();
        let now = time::unix_now();

        let mut invalid = false;
        let mut soft_speed_penalty = false;
        let mut reasons: Vec<String> = Vec::new();
        let mut confidence: f32 = 1.0;
        let mut corroborated = false;
        let mut unknown_sources: Vec<UnknownSource> = Vec::new();

        // Malformed coordinates are a verdict, not a transport error
        if !(-90.0..=90.0).contains(&report.latitude)
            || !(-180.0..=180.0).contains(&report.longitude)
        {
            invalid = true;
            reasons.push("coordinates out of range".to_string());
        }

        // Layer 1: temporal plausibility
        if !invalid {
            if report.timestamp > now {
                invalid = true;
                reasons.push("future timestamp".to_string());
            } else if now - report.timestamp > settings.max_time_diff_hours * 3600 {
                invalid = true;
                reasons.push("timestamp too old".to_string());
            }
        }

        // Layer 2: kinematic plausibility against last accepted position.
        // Missing last-known is the normal no-data case; skip the check.
        if !invalid {
            if let Some(last) = self.catalog.get_last_position(&report.device_id).await? {
                let dt = report.timestamp - last.timestamp;
                if dt > 0 {
                    let distance_km = haversine_km(
                        last.lat,
                        last.lon,
                        report.latitude,
                        report.longitude,
                    );
                    let speed_kmh = distance_km / (dt as f64 / 3600.0);
                    if speed_kmh > settings.max_speed_kmh {
                        reasons.push(format!("impossible speed {:.1}km/h", speed_kmh));
                        if settings.speed_soft_fail {
                            soft_speed_penalty = true;
                        } else {
                            invalid = true;
                        }
                    }
                }
            }
        }

        // Layer 3: corroboration against the anchor catalog. An operator
        // override stands in for a learned anchor and takes precedence in
        // lookups, so either counts as a hit.
        if !invalid {
            // Wi-Fi is the wide fan-out; batch-fetch the anchors
            let wifi_refs: Vec<SourceRef> =
                report.wifi.iter().map(|w| w.source_ref()).collect();
            let wifi_anchors = self.catalog.mget_anchors(&wifi_refs).await?;
            for (reading, slot) in report.wifi.iter().zip(wifi_anchors) {
                let source = reading.source_ref();
                if slot.is_some() || self.catalog.get_absolute(&source).await?.is_some() {
                    confidence += settings.wifi_weight * 0.3;
                    corroborated = true;
                    reasons.push(format!("known wifi: {}", source.source_id));
                } else {
                    unknown_sources.push(UnknownSource {
                        source,
                        kind: AnchorKind::Wifi {
                            ssid: reading.ssid.clone(),
                        },
                        rssi: reading.effective_rssi(),
                    });
                }
            }

            for reading in &report.cell_towers {
                let source = reading.source_ref();
                if self.resolve_known(&source).await? {
                    confidence += settings.cell_weight * 0.3;
                    corroborated = true;
                    reasons.push(format!("known cell: {}", source.source_id));
                } else {
                    unknown_sources.push(UnknownSource {
                        source,
                        kind: AnchorKind::Cell {
                            mcc: reading.mcc,
                            mnc: reading.mnc,
                        },
                        rssi: reading.effective_rssi(),
                    });
                }
            }

            for reading in &report.bluetooth {
                let source = reading.source_ref();
                if self.resolve_known(&source).await? {
                    confidence += settings.ble_weight * 0.3;
                    corroborated = true;
                    reasons.push(format!("known ble: {}", source.source_id));
                } else {
                    unknown_sources.push(UnknownSource {
                        source,
                        kind: AnchorKind::Ble,
                        rssi: reading.effective_rssi(),
                    });
                }
            }
        }

        if soft_speed_penalty {
            confidence *= 0.5;
        }
        confidence = confidence.clamp(0.0, 1.0);

        // Verdict assembly
        let verdict = if invalid {
            Verdict::Invalid
        } else if confidence < settings.confidence_low {
            Verdict::Invalid
        } else if confidence < settings.confidence_high {
            Verdict::Uncertain
        } else {
            Verdict::Valid
        };

        if verdict == Verdict::Uncertain {
            reasons.push("low confidence".to_string());
        }
        if verdict == Verdict::Invalid {
            confidence = 0.0;
            // No learning from rejected reports
            unknown_sources.clear();
        }

        let estimated_accuracy = if corroborated {
            report.accuracy * (1.0 - confidence * 0.5)
        } else {
            report.accuracy
        };

        Ok(ValidationOutcome {
            response: ValidateResponse {
                verdict,
                confidence,
                estimated_accuracy,
                reason: reasons.join("; "),
            },
            unknown_sources,
            corroborated,
        })
    }

    /// Whether a source is known: a learned anchor or an operator override
    async fn resolve_known(&self, source: &SourceRef) -> Result<bool> {
        if self.catalog.get_anchor(source).await?.is_some() {
            return Ok(true);
        }
        Ok(self.catalog.get_absolute(source).await?.is_some())
    }
}

/// Great-circle distance between two coordinates, km
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_KM * c
}

/// Seed an anchor for an unknown source at the reported position
pub fn seed_anchor(unknown: &UnknownSource, lat: f64, lon: f64) -> Anchor {
    let mut anchor = Anchor::seed(lat, lon, time::now(), unknown.kind.clone());
    anchor.last_rssi = unknown.rssi;
    anchor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCache;
    use coordcheck_common::model::{DeviceLastPosition, WifiReading};
    use coordcheck_common::params::Settings;

    fn setup(mutate: impl FnOnce(&mut Settings)) -> (Arc<CatalogStore>, ValidationEngine) {
        let catalog = Arc::new(CatalogStore::new(Arc::new(MemoryCache::new())));
        let mut settings = Settings::from_env();
        mutate(&mut settings);
        let config = Arc::new(ConfigRegistry::new(settings));
        let engine = ValidationEngine::new(catalog.clone(), config);
        (catalog, engine)
    }

    fn report(timestamp: i64) -> PositionReport {
        PositionReport {
            device_id: "dev-1".into(),
            latitude: 55.75,
            longitude: 37.62,
            accuracy: 20.0,
            timestamp,
            wifi: vec![],
            bluetooth: vec![],
            cell_towers: vec![],
        }
    }

    fn wifi_reading(bssid: &str) -> WifiReading {
        WifiReading {
            bssid: bssid.into(),
            ssid: None,
            rssi: Some(-60),
            eid: None,
        }
    }

    #[tokio::test]
    async fn test_future_timestamp_is_invalid() {
        let (_catalog, engine) = setup(|_| {});
        let outcome = engine
            .validate(&report(time::unix_now() + 10))
            .await
            .unwrap();

        assert_eq!(outcome.response.verdict, Verdict::Invalid);
        assert_eq!(outcome.response.confidence, 0.0);
        assert!(outcome.response.reason.contains("future timestamp"));
    }

    #[tokio::test]
    async fn test_stale_timestamp_is_invalid() {
        let (_catalog, engine) = setup(|s| s.max_time_diff_hours = 12);
        let outcome = engine
            .validate(&report(time::unix_now() - 13 * 3600))
            .await
            .unwrap();

        assert_eq!(outcome.response.verdict, Verdict::Invalid);
        assert_eq!(outcome.response.confidence, 0.0);
        assert!(outcome.response.reason.contains("timestamp too old"));
    }

    #[tokio::test]
    async fn test_impossible_speed_is_invalid() {
        let (catalog, engine) = setup(|_| {});
        let now = time::unix_now();

        catalog
            .put_last_position(
                "dev-1",
                &DeviceLastPosition {
                    lat: 55.75,
                    lon: 37.62,
                    timestamp: now - 60,
                    wall_time: time::now(),
                },
            )
            .await
            .unwrap();

        // ~62 km east in 60 seconds
        let mut r = report(now);
        r.longitude = 38.62;

        let outcome = engine.validate(&r).await.unwrap();
        assert_eq!(outcome.response.verdict, Verdict::Invalid);
        assert_eq!(outcome.response.confidence, 0.0);
        assert!(outcome.response.reason.contains("impossible speed"));
    }

    #[tokio::test]
    async fn test_soft_mode_halves_confidence_instead() {
        let (catalog, engine) = setup(|s| s.speed_soft_fail = true);
        let now = time::unix_now();

        catalog
            .put_last_position(
                "dev-1",
                &DeviceLastPosition {
                    lat: 55.75,
                    lon: 37.62,
                    timestamp: now - 60,
                    wall_time: time::now(),
                },
            )
            .await
            .unwrap();

        let mut r = report(now);
        r.longitude = 38.62;

        let outcome = engine.validate(&r).await.unwrap();
        assert_eq!(outcome.response.verdict, Verdict::Uncertain);
        assert_eq!(outcome.response.confidence, 0.5);
        assert!(outcome.response.reason.contains("impossible speed"));
    }

    #[tokio::test]
    async fn test_no_sources_no_history_is_valid() {
        let (_catalog, engine) = setup(|_| {});
        let outcome = engine.validate(&report(time::unix_now())).await.unwrap();

        assert_eq!(outcome.response.verdict, Verdict::Valid);
        assert_eq!(outcome.response.confidence, 1.0);
        assert!(!outcome.corroborated);
        // Uncorroborated accuracy passes through untouched
        assert_eq!(outcome.response.estimated_accuracy, 20.0);
    }

    #[tokio::test]
    async fn test_unknown_wifi_is_queued_for_learning() {
        let (_catalog, engine) = setup(|_| {});
        let mut r = report(time::unix_now());
        r.wifi.push(wifi_reading("AA:BB:CC:DD:EE:FF"));

        let outcome = engine.validate(&r).await.unwrap();
        assert_eq!(outcome.response.verdict, Verdict::Valid);
        assert_eq!(outcome.response.confidence, 1.0);
        assert_eq!(outcome.unknown_sources.len(), 1);
        assert_eq!(
            outcome.unknown_sources[0].source.source_id,
            "aa:bb:cc:dd:ee:ff"
        );
    }

    #[tokio::test]
    async fn test_known_wifi_corroborates_and_attenuates_accuracy() {
        let (catalog, engine) = setup(|_| {});
        let source = SourceRef::wifi("AA:BB:CC:DD:EE:FF");
        let mut anchor = Anchor::seed(
            55.75,
            37.62,
            time::now(),
            AnchorKind::Wifi { ssid: None },
        );
        anchor.confidence = 0.8;
        catalog.put_anchor(&source, &anchor).await.unwrap();

        let mut r = report(time::unix_now());
        r.wifi.push(wifi_reading("aa:bb:cc:dd:ee:ff"));

        let outcome = engine.validate(&r).await.unwrap();
        assert_eq!(outcome.response.verdict, Verdict::Valid);
        // 1.0 + 0.4 * 0.3 clipped to 1.0
        assert_eq!(outcome.response.confidence, 1.0);
        assert!(outcome.corroborated);
        assert!(outcome.unknown_sources.is_empty());
        assert_eq!(outcome.response.estimated_accuracy, 10.0);
        assert!(outcome.response.reason.contains("known wifi"));
    }

    #[tokio::test]
    async fn test_out_of_range_coordinates_are_invalid() {
        let (_catalog, engine) = setup(|_| {});
        let mut r = report(time::unix_now());
        r.latitude = 123.0;

        let outcome = engine.validate(&r).await.unwrap();
        assert_eq!(outcome.response.verdict, Verdict::Invalid);
        assert!(outcome.response.reason.contains("coordinates out of range"));
    }

    #[tokio::test]
    async fn test_invalid_verdict_learns_nothing() {
        let (_catalog, engine) = setup(|_| {});
        let mut r = report(time::unix_now() + 100);
        r.wifi.push(wifi_reading("aa:bb:cc:dd:ee:ff"));

        let outcome = engine.validate(&r).await.unwrap();
        assert_eq!(outcome.response.verdict, Verdict::Invalid);
        assert!(outcome.unknown_sources.is_empty());
    }

    #[tokio::test]
    async fn test_absolute_override_counts_as_corroboration() {
        use coordcheck_common::model::{AbsoluteOverride, BluetoothReading};

        let (catalog, engine) = setup(|_| {});
        let source = SourceRef::ble("11:22:33:44:55:66");
        catalog
            .put_absolute(
                &source,
                &AbsoluteOverride {
                    lat: 55.75,
                    lon: 37.62,
                    accuracy: 5.0,
                    source: "site-survey".into(),
                    set_at: time::now(),
                    expires_at: time::now() + chrono::Duration::hours(1),
                },
            )
            .await
            .unwrap();

        let mut r = report(time::unix_now());
        r.bluetooth.push(BluetoothReading {
            mac: "11:22:33:44:55:66".into(),
            rssi: Some(-70),
            eid: None,
        });

        let outcome = engine.validate(&r).await.unwrap();
        assert!(outcome.corroborated);
        assert!(outcome.unknown_sources.is_empty());
        assert!(outcome.response.reason.contains("known ble"));
    }

    #[test]
    fn test_haversine_known_distance() {
        // One degree of longitude at the equator
        let d = haversine_km(0.0, 0.0, 0.0, 1.0);
        assert!((d - 111.19).abs() < 0.2, "got {}", d);

        // Same point
        assert_eq!(haversine_km(55.75, 37.62, 55.75, 37.62), 0.0);
    }
}
