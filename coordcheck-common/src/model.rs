//! Data model shared by the validation and learning flows
//!
//! The three wireless source families (Wi-Fi access points, cell towers,
//! Bluetooth devices) share a structural shape but differ in identity:
//! Wi-Fi by BSSID, cells by (CellID, LAC), Bluetooth by MAC. They are
//! modeled as tagged variants rather than a common base record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Source identity
// ============================================================================

/// Wireless source family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SourceType {
    Wifi,
    Cell,
    Ble,
}

impl SourceType {
    /// Lowercase token used in catalog keys for observations and overrides
    pub fn as_key_token(&self) -> &'static str {
        match self {
            SourceType::Wifi => "wifi",
            SourceType::Cell => "cell",
            SourceType::Ble => "ble",
        }
    }

    /// Parse from a key token or API path segment (case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "wifi" => Some(SourceType::Wifi),
            "cell" => Some(SourceType::Cell),
            "ble" | "bt" => Some(SourceType::Ble),
            _ => None,
        }
    }
}

/// Identity of one wireless source: family plus canonical id
///
/// The id is a canonical lowercase MAC for Wi-Fi/Bluetooth and
/// `<cell_id>:<lac>` for cells. MCC/MNC are descriptive, never identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    pub source_type: SourceType,
    pub source_id: String,
}

impl SourceRef {
    pub fn wifi(bssid: &str) -> Self {
        Self {
            source_type: SourceType::Wifi,
            source_id: canonical_mac(bssid),
        }
    }

    pub fn cell(cell_id: u32, lac: u32) -> Self {
        Self {
            source_type: SourceType::Cell,
            source_id: format!("{}:{}", cell_id, lac),
        }
    }

    pub fn ble(mac: &str) -> Self {
        Self {
            source_type: SourceType::Ble,
            source_id: canonical_mac(mac),
        }
    }
}

/// Canonicalize a MAC address to lowercase colon-separated hex
///
/// Accepts `AA:BB:CC:DD:EE:FF`, `aa-bb-cc-dd-ee-ff`, or bare hex. Inputs
/// that do not look like a 48-bit MAC are lowercased and passed through so
/// a malformed id still produces a stable catalog key.
pub fn canonical_mac(raw: &str) -> String {
    let hex: String = raw
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .collect::<String>()
        .to_ascii_lowercase();

    if hex.len() != 12 {
        return raw.trim().to_ascii_lowercase();
    }

    hex.as_bytes()
        .chunks(2)
        .map(|pair| std::str::from_utf8(pair).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(":")
}

/// Recover an RSSI value from a legacy EID field
///
/// Telematics gateways report signal strength as a positive EID; the RSSI
/// is its negation, folded back into the i8 range.
pub fn rssi_from_eid(eid: i32) -> i32 {
    let mut rssi = -eid;
    if rssi < -128 {
        rssi += 128;
    }
    rssi
}

// ============================================================================
// Inbound readings
// ============================================================================

/// One observed Wi-Fi access point in a report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WifiReading {
    pub bssid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eid: Option<i32>,
}

/// One observed Bluetooth device in a report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BluetoothReading {
    pub mac: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eid: Option<i32>,
}

/// One observed cell tower in a report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellReading {
    pub cell_id: u32,
    pub lac: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcc: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mnc: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eid: Option<i32>,
}

impl WifiReading {
    pub fn source_ref(&self) -> SourceRef {
        SourceRef::wifi(&self.bssid)
    }

    pub fn effective_rssi(&self) -> Option<i32> {
        effective_rssi(self.rssi, self.eid)
    }
}

impl BluetoothReading {
    pub fn source_ref(&self) -> SourceRef {
        SourceRef::ble(&self.mac)
    }

    pub fn effective_rssi(&self) -> Option<i32> {
        effective_rssi(self.rssi, self.eid)
    }
}

impl CellReading {
    pub fn source_ref(&self) -> SourceRef {
        SourceRef::cell(self.cell_id, self.lac)
    }

    pub fn effective_rssi(&self) -> Option<i32> {
        effective_rssi(self.rssi, self.eid)
    }
}

fn effective_rssi(rssi: Option<i32>, eid: Option<i32>) -> Option<i32> {
    match (rssi, eid) {
        (Some(r), _) if r != 0 => Some(r),
        (_, Some(e)) if e != 0 => Some(rssi_from_eid(e)),
        (Some(r), _) => Some(r),
        _ => None,
    }
}

/// Device position report submitted for validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionReport {
    pub device_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f32,
    /// Report time, unix seconds
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wifi: Vec<WifiReading>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bluetooth: Vec<BluetoothReading>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cell_towers: Vec<CellReading>,
}

/// Position report submitted to the learning flow
///
/// Same shape as [`PositionReport`] but keyed by the learning object rather
/// than the validating device (they may be the same principal).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnReport {
    pub object_id: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub accuracy: f32,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wifi: Vec<WifiReading>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bluetooth: Vec<BluetoothReading>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cell_towers: Vec<CellReading>,
}

// ============================================================================
// Validation results
// ============================================================================

/// Plausibility verdict for a reported coordinate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Valid,
    Invalid,
    Uncertain,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Valid => "VALID",
            Verdict::Invalid => "INVALID",
            Verdict::Uncertain => "UNCERTAIN",
        }
    }
}

/// Validation response returned to the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateResponse {
    pub verdict: Verdict,
    pub confidence: f32,
    /// Meters; the reported accuracy attenuated when corroborated
    pub estimated_accuracy: f32,
    /// Human-readable fragments joined with "; ", in layer order
    pub reason: String,
}

// ============================================================================
// Learning results
// ============================================================================

/// Outcome of one learning request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LearnOutcome {
    Learned,
    NeedMoreData,
    StationaryDetected,
    RandomExcluded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnResponse {
    pub result: LearnOutcome,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stationary_sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub random_sources: Vec<String>,
}

// ============================================================================
// Observation aggregates (stationary detection)
// ============================================================================

/// Classification of a (object, source) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ObservationStatus {
    New,
    Stationary,
    Random,
}

/// One retained position sample
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationSample {
    pub lat: f64,
    pub lon: f64,
    pub time: DateTime<Utc>,
}

/// Rolling observation window for one (object, source) pair
///
/// `count` is the total number of samples ever seen; `observations` retains
/// only the most recent window. Status is derived from count and the
/// variance of the retained samples, never written from outside.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationAggregate {
    pub object_id: String,
    pub source_type: SourceType,
    pub source_id: String,
    pub observations: Vec<ObservationSample>,
    pub count: i64,
    pub status: ObservationStatus,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

// ============================================================================
// Anchors
// ============================================================================

/// Variant-specific descriptive attributes of an anchor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AnchorKind {
    Wifi {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ssid: Option<String>,
    },
    Cell {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mcc: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mnc: Option<u32>,
    },
    Ble,
}

/// A learned wireless source with an inferred coordinate
///
/// Stored as self-describing JSON in the catalog; optional fields double as
/// the schema-version mechanism. `version` increments exactly once per
/// accepted update and the coordinate only ever moves along the segment
/// between its previous value and the triggering report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anchor {
    pub lat: f64,
    pub lon: f64,
    pub last_seen: DateTime<Utc>,
    pub version: i64,
    pub observation_count: i64,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_rssi: Option<i32>,
    #[serde(flatten)]
    pub kind: AnchorKind,
}

impl Anchor {
    /// Initial anchor for a source seen for the first time
    pub fn seed(lat: f64, lon: f64, now: DateTime<Utc>, kind: AnchorKind) -> Self {
        Self {
            lat,
            lon,
            last_seen: now,
            version: 1,
            observation_count: 1,
            confidence: 0.3,
            last_rssi: None,
            kind,
        }
    }
}

// ============================================================================
// Device position, companions, overrides
// ============================================================================

/// Last accepted position of a device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceLastPosition {
    pub lat: f64,
    pub lon: f64,
    /// Report time of the accepted position, unix seconds
    pub timestamp: i64,
    pub wall_time: DateTime<Utc>,
}

/// A source currently classified STATIONARY for a given object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanionEntry {
    pub source_type: SourceType,
    pub source_id: String,
    pub first_seen: DateTime<Utc>,
}

/// Operator-supplied coordinate that overrides learned values until expiry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbsoluteOverride {
    pub lat: f64,
    pub lon: f64,
    pub accuracy: f32,
    /// Provenance tag, e.g. the upstream system that supplied the fix
    pub source: String,
    pub set_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// ============================================================================
// Sink records and events
// ============================================================================

/// Write-only record of one validation verdict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerdictRecord {
    pub device_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f32,
    pub timestamp: i64,
    pub has_wifi: bool,
    pub has_bt: bool,
    pub has_cell: bool,
    pub verdict: Verdict,
    pub confidence: f32,
    pub flow_type: String,
    pub insert_time: DateTime<Utc>,
}

/// Per-source statistics row emitted when an unknown source is first seen
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointStatsRecord {
    pub source_type: SourceType,
    pub source_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub observations: i64,
    pub last_updated: DateTime<Utc>,
}

/// Event describing the outcome of one learning request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningEvent {
    pub object_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: i64,
    pub result: LearnOutcome,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stationary_sources: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub random_sources: Vec<String>,
    pub event_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_mac_forms() {
        assert_eq!(canonical_mac("AA:BB:CC:DD:EE:FF"), "aa:bb:cc:dd:ee:ff");
        assert_eq!(canonical_mac("aa-bb-cc-dd-ee-ff"), "aa:bb:cc:dd:ee:ff");
        assert_eq!(canonical_mac("AABBCCDDEEFF"), "aa:bb:cc:dd:ee:ff");
        // Not a 48-bit MAC: lowercased passthrough
        assert_eq!(canonical_mac("NOT-A-MAC"), "not-a-mac");
    }

    #[test]
    fn test_rssi_from_eid_folds_into_range() {
        assert_eq!(rssi_from_eid(70), -70);
        assert_eq!(rssi_from_eid(200), -72);
    }

    #[test]
    fn test_cell_identity_excludes_mcc_mnc() {
        let a = CellReading {
            cell_id: 42,
            lac: 7,
            mcc: Some(250),
            mnc: Some(1),
            rssi: None,
            eid: None,
        };
        let b = CellReading {
            cell_id: 42,
            lac: 7,
            mcc: Some(999),
            mnc: Some(99),
            rssi: None,
            eid: None,
        };
        assert_eq!(a.source_ref(), b.source_ref());
        assert_eq!(a.source_ref().source_id, "42:7");
    }

    #[test]
    fn test_anchor_json_is_tagged_by_kind() {
        let anchor = Anchor::seed(
            55.75,
            37.62,
            chrono::Utc::now(),
            AnchorKind::Wifi {
                ssid: Some("office".into()),
            },
        );
        let json = serde_json::to_string(&anchor).unwrap();
        assert!(json.contains("\"kind\":\"wifi\""));
        assert!(json.contains("\"ssid\":\"office\""));

        let back: Anchor = serde_json::from_str(&json).unwrap();
        assert_eq!(back.version, 1);
        assert_eq!(back.observation_count, 1);
    }

    #[test]
    fn test_verdict_wire_names() {
        assert_eq!(serde_json::to_string(&Verdict::Valid).unwrap(), "\"VALID\"");
        assert_eq!(
            serde_json::to_string(&LearnOutcome::NeedMoreData).unwrap(),
            "\"NEED_MORE_DATA\""
        );
    }

    #[test]
    fn test_report_defaults_empty_source_lists() {
        let report: PositionReport = serde_json::from_str(
            r#"{"device_id":"d1","latitude":55.0,"longitude":37.0,"accuracy":10.0,"timestamp":1700000000}"#,
        )
        .unwrap();
        assert!(report.wifi.is_empty());
        assert!(report.bluetooth.is_empty());
        assert!(report.cell_towers.is_empty());
    }
}
