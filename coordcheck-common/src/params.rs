//! Runtime parameter registry
//!
//! Single in-process configuration object for all tunable parameters:
//! time bounds, speed bounds, confidence thresholds, source weights,
//! learning knobs, and sink sizing. Read-frequently, write-rarely access
//! pattern using RwLock; every runtime change appends to an in-memory
//! audit trail so threshold oscillation can be diagnosed during tuning.
//!
//! The audit trail is intentionally not persisted.
//!
//! # Usage
//!
//! ```
//! use coordcheck_common::params::ConfigRegistry;
//!
//! let registry = ConfigRegistry::from_env();
//!
//! // Read (fast, shared lock, coherent per-request snapshot)
//! let settings = registry.snapshot();
//! assert!(settings.max_speed_kmh > 0.0);
//!
//! // Write (rare, tuning only)
//! registry.update("validation.max_speed_kmh", "200", "load test");
//! ```

use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// All tunable parameters, with environment defaults
#[derive(Debug, Clone)]
pub struct Settings {
    /// HTTP listen port
    pub server_port: u16,
    /// Path of the SQLite file backing the catalog key/value cache
    pub catalog_db_path: String,
    /// Path of the SQLite file backing the analytics sink
    pub analytics_db_path: String,

    /// Maximum plausible travel speed, km/h
    ///
    /// Default: 150.0
    pub max_speed_kmh: f64,
    /// Maximum report age before rejection, hours
    ///
    /// Default: 12
    pub max_time_diff_hours: i64,
    /// When true, an impossible speed halves confidence instead of
    /// rejecting the report outright
    ///
    /// Default: false
    pub speed_soft_fail: bool,

    /// Corroboration weight of a known Wi-Fi access point
    ///
    /// Default: 0.4
    pub wifi_weight: f32,
    /// Corroboration weight of a known cell tower
    ///
    /// Default: 0.3
    pub cell_weight: f32,
    /// Corroboration weight of a known Bluetooth device
    ///
    /// Default: 0.3
    pub ble_weight: f32,

    /// Confidence at or above which a verdict is VALID
    ///
    /// Default: 0.8
    pub confidence_high: f32,
    /// Mid threshold, reported for operator visibility
    ///
    /// Default: 0.5
    pub confidence_medium: f32,
    /// Confidence below which a verdict is INVALID
    ///
    /// Default: 0.3
    pub confidence_low: f32,

    /// Observations required before a source can leave NEW
    ///
    /// Default: 3. The retained sample window is 10x this value.
    pub min_observations: usize,
    /// Positional variance (degrees squared) below which a source is
    /// STATIONARY
    ///
    /// Default: 1e-4
    pub variance_threshold: f64,
    /// Observation aggregate lifetime, hours
    ///
    /// Default: 24
    pub time_window_hours: i64,

    /// Analytics batch size; a full batch flushes immediately
    ///
    /// Default: 100
    pub analytics_batch_size: usize,
    /// Analytics flush period, seconds
    ///
    /// Default: 5
    pub analytics_flush_interval_secs: u64,
    /// Maximum in-flight detached side-effect tasks; a full pool applies
    /// back-pressure to enqueue
    ///
    /// Default: 64
    pub sink_pool_size: usize,

    /// Routing topic for verdict events
    pub refinement_topic: String,
    /// Routing topic for learning events
    pub learning_topic: String,
}

impl Settings {
    /// Load settings from the environment, falling back to defaults
    pub fn from_env() -> Self {
        Self {
            server_port: get_env_parse("SERVER_PORT", 8095),
            catalog_db_path: get_env("CATALOG_DB_PATH", "coordcheck-catalog.db"),
            analytics_db_path: get_env("ANALYTICS_DB_PATH", "coordcheck-analytics.db"),
            max_speed_kmh: get_env_parse("MAX_SPEED_KMH", 150.0),
            max_time_diff_hours: get_env_parse("MAX_TIME_DIFF", 12),
            speed_soft_fail: get_env_parse("SPEED_SOFT_FAIL", false),
            wifi_weight: get_env_parse("WIFI_WEIGHT", 0.4),
            cell_weight: get_env_parse("CELL_WEIGHT", 0.3),
            ble_weight: get_env_parse("BLE_WEIGHT", 0.3),
            confidence_high: get_env_parse("CONFIDENCE_HIGH", 0.8),
            confidence_medium: get_env_parse("CONFIDENCE_MEDIUM", 0.5),
            confidence_low: get_env_parse("CONFIDENCE_LOW", 0.3),
            min_observations: get_env_parse("LEARNING_MIN_OBSERVATIONS", 3),
            variance_threshold: get_env_parse("LEARNING_VARIANCE_THRESHOLD", 1e-4),
            time_window_hours: get_env_parse("LEARNING_TIME_WINDOW_HOURS", 24),
            analytics_batch_size: get_env_parse("ANALYTICS_BATCH_SIZE", 100),
            analytics_flush_interval_secs: get_env_parse("ANALYTICS_FLUSH_INTERVAL_SECS", 5),
            sink_pool_size: get_env_parse("SINK_POOL_SIZE", 64),
            refinement_topic: get_env("REFINEMENT_TOPIC", "coordinate-refinement"),
            learning_topic: get_env("LEARNING_TOPIC", "coordinate-learning"),
        }
    }
}

fn get_env(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn get_env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// One audit entry for a runtime parameter change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigChange {
    pub key: String,
    pub old_value: String,
    pub new_value: String,
    pub reason: String,
    pub changed_at: DateTime<Utc>,
}

/// Result of a runtime update attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Value parsed and applied; audit entry appended
    Applied { old_value: String, new_value: String },
    /// Key is not a runtime-tunable parameter; no-op
    UnknownKey,
    /// Value failed to parse or violated its range; no-op
    InvalidValue(String),
}

/// Parameter description returned by the admin surface
#[derive(Debug, Clone, Serialize)]
pub struct ConfigParam {
    pub key: &'static str,
    pub value: String,
    pub description: &'static str,
    pub category: &'static str,
}

/// Thread-safe registry over [`Settings`] with an audit trail
pub struct ConfigRegistry {
    settings: RwLock<Settings>,
    history: Mutex<Vec<ConfigChange>>,
}

impl ConfigRegistry {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: RwLock::new(settings),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn from_env() -> Self {
        Self::new(Settings::from_env())
    }

    /// Coherent copy of the current settings
    ///
    /// Engines take one snapshot per request so a mid-request update cannot
    /// split a decision across two parameter sets.
    pub fn snapshot(&self) -> Settings {
        self.settings.read().expect("settings lock poisoned").clone()
    }

    /// Apply a runtime change to a single parameter
    ///
    /// Unknown keys are a no-op. Applied changes append an audit entry.
    pub fn update(&self, key: &str, value: &str, reason: &str) -> UpdateOutcome {
        let mut settings = self.settings.write().expect("settings lock poisoned");

        macro_rules! apply {
            ($field:ident, $parsed:expr) => {{
                let old = settings.$field.to_string();
                settings.$field = $parsed;
                let new = settings.$field.to_string();
                drop(settings);
                self.push_audit(key, &old, &new, reason);
                return UpdateOutcome::Applied {
                    old_value: old,
                    new_value: new,
                };
            }};
        }

        match key {
            "validation.max_speed_kmh" => match parse_positive_f64(value) {
                Ok(v) => apply!(max_speed_kmh, v),
                Err(e) => UpdateOutcome::InvalidValue(e),
            },
            "validation.max_time_diff_hours" => match parse_positive_i64(value) {
                Ok(v) => apply!(max_time_diff_hours, v),
                Err(e) => UpdateOutcome::InvalidValue(e),
            },
            "validation.speed_soft_fail" => match value.parse::<bool>() {
                Ok(v) => apply!(speed_soft_fail, v),
                Err(_) => UpdateOutcome::InvalidValue(format!("{}: not a bool", key)),
            },
            "validation.wifi_weight" => match parse_unit_f32(value) {
                Ok(v) => apply!(wifi_weight, v),
                Err(e) => UpdateOutcome::InvalidValue(e),
            },
            "validation.cell_weight" => match parse_unit_f32(value) {
                Ok(v) => apply!(cell_weight, v),
                Err(e) => UpdateOutcome::InvalidValue(e),
            },
            "validation.ble_weight" => match parse_unit_f32(value) {
                Ok(v) => apply!(ble_weight, v),
                Err(e) => UpdateOutcome::InvalidValue(e),
            },
            "validation.confidence_high" => match parse_unit_f32(value) {
                Ok(v) => apply!(confidence_high, v),
                Err(e) => UpdateOutcome::InvalidValue(e),
            },
            "validation.confidence_medium" => match parse_unit_f32(value) {
                Ok(v) => apply!(confidence_medium, v),
                Err(e) => UpdateOutcome::InvalidValue(e),
            },
            "validation.confidence_low" => match parse_unit_f32(value) {
                Ok(v) => apply!(confidence_low, v),
                Err(e) => UpdateOutcome::InvalidValue(e),
            },
            "learning.min_observations" => match parse_positive_usize(value) {
                Ok(v) => apply!(min_observations, v),
                Err(e) => UpdateOutcome::InvalidValue(e),
            },
            "learning.variance_threshold" => match parse_positive_f64(value) {
                Ok(v) => apply!(variance_threshold, v),
                Err(e) => UpdateOutcome::InvalidValue(e),
            },
            "learning.time_window_hours" => match parse_positive_i64(value) {
                Ok(v) => apply!(time_window_hours, v),
                Err(e) => UpdateOutcome::InvalidValue(e),
            },
            "sink.batch_size" => match parse_positive_usize(value) {
                Ok(v) => apply!(analytics_batch_size, v),
                Err(e) => UpdateOutcome::InvalidValue(e),
            },
            "sink.flush_interval_secs" => match value.parse::<u64>() {
                Ok(v) if v >= 1 => apply!(analytics_flush_interval_secs, v),
                _ => UpdateOutcome::InvalidValue(format!("{}: must be >= 1", key)),
            },
            "sink.pool_size" => match parse_positive_usize(value) {
                Ok(v) => apply!(sink_pool_size, v),
                Err(e) => UpdateOutcome::InvalidValue(e),
            },
            _ => UpdateOutcome::UnknownKey,
        }
    }

    /// Restore environment/default values, logging a single "ALL" entry
    pub fn reset(&self) {
        {
            let mut settings = self.settings.write().expect("settings lock poisoned");
            *settings = Settings::from_env();
        }
        self.push_audit("ALL", "custom", "default", "reset to defaults");
    }

    /// Audit trail of runtime changes, oldest first
    pub fn history(&self) -> Vec<ConfigChange> {
        self.history.lock().expect("history lock poisoned").clone()
    }

    /// Tunable parameters with current values, for the admin surface
    pub fn describe(&self) -> Vec<ConfigParam> {
        let s = self.snapshot();
        vec![
            ConfigParam {
                key: "validation.max_speed_kmh",
                value: format!("{:.1}", s.max_speed_kmh),
                description: "Maximum plausible travel speed, km/h",
                category: "validation",
            },
            ConfigParam {
                key: "validation.max_time_diff_hours",
                value: s.max_time_diff_hours.to_string(),
                description: "Maximum report age, hours",
                category: "validation",
            },
            ConfigParam {
                key: "validation.speed_soft_fail",
                value: s.speed_soft_fail.to_string(),
                description: "Impossible speed halves confidence instead of rejecting",
                category: "validation",
            },
            ConfigParam {
                key: "validation.wifi_weight",
                value: format!("{:.2}", s.wifi_weight),
                description: "Corroboration weight of a known Wi-Fi access point",
                category: "validation",
            },
            ConfigParam {
                key: "validation.cell_weight",
                value: format!("{:.2}", s.cell_weight),
                description: "Corroboration weight of a known cell tower",
                category: "validation",
            },
            ConfigParam {
                key: "validation.ble_weight",
                value: format!("{:.2}", s.ble_weight),
                description: "Corroboration weight of a known Bluetooth device",
                category: "validation",
            },
            ConfigParam {
                key: "validation.confidence_high",
                value: format!("{:.2}", s.confidence_high),
                description: "Confidence at or above which a verdict is VALID",
                category: "validation",
            },
            ConfigParam {
                key: "validation.confidence_medium",
                value: format!("{:.2}", s.confidence_medium),
                description: "Mid confidence threshold",
                category: "validation",
            },
            ConfigParam {
                key: "validation.confidence_low",
                value: format!("{:.2}", s.confidence_low),
                description: "Confidence below which a verdict is INVALID",
                category: "validation",
            },
            ConfigParam {
                key: "learning.min_observations",
                value: s.min_observations.to_string(),
                description: "Observations required before a source can leave NEW",
                category: "learning",
            },
            ConfigParam {
                key: "learning.variance_threshold",
                value: format!("{:e}", s.variance_threshold),
                description: "Variance (deg^2) below which a source is STATIONARY",
                category: "learning",
            },
            ConfigParam {
                key: "learning.time_window_hours",
                value: s.time_window_hours.to_string(),
                description: "Observation aggregate lifetime, hours",
                category: "learning",
            },
            ConfigParam {
                key: "sink.batch_size",
                value: s.analytics_batch_size.to_string(),
                description: "Analytics batch size",
                category: "sink",
            },
            ConfigParam {
                key: "sink.flush_interval_secs",
                value: s.analytics_flush_interval_secs.to_string(),
                description: "Analytics flush period, seconds",
                category: "sink",
            },
            ConfigParam {
                key: "sink.pool_size",
                value: s.sink_pool_size.to_string(),
                description: "Maximum in-flight detached side-effect tasks",
                category: "sink",
            },
        ]
    }

    fn push_audit(&self, key: &str, old: &str, new: &str, reason: &str) {
        self.history
            .lock()
            .expect("history lock poisoned")
            .push(ConfigChange {
                key: key.to_string(),
                old_value: old.to_string(),
                new_value: new.to_string(),
                reason: reason.to_string(),
                changed_at: Utc::now(),
            });
    }
}

fn parse_positive_f64(value: &str) -> std::result::Result<f64, String> {
    value
        .parse::<f64>()
        .ok()
        .filter(|v| *v > 0.0 && v.is_finite())
        .ok_or_else(|| format!("{}: must be a positive number", value))
}

fn parse_positive_i64(value: &str) -> std::result::Result<i64, String> {
    value
        .parse::<i64>()
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| format!("{}: must be a positive integer", value))
}

fn parse_positive_usize(value: &str) -> std::result::Result<usize, String> {
    value
        .parse::<usize>()
        .ok()
        .filter(|v| *v >= 1)
        .ok_or_else(|| format!("{}: must be >= 1", value))
}

fn parse_unit_f32(value: &str) -> std::result::Result<f32, String> {
    value
        .parse::<f32>()
        .ok()
        .filter(|v| (0.0..=1.0).contains(v))
        .ok_or_else(|| format!("{}: must be in [0.0, 1.0]", value))
}
