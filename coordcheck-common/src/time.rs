//! Timestamp utilities

use chrono::{DateTime, Utc};

/// Get current UTC wall time
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Get current unix time in seconds
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// Convert hours to a std Duration
pub fn hours_to_duration(hours: i64) -> std::time::Duration {
    std::time::Duration::from_secs((hours.max(0) as u64) * 3600)
}
