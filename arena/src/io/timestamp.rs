//! Clock and id helpers.

use chrono::{SecondsFormat, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;

/// Current UTC time as RFC 3339 with second precision.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Current UTC time as `YYYYmmdd_HHMMSS`, sortable and path-safe.
pub fn compact_utc() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

pub fn unix_secs() -> i64 {
    Utc::now().timestamp()
}

/// Random lowercase alphanumeric suffix.
pub fn short_id(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect()
}
