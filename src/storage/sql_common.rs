//! Shared helpers for the SQL backend
//!
//! Timestamps are stored as unix seconds and string lists as JSON text.

use crate::Result;
use crate::error::StorageError;
use chrono::{DateTime, Utc};

/// Convert DateTime to SQLite INTEGER (unix timestamp)
#[inline]
pub fn to_unix(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

/// Expiry instant as SQLite INTEGER, rounded up to the next whole second
///
/// Truncating would end a row's lifetime up to a second early.
#[inline]
pub fn expiry_to_unix(dt: DateTime<Utc>) -> i64 {
    let secs = dt.timestamp();
    if dt.timestamp_subsec_nanos() > 0 { secs + 1 } else { secs }
}

/// Convert SQLite INTEGER back to DateTime
///
/// Out-of-range values are corrupt rows, not "now".
#[inline]
pub fn from_unix(column: &str, ts: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(ts, 0).ok_or_else(|| {
        StorageError::Corrupt(format!("{column} holds invalid timestamp {ts}")).into()
    })
}

/// Encode a string list as JSON TEXT
#[inline]
pub fn encode_list(values: &[String]) -> Result<String> {
    Ok(serde_json::to_string(values)?)
}

/// Decode a JSON TEXT column into a string list
#[inline]
pub fn decode_list(text: &str) -> Result<Vec<String>> {
    Ok(serde_json::from_str(text)?)
}
