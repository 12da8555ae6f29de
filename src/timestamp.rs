//! Lenient timestamp parsing
//!
//! Upstream readings carry timestamps as `YYYY-MM-DD HH:MM:SS.ffffff±HHMM`
//! strings. Parsing never fails hard: anything unparseable becomes `None`
//! and the caller decides how loudly to complain.

use chrono::{DateTime, NaiveDateTime, Utc};

/// Wire format of `timestamp_str` / `next_timestamp_str`
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f%z";

const NAIVE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Parse a timestamp string into a UTC instant.
///
/// Accepts the wire format (fraction optional, offset `+HHMM` or `+HH:MM`),
/// RFC 3339, and offset-less values which are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_str(trimmed, TIMESTAMP_FORMAT) {
        return Some(dt.with_timezone(&Utc));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(trimmed, NAIVE_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Format an instant in the wire format with microsecond precision
pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S%.6f%z").to_string()
}

/// Signed distance between two instants in fractional seconds (µs precision).
pub fn seconds_between(start: &DateTime<Utc>, end: &DateTime<Utc>) -> Option<f64> {
    (*end - *start)
        .num_microseconds()
        .map(|micros| micros as f64 / 1_000_000.0)
}
