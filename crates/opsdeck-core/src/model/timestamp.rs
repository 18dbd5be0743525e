//! Lenient timestamp decoding.
//!
//! The backend stores naive UTC datetimes and serializes them without an
//! offset (`2026-03-01T10:00:00.123456`). Other producers send RFC 3339.
//! Both decode to `DateTime<Utc>`; a naive value is read as UTC.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Parse an RFC 3339 or offset-less timestamp.
pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

/// `deserialize_with` helper for optional timestamp fields.
///
/// # Errors
///
/// Fails when the value is neither null nor a parseable timestamp string.
pub fn deserialize_opt<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    raw.map(|raw| parse(&raw).ok_or_else(|| D::Error::custom(format!("invalid timestamp '{raw}'"))))
        .transpose()
}
