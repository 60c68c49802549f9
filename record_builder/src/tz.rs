//! Time zone parsing and conversion helpers.
//!
//! What this module provides:
//! - [`parse_ts_to_utc`]: parse RFC-3339 timestamps with an explicit offset into UTC
//!   (the storage format of `session_log.timestamp`).
//! - [`from_local_naive_with_policy`]: resolve a naive wall-clock time recorded at an
//!   instrument (IANA zone) into UTC, with a [`DstPolicy`] for DST gaps and folds.
//! - [`to_instrument_local`]: render a UTC instant in the instrument's zone for the
//!   record summary.
//! - [`system_time_to_utc`]: file modification times as UTC instants.
//!
//! Notes:
//! - All database writes are RFC-3339 UTC strings with millisecond precision.
//! - Local times are only accepted at harvester edges and must resolve deterministically
//!   or error.

use std::time::SystemTime;

use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use chrono_tz::Tz;

/// RFC-3339 with offset -> UTC.
///
/// Example:
/// - "2024-03-10T09:30:00-05:00" -> "2024-03-10T14:30:00Z"
pub fn parse_ts_to_utc(s: &str) -> anyhow::Result<DateTime<Utc>> {
    let dt = DateTime::parse_from_rfc3339(s).with_context(|| format!("bad rfc3339: {s}"))?;
    Ok(dt.with_timezone(&Utc))
}

/// Parse an IANA time zone name (e.g., "America/Denver").
pub fn parse_tz(name: &str) -> anyhow::Result<Tz> {
    name.trim()
        .parse::<Tz>()
        .map_err(|e| anyhow::anyhow!("bad tz: {name}: {e}"))
}

/// Policy for handling DST edge cases when converting local naive timestamps to UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DstPolicy {
    /// Error on ambiguous (fall-back) or nonexistent (spring-forward) local times.
    Strict,
    /// For ambiguous local times pick the earlier instant.
    PreferEarliest,
    /// For ambiguous local times pick the later instant.
    PreferLatest,
}

/// Convert a naive local timestamp to UTC using a specific IANA time zone and DST policy.
///
/// Nonexistent local times (spring-forward gap) are always an error; ambiguous ones
/// resolve according to `policy`.
pub fn from_local_naive_with_policy(
    naive: NaiveDateTime,
    tz: Tz,
    policy: DstPolicy,
) -> anyhow::Result<DateTime<Utc>> {
    use chrono::offset::LocalResult::*;
    match tz.from_local_datetime(&naive) {
        Single(dt) => Ok(dt.with_timezone(&Utc)),
        Ambiguous(a, b) => match policy {
            DstPolicy::PreferEarliest => Ok(a.with_timezone(&Utc)),
            DstPolicy::PreferLatest => Ok(b.with_timezone(&Utc)),
            DstPolicy::Strict => Err(anyhow::anyhow!("ambiguous local time {naive} in {tz}")),
        },
        None => Err(anyhow::anyhow!("nonexistent local time {naive} in {tz}")),
    }
}

/// Format a UTC datetime as an RFC-3339 string with millisecond precision.
pub fn to_rfc3339_millis(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Render a UTC instant as RFC-3339 in the given zone (offset included).
pub fn to_instrument_local(dt: DateTime<Utc>, tz: Tz) -> String {
    dt.with_timezone(&tz)
        .to_rfc3339_opts(SecondsFormat::Millis, false)
}

/// File-system time to a UTC instant.
pub fn system_time_to_utc(t: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(t)
}
