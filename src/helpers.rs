//! Shared helpers for forecast timestamps and hour-of-day arithmetic.
//!
//! The classifier computes the rain onset as an hour offset from the window
//! start, and the responder renders per-hour listings from the same start.
//! Both go through `hour_at_offset` / `hour_of_day_at_offset` so the onset
//! hour quoted to users always matches the detail listing.

use chrono::{DateTime, Duration, FixedOffset, Timelike};

/// Timestamp layout used by the provider's `fcst_valid_local` field,
/// e.g. `2017-06-18T15:00:00+0900`.
const PROVIDER_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%z";

/// Parse a provider local timestamp, keeping its UTC offset.
///
/// Accepts both the compact `+0900` offset the provider emits and RFC 3339
/// (`+09:00`).
pub(crate) fn parse_provider_timestamp(s: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_str(s, PROVIDER_TIMESTAMP_FORMAT)
        .or_else(|_| DateTime::parse_from_rfc3339(s))
        .ok()
}

/// The timestamp `offset_hours` after `start`.
pub(crate) fn hour_at_offset(
    start: DateTime<FixedOffset>,
    offset_hours: usize,
) -> DateTime<FixedOffset> {
    start + Duration::hours(offset_hours as i64)
}

/// Hour of day (0–23) `offset_hours` after `start`, wrapping across midnight.
pub(crate) fn hour_of_day_at_offset(start: DateTime<FixedOffset>, offset_hours: usize) -> u32 {
    hour_at_offset(start, offset_hours).hour()
}
