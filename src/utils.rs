/// Shared utility functions
use chrono::{DateTime, NaiveDate, TimeZone, Utc};

use crate::db::DateRange;
use crate::error::{Result, StoreError};

/// Safely truncate a string at a UTF-8 boundary
pub fn safe_truncate(s: &str, max_bytes: usize) -> &str {
    if max_bytes >= s.len() { return s; }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Truncate for table output, marking the cut with "..."
pub fn ellipsize(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    format!("{}...", safe_truncate(s, max_bytes.saturating_sub(3)))
}

/// Which end of a bare `YYYY-MM-DD` date to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayEdge {
    Start,
    End,
}

/// Parse epoch milliseconds, RFC 3339, or a bare UTC date.
pub fn parse_timestamp(s: &str, edge: DayEdge) -> Result<DateTime<Utc>> {
    let s = s.trim();
    if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
        let millis: i64 = s
            .parse()
            .map_err(|_| StoreError::InvalidQuery(format!("timestamp out of range: {}", s)))?;
        return Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| StoreError::InvalidQuery(format!("timestamp out of range: {}", s)));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        let day = DateRange::day(date)?;
        return Ok(match edge {
            DayEdge::Start => day.start,
            DayEdge::End => day.end,
        });
    }
    Err(StoreError::InvalidQuery(format!(
        "unrecognised time '{}' (use epoch millis, RFC 3339 or YYYY-MM-DD)",
        s
    )))
}

/// Build a range from optional bounds. An open start means the epoch, an
/// open end means `now`.
pub fn parse_range(from: Option<&str>, to: Option<&str>, now: DateTime<Utc>) -> Result<Option<DateRange>> {
    let from = from.filter(|s| !s.trim().is_empty());
    let to = to.filter(|s| !s.trim().is_empty());
    if from.is_none() && to.is_none() {
        return Ok(None);
    }
    let start = match from {
        Some(s) => parse_timestamp(s, DayEdge::Start)?,
        None => DateTime::<Utc>::UNIX_EPOCH,
    };
    let end = match to {
        Some(s) => parse_timestamp(s, DayEdge::End)?,
        None => now,
    };
    DateRange::new(start, end).map(Some)
}
