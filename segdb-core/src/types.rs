//! Core types for SegDB

use chrono::{SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp in nanoseconds since Unix epoch
pub type Timestamp = i64;

pub const NANOSECOND: Timestamp = 1;
pub const MICROSECOND: Timestamp = 1_000 * NANOSECOND;
pub const MILLISECOND: Timestamp = 1_000 * MICROSECOND;
pub const SECOND: Timestamp = 1_000 * MILLISECOND;

/// Render a timestamp as an RFC 3339 UTC string
pub fn format_timestamp(ts: Timestamp) -> String {
    Utc.timestamp_nanos(ts)
        .to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Half-open time range `[start, end)`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeRange {
    /// Range covering every representable timestamp
    pub const MAX: TimeRange = TimeRange {
        start: Timestamp::MIN,
        end: Timestamp::MAX,
    };

    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Zero-length range positioned at `ts`
    pub fn point(ts: Timestamp) -> Self {
        Self { start: ts, end: ts }
    }

    /// Length of the range in nanoseconds
    pub fn span(&self) -> Timestamp {
        self.end.saturating_sub(self.start)
    }

    pub fn is_zero(&self) -> bool {
        self.start == self.end
    }

    /// Check if a timestamp falls within the range
    pub fn contains_stamp(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Check if `other` lies entirely within the range
    pub fn contains_range(&self, other: &TimeRange) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    /// Check if two ranges share at least one timestamp.
    ///
    /// Ranges that only touch at a boundary are adjacent, not overlapping. A
    /// zero-length range overlaps another range when that range contains its
    /// start.
    pub fn overlaps_with(&self, other: &TimeRange) -> bool {
        if self.is_zero() {
            return other.contains_stamp(self.start);
        }
        if other.is_zero() {
            return self.contains_stamp(other.start);
        }
        self.start < other.end && other.start < self.end
    }

    /// Portion of the two ranges they have in common
    pub fn intersection(&self, other: &TimeRange) -> TimeRange {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        TimeRange::new(start, end.max(start))
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            format_timestamp(self.start),
            format_timestamp(self.end)
        )
    }
}
