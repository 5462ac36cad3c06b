//! Date window used to bound full syncs.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Days into the past covered by a default full sync.
pub const DEFAULT_PAST_DAYS: i64 = 90;
/// Days into the future covered by a default full sync.
pub const DEFAULT_FUTURE_DAYS: i64 = 365;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> DateRange {
        DateRange { start, end }
    }

    /// Default sync window: 90 days back, one year ahead.
    pub fn around(now: DateTime<Utc>) -> DateRange {
        DateRange {
            start: now - Duration::days(DEFAULT_PAST_DAYS),
            end: now + Duration::days(DEFAULT_FUTURE_DAYS),
        }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t <= self.end
    }
}
