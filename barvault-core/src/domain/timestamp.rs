use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Milliseconds since the Unix epoch. Never negative.
///
/// Serializes as a bare integer so it can be used directly as the
/// `timestamp` column of a stored series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Timestamp(i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("timestamp must be non-negative, got {0}")]
pub struct NegativeTimestamp(pub i64);

impl Timestamp {
    pub const EPOCH: Timestamp = Timestamp(0);

    /// Returns `None` for instants before the epoch.
    pub const fn new(millis: i64) -> Option<Self> {
        if millis < 0 {
            None
        } else {
            Some(Self(millis))
        }
    }

    pub fn now() -> Self {
        Self::from_datetime(Utc::now()).unwrap_or(Self::EPOCH)
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Option<Self> {
        Self::new(dt.timestamp_millis())
    }

    pub const fn millis(self) -> i64 {
        self.0
    }

    /// Adds a non-negative number of milliseconds, saturating at `i64::MAX`.
    pub const fn plus_millis(self, millis: i64) -> Self {
        if millis <= 0 {
            self
        } else {
            Self(self.0.saturating_add(millis))
        }
    }

    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.0)
    }

    /// RFC 3339 rendering with millisecond precision, for logs and reports.
    pub fn iso(self) -> String {
        self.to_datetime()
            .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
            .unwrap_or_else(|| self.0.to_string())
    }
}

impl TryFrom<i64> for Timestamp {
    type Error = NegativeTimestamp;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(NegativeTimestamp(value))
    }
}

impl From<Timestamp> for i64 {
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

/// Displays as the raw millisecond count so a reported instant can be passed
/// straight back as `--since`.
impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
