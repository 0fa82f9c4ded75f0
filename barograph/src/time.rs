//! Epoch-second timestamps and inclusive time ranges.
//!
//! Stored stamps are signed 32-bit seconds since the Unix epoch. Callers
//! work in wall-clock [`DateTime<Utc>`]; conversion happens once at the
//! boundary and fails for times outside the 32-bit range.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::InvalidOperation;

/// Seconds per minute summary period.
pub const MINUTE: i32 = 60;

/// Seconds per ten-minute summary period.
pub const TEN_MINUTES: i32 = 600;

/// A stored timestamp: seconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PosixTime(i32);

impl PosixTime {
    /// Earliest storable time.
    pub const MIN: Self = Self(i32::MIN);
    /// Latest storable time.
    pub const MAX: Self = Self(i32::MAX);

    /// Wraps raw epoch seconds.
    #[must_use]
    pub const fn new(secs: i32) -> Self {
        Self(secs)
    }

    /// Raw epoch seconds.
    #[must_use]
    pub const fn secs(self) -> i32 {
        self.0
    }

    /// Start of the `period`-second bucket holding this time.
    #[must_use]
    pub const fn floor_to(self, period: i32) -> Self {
        Self(self.0 - self.0.rem_euclid(period))
    }

    /// Adds `secs`, returning `None` outside the storable range.
    #[must_use]
    pub fn checked_add(self, secs: i64) -> Option<Self> {
        i64::from(self.0)
            .checked_add(secs)
            .and_then(|v| i32::try_from(v).ok())
            .map(Self)
    }

    /// Adds `secs`, clamping to the storable range.
    #[must_use]
    pub fn saturating_add(self, secs: i64) -> Self {
        let v = i64::from(self.0).saturating_add(secs);
        Self(i32::try_from(v).unwrap_or(if v < 0 { i32::MIN } else { i32::MAX }))
    }

    /// Wall-clock form of this stamp.
    #[must_use]
    pub fn to_datetime(self) -> DateTime<Utc> {
        // Every i32 second count is representable.
        DateTime::from_timestamp(i64::from(self.0), 0).unwrap_or(DateTime::UNIX_EPOCH)
    }
}

impl TryFrom<DateTime<Utc>> for PosixTime {
    type Error = InvalidOperation;

    fn try_from(value: DateTime<Utc>) -> Result<Self, Self::Error> {
        let timestamp = value.timestamp();
        i32::try_from(timestamp)
            .map(Self)
            .map_err(|_| InvalidOperation::TimestampOutOfRange { timestamp })
    }
}

impl From<PosixTime> for DateTime<Utc> {
    fn from(value: PosixTime) -> Self {
        value.to_datetime()
    }
}

impl fmt::Display for PosixTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An inclusive `[low, high]` range of stamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PosixTimeRange {
    /// Inclusive lower bound.
    pub low: PosixTime,
    /// Inclusive upper bound.
    pub high: PosixTime,
}

impl PosixTimeRange {
    /// Builds a range from two bounds in either order.
    #[must_use]
    pub fn new(a: PosixTime, b: PosixTime) -> Self {
        Self {
            low: a.min(b),
            high: a.max(b),
        }
    }

    /// Builds a range from wall-clock bounds in either order.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidOperation::TimestampOutOfRange`] if either bound
    /// does not fit a 32-bit stamp.
    pub fn from_datetimes(a: DateTime<Utc>, b: DateTime<Utc>) -> Result<Self, InvalidOperation> {
        Ok(Self::new(a.try_into()?, b.try_into()?))
    }

    /// Builds the inclusive range `[from, from + span]`, swapping bounds
    /// for a negative span. Bounds are clamped to the storable range.
    #[must_use]
    pub fn from_span(from: PosixTime, span: i64) -> Self {
        Self::new(from, from.saturating_add(span))
    }

    /// `high - low`.
    #[must_use]
    pub fn span(&self) -> i64 {
        i64::from(self.high.0) - i64::from(self.low.0)
    }

    /// True if `stamp` lies inside the range.
    #[must_use]
    pub fn contains(&self, stamp: PosixTime) -> bool {
        self.low <= stamp && stamp <= self.high
    }

    /// True if the two ranges share at least one stamp.
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.low <= other.high && other.low <= self.high
    }

    /// Smallest range covering both.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        Self {
            low: self.low.min(other.low),
            high: self.high.max(other.high),
        }
    }

    /// Wall-clock bounds.
    #[must_use]
    pub fn to_datetimes(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.low.to_datetime(), self.high.to_datetime())
    }
}

impl fmt::Display for PosixTimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.low, self.high)
    }
}
