//! Running statistics for summary periods.
//!
//! A [`SummaryWindow`] accumulates the readings of one period. Each channel
//! keeps count, min, max, mean and the sum of squared deviations (Welford),
//! plus a histogram of quantized buckets. Missing (`NaN`) values are
//! skipped per channel, so channels of the same period may have different
//! counts.
//!
//! Windows of adjacent periods are merged with the parallel variance
//! formula, which is how ten-minute summaries are built from minute
//! summaries without re-reading raw data.

use crate::codec::{Channel, Histogram, ReadingValues};
use crate::time::PosixTime;

/// Running statistics of one channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelStats {
    count: u32,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
    histogram: Histogram,
}

impl ChannelStats {
    /// Adds one value. `NaN` is ignored.
    pub fn add(&mut self, channel: Channel, value: f64) {
        if value.is_nan() {
            return;
        }
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / f64::from(self.count);
        self.m2 += delta * (value - self.mean);
        if let Some(bucket) = channel.bucket(value) {
            self.histogram.increment(bucket);
        }
    }

    /// Folds `other` into `self`.
    pub fn merge(&mut self, other: &Self) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = other.clone();
            return;
        }
        let (na, nb) = (f64::from(self.count), f64::from(other.count));
        let n = na + nb;
        let delta = other.mean - self.mean;
        self.mean += delta * nb / n;
        self.m2 += other.m2 + delta * delta * na * nb / n;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.count += other.count;
        self.histogram.merge(&other.histogram);
    }

    /// Number of non-missing values.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Smallest value, `NaN` when empty.
    #[must_use]
    pub fn min(&self) -> f64 {
        if self.count == 0 { f64::NAN } else { self.min }
    }

    /// Largest value, `NaN` when empty.
    #[must_use]
    pub fn max(&self) -> f64 {
        if self.count == 0 { f64::NAN } else { self.max }
    }

    /// Arithmetic mean, `NaN` when empty.
    #[must_use]
    pub fn mean(&self) -> f64 {
        if self.count == 0 { f64::NAN } else { self.mean }
    }

    /// Sample standard deviation; zero for a single value, `NaN` when empty.
    #[must_use]
    pub fn stddev(&self) -> f64 {
        match self.count {
            0 => f64::NAN,
            1 => 0.0,
            n => (self.m2 / f64::from(n - 1)).max(0.0).sqrt(),
        }
    }

    /// Bucket counts.
    #[must_use]
    pub fn histogram(&self) -> &Histogram {
        &self.histogram
    }
}

/// Accumulated statistics for one summary period.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryWindow {
    start: PosixTime,
    record_count: u32,
    channels: [ChannelStats; Channel::COUNT],
}

impl SummaryWindow {
    /// An empty window for the period starting at `start`.
    #[must_use]
    pub fn new(start: PosixTime) -> Self {
        Self {
            start,
            record_count: 0,
            channels: Default::default(),
        }
    }

    /// Adds one raw reading.
    pub fn add_reading(&mut self, values: &ReadingValues) {
        self.record_count += 1;
        for channel in Channel::ALL {
            self.channels[channel.index()].add(channel, values.get(channel));
        }
    }

    /// Folds another window's statistics into this one.
    pub fn merge(&mut self, other: &Self) {
        self.record_count += other.record_count;
        for (mine, theirs) in self.channels.iter_mut().zip(&other.channels) {
            mine.merge(theirs);
        }
    }

    /// Period start.
    #[must_use]
    pub fn start(&self) -> PosixTime {
        self.start
    }

    /// Raw readings folded in, including all-missing ones.
    #[must_use]
    pub fn record_count(&self) -> u32 {
        self.record_count
    }

    /// True once at least one reading was added.
    #[must_use]
    pub fn has_data(&self) -> bool {
        self.record_count > 0
    }

    /// Statistics of one channel.
    #[must_use]
    pub fn channel(&self, channel: Channel) -> &ChannelStats {
        &self.channels[channel.index()]
    }

    /// Per-channel minimum.
    #[must_use]
    pub fn min(&self) -> ReadingValues {
        ReadingValues::from_fn(|ch| self.channel(ch).min())
    }

    /// Per-channel maximum.
    #[must_use]
    pub fn max(&self) -> ReadingValues {
        ReadingValues::from_fn(|ch| self.channel(ch).max())
    }

    /// Per-channel mean.
    #[must_use]
    pub fn mean(&self) -> ReadingValues {
        ReadingValues::from_fn(|ch| self.channel(ch).mean())
    }

    /// Per-channel sample standard deviation.
    #[must_use]
    pub fn stddev(&self) -> ReadingValues {
        ReadingValues::from_fn(|ch| self.channel(ch).stddev())
    }
}
