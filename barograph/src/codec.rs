//! Packed reading codec.
//!
//! Every raw record and every summary statistic is stored as the same
//! fixed-width 8-byte blob: five quantized channel codes packed into a
//! little-endian `u64`. Per-channel histograms are stored as a sparse,
//! variable-length byte sequence.
//!
//! # Bit Layout
//!
//! ```text
//!  63  62        53 52          39 38      29 28             12 11         0
//! +---+------------+--------------+----------+-----------------+------------+
//! | 0 | direction  |  wind speed  | humidity |    pressure     |temperature |
//! |   |  10 bits   |   14 bits    | 10 bits  |     17 bits     |  12 bits   |
//! +---+------------+--------------+----------+-----------------+------------+
//! ```
//!
//! Each field stores `round((value - offset) * scale)` clamped into
//! `[0, max_code - 1]`. The all-ones code is reserved for a missing value,
//! which is `NaN` in memory. Bit 63 is always written as zero.
//!
//! # Histograms
//!
//! A histogram maps a bucket index (the channel code divided by the
//! channel's bucket width) to an occurrence count. Only non-zero buckets are
//! encoded, in ascending order, each as a varint bucket followed by a varint
//! count, using the SQLite4 varint format.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Size of a packed reading in bytes.
pub const PACKED_LEN: usize = 8;

/// One of the five measured channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Air temperature in °C.
    Temperature,
    /// Air pressure in Pa.
    Pressure,
    /// Relative humidity as a 0..1 fraction.
    Humidity,
    /// Wind speed in m/s.
    WindSpeed,
    /// Wind direction in degrees.
    WindDirection,
}

impl Channel {
    /// Number of channels.
    pub const COUNT: usize = 5;

    /// All channels, in storage order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::Temperature,
        Self::Pressure,
        Self::Humidity,
        Self::WindSpeed,
        Self::WindDirection,
    ];

    /// Position of this channel in [`Channel::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// `(shift, bits, scale, offset, bucket_width)` for this channel.
    const fn layout(self) -> (u32, u32, f64, f64, u32) {
        match self {
            Self::Temperature => (0, 12, 10.0, -200.0, 10),
            Self::Pressure => (12, 17, 1.0, 0.0, 100),
            Self::Humidity => (29, 10, 1000.0, 0.0, 10),
            Self::WindSpeed => (39, 14, 100.0, 0.0, 50),
            Self::WindDirection => (53, 10, 2.0, 0.0, 10),
        }
    }

    /// The reserved code meaning "missing".
    #[must_use]
    pub const fn missing_code(self) -> u32 {
        let (_, bits, _, _, _) = self.layout();
        (1 << bits) - 1
    }

    /// Largest absolute error introduced by quantization.
    #[must_use]
    pub fn tolerance(self) -> f64 {
        let (_, _, scale, _, _) = self.layout();
        0.5 / scale
    }

    /// Smallest and largest storable values.
    #[must_use]
    pub fn range(self) -> (f64, f64) {
        (self.decode(0), self.decode(self.missing_code() - 1))
    }

    /// Quantizes `value` to this channel's code.
    ///
    /// `NaN` maps to [`Channel::missing_code`]; everything else is clamped
    /// into the storable range.
    #[must_use]
    pub fn encode(self, value: f64) -> u32 {
        if value.is_nan() {
            return self.missing_code();
        }
        let (_, _, scale, offset, _) = self.layout();
        let max = f64::from(self.missing_code() - 1);
        let scaled = ((value - offset) * scale).round().clamp(0.0, max);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // clamped to [0, max]
        let code = scaled as u32;
        code
    }

    /// Converts a code back to a value. The missing code yields `NaN`.
    #[must_use]
    pub fn decode(self, code: u32) -> f64 {
        if code >= self.missing_code() {
            return f64::NAN;
        }
        let (_, _, scale, offset, _) = self.layout();
        f64::from(code) / scale + offset
    }

    /// Histogram bucket holding `value`, or `None` when it is missing.
    #[must_use]
    pub fn bucket(self, value: f64) -> Option<u16> {
        let code = self.encode(value);
        if code == self.missing_code() {
            return None;
        }
        let (_, _, _, _, width) = self.layout();
        u16::try_from(code / width).ok()
    }

    /// Lowest value falling into `bucket`.
    #[must_use]
    pub fn bucket_floor(self, bucket: u16) -> f64 {
        let (_, _, _, _, width) = self.layout();
        self.decode(u32::from(bucket) * width)
    }

    fn extract(self, word: u64) -> u32 {
        let (shift, bits, _, _, _) = self.layout();
        #[allow(clippy::cast_possible_truncation)] // masked to at most 17 bits
        let code = ((word >> shift) & ((1u64 << bits) - 1)) as u32;
        code
    }

    fn insert(self, word: u64, code: u32) -> u64 {
        let (shift, _, _, _, _) = self.layout();
        word | (u64::from(code) << shift)
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Temperature => "temperature",
            Self::Pressure => "pressure",
            Self::Humidity => "humidity",
            Self::WindSpeed => "wind_speed",
            Self::WindDirection => "wind_direction",
        };
        f.write_str(name)
    }
}

/// One value per channel. `NaN` marks a missing channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReadingValues {
    /// Air temperature in °C.
    pub temperature: f64,
    /// Air pressure in Pa.
    pub pressure: f64,
    /// Relative humidity as a 0..1 fraction.
    pub humidity: f64,
    /// Wind speed in m/s.
    pub wind_speed: f64,
    /// Wind direction in degrees.
    pub wind_direction: f64,
}

impl Default for ReadingValues {
    fn default() -> Self {
        Self::missing()
    }
}

impl ReadingValues {
    /// A reading with every channel missing.
    #[must_use]
    pub const fn missing() -> Self {
        Self {
            temperature: f64::NAN,
            pressure: f64::NAN,
            humidity: f64::NAN,
            wind_speed: f64::NAN,
            wind_direction: f64::NAN,
        }
    }

    /// Value of one channel.
    #[must_use]
    pub fn get(&self, channel: Channel) -> f64 {
        match channel {
            Channel::Temperature => self.temperature,
            Channel::Pressure => self.pressure,
            Channel::Humidity => self.humidity,
            Channel::WindSpeed => self.wind_speed,
            Channel::WindDirection => self.wind_direction,
        }
    }

    /// Sets one channel.
    pub fn set(&mut self, channel: Channel, value: f64) {
        let slot = match channel {
            Channel::Temperature => &mut self.temperature,
            Channel::Pressure => &mut self.pressure,
            Channel::Humidity => &mut self.humidity,
            Channel::WindSpeed => &mut self.wind_speed,
            Channel::WindDirection => &mut self.wind_direction,
        };
        *slot = value;
    }

    /// Builds a reading by evaluating `f` for each channel.
    pub fn from_fn(mut f: impl FnMut(Channel) -> f64) -> Self {
        let mut values = Self::missing();
        for channel in Channel::ALL {
            values.set(channel, f(channel));
        }
        values
    }

    /// Packs the reading into its 8-byte stored form.
    #[must_use]
    pub fn pack(&self) -> [u8; PACKED_LEN] {
        let word = Channel::ALL
            .iter()
            .fold(0u64, |word, &ch| ch.insert(word, ch.encode(self.get(ch))));
        word.to_le_bytes()
    }

    /// Unpacks a stored blob. Bytes beyond the eighth are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::ShortReading`] if fewer than 8 bytes are given.
    pub fn unpack(bytes: &[u8]) -> Result<Self, CodecError> {
        let head: [u8; PACKED_LEN] = bytes
            .get(..PACKED_LEN)
            .and_then(|b| b.try_into().ok())
            .ok_or(CodecError::ShortReading { len: bytes.len() })?;
        let word = u64::from_le_bytes(head);
        Ok(Self::from_fn(|ch| ch.decode(ch.extract(word))))
    }

    /// True if each channel matches `other` within quantization tolerance,
    /// treating two missing values as equal.
    #[must_use]
    pub fn approx_eq(&self, other: &Self) -> bool {
        Channel::ALL.iter().all(|&ch| {
            let (a, b) = (self.get(ch), other.get(ch));
            (a.is_nan() && b.is_nan()) || (a - b).abs() <= ch.tolerance() + f64::EPSILON * 1e3
        })
    }
}

/// Sparse bucket → count mapping for one channel.
///
/// Absent buckets count as zero; zero counts are never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Histogram {
    buckets: BTreeMap<u16, u32>,
}

impl Histogram {
    /// An empty histogram.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one occurrence to `bucket`.
    pub fn increment(&mut self, bucket: u16) {
        self.add(bucket, 1);
    }

    /// Adds `count` occurrences to `bucket`. A zero count is a no-op.
    pub fn add(&mut self, bucket: u16, count: u32) {
        if count > 0 {
            let slot = self.buckets.entry(bucket).or_insert(0);
            *slot = slot.saturating_add(count);
        }
    }

    /// Count for `bucket`, zero when absent.
    #[must_use]
    pub fn get(&self, bucket: u16) -> u32 {
        self.buckets.get(&bucket).copied().unwrap_or(0)
    }

    /// Adds every count of `other` into `self`.
    pub fn merge(&mut self, other: &Self) {
        for (&bucket, &count) in &other.buckets {
            self.add(bucket, count);
        }
    }

    /// Sum of all counts.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.buckets.values().map(|&c| u64::from(c)).sum()
    }

    /// Non-zero buckets in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (u16, u32)> + '_ {
        self.buckets.iter().map(|(&b, &c)| (b, c))
    }

    /// True when no bucket holds a count.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Encodes the non-zero buckets.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.buckets.len() * 2);
        for (&bucket, &count) in &self.buckets {
            put_varint(&mut out, u32::from(bucket));
            put_varint(&mut out, count);
        }
        out
    }

    /// Decodes a histogram written by [`Histogram::encode`].
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] if the input ends mid-entry, holds an
    /// invalid varint, or a bucket index exceeds 16 bits.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut histogram = Self::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let raw_bucket = get_varint(bytes, &mut pos)?;
            let bucket = u16::try_from(raw_bucket)
                .map_err(|_| CodecError::BucketOutOfRange { bucket: raw_bucket })?;
            if pos >= bytes.len() {
                return Err(CodecError::TruncatedHistogram { offset: pos });
            }
            let count = get_varint(bytes, &mut pos)?;
            histogram.add(bucket, count);
        }
        Ok(histogram)
    }
}

impl FromIterator<(u16, u32)> for Histogram {
    fn from_iter<I: IntoIterator<Item = (u16, u32)>>(iter: I) -> Self {
        let mut histogram = Self::new();
        for (bucket, count) in iter {
            histogram.add(bucket, count);
        }
        histogram
    }
}

/// Appends `value` as a SQLite4 varint.
///
/// [Docs](https://sqlite.org/src4/doc/trunk/www/varint.wiki)
#[allow(clippy::cast_possible_truncation)] // every byte is masked or range-checked
fn put_varint(out: &mut Vec<u8>, value: u32) {
    if value <= 240 {
        out.push(value as u8);
    } else if value <= 2287 {
        let offset = value - 240;
        out.push(241 + (offset >> 8) as u8);
        out.push((offset & 0xFF) as u8);
    } else if value <= 67823 {
        let offset = value - 2288;
        out.push(249);
        out.push((offset >> 8) as u8);
        out.push((offset & 0xFF) as u8);
    } else if value <= 0x00FF_FFFF {
        out.push(250);
        out.extend_from_slice(&value.to_be_bytes()[1..]);
    } else {
        out.push(251);
        out.extend_from_slice(&value.to_be_bytes());
    }
}

/// Reads one SQLite4 varint starting at `*pos`, advancing it.
fn get_varint(bytes: &[u8], pos: &mut usize) -> Result<u32, CodecError> {
    let start = *pos;
    let lead = *bytes
        .get(start)
        .ok_or(CodecError::TruncatedHistogram { offset: start })?;
    let extra = match lead {
        0..=240 => 0,
        241..=248 => 1,
        249 => 2,
        250 => 3,
        251 => 4,
        _ => return Err(CodecError::InvalidVarint { byte: lead, offset: start }),
    };
    let tail = bytes
        .get(start + 1..start + 1 + extra)
        .ok_or(CodecError::TruncatedHistogram { offset: bytes.len() })?;
    *pos = start + 1 + extra;

    let be = tail.iter().fold(0u32, |acc, &b| (acc << 8) | u32::from(b));
    Ok(match lead {
        0..=240 => u32::from(lead),
        241..=248 => 240 + ((u32::from(lead) - 241) << 8) + be,
        249 => 2288 + be,
        _ => be,
    })
}
