//! Summary aggregator.
//!
//! Summary tables hold derived per-period statistics of the raw records and
//! carry no independent truth: whenever raw data in a window changes, the
//! covering summaries are rebuilt from scratch.
//!
//! # Design
//!
//! Rebuilding a window:
//! - Aligns it outward to ten-minute boundaries, `[floor(low), floor(high) + 10min)`
//! - Streams the raw records of that window once
//! - Builds one [`SummaryWindow`] per minute that has data
//! - Merges contiguous minute windows sharing a ten-minute start
//! - Replaces each table's rows in the window: the delete commits with the
//!   first chunk of inserts
//!
//! # Resolution Selection
//!
//! ```text
//! desired:   0 ──── 1min ──────── 5.5min ──────── 10min ──── ∞
//! chosen:    └ 1min ┘└──── 1min ────┘└──── 10min ───┘└ 10min ┘
//! ```
//!
//! Hour and day spans are advertised for display but have no backing
//! table; asking for them explicitly is an error.

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

use crate::batch::{BatchReport, ChunkedWriter};
use crate::codec::{Channel, Histogram, ReadingValues};
use crate::error::{BarographError, Result};
use crate::record::{Order, ReadingIter};
use crate::sensor::SensorId;
use crate::stats::SummaryWindow;
use crate::time::{MINUTE, PosixTime, PosixTimeRange, TEN_MINUTES};

/// A summary period length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// One minute.
    Minute,
    /// Ten minutes.
    TenMinutes,
    /// One hour. Advertised only.
    Hour,
    /// One day. Advertised only.
    Day,
}

impl Resolution {
    /// Every advertised resolution, ascending.
    pub const ADVERTISED: [Self; 4] = [Self::Minute, Self::TenMinutes, Self::Hour, Self::Day];

    /// Resolutions with a backing table, ascending.
    pub const BACKED: [Self; 2] = [Self::Minute, Self::TenMinutes];

    /// Period length in seconds.
    #[must_use]
    pub const fn seconds(self) -> i32 {
        match self {
            Self::Minute => MINUTE,
            Self::TenMinutes => TEN_MINUTES,
            Self::Hour => 3_600,
            Self::Day => 86_400,
        }
    }

    /// Period length.
    #[must_use]
    pub fn span(self) -> TimeDelta {
        TimeDelta::seconds(i64::from(self.seconds()))
    }

    /// Backing table, if any.
    #[must_use]
    pub const fn table(self) -> Option<&'static str> {
        match self {
            Self::Minute => Some("minute_record"),
            Self::TenMinutes => Some("ten_minute_record"),
            Self::Hour | Self::Day => None,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Minute => "minute",
            Self::TenMinutes => "ten_minutes",
            Self::Hour => "hour",
            Self::Day => "day",
        };
        f.write_str(name)
    }
}

/// Picks the backed resolution closest to `desired`.
///
/// Values at or below the smallest span clamp to it, values at or above
/// the largest clamp to that. Otherwise the nearest span wins, and an
/// exact tie goes to the larger one.
#[must_use]
pub fn choose_best_summary_span(desired: TimeDelta) -> Resolution {
    let want = desired.num_seconds();
    let backed = Resolution::BACKED;
    let mut best = backed[0];
    for pair in backed.windows(2) {
        let (lower, upper) = (pair[0], pair[1]);
        let (lo, hi) = (i64::from(lower.seconds()), i64::from(upper.seconds()));
        if want <= lo {
            return best;
        }
        best = if want >= hi || hi - want <= want - lo { upper } else { lower };
        if want < hi {
            return best;
        }
    }
    best
}

/// One stored summary row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    /// Period start.
    pub stamp: PosixTime,
    /// Raw records in the period.
    pub record_count: u32,
    /// Per-channel minimum.
    pub min: ReadingValues,
    /// Per-channel maximum.
    pub max: ReadingValues,
    /// Per-channel mean.
    pub mean: ReadingValues,
    /// Per-channel sample standard deviation.
    pub stddev: ReadingValues,
    /// Per-channel bucket counts, indexed by [`Channel::index`].
    pub histograms: [Histogram; Channel::COUNT],
}

impl SummaryRecord {
    /// Period start as wall-clock time.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.stamp.to_datetime()
    }

    /// Bucket counts of one channel.
    #[must_use]
    pub fn histogram(&self, channel: Channel) -> &Histogram {
        &self.histograms[channel.index()]
    }

    fn from_row(row: &Row<'_>) -> Result<Self> {
        let blob = |idx: usize| row.get::<_, Vec<u8>>(idx);
        let stats =
            |idx: usize| -> Result<ReadingValues> { Ok(ReadingValues::unpack(&blob(idx)?)?) };
        let record_count: i64 = row.get(5)?;

        let mut histograms: [Histogram; Channel::COUNT] = Default::default();
        for (offset, histogram) in histograms.iter_mut().enumerate() {
            *histogram = Histogram::decode(&blob(6 + offset)?)?;
        }

        Ok(Self {
            stamp: PosixTime::new(row.get(0)?),
            record_count: u32::try_from(record_count).unwrap_or(u32::MAX),
            min: stats(1)?,
            max: stats(2)?,
            mean: stats(3)?,
            stddev: stats(4)?,
            histograms,
        })
    }
}

/// Summaries returned by a query, tagged with the resolution used.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryResult {
    resolution: Resolution,
    records: Vec<SummaryRecord>,
}

impl SummaryResult {
    /// Resolution the rows were read from.
    #[must_use]
    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// The rows, in query order.
    #[must_use]
    pub fn records(&self) -> &[SummaryRecord] {
        &self.records
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when no rows matched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl IntoIterator for SummaryResult {
    type Item = SummaryRecord;
    type IntoIter = std::vec::IntoIter<SummaryRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

/// Outcome of [`rebuild`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebuildReport {
    /// First stamp of the rebuilt window.
    pub low: PosixTime,
    /// First stamp past the rebuilt window.
    pub high_exclusive: i64,
    /// Minute rows written.
    pub minute: BatchReport,
    /// Ten-minute rows written.
    pub ten_minute: BatchReport,
}

/// Recomputes both summary tables for the ten-minute-aligned window
/// covering `range`.
///
/// # Errors
///
/// Returns [`BarographError::Codec`] if a raw record is corrupt, or a
/// storage error from either table's chunked write.
pub fn rebuild(
    conn: &Connection,
    sensor_id: SensorId,
    range: PosixTimeRange,
    batch_size: usize,
    page_size: usize,
) -> Result<RebuildReport> {
    let low = range.low.floor_to(TEN_MINUTES);
    let last_period = range.high.floor_to(TEN_MINUTES);
    let high_exclusive = i64::from(last_period.secs()) + i64::from(TEN_MINUTES);
    let scan = PosixTimeRange::new(low, last_period.saturating_add(i64::from(TEN_MINUTES - 1)));

    let mut minutes: Vec<SummaryWindow> = Vec::new();
    for reading in ReadingIter::new(conn, sensor_id, scan, Order::Ascending, page_size) {
        let reading = reading?;
        let start = reading.stamp.floor_to(MINUTE);
        match minutes.last_mut() {
            Some(window) if window.start() == start => window.add_reading(&reading.values),
            _ => {
                let mut window = SummaryWindow::new(start);
                window.add_reading(&reading.values);
                minutes.push(window);
            }
        }
    }

    let mut ten_minutes: Vec<SummaryWindow> = Vec::new();
    for minute in &minutes {
        let start = minute.start().floor_to(TEN_MINUTES);
        match ten_minutes.last_mut() {
            Some(window) if window.start() == start => window.merge(minute),
            _ => {
                let mut window = SummaryWindow::new(start);
                window.merge(minute);
                ten_minutes.push(window);
            }
        }
    }

    let minute = replace_window(
        conn,
        Resolution::Minute,
        sensor_id,
        low,
        high_exclusive,
        &minutes,
        batch_size,
    )?;
    let ten_minute = replace_window(
        conn,
        Resolution::TenMinutes,
        sensor_id,
        low,
        high_exclusive,
        &ten_minutes,
        batch_size,
    )?;
    tracing::debug!(
        sensor_id = sensor_id.get(),
        low = low.secs(),
        high_exclusive,
        minutes = minute.rows,
        ten_minutes = ten_minute.rows,
        "rebuilt summaries"
    );

    Ok(RebuildReport {
        low,
        high_exclusive,
        minute,
        ten_minute,
    })
}

fn replace_window(
    conn: &Connection,
    resolution: Resolution,
    sensor_id: SensorId,
    low: PosixTime,
    high_exclusive: i64,
    windows: &[SummaryWindow],
    batch_size: usize,
) -> Result<BatchReport> {
    let table = resolution
        .table()
        .ok_or(BarographError::UnsupportedResolution { resolution })?;
    let delete = format!("DELETE FROM {table} WHERE sensor_id = ?1 AND stamp >= ?2 AND stamp < ?3");
    let insert = format!(
        "INSERT INTO {table} (sensor_id, stamp, min_values, max_values, mean_values, stddev_values,
             record_count, temp_counts, press_counts, hum_counts, speed_counts, dir_counts)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
    );

    let mut writer = ChunkedWriter::new(conn, batch_size);
    writer.prelude(&delete, params![sensor_id.get(), low.secs(), high_exclusive])?;
    for window in windows {
        let histogram = |ch: Channel| window.channel(ch).histogram().encode();
        writer.write(
            &insert,
            params![
                sensor_id.get(),
                window.start().secs(),
                &window.min().pack()[..],
                &window.max().pack()[..],
                &window.mean().pack()[..],
                &window.stddev().pack()[..],
                window.record_count(),
                histogram(Channel::Temperature),
                histogram(Channel::Pressure),
                histogram(Channel::Humidity),
                histogram(Channel::WindSpeed),
                histogram(Channel::WindDirection),
            ],
        )?;
    }
    writer.finish()
}

/// Reads summaries with `from <= stamp < from + span`; a negative span
/// reads `[from + span, from)` newest first.
///
/// # Errors
///
/// Returns [`BarographError::UnsupportedResolution`] for hour and day, or
/// [`BarographError::Codec`] if a stored row is corrupt.
pub fn query(
    conn: &Connection,
    sensor_id: SensorId,
    from: PosixTime,
    span: i64,
    resolution: Resolution,
) -> Result<SummaryResult> {
    let table = resolution
        .table()
        .ok_or(BarographError::UnsupportedResolution { resolution })?;
    let from = i64::from(from.secs());
    let (low, high, direction) = if span < 0 {
        (from + span, from, "DESC")
    } else {
        (from, from + span, "ASC")
    };

    let sql = format!(
        "SELECT stamp, min_values, max_values, mean_values, stddev_values, record_count,
                temp_counts, press_counts, hum_counts, speed_counts, dir_counts
         FROM {table}
         WHERE sensor_id = ?1 AND stamp >= ?2 AND stamp < ?3
         ORDER BY stamp {direction}"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut rows = stmt.query(params![sensor_id.get(), low, high])?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        records.push(SummaryRecord::from_row(row)?);
    }
    Ok(SummaryResult { resolution, records })
}

/// Start of the newest ten-minute summary of any sensor.
pub(crate) fn latest_period_start(conn: &Connection) -> Result<Option<PosixTime>> {
    let stamp: Option<i32> = conn
        .query_row("SELECT MAX(stamp) FROM ten_minute_record", [], |row| row.get(0))
        .optional()?
        .flatten();
    Ok(stamp.map(PosixTime::new))
}
