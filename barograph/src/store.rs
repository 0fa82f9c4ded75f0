//! Store facade for the barograph sensor storage engine.
//!
//! [`Store`] is the caller-facing API. It owns one lazily opened
//! [`Session`] and routes every operation through the sensor directory,
//! record store, adjustment engine and summary aggregator. Timestamps at
//! this boundary are wall-clock `DateTime<Utc>` values and `TimeDelta`
//! spans; internally they are whole epoch seconds.
//!
//! # Design
//!
//! - Writes go through chunked transactions sized by
//!   [`StoreConfig::batch_size`], so a large push is not atomic end to end
//! - Every push rebuilds the summaries of the ten-minute periods it touched
//! - Reads stream in pages of [`StoreConfig::query_chunk_size`]
//!
//! # Example Usage
//!
//! ```rust
//! use barograph::{ReadingValues, Reading, Store};
//! use chrono::{DateTime, TimeDelta};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut store = Store::open_in_memory()?;
//!
//! let start = DateTime::from_timestamp(1_700_000_400, 0).ok_or("bad timestamp")?;
//! let readings = (0..600)
//!     .map(|i| {
//!         let mut values = ReadingValues::missing();
//!         values.temperature = 21.5;
//!         Reading::new(start + TimeDelta::seconds(i), values)
//!     })
//!     .collect::<Result<Vec<_>, _>>()?;
//! store.push_readings("porch", &readings, true)?;
//!
//! let summaries =
//!     store.query_summaries("porch", start, TimeDelta::minutes(10), TimeDelta::minutes(10))?;
//! assert_eq!(summaries.records()[0].record_count, 600);
//! # Ok(())
//! # }
//! ```

use std::ops::RangeInclusive;

use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

use crate::adjust::{self, AdjustPlan, AdjustReport, AdjustSizes};
use crate::config::StoreConfig;
use crate::error::{BarographError, Result};
use crate::record::{self, PushReport, Reading, ReadingIter};
use crate::sensor::{self, SensorInfo};
use crate::session::Session;
use crate::summary::{self, Resolution, SummaryResult};
use crate::time::{PosixTime, PosixTimeRange};

/// Row counts of every table, as shown by `barograph info`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreInfo {
    /// Registered sensors.
    pub sensors: u64,
    /// Raw readings across all sensors.
    pub records: u64,
    /// Minute summary rows.
    pub minute_records: u64,
    /// Ten-minute summary rows.
    pub ten_minute_records: u64,
    /// Recorded sync stamps.
    pub sync_stamps: u64,
}

/// Top-level handle to a sensor reading store.
///
/// # Thread Safety
///
/// A store owns a single connection and is meant for one writer. It is
/// `Send` but not `Sync`; share it behind a lock if several threads write.
#[derive(Debug)]
pub struct Store {
    session: Session,
}

impl Store {
    /// Opens a store described by `config`.
    ///
    /// Nothing is touched on disk until the first operation.
    ///
    /// # Errors
    ///
    /// Returns [`BarographError::Config`] if the configuration is invalid.
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            session: Session::new(config),
        })
    }

    /// Opens a private in-memory store.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the signature matches [`Store::open`].
    pub fn open_in_memory() -> Result<Self> {
        Self::open(StoreConfig::in_memory())
    }

    /// The configuration this store was opened with.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        self.session.config()
    }

    /// Every resolution callers may ask for, including the ones with no
    /// backing table.
    #[must_use]
    pub fn supported_summary_spans(&self) -> [Resolution; 4] {
        Resolution::ADVERTISED
    }

    /// Closes the underlying connection. Later calls reopen it.
    ///
    /// # Errors
    ///
    /// Returns [`BarographError::Database`] if SQLite refuses to close.
    pub fn close(&mut self) -> Result<()> {
        self.session.close()
    }

    fn conn(&mut self) -> Result<&mut Connection> {
        self.session.connection()
    }

    fn sizes(&self) -> AdjustSizes {
        let config = self.session.config();
        AdjustSizes {
            batch_size: config.batch_size,
            page_size: config.query_chunk_size,
        }
    }

    /// Inserts readings for `sensor`, creating it if needed, and rebuilds
    /// the summaries of the pushed range.
    ///
    /// With `replace` a reading at an already stored stamp overwrites it;
    /// otherwise the stored reading wins.
    ///
    /// # Errors
    ///
    /// - [`InvalidOperation::EmptySensorName`](crate::InvalidOperation::EmptySensorName)
    ///   for an empty name
    /// - [`BarographError::PartialBatch`] if a chunk failed after others
    ///   committed; summaries of the pushed range are rebuilt on a best
    ///   effort basis and the partial failure is what gets returned
    pub fn push_readings(
        &mut self,
        sensor: &str,
        readings: &[Reading],
        replace: bool,
    ) -> Result<PushReport> {
        let sizes = self.sizes();
        let conn = self.conn()?;
        let (id, _) = sensor::ensure(conn, sensor)?;

        let report = match record::push(conn, id, readings, replace, sizes.batch_size) {
            Ok(report) => report,
            Err(e @ BarographError::PartialBatch(_)) => {
                if let Some(range) = stamp_range(readings) {
                    tracing::warn!(sensor, %range, "rebuilding summaries after partial push");
                    if let Err(rebuild) =
                        summary::rebuild(conn, id, range, sizes.batch_size, sizes.page_size)
                    {
                        tracing::warn!(
                            sensor,
                            %range,
                            error = %rebuild,
                            "summary rebuild after partial push failed"
                        );
                    }
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if let Some(range) = report.range {
            summary::rebuild(conn, id, range, sizes.batch_size, sizes.page_size)?;
        }
        tracing::debug!(sensor, rows = report.batch.rows, "pushed readings");
        Ok(report)
    }

    /// Streams the readings of `sensor` in `[from, from + span]`, oldest
    /// first; a negative span reads `[from + span, from]` newest first.
    ///
    /// # Errors
    ///
    /// - [`BarographError::NotFound`] for an unknown sensor
    /// - [`InvalidOperation::TimestampOutOfRange`](crate::InvalidOperation::TimestampOutOfRange)
    ///   if `from` does not fit the stored stamp range
    pub fn query_readings(
        &mut self,
        sensor: &str,
        from: DateTime<Utc>,
        span: TimeDelta,
    ) -> Result<ReadingIter<'_>> {
        let from = PosixTime::try_from(from)?;
        let chunk_size = self.session.config().query_chunk_size;
        let conn: &Connection = self.conn()?;
        let id = sensor::require(conn, sensor)?;
        Ok(ReadingIter::from_span(conn, id, from, span.num_seconds(), chunk_size))
    }

    /// Summaries of `sensor` over `[from, from + span)` at the backed
    /// resolution closest to `desired`.
    ///
    /// # Errors
    ///
    /// - [`BarographError::NotFound`] for an unknown sensor
    /// - [`BarographError::Codec`] if a stored summary is corrupt
    pub fn query_summaries(
        &mut self,
        sensor: &str,
        from: DateTime<Utc>,
        span: TimeDelta,
        desired: TimeDelta,
    ) -> Result<SummaryResult> {
        self.query_summaries_at(sensor, from, span, summary::choose_best_summary_span(desired))
    }

    /// Summaries of `sensor` over `[from, from + span)` at exactly
    /// `resolution`.
    ///
    /// # Errors
    ///
    /// - [`BarographError::UnsupportedResolution`] for hour and day
    /// - [`BarographError::NotFound`] for an unknown sensor
    pub fn query_summaries_at(
        &mut self,
        sensor: &str,
        from: DateTime<Utc>,
        span: TimeDelta,
        resolution: Resolution,
    ) -> Result<SummaryResult> {
        if resolution.table().is_none() {
            return Err(BarographError::UnsupportedResolution { resolution });
        }
        let from = PosixTime::try_from(from)?;
        let conn = self.conn()?;
        let id = sensor::require(conn, sensor)?;
        summary::query(conn, id, from, span.num_seconds(), resolution)
    }

    /// Moves the readings `sensor` recorded over `current` so that they
    /// cover `corrected`, then rebuilds the affected summaries.
    ///
    /// Bounds are inclusive wall-clock times and may be given in either
    /// order. See [`crate::adjust`] for how records are shrunk, offset and
    /// expanded.
    ///
    /// # Errors
    ///
    /// - [`InvalidOperation::TimestampOutOfRange`](crate::InvalidOperation::TimestampOutOfRange)
    ///   if a bound does not fit the stored stamp range
    /// - [`BarographError::InvalidOperation`] if the ranges are identical,
    ///   the shrink or expand is infeasible, or the guard trips; the store
    ///   is unchanged
    /// - [`BarographError::NotFound`] for an unknown sensor
    pub fn adjust_timestamps(
        &mut self,
        sensor: &str,
        current: RangeInclusive<DateTime<Utc>>,
        corrected: RangeInclusive<DateTime<Utc>>,
        can_overwrite: bool,
    ) -> Result<AdjustReport> {
        let (from, to) = current.into_inner();
        let current = PosixTimeRange::from_datetimes(from, to)?;
        let (from, to) = corrected.into_inner();
        let corrected = PosixTimeRange::from_datetimes(from, to)?;
        self.adjust_stamps(sensor, current, corrected, can_overwrite)
    }

    /// [`Store::adjust_timestamps`] over ranges of stored stamps.
    ///
    /// # Errors
    ///
    /// As for [`Store::adjust_timestamps`], minus the range conversion.
    pub fn adjust_stamps(
        &mut self,
        sensor: &str,
        current: PosixTimeRange,
        corrected: PosixTimeRange,
        can_overwrite: bool,
    ) -> Result<AdjustReport> {
        let plan = AdjustPlan::new(current, corrected)?;
        let sizes = self.sizes();
        let conn = self.conn()?;
        let id = sensor::require(conn, sensor)?;
        adjust::adjust(conn, id, &plan, can_overwrite, sizes)
    }

    /// Registers a sensor. Returns `false` if it already existed.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidOperation::EmptySensorName`](crate::InvalidOperation::EmptySensorName)
    /// for an empty name.
    pub fn add_sensor(&mut self, sensor: &str) -> Result<bool> {
        let (_, created) = sensor::ensure(self.conn()?, sensor)?;
        Ok(created)
    }

    /// Deletes a sensor with its readings and summaries. Returns `false` if
    /// it did not exist.
    ///
    /// # Errors
    ///
    /// Returns [`BarographError::PartialDelete`] if some tables could not be
    /// cleared; the others stay cleared.
    pub fn delete_sensor(&mut self, sensor: &str) -> Result<bool> {
        sensor::delete(self.conn()?, sensor)
    }

    /// Renames a sensor. Returns `false` if `old` is unknown or `new` taken.
    ///
    /// # Errors
    ///
    /// Returns [`BarographError::Database`] on storage failure.
    pub fn rename_sensor(&mut self, old: &str, new: &str) -> Result<bool> {
        sensor::rename(self.conn()?, old, new)
    }

    /// Every registered sensor, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`BarographError::Database`] on storage failure.
    pub fn get_all_sensors(&mut self) -> Result<Vec<SensorInfo>> {
        sensor::all(self.conn()?)
    }

    /// Appends a sync stamp.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidOperation::TimestampOutOfRange`](crate::InvalidOperation::TimestampOutOfRange)
    /// if `stamp` does not fit the stored stamp range.
    pub fn push_sync_stamp(&mut self, stamp: DateTime<Utc>) -> Result<()> {
        let stamp = PosixTime::try_from(stamp)?;
        self.conn()?
            .prepare_cached("INSERT INTO sync_stamp (stamp) VALUES (?1)")?
            .execute(params![stamp.secs()])?;
        Ok(())
    }

    /// The newest sync stamp, or the start of the newest ten-minute
    /// summary when none was ever pushed.
    ///
    /// # Errors
    ///
    /// Returns [`BarographError::Database`] on storage failure.
    pub fn get_max_sync_stamp(&mut self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn()?;
        let stamp: Option<i32> = conn
            .query_row("SELECT MAX(stamp) FROM sync_stamp", [], |row| row.get(0))
            .optional()?
            .flatten();
        let stamp = match stamp {
            Some(secs) => Some(PosixTime::new(secs)),
            None => summary::latest_period_start(conn)?,
        };
        Ok(stamp.map(PosixTime::to_datetime))
    }

    /// Name of the most recently active sensor last loaded from
    /// `hardware_id`.
    ///
    /// # Errors
    ///
    /// Returns [`BarographError::Database`] on storage failure.
    pub fn latest_name_for_hardware_id(&mut self, hardware_id: &str) -> Result<Option<String>> {
        sensor::latest_name_for_hardware_id(self.conn()?, hardware_id)
    }

    /// Records that `sensor` was last loaded from `hardware_id`. Returns
    /// `false` if the sensor does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`BarographError::Database`] on storage failure.
    pub fn set_latest_name_for_hardware_id(
        &mut self,
        sensor: &str,
        hardware_id: &str,
    ) -> Result<bool> {
        sensor::set_last_hardware_id(self.conn()?, sensor, hardware_id)
    }

    /// Row counts of every table.
    ///
    /// # Errors
    ///
    /// Returns [`BarographError::Database`] on storage failure.
    pub fn info(&mut self) -> Result<StoreInfo> {
        let conn = self.conn()?;
        let count = |table: &str| -> Result<u64> {
            let sql = format!("SELECT COUNT(*) FROM {table}");
            let n: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
            Ok(u64::try_from(n).unwrap_or(0))
        };
        Ok(StoreInfo {
            sensors: count("sensor")?,
            records: count("record")?,
            minute_records: count("minute_record")?,
            ten_minute_records: count("ten_minute_record")?,
            sync_stamps: count("sync_stamp")?,
        })
    }
}

fn stamp_range(readings: &[Reading]) -> Option<PosixTimeRange> {
    let low = readings.iter().map(|r| r.stamp).min()?;
    let high = readings.iter().map(|r| r.stamp).max()?;
    Some(PosixTimeRange { low, high })
}
