//! Raw record store.
//!
//! Raw records are keyed by `(sensor_id, stamp)` and hold one packed
//! reading. This module owns every statement that touches the `record`
//! table: chunked inserts, lazily paged range reads, and the range helpers
//! the adjustment engine builds on.
//!
//! # Paging
//!
//! [`ReadingIter`] never materializes a full result. It fetches
//! `chunk_size` rows at a time with keyset pagination (`stamp > last`), so
//! memory stays bounded and a half-consumed iterator can simply be dropped.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};

use crate::batch::{BatchReport, ChunkedWriter};
use crate::codec::ReadingValues;
use crate::error::Result;
use crate::sensor::SensorId;
use crate::time::{PosixTime, PosixTimeRange};

const INSERT_REPLACE: &str =
    "INSERT OR REPLACE INTO record (sensor_id, stamp, packed_values) VALUES (?1, ?2, ?3)";
const INSERT_IGNORE: &str =
    "INSERT OR IGNORE INTO record (sensor_id, stamp, packed_values) VALUES (?1, ?2, ?3)";

/// One raw sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// When the sample was taken.
    pub stamp: PosixTime,
    /// Channel values.
    pub values: ReadingValues,
}

impl Reading {
    /// A reading at a stored stamp.
    #[must_use]
    pub const fn at(stamp: PosixTime, values: ReadingValues) -> Self {
        Self { stamp, values }
    }

    /// A reading at a wall-clock time.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidOperation::TimestampOutOfRange`](crate::error::InvalidOperation::TimestampOutOfRange)
    /// if the time does not fit a 32-bit stamp.
    pub fn new(timestamp: DateTime<Utc>, values: ReadingValues) -> Result<Self> {
        Ok(Self::at(timestamp.try_into()?, values))
    }

    /// Wall-clock time of the sample.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.stamp.to_datetime()
    }
}

/// Outcome of [`push`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushReport {
    /// Rows and chunks written.
    pub batch: BatchReport,
    /// `[min, max]` stamp of the input, `None` for empty input.
    pub range: Option<PosixTimeRange>,
}

/// Scan direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    /// Oldest first.
    Ascending,
    /// Newest first.
    Descending,
}

/// Inserts readings for one sensor.
///
/// With `replace` a colliding stamp is overwritten, otherwise the new
/// reading is dropped.
///
/// # Errors
///
/// Returns [`BarographError::PartialBatch`](crate::BarographError::PartialBatch)
/// if a chunk fails after earlier chunks committed.
pub fn push(
    conn: &Connection,
    sensor_id: SensorId,
    readings: &[Reading],
    replace: bool,
    chunk_size: usize,
) -> Result<PushReport> {
    let Some(first) = readings.first() else {
        return Ok(PushReport::default());
    };
    let (low, high) = readings
        .iter()
        .fold((first.stamp, first.stamp), |(lo, hi), r| (lo.min(r.stamp), hi.max(r.stamp)));

    let sql = if replace { INSERT_REPLACE } else { INSERT_IGNORE };
    let mut writer = ChunkedWriter::new(conn, chunk_size);
    for reading in readings {
        writer.write(
            sql,
            params![sensor_id.get(), reading.stamp.secs(), &reading.values.pack()[..]],
        )?;
    }
    let batch = writer.finish()?;

    Ok(PushReport {
        batch,
        range: Some(PosixTimeRange { low, high }),
    })
}

/// Lazily paged, single-pass iterator over one sensor's readings.
#[derive(Debug)]
pub struct ReadingIter<'c> {
    conn: &'c Connection,
    sensor_id: SensorId,
    /// Next unread bound: the low end when ascending, the high end when
    /// descending.
    low: i64,
    high: i64,
    order: Order,
    chunk_size: usize,
    buffer: VecDeque<Reading>,
    exhausted: bool,
}

impl<'c> ReadingIter<'c> {
    /// Iterates readings with stamps in `range`.
    #[must_use]
    pub fn new(
        conn: &'c Connection,
        sensor_id: SensorId,
        range: PosixTimeRange,
        order: Order,
        chunk_size: usize,
    ) -> Self {
        Self {
            conn,
            sensor_id,
            low: i64::from(range.low.secs()),
            high: i64::from(range.high.secs()),
            order,
            chunk_size: chunk_size.max(1),
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Iterates `[from, from + span]`; a negative span reads
    /// `[from + span, from]` newest first.
    #[must_use]
    pub fn from_span(
        conn: &'c Connection,
        sensor_id: SensorId,
        from: PosixTime,
        span: i64,
        chunk_size: usize,
    ) -> Self {
        let order = if span < 0 { Order::Descending } else { Order::Ascending };
        Self::new(conn, sensor_id, PosixTimeRange::from_span(from, span), order, chunk_size)
    }

    /// The scan direction.
    #[must_use]
    pub fn order(&self) -> Order {
        self.order
    }

    fn fetch_chunk(&mut self) -> Result<()> {
        let sql = match self.order {
            Order::Ascending => {
                "SELECT stamp, packed_values FROM record
                 WHERE sensor_id = ?1 AND stamp >= ?2 AND stamp <= ?3
                 ORDER BY stamp ASC LIMIT ?4"
            }
            Order::Descending => {
                "SELECT stamp, packed_values FROM record
                 WHERE sensor_id = ?1 AND stamp >= ?2 AND stamp <= ?3
                 ORDER BY stamp DESC LIMIT ?4"
            }
        };
        let limit = i64::try_from(self.chunk_size).unwrap_or(i64::MAX);
        let conn = self.conn;

        let mut stmt = conn.prepare_cached(sql)?;
        let mut rows = stmt.query(params![self.sensor_id.get(), self.low, self.high, limit])?;
        let mut fetched = 0;
        while let Some(row) = rows.next()? {
            let stamp: i32 = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            self.buffer
                .push_back(Reading::at(PosixTime::new(stamp), ReadingValues::unpack(&blob)?));
            fetched += 1;
        }

        if fetched < self.chunk_size {
            self.exhausted = true;
        } else if let Some(last) = self.buffer.back() {
            match self.order {
                Order::Ascending => self.low = i64::from(last.stamp.secs()) + 1,
                Order::Descending => self.high = i64::from(last.stamp.secs()) - 1,
            }
            if self.low > self.high {
                self.exhausted = true;
            }
        }
        Ok(())
    }
}

impl Iterator for ReadingIter<'_> {
    type Item = Result<Reading>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch_chunk() {
                // A failed page ends the sequence after reporting once.
                self.exhausted = true;
                self.buffer.clear();
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

/// Removes every raw record of a sensor.
///
/// # Errors
///
/// Returns [`BarographError::Database`](crate::BarographError::Database) on
/// storage failure.
pub fn delete_for_sensor(conn: &Connection, sensor_id: SensorId) -> Result<usize> {
    Ok(conn.execute("DELETE FROM record WHERE sensor_id = ?1", params![sensor_id.get()])?)
}

/// Up to `limit` stamps of one sensor inside `[low, high]`, in `order`.
pub(crate) fn stamps_in(
    conn: &Connection,
    sensor_id: SensorId,
    low: i64,
    high: i64,
    order: Order,
    limit: usize,
) -> Result<Vec<i64>> {
    if low > high {
        return Ok(Vec::new());
    }
    let sql = match order {
        Order::Ascending => {
            "SELECT stamp FROM record WHERE sensor_id = ?1 AND stamp BETWEEN ?2 AND ?3
             ORDER BY stamp ASC LIMIT ?4"
        }
        Order::Descending => {
            "SELECT stamp FROM record WHERE sensor_id = ?1 AND stamp BETWEEN ?2 AND ?3
             ORDER BY stamp DESC LIMIT ?4"
        }
    };
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let mut stmt = conn.prepare_cached(sql)?;
    let stamps = stmt
        .query_map(params![sensor_id.get(), low, high, limit], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(stamps)
}

/// Number of one sensor's records inside `[low, high]`.
pub(crate) fn count_in(conn: &Connection, sensor_id: SensorId, low: i64, high: i64) -> Result<u64> {
    if low > high {
        return Ok(0);
    }
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM record WHERE sensor_id = ?1 AND stamp BETWEEN ?2 AND ?3",
        params![sensor_id.get(), low, high],
        |row| row.get(0),
    )?;
    Ok(u64::try_from(count).unwrap_or(0))
}

/// Deletes one sensor's records inside `[low, high]`.
pub(crate) fn delete_in(conn: &Connection, sensor_id: SensorId, low: i64, high: i64) -> Result<usize> {
    if low > high {
        return Ok(0);
    }
    Ok(conn.execute(
        "DELETE FROM record WHERE sensor_id = ?1 AND stamp BETWEEN ?2 AND ?3",
        params![sensor_id.get(), low, high],
    )?)
}
