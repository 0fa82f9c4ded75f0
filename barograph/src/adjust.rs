//! Range adjustment engine.
//!
//! Retroactively moves a sensor's raw records so that data recorded over
//! `current` ends up covering `corrected`. This fixes readings logged with
//! a drifting or mis-set clock.
//!
//! # Design
//!
//! With `delta = corrected.span - current.span` and
//! `offset = corrected.low - current.low`, an adjustment is at most two
//! steps, each in its own transaction:
//!
//! - **Shrink** (`delta < 0`), then **offset** the shrunk range
//! - **Offset**, then **expand** (`delta > 0`) the offset range
//!
//! Summaries are rebuilt afterwards: once over the union of both ranges if
//! they intersect, otherwise once per range.
//!
//! # Collision Avoidance
//!
//! Stamps are moved in place, so every step walks its rows in the
//! direction away from its targets: rows moving down are visited lowest
//! first, rows moving up highest first. A target is then either outside
//! the source range (cleared beforehand) or a slot already vacated. The
//! same rule makes keyset paging safe: moved rows never land in the part
//! of the range still to be visited.
//!
//! ```text
//! offset +3, visited high → low:
//!   before   a b c d e . . .
//!   after    . . . a b c d e
//! ```
//!
//! Shrink is the one step that collides on purpose: removal `k` shifts a
//! segment down by `k + 1`, and its first row replaces the previous
//! segment's last row.

use rusqlite::{Connection, params};

use crate::error::{InvalidOperation, Result};
use crate::record::{self, Order};
use crate::sensor::SensorId;
use crate::summary::{self, RebuildReport};
use crate::time::PosixTimeRange;

const MOVE: &str = "UPDATE record SET stamp = ?3 WHERE sensor_id = ?1 AND stamp = ?2";
const MOVE_OR_REPLACE: &str =
    "UPDATE OR REPLACE record SET stamp = ?3 WHERE sensor_id = ?1 AND stamp = ?2";

/// A validated adjustment between two ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdjustPlan {
    current: PosixTimeRange,
    corrected: PosixTimeRange,
    delta: i64,
    offset: i64,
}

impl AdjustPlan {
    /// Validates an adjustment without touching storage.
    ///
    /// # Errors
    ///
    /// - [`InvalidOperation::NoChange`] if the ranges are identical
    /// - [`InvalidOperation::ShrinkTooLarge`] if more slots would be removed
    ///   than the current span holds
    /// - [`InvalidOperation::ExpandTooLarge`] if the inserted slots do not
    ///   fit the resulting span, which happens for a single-stamp range
    pub fn new(
        current: PosixTimeRange,
        corrected: PosixTimeRange,
    ) -> std::result::Result<Self, InvalidOperation> {
        let delta = corrected.span() - current.span();
        let offset = i64::from(corrected.low.secs()) - i64::from(current.low.secs());
        if delta == 0 && offset == 0 {
            return Err(InvalidOperation::NoChange);
        }
        if delta < 0 && -delta > current.span() {
            return Err(InvalidOperation::ShrinkTooLarge {
                removals: -delta,
                span: current.span(),
            });
        }
        if delta > 0 && delta >= corrected.span() {
            return Err(InvalidOperation::ExpandTooLarge {
                inserts: delta,
                resulting_span: corrected.span(),
            });
        }
        Ok(Self {
            current,
            corrected,
            delta,
            offset,
        })
    }

    /// The range the data covers now.
    #[must_use]
    pub fn current(&self) -> PosixTimeRange {
        self.current
    }

    /// The range the data should cover.
    #[must_use]
    pub fn corrected(&self) -> PosixTimeRange {
        self.corrected
    }

    /// `corrected.span - current.span`.
    #[must_use]
    pub fn delta(&self) -> i64 {
        self.delta
    }

    /// `corrected.low - current.low`.
    #[must_use]
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Windows whose summaries must be rebuilt afterwards.
    #[must_use]
    pub fn rebuild_windows(&self) -> Vec<PosixTimeRange> {
        if self.current.intersects(&self.corrected) {
            vec![self.current.union(&self.corrected)]
        } else {
            vec![self.current, self.corrected]
        }
    }
}

/// Outcome of [`adjust`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdjustReport {
    /// Rows whose stamp changed.
    pub moved: usize,
    /// Rows deleted as overflow or shrink collisions.
    pub removed: usize,
    /// Summary windows rebuilt.
    pub rebuilt: Vec<RebuildReport>,
}

/// Batch and paging sizes used while adjusting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdjustSizes {
    /// Rows per committed summary chunk.
    pub batch_size: usize,
    /// Rows fetched per page.
    pub page_size: usize,
}

/// Applies `plan` to one sensor's raw records and rebuilds its summaries.
///
/// Unless `can_overwrite` is set, fails before any mutation if the
/// corrected range holds records outside the current range.
///
/// # Errors
///
/// - [`InvalidOperation::WouldOverwrite`] if the guard trips
/// - [`BarographError::Database`](crate::BarographError::Database) if a
///   step fails; earlier steps stay committed
pub fn adjust(
    conn: &mut Connection,
    sensor_id: SensorId,
    plan: &AdjustPlan,
    can_overwrite: bool,
    sizes: AdjustSizes,
) -> Result<AdjustReport> {
    if !can_overwrite {
        let existing = foreign_rows(conn, sensor_id, plan)?;
        if existing > 0 {
            return Err(InvalidOperation::WouldOverwrite { existing }.into());
        }
    }

    tracing::info!(
        sensor_id = sensor_id.get(),
        current = %plan.current,
        corrected = %plan.corrected,
        delta = plan.delta,
        offset = plan.offset,
        "adjusting timestamps"
    );

    let mut report = AdjustReport::default();
    let (low, high) = (
        i64::from(plan.current.low.secs()),
        i64::from(plan.current.high.secs()),
    );
    let page = sizes.page_size.max(1);

    if plan.delta < 0 {
        let step = shrink(conn, sensor_id, low, high - low, -plan.delta, page)?;
        report.absorb(step);
        if plan.offset != 0 {
            let shrunk_high = low + plan.corrected.span();
            let step = shift(conn, sensor_id, low, shrunk_high, plan.offset, page)?;
            report.absorb(step);
        }
    } else {
        if plan.offset != 0 {
            let step = shift(conn, sensor_id, low, high, plan.offset, page)?;
            report.absorb(step);
        }
        if plan.delta > 0 {
            let (low, high) = (low + plan.offset, high + plan.offset);
            let step = expand(conn, sensor_id, low, high, plan.delta, page)?;
            report.absorb(step);
        }
    }

    for window in plan.rebuild_windows() {
        let rebuilt = summary::rebuild(conn, sensor_id, window, sizes.batch_size, page)?;
        report.rebuilt.push(rebuilt);
    }

    tracing::info!(
        sensor_id = sensor_id.get(),
        moved = report.moved,
        removed = report.removed,
        "adjusted timestamps"
    );
    Ok(report)
}

/// Records inside `corrected` but outside `current`.
fn foreign_rows(conn: &Connection, sensor_id: SensorId, plan: &AdjustPlan) -> Result<u64> {
    let (cur_low, cur_high) = (
        i64::from(plan.current.low.secs()),
        i64::from(plan.current.high.secs()),
    );
    let (cor_low, cor_high) = (
        i64::from(plan.corrected.low.secs()),
        i64::from(plan.corrected.high.secs()),
    );
    let below = record::count_in(conn, sensor_id, cor_low, cor_high.min(cur_low - 1))?;
    let above = record::count_in(conn, sensor_id, cor_low.max(cur_high + 1), cor_high)?;
    Ok(below + above)
}

#[derive(Debug, Default)]
struct StepCounts {
    moved: usize,
    removed: usize,
}

impl AdjustReport {
    fn absorb(&mut self, step: StepCounts) {
        self.moved += step.moved;
        self.removed += step.removed;
    }
}

/// `a * b / c` without intermediate overflow, rounding toward zero.
fn mul_div(a: i64, b: i64, c: i64) -> i64 {
    let wide = i128::from(a) * i128::from(b) / i128::from(c);
    i64::try_from(wide).unwrap_or(if wide < 0 { i64::MIN } else { i64::MAX })
}

/// How far the row at index `i` of a span `span` moves down when
/// `removals` slots are taken out: `ceil(i * removals / span)`.
///
/// This is the removal segment `k` holding `i` plus one, where segment `k`
/// covers indices `floor(k * span / removals) + 1 ..= floor((k + 1) * span / removals)`.
fn shrink_shift(i: i64, span: i64, removals: i64) -> i64 {
    if i == 0 {
        return 0;
    }
    let wide = (i128::from(i) * i128::from(removals) + i128::from(span) - 1) / i128::from(span);
    i64::try_from(wide).unwrap_or(i64::MAX)
}

/// Visits the stamps of `[low, high]` page by page.
///
/// `visit` may move the stamp it is given, provided the target lies on the
/// already visited side.
fn for_each_stamp(
    conn: &Connection,
    sensor_id: SensorId,
    (mut low, mut high): (i64, i64),
    order: Order,
    page: usize,
    mut visit: impl FnMut(i64) -> Result<()>,
) -> Result<()> {
    while low <= high {
        let stamps = record::stamps_in(conn, sensor_id, low, high, order, page)?;
        for &stamp in &stamps {
            visit(stamp)?;
        }
        match (stamps.last(), order) {
            (Some(&last), Order::Ascending) if stamps.len() == page => low = last + 1,
            (Some(&last), Order::Descending) if stamps.len() == page => high = last - 1,
            _ => break,
        }
    }
    Ok(())
}

fn move_row(conn: &Connection, sql: &str, sensor_id: SensorId, from: i64, to: i64) -> Result<()> {
    conn.prepare_cached(sql)?
        .execute(params![sensor_id.get(), from, to])?;
    Ok(())
}

/// Compresses `[low, low + span]` into `[low, low + span - removals]`.
fn shrink(
    conn: &mut Connection,
    sensor_id: SensorId,
    low: i64,
    span: i64,
    removals: i64,
    page: usize,
) -> Result<StepCounts> {
    let tx = conn.transaction()?;
    let before = record::count_in(&tx, sensor_id, low, low + span)?;
    let mut moved = 0;

    for_each_stamp(&tx, sensor_id, (low + 1, low + span), Order::Ascending, page, |stamp| {
        let to = stamp - shrink_shift(stamp - low, span, removals);
        move_row(&tx, MOVE_OR_REPLACE, sensor_id, stamp, to)?;
        moved += 1;
        Ok(())
    })?;
    record::delete_in(&tx, sensor_id, low + span - removals + 1, low + span)?;

    let after = record::count_in(&tx, sensor_id, low, low + span)?;
    tx.commit()?;
    tracing::debug!(sensor_id = sensor_id.get(), low, span, removals, moved, "shrunk range");

    Ok(StepCounts {
        moved,
        removed: usize::try_from(before.saturating_sub(after)).unwrap_or(0),
    })
}

/// Moves every record of `[low, high]` by `offset`, clearing the part of
/// the destination outside the source first.
fn shift(
    conn: &mut Connection,
    sensor_id: SensorId,
    low: i64,
    high: i64,
    offset: i64,
    page: usize,
) -> Result<StepCounts> {
    let tx = conn.transaction()?;
    let (removed, order) = if offset < 0 {
        let cleared = record::delete_in(&tx, sensor_id, low + offset, (low - 1).min(high + offset))?;
        (cleared, Order::Ascending)
    } else {
        let cleared = record::delete_in(&tx, sensor_id, (high + 1).max(low + offset), high + offset)?;
        (cleared, Order::Descending)
    };

    let mut moved = 0;
    for_each_stamp(&tx, sensor_id, (low, high), order, page, |stamp| {
        move_row(&tx, MOVE, sensor_id, stamp, stamp + offset)?;
        moved += 1;
        Ok(())
    })?;
    tx.commit()?;
    tracing::debug!(sensor_id = sensor_id.get(), low, high, offset, moved, "offset range");

    Ok(StepCounts { moved, removed })
}

/// Stretches `[low, high]` to `[low, high + inserts]`.
///
/// The span is cut into `min(span, inserts + 1)` partitions; partition `p`
/// moves up by `floor(start_p * resulting / span) - start_p`, so partition
/// starts land proportionally and each partition keeps its spacing.
fn expand(
    conn: &mut Connection,
    sensor_id: SensorId,
    low: i64,
    high: i64,
    inserts: i64,
    page: usize,
) -> Result<StepCounts> {
    let span = high - low;
    let resulting = span + inserts;
    let partitions = span.min(inserts + 1);

    let tx = conn.transaction()?;
    let removed = record::delete_in(&tx, sensor_id, high + 1, high + inserts)?;

    let mut moved = 0;
    if record::count_in(&tx, sensor_id, high, high)? > 0 {
        move_row(&tx, MOVE, sensor_id, high, low + resulting)?;
        moved += 1;
    }

    for p in (0..partitions).rev() {
        let start = mul_div(p, span, partitions);
        let end = mul_div(p + 1, span, partitions);
        let lift = mul_div(start, resulting, span) - start;
        if lift == 0 || start >= end {
            continue;
        }
        for_each_stamp(&tx, sensor_id, (low + start, low + end - 1), Order::Descending, page, |stamp| {
            move_row(&tx, MOVE, sensor_id, stamp, stamp + lift)?;
            moved += 1;
            Ok(())
        })?;
    }
    tx.commit()?;
    tracing::debug!(sensor_id = sensor_id.get(), low, high, inserts, moved, "expanded range");

    Ok(StepCounts { moved, removed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ReadingValues;
    use crate::config::StoreConfig;
    use crate::record::{Reading, ReadingIter};
    use crate::sensor;
    use crate::session::Session;
    use crate::time::PosixTime;

    fn range(low: i32, high: i32) -> PosixTimeRange {
        PosixTimeRange::new(PosixTime::new(low), PosixTime::new(high))
    }

    #[test]
    fn test_plan_validation() {
        assert_eq!(
            AdjustPlan::new(range(10, 20), range(10, 20)),
            Err(InvalidOperation::NoChange)
        );
        assert!(matches!(
            AdjustPlan::new(range(10, 10), range(10, 15)),
            Err(InvalidOperation::ExpandTooLarge { inserts: 5, resulting_span: 5 })
        ));

        let plan = AdjustPlan::new(range(100, 200), range(90, 150)).unwrap();
        assert_eq!((plan.delta(), plan.offset()), (-40, -10));

        let plan = AdjustPlan::new(range(100, 200), range(100, 200 + 50)).unwrap();
        assert_eq!((plan.delta(), plan.offset()), (50, 0));
    }

    #[test]
    fn test_rebuild_windows() {
        let overlapping = AdjustPlan::new(range(100, 200), range(150, 260)).unwrap();
        assert_eq!(overlapping.rebuild_windows(), vec![range(100, 260)]);

        let disjoint = AdjustPlan::new(range(100, 200), range(1000, 1100)).unwrap();
        assert_eq!(disjoint.rebuild_windows(), vec![range(100, 200), range(1000, 1100)]);
    }

    #[test]
    fn test_shrink_shift_matches_segments() {
        // Segment k covers floor(k*S/D)+1 ..= floor((k+1)*S/D) and moves by k+1.
        for (span, removals) in [(100, 50), (10, 3), (7, 7), (9, 1), (5, 4)] {
            for k in 0..removals {
                let first = k * span / removals + 1;
                let last = (k + 1) * span / removals;
                for i in first..=last {
                    assert_eq!(shrink_shift(i, span, removals), k + 1, "S={span} D={removals} i={i}");
                }
            }
            assert_eq!(shrink_shift(0, span, removals), 0);
            assert_eq!(shrink_shift(span, span, removals), removals);
        }
    }

    #[test]
    fn test_expand_lifts_are_monotone() {
        for (span, inserts) in [(10, 5), (3, 10), (100, 1), (7, 6)] {
            let resulting = span + inserts;
            let partitions = span.min(inserts + 1);
            let mut previous_end_target = -1;
            for p in 0..partitions {
                let start = mul_div(p, span, partitions);
                let end = mul_div(p + 1, span, partitions);
                let lift = mul_div(start, resulting, span) - start;
                assert!(start + lift > previous_end_target);
                previous_end_target = end - 1 + lift;
            }
            assert!(previous_end_target < resulting, "last partition stays below the high stamp");
        }
    }

    #[test]
    fn test_mul_div_wide() {
        let big = i64::from(u32::MAX);
        assert_eq!(mul_div(big, big, big), big);
        assert_eq!(mul_div(7, 3, 2), 10);
    }

    const SIZES: AdjustSizes = AdjustSizes {
        batch_size: 16,
        page_size: 3,
    };

    /// Pushes one reading per stamp; pressure carries the original stamp.
    fn seeded(stamps: impl IntoIterator<Item = i32>) -> (Session, SensorId) {
        let mut session = Session::new(StoreConfig::in_memory());
        let conn = session.connection().unwrap();
        let (id, _) = sensor::ensure(conn, "A").unwrap();
        let readings: Vec<Reading> = stamps
            .into_iter()
            .map(|s| {
                let mut values = ReadingValues::missing();
                values.pressure = f64::from(s);
                Reading::at(PosixTime::new(s), values)
            })
            .collect();
        record::push(conn, id, &readings, true, 64).unwrap();
        (session, id)
    }

    /// `(stamp, original stamp)` pairs, ascending.
    fn contents(conn: &Connection, id: SensorId) -> Vec<(i32, i32)> {
        ReadingIter::new(conn, id, range(i32::MIN, i32::MAX), Order::Ascending, 7)
            .map(|r| {
                let r = r.unwrap();
                #[allow(clippy::cast_possible_truncation)] // pressure holds small integers
                let origin = r.values.pressure as i32;
                (r.stamp.secs(), origin)
            })
            .collect()
    }

    #[test]
    fn test_offset_left_over_foreign_rows() {
        let (mut session, id) = seeded([95, 98, 100, 101, 102, 103, 104]);
        let conn = session.connection().unwrap();
        let plan = AdjustPlan::new(range(100, 104), range(97, 101)).unwrap();

        let err = adjust(conn, id, &plan, false, SIZES).unwrap_err();
        assert!(matches!(
            err,
            crate::BarographError::InvalidOperation(InvalidOperation::WouldOverwrite { existing: 1 })
        ));

        let report = adjust(conn, id, &plan, true, SIZES).unwrap();
        assert_eq!((report.moved, report.removed), (5, 1));
        assert_eq!(
            contents(conn, id),
            vec![(95, 95), (97, 100), (98, 101), (99, 102), (100, 103), (101, 104)]
        );
    }

    #[test]
    fn test_offset_right_then_back() {
        let stamps: Vec<i32> = (0..20).map(|i| 1000 + i * 2).collect();
        let (mut session, id) = seeded(stamps.clone());
        let conn = session.connection().unwrap();

        let forward = AdjustPlan::new(range(1000, 1038), range(1007, 1045)).unwrap();
        adjust(conn, id, &forward, false, SIZES).unwrap();
        assert!(contents(conn, id).iter().all(|&(s, origin)| s == origin + 7));

        let back = AdjustPlan::new(range(1007, 1045), range(1000, 1038)).unwrap();
        adjust(conn, id, &back, false, SIZES).unwrap();
        let restored: Vec<i32> = contents(conn, id).into_iter().map(|(s, _)| s).collect();
        assert_eq!(restored, stamps);
    }

    #[test]
    fn test_expand_positions() {
        let (mut session, id) = seeded(0..=10);
        let conn = session.connection().unwrap();
        let plan = AdjustPlan::new(range(0, 10), range(0, 15)).unwrap();
        let report = adjust(conn, id, &plan, true, SIZES).unwrap();

        let stamps: Vec<i32> = contents(conn, id).into_iter().map(|(s, _)| s).collect();
        assert_eq!(stamps, vec![0, 1, 2, 4, 5, 7, 9, 10, 12, 13, 15]);
        assert_eq!(report.removed, 0);
        assert_eq!(report.rebuilt.len(), 1);
    }

    #[test]
    fn test_shrink_keeps_order_inside_bounds() {
        let (mut session, id) = seeded(100..=200);
        let conn = session.connection().unwrap();
        let plan = AdjustPlan::new(range(100, 200), range(100, 150)).unwrap();
        let report = adjust(conn, id, &plan, true, SIZES).unwrap();

        let rows = contents(conn, id);
        assert_eq!(rows.len(), 51);
        assert_eq!(report.removed, 50);
        assert_eq!(rows.first(), Some(&(100, 101)));
        assert_eq!(rows.last(), Some(&(150, 200)));
        assert!(rows.windows(2).all(|w| w[0].1 < w[1].1));
    }

    #[test]
    fn test_shrink_with_offset() {
        let (mut session, id) = seeded(10..=20);
        let conn = session.connection().unwrap();
        let plan = AdjustPlan::new(range(10, 20), range(30, 35)).unwrap();
        let report = adjust(conn, id, &plan, false, SIZES).unwrap();

        let stamps: Vec<i32> = contents(conn, id).into_iter().map(|(s, _)| s).collect();
        assert_eq!(stamps, (30..=35).collect::<Vec<_>>());
        assert_eq!(report.rebuilt.len(), 2);
    }
}
