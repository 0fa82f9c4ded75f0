//! Sensor directory.
//!
//! Maps a sensor's name key to its stable internal id and keeps the
//! last-seen hardware id for each sensor.
//!
//! # Overview
//!
//! - [`SensorId`] - stable integer id; never reused, survives renames
//! - [`SensorInfo`] - one directory entry
//!
//! Deleting a sensor clears its dependent tables one by one, summaries
//! first and the directory entry last. Each step is attempted even if an
//! earlier one failed; failures are collected and reported together.

use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::error::{BarographError, InvalidOperation, Result};

/// Tables cleared by [`delete`], in order.
const DEPENDENT_TABLES: [&str; 4] = ["ten_minute_record", "minute_record", "record", "sensor"];

/// Stable internal id of a sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorId(i64);

impl SensorId {
    /// Raw database id.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorInfo {
    /// Internal id.
    pub id: SensorId,
    /// Current name key.
    pub name: String,
    /// Last hardware id the sensor was loaded from; empty if unknown.
    pub last_hardware_id: String,
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(InvalidOperation::EmptySensorName.into());
    }
    Ok(())
}

/// Looks up a sensor id by name.
///
/// # Errors
///
/// Returns [`BarographError::Database`] on storage failure.
pub fn resolve(conn: &Connection, name: &str) -> Result<Option<SensorId>> {
    let id = conn
        .prepare_cached("SELECT sensor_id FROM sensor WHERE name_key = ?1")?
        .query_row(params![name], |row| row.get(0))
        .optional()?;
    Ok(id.map(SensorId))
}

/// Looks up a sensor id, failing if it does not exist.
///
/// # Errors
///
/// Returns [`BarographError::NotFound`] for an unknown name.
pub fn require(conn: &Connection, name: &str) -> Result<SensorId> {
    resolve(conn, name)?.ok_or_else(|| BarographError::not_found(name))
}

/// Returns the sensor's id, creating it if needed.
///
/// The flag is `true` when this call created the sensor.
///
/// # Errors
///
/// Returns [`InvalidOperation::EmptySensorName`] for an empty name, or
/// [`BarographError::Database`] on storage failure.
pub fn ensure(conn: &Connection, name: &str) -> Result<(SensorId, bool)> {
    check_name(name)?;
    if let Some(id) = resolve(conn, name)? {
        return Ok((id, false));
    }
    conn.execute("INSERT INTO sensor (name_key) VALUES (?1)", params![name])?;
    let id = SensorId(conn.last_insert_rowid());
    tracing::info!(sensor = name, id = id.0, "created sensor");
    Ok((id, true))
}

/// Renames a sensor. Its id and data are untouched.
///
/// Returns `false` if `old` does not exist or `new` is already taken.
///
/// # Errors
///
/// Returns [`InvalidOperation::EmptySensorName`] if `new` is empty, or
/// [`BarographError::Database`] on any other storage failure.
pub fn rename(conn: &Connection, old: &str, new: &str) -> Result<bool> {
    check_name(new)?;
    match conn.execute(
        "UPDATE sensor SET name_key = ?2 WHERE name_key = ?1",
        params![old, new],
    ) {
        Ok(0) => Ok(false),
        Ok(_) => {
            tracing::info!(from = old, to = new, "renamed sensor");
            Ok(true)
        }
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
            tracing::debug!(from = old, to = new, "rename target already exists");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// Deletes a sensor with all of its raw and summary rows.
///
/// Returns `false` if no sensor has that name. Each table is cleared in
/// its own statement; a failure does not undo earlier tables.
///
/// # Errors
///
/// Returns [`BarographError::PartialDelete`] listing the tables that could
/// not be cleared.
pub fn delete(conn: &Connection, name: &str) -> Result<bool> {
    let Some(id) = resolve(conn, name)? else {
        return Ok(false);
    };

    let mut failed_tables = Vec::new();
    for table in DEPENDENT_TABLES {
        let sql = format!("DELETE FROM {table} WHERE sensor_id = ?1");
        if let Err(e) = conn.execute(&sql, params![id.0]) {
            tracing::warn!(sensor = name, table, error = %e, "failed to clear table");
            failed_tables.push(table);
        }
    }

    if failed_tables.is_empty() {
        tracing::info!(sensor = name, id = id.0, "deleted sensor");
        Ok(true)
    } else {
        Err(BarographError::PartialDelete {
            sensor: name.to_string(),
            failed_tables,
        })
    }
}

/// Records the hardware id a sensor was last loaded from.
///
/// Returns `false` if no sensor has that name.
///
/// # Errors
///
/// Returns [`BarographError::Database`] on storage failure.
pub fn set_last_hardware_id(conn: &Connection, name: &str, hardware_id: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE sensor SET last_hardware_id = ?2 WHERE name_key = ?1",
        params![name, hardware_id],
    )?;
    Ok(changed > 0)
}

/// Name of the most recently active sensor last loaded from `hardware_id`.
///
/// Sensors are ranked by their newest raw stamp, sensors without data
/// last, then by highest id.
///
/// # Errors
///
/// Returns [`BarographError::Database`] on storage failure.
pub fn latest_name_for_hardware_id(conn: &Connection, hardware_id: &str) -> Result<Option<String>> {
    let name = conn
        .query_row(
            "SELECT s.name_key
             FROM sensor s LEFT JOIN record r ON r.sensor_id = s.sensor_id
             WHERE s.last_hardware_id = ?1
             GROUP BY s.sensor_id
             ORDER BY MAX(r.stamp) IS NULL, MAX(r.stamp) DESC, s.sensor_id DESC
             LIMIT 1",
            params![hardware_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(name)
}

/// Every sensor, ordered by id.
///
/// # Errors
///
/// Returns [`BarographError::Database`] on storage failure.
pub fn all(conn: &Connection) -> Result<Vec<SensorInfo>> {
    let mut stmt = conn
        .prepare_cached("SELECT sensor_id, name_key, last_hardware_id FROM sensor ORDER BY sensor_id")?;
    let sensors = stmt
        .query_map([], |row| {
            Ok(SensorInfo {
                id: SensorId(row.get(0)?),
                name: row.get(1)?,
                last_hardware_id: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(sensors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::session::Session;

    fn session() -> Session {
        Session::new(StoreConfig::in_memory())
    }

    fn add_record(conn: &Connection, id: SensorId, stamp: i32) {
        conn.execute(
            "INSERT INTO record (sensor_id, stamp, packed_values) VALUES (?1, ?2, zeroblob(8))",
            params![id.get(), stamp],
        )
        .unwrap();
    }

    #[test]
    fn test_ensure_creates_once() {
        let mut session = session();
        let conn = session.connection().unwrap();

        let (a, created) = ensure(conn, "outdoor").unwrap();
        assert!(created);
        let (again, created) = ensure(conn, "outdoor").unwrap();
        assert!(!created);
        assert_eq!(a, again);
        assert_eq!(resolve(conn, "outdoor").unwrap(), Some(a));
        assert_eq!(resolve(conn, "indoor").unwrap(), None);

        assert!(matches!(
            ensure(conn, ""),
            Err(BarographError::InvalidOperation(InvalidOperation::EmptySensorName))
        ));
        assert!(matches!(require(conn, "indoor"), Err(BarographError::NotFound { .. })));
    }

    #[test]
    fn test_rename_keeps_id() {
        let mut session = session();
        let conn = session.connection().unwrap();
        let (a, _) = ensure(conn, "a").unwrap();
        ensure(conn, "b").unwrap();

        assert!(rename(conn, "a", "c").unwrap());
        assert_eq!(resolve(conn, "c").unwrap(), Some(a));
        assert_eq!(resolve(conn, "a").unwrap(), None);

        assert!(!rename(conn, "missing", "d").unwrap());
        assert!(!rename(conn, "c", "b").unwrap(), "target name is taken");
        assert_eq!(resolve(conn, "c").unwrap(), Some(a));
    }

    #[test]
    fn test_delete_cascades() {
        let mut session = session();
        let conn = session.connection().unwrap();
        let (a, _) = ensure(conn, "a").unwrap();
        let (b, _) = ensure(conn, "b").unwrap();
        add_record(conn, a, 10);
        add_record(conn, b, 10);

        assert!(delete(conn, "a").unwrap());
        assert!(!delete(conn, "a").unwrap());

        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM record", [], |row| row.get(0))
            .unwrap();
        assert_eq!(remaining, 1);
        assert_eq!(all(conn).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_reports_failed_tables() {
        let mut session = session();
        let conn = session.connection().unwrap();
        ensure(conn, "a").unwrap();
        conn.execute_batch(
            "CREATE TRIGGER block_minute BEFORE DELETE ON minute_record
             BEGIN SELECT RAISE(ABORT, 'blocked'); END;
             INSERT INTO minute_record VALUES (1, 0, x'', x'', x'', x'', 0, x'', x'', x'', x'', x'');",
        )
        .unwrap();

        let err = delete(conn, "a").unwrap_err();
        match err {
            BarographError::PartialDelete { failed_tables, .. } => {
                // The sensor row is still referenced by the blocked summary.
                assert_eq!(failed_tables, vec!["minute_record", "sensor"]);
            }
            other => panic!("expected partial delete, got {other}"),
        }
    }

    #[test]
    fn test_latest_name_for_hardware_id() {
        let mut session = session();
        let conn = session.connection().unwrap();
        let (old, _) = ensure(conn, "old").unwrap();
        let (new, _) = ensure(conn, "new").unwrap();
        ensure(conn, "empty").unwrap();
        ensure(conn, "other").unwrap();
        for name in ["old", "new", "empty"] {
            assert!(set_last_hardware_id(conn, name, "hw-1").unwrap());
        }
        assert!(!set_last_hardware_id(conn, "missing", "hw-1").unwrap());

        add_record(conn, old, 500);
        add_record(conn, new, 100);
        assert_eq!(latest_name_for_hardware_id(conn, "hw-1").unwrap().as_deref(), Some("old"));

        add_record(conn, new, 900);
        assert_eq!(latest_name_for_hardware_id(conn, "hw-1").unwrap().as_deref(), Some("new"));

        // Ties on newest stamp go to the higher id.
        add_record(conn, old, 900);
        assert_eq!(latest_name_for_hardware_id(conn, "hw-1").unwrap().as_deref(), Some("new"));

        assert_eq!(latest_name_for_hardware_id(conn, "hw-2").unwrap(), None);
    }

    #[test]
    fn test_latest_name_without_data_prefers_highest_id() {
        let mut session = session();
        let conn = session.connection().unwrap();
        for name in ["x", "y"] {
            ensure(conn, name).unwrap();
            set_last_hardware_id(conn, name, "hw").unwrap();
        }
        assert_eq!(latest_name_for_hardware_id(conn, "hw").unwrap().as_deref(), Some("y"));
    }

    #[test]
    fn test_all_lists_entries() {
        let mut session = session();
        let conn = session.connection().unwrap();
        ensure(conn, "a").unwrap();
        ensure(conn, "b").unwrap();
        set_last_hardware_id(conn, "b", "usb-7").unwrap();

        let sensors = all(conn).unwrap();
        let names: Vec<_> = sensors.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(sensors[1].last_hardware_id, "usb-7");
        assert_eq!(sensors[0].last_hardware_id, "");
    }
}
