//! Database session: one lazily opened SQLite connection.
//!
//! A [`Session`] owns at most one [`Connection`]. Nothing touches the disk
//! until the first call to [`Session::connection`], which opens the file,
//! applies pragmas from the [`StoreConfig`] and creates or validates the
//! schema. The connection is released by [`Session::close`] or, on every
//! other exit path, when the session is dropped.
//!
//! # Schema
//!
//! ```text
//! store_meta         (version)
//! sensor             (sensor_id PK, name_key UNIQUE, last_hardware_id)
//! record             (sensor_id, stamp, packed_values)        PK (sensor_id, stamp)
//! minute_record      (sensor_id, stamp, min/max/mean/stddev, record_count,
//!                     temp/press/hum/speed/dir counts)         PK (sensor_id, stamp)
//! ten_minute_record  (same columns as minute_record)
//! sync_stamp         (stamp)
//! ```

use rusqlite::{Connection, OpenFlags, OptionalExtension, params};

use crate::config::StoreConfig;
use crate::error::{BarographError, Result};

/// Schema version written to `store_meta`.
pub const SCHEMA_VERSION: i64 = 1;

const SUMMARY_COLUMNS: &str = "
    sensor_id INTEGER NOT NULL REFERENCES sensor (sensor_id),
    stamp INTEGER NOT NULL,
    min_values BLOB NOT NULL,
    max_values BLOB NOT NULL,
    mean_values BLOB NOT NULL,
    stddev_values BLOB NOT NULL,
    record_count INTEGER NOT NULL,
    temp_counts BLOB NOT NULL,
    press_counts BLOB NOT NULL,
    hum_counts BLOB NOT NULL,
    speed_counts BLOB NOT NULL,
    dir_counts BLOB NOT NULL,
    PRIMARY KEY (sensor_id, stamp)";

/// Owner of the store's single connection.
#[derive(Debug)]
pub struct Session {
    config: StoreConfig,
    conn: Option<Connection>,
}

impl Session {
    /// Creates a session without opening anything.
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        Self { config, conn: None }
    }

    /// The configuration this session opens with.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// True once the connection has been opened and not yet closed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    /// Returns the live connection, opening it on first use.
    ///
    /// # Errors
    ///
    /// - [`BarographError::StorageUnavailable`] if the database cannot be opened
    /// - [`BarographError::SchemaVersion`] if the file has an unknown schema
    /// - [`BarographError::Database`] if pragmas or schema creation fail
    pub fn connection(&mut self) -> Result<&mut Connection> {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => {
                let conn = open_connection(&self.config)?;
                tracing::debug!(path = %self.config.path.display(), "opened database");
                conn
            }
        };
        Ok(self.conn.insert(conn))
    }

    /// Closes the connection if open. The next call to
    /// [`Session::connection`] reopens it.
    ///
    /// # Errors
    ///
    /// Returns [`BarographError::Database`] if SQLite refuses to close; the
    /// connection is dropped regardless.
    pub fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, e)| BarographError::Database(e))?;
            tracing::debug!(path = %self.config.path.display(), "closed database");
        }
        Ok(())
    }
}

/// Opens the database and brings its schema up to date.
fn open_connection(config: &StoreConfig) -> Result<Connection> {
    let unavailable = |source| BarographError::StorageUnavailable {
        path: config.path.display().to_string(),
        source,
    };
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let mut conn = Connection::open_with_flags(&config.path, flags).map_err(unavailable)?;
    apply_pragmas(&conn, config)?;
    initialize_schema(&mut conn)?;
    Ok(conn)
}

fn apply_pragmas(conn: &Connection, config: &StoreConfig) -> Result<()> {
    conn.pragma_update(None, "foreign_keys", true)?;
    // journal_mode reports the resulting mode as a row.
    let _mode: String = conn.pragma_update_and_check(
        None,
        "journal_mode",
        config.journal_mode.pragma_value(),
        |row| row.get(0),
    )?;
    conn.pragma_update(None, "synchronous", config.synchronous.pragma_value())?;
    conn.busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms))?;
    Ok(())
}

fn initialize_schema(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch("CREATE TABLE IF NOT EXISTS store_meta (version INTEGER NOT NULL);")?;
    let version: Option<i64> = tx
        .query_row("SELECT version FROM store_meta LIMIT 1", [], |row| row.get(0))
        .optional()?;
    match version {
        None => {
            tx.execute("INSERT INTO store_meta (version) VALUES (?1)", params![SCHEMA_VERSION])?;
            tx.execute_batch(&format!(
                "CREATE TABLE sensor (
                    sensor_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name_key TEXT NOT NULL UNIQUE,
                    last_hardware_id TEXT NOT NULL DEFAULT ''
                );
                CREATE INDEX idx_sensor_hardware ON sensor (last_hardware_id);
                CREATE TABLE record (
                    sensor_id INTEGER NOT NULL REFERENCES sensor (sensor_id),
                    stamp INTEGER NOT NULL,
                    packed_values BLOB NOT NULL,
                    PRIMARY KEY (sensor_id, stamp)
                ) WITHOUT ROWID;
                CREATE TABLE minute_record ({SUMMARY_COLUMNS}) WITHOUT ROWID;
                CREATE TABLE ten_minute_record ({SUMMARY_COLUMNS}) WITHOUT ROWID;
                CREATE TABLE sync_stamp (stamp INTEGER NOT NULL);
                CREATE INDEX idx_sync_stamp ON sync_stamp (stamp);"
            ))?;
            tracing::info!(version = SCHEMA_VERSION, "created store schema");
        }
        Some(SCHEMA_VERSION) => {}
        Some(found) => {
            return Err(BarographError::SchemaVersion {
                found,
                expected: SCHEMA_VERSION,
            });
        }
    }
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap();
        let names = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<Vec<String>>>()
            .unwrap();
        names
    }

    #[test]
    fn test_lazy_open_and_close() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lazy.db");
        let mut session = Session::new(StoreConfig::new(&path));

        assert!(!session.is_open());
        assert!(!path.exists(), "nothing is created before first use");

        let names = table_names(session.connection().unwrap());
        assert!(session.is_open());
        assert!(path.exists());
        for table in ["record", "minute_record", "sensor", "sync_stamp", "ten_minute_record"] {
            assert!(names.iter().any(|n| n == table), "missing table {table}");
        }

        session.close().unwrap();
        assert!(!session.is_open());
        session.close().unwrap();

        // Reopening an existing file validates rather than recreates.
        session.connection().unwrap();
        assert!(session.is_open());
    }

    #[test]
    fn test_unavailable_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("no_such_dir").join("x.db");
        let mut session = Session::new(StoreConfig::new(path));
        let err = session.connection().unwrap_err();
        assert!(matches!(err, BarographError::StorageUnavailable { .. }), "{err}");
        assert!(!session.is_open());
    }

    #[test]
    fn test_schema_version_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("old.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE store_meta (version INTEGER NOT NULL);
                 INSERT INTO store_meta (version) VALUES (99);",
            )
            .unwrap();
        }
        let mut session = Session::new(StoreConfig::new(&path));
        let err = session.connection().unwrap_err();
        assert!(matches!(
            err,
            BarographError::SchemaVersion { found: 99, expected: SCHEMA_VERSION }
        ));
    }

    #[test]
    fn test_in_memory() {
        let mut session = Session::new(StoreConfig::in_memory());
        let conn = session.connection().unwrap();
        let fk: i64 = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0)).unwrap();
        assert_eq!(fk, 1);
    }
}
