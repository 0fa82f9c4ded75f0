//! Chunked writer for multi-row mutations.
//!
//! Large writes are split into physical transactions of at most
//! `chunk_size` rows so transaction memory and lock time stay bounded. A
//! logical batch is therefore not atomic end to end: when a write fails,
//! the chunks committed so far stay durable and the error reports how many
//! there were.
//!
//! # Example
//!
//! ```rust
//! # use barograph::batch::ChunkedWriter;
//! # use rusqlite::{Connection, params};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let conn = Connection::open_in_memory()?;
//! conn.execute_batch("CREATE TABLE t (x INTEGER PRIMARY KEY);")?;
//!
//! let mut writer = ChunkedWriter::new(&conn, 2);
//! for x in 0..5 {
//!     writer.write("INSERT INTO t (x) VALUES (?1)", params![x])?;
//! }
//! let report = writer.finish()?;
//! assert_eq!(report.rows, 5);
//! assert_eq!(report.chunks_committed, 3);
//! # Ok(())
//! # }
//! ```

use rusqlite::{Connection, Params, Transaction};

use crate::config::MAX_BATCH_SIZE;
use crate::error::{BarographError, PartialBatchFailure, Result};

/// Outcome of a fully committed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Rows written.
    pub rows: usize,
    /// Physical transactions committed.
    pub chunks_committed: usize,
}

/// Writes rows through a sequence of bounded transactions.
///
/// Dropping the writer without calling [`ChunkedWriter::finish`] rolls back
/// the open chunk; earlier chunks stay committed.
#[derive(Debug)]
pub struct ChunkedWriter<'c> {
    conn: &'c Connection,
    tx: Option<Transaction<'c>>,
    chunk_size: usize,
    rows_in_chunk: usize,
    rows_committed: usize,
    chunks_committed: usize,
}

impl<'c> ChunkedWriter<'c> {
    /// Creates a writer committing every `chunk_size` rows.
    ///
    /// `chunk_size` is clamped into `1..=65535`.
    #[must_use]
    pub fn new(conn: &'c Connection, chunk_size: usize) -> Self {
        Self {
            conn,
            tx: None,
            chunk_size: chunk_size.clamp(1, MAX_BATCH_SIZE),
            rows_in_chunk: 0,
            rows_committed: 0,
            chunks_committed: 0,
        }
    }

    /// Runs `sql` in the current chunk without counting it as a row.
    ///
    /// Used for setup work, such as clearing a window, that must commit
    /// together with the first rows written.
    ///
    /// # Errors
    ///
    /// Same as [`ChunkedWriter::write`].
    pub fn prelude(&mut self, sql: &str, params: impl Params) -> Result<usize> {
        self.execute(sql, params).map_err(|e| self.fail(e))
    }

    /// Writes one row, committing the chunk when it is full.
    ///
    /// Returns the number of rows SQLite reports as changed.
    ///
    /// # Errors
    ///
    /// Returns [`BarographError::PartialBatch`] if earlier chunks were
    /// committed, otherwise [`BarographError::Database`].
    pub fn write(&mut self, sql: &str, params: impl Params) -> Result<usize> {
        let changed = self.execute(sql, params).map_err(|e| self.fail(e))?;
        self.rows_in_chunk += 1;
        if self.rows_in_chunk >= self.chunk_size {
            self.commit_chunk().map_err(|e| self.fail(e))?;
        }
        Ok(changed)
    }

    /// Commits the final chunk and reports totals.
    ///
    /// # Errors
    ///
    /// Same as [`ChunkedWriter::write`].
    pub fn finish(mut self) -> Result<BatchReport> {
        self.commit_chunk().map_err(|e| self.fail(e))?;
        Ok(BatchReport {
            rows: self.rows_committed,
            chunks_committed: self.chunks_committed,
        })
    }

    fn execute(&mut self, sql: &str, params: impl Params) -> rusqlite::Result<usize> {
        let tx = match self.tx.take() {
            Some(tx) => tx,
            None => self.conn.unchecked_transaction()?,
        };
        let tx = self.tx.insert(tx);
        tx.prepare_cached(sql)?.execute(params)
    }

    fn commit_chunk(&mut self) -> rusqlite::Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.commit()?;
            self.chunks_committed += 1;
            self.rows_committed += self.rows_in_chunk;
            tracing::debug!(
                rows = self.rows_in_chunk,
                chunk = self.chunks_committed,
                "committed chunk"
            );
            self.rows_in_chunk = 0;
        }
        Ok(())
    }

    fn fail(&self, source: rusqlite::Error) -> BarographError {
        if self.chunks_committed == 0 {
            return BarographError::Database(source);
        }
        tracing::warn!(
            chunks_committed = self.chunks_committed,
            rows_committed = self.rows_committed,
            error = %source,
            "chunked write failed after partial commit"
        );
        PartialBatchFailure {
            chunks_committed: self.chunks_committed,
            rows_committed: self.rows_committed,
            source,
        }
        .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (x INTEGER PRIMARY KEY);").unwrap();
        conn
    }

    fn count(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0)).unwrap()
    }

    #[test]
    fn test_commits_every_chunk() {
        let conn = setup();
        let mut writer = ChunkedWriter::new(&conn, 3);
        for x in 0..7 {
            writer.write("INSERT INTO t (x) VALUES (?1)", params![x]).unwrap();
        }
        let report = writer.finish().unwrap();
        assert_eq!(report, BatchReport { rows: 7, chunks_committed: 3 });
        assert_eq!(count(&conn), 7);
    }

    #[test]
    fn test_exact_multiple_has_no_empty_chunk() {
        let conn = setup();
        let mut writer = ChunkedWriter::new(&conn, 2);
        for x in 0..4 {
            writer.write("INSERT INTO t (x) VALUES (?1)", params![x]).unwrap();
        }
        assert_eq!(writer.finish().unwrap().chunks_committed, 2);
    }

    #[test]
    fn test_partial_failure_keeps_committed_chunks() {
        let conn = setup();
        let mut writer = ChunkedWriter::new(&conn, 2);
        writer.write("INSERT INTO t (x) VALUES (?1)", params![1]).unwrap();
        writer.write("INSERT INTO t (x) VALUES (?1)", params![2]).unwrap();
        writer.write("INSERT INTO t (x) VALUES (?1)", params![3]).unwrap();

        let err = writer
            .write("INSERT INTO t (x) VALUES (?1)", params![1])
            .unwrap_err();
        match err {
            BarographError::PartialBatch(failure) => {
                assert_eq!(failure.chunks_committed, 1);
                assert_eq!(failure.rows_committed, 2);
            }
            other => panic!("expected partial batch, got {other}"),
        }
        drop(writer);

        // Row 3 was in the open chunk and rolled back.
        assert_eq!(count(&conn), 2);
    }

    #[test]
    fn test_failure_before_any_commit_is_plain_error() {
        let conn = setup();
        let mut writer = ChunkedWriter::new(&conn, 10);
        writer.write("INSERT INTO t (x) VALUES (?1)", params![1]).unwrap();
        let err = writer
            .write("INSERT INTO t (x) VALUES (?1)", params![1])
            .unwrap_err();
        assert!(matches!(err, BarographError::Database(_)));
        drop(writer);
        assert_eq!(count(&conn), 0);
    }

    #[test]
    fn test_prelude_commits_with_first_chunk() {
        let conn = setup();
        conn.execute("INSERT INTO t (x) VALUES (100)", []).unwrap();

        let mut writer = ChunkedWriter::new(&conn, 10);
        writer.prelude("DELETE FROM t", []).unwrap();
        let report = writer.finish().unwrap();
        assert_eq!(report, BatchReport { rows: 0, chunks_committed: 1 });
        assert_eq!(count(&conn), 0);
    }
}
