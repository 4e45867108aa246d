//! Database module for mirror state kept between runs

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult};
use std::collections::HashMap;
use std::path::Path;

use crate::models::{FileKind, FileRecord, SyncReport};

/// Indexed source file (minimal for fast comparison)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedFile {
    pub path: String,
    pub kind: FileKind,
    pub size: u64,
    /// Modification time as Unix timestamp (seconds), 0 when unknown
    pub mtime: i64,
}

/// Key of a source path in the index.
/// Separators are normalized for cross-platform consistency.
pub fn index_key(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Persistent mirror state
pub struct MirrorState {
    conn: Connection,
}

impl MirrorState {
    /// Open or create database
    pub fn open(path: &Path) -> SqliteResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> SqliteResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> SqliteResult<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS files (
                path TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                size INTEGER NOT NULL,
                mtime INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_files_kind ON files(kind);

            CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                started_at INTEGER NOT NULL,
                finished_at INTEGER NOT NULL,
                incremental INTEGER NOT NULL,
                cancelled INTEGER NOT NULL,
                scan_errors INTEGER NOT NULL,
                media INTEGER NOT NULL,
                metadata INTEGER NOT NULL,
                image INTEGER NOT NULL,
                unknown INTEGER NOT NULL,
                orphans_deleted INTEGER NOT NULL,
                errors INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs(started_at);
            ",
        )?;
        Ok(())
    }

    /// Load all indexed files as HashMap for fast lookup
    pub fn load_file_index(&self) -> SqliteResult<HashMap<String, IndexedFile>> {
        let mut stmt = self
            .conn
            .prepare("SELECT path, kind, size, mtime FROM files")?;

        let rows = stmt.query_map([], |row| {
            Ok(IndexedFile {
                path: row.get(0)?,
                kind: FileKind::parse(&row.get::<_, String>(1)?),
                size: row.get::<_, i64>(2)? as u64,
                mtime: row.get(3)?,
            })
        })?;

        let mut index = HashMap::new();
        for row in rows {
            let file = row?;
            index.insert(file.path.clone(), file);
        }
        Ok(index)
    }

    /// Batch insert/update scanned records. Unknown files are not indexed.
    pub fn upsert_records(&mut self, records: &[FileRecord]) -> SqliteResult<usize> {
        let tx = self.conn.transaction()?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO files (path, kind, size, mtime) VALUES (?1, ?2, ?3, ?4)",
            )?;

            for record in records.iter().filter(|r| r.kind.is_relevant()) {
                let path_str = index_key(&record.path);
                let mtime = record.modified_at.map(|t| t.timestamp()).unwrap_or(0);

                stmt.execute(params![
                    path_str,
                    record.kind.as_str(),
                    record.size as i64,
                    mtime,
                ])?;
                written += 1;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    /// Delete files by paths
    pub fn delete_paths(&mut self, paths: &[String]) -> SqliteResult<()> {
        if paths.is_empty() {
            return Ok(());
        }

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare("DELETE FROM files WHERE path = ?1")?;
            for path in paths {
                stmt.execute(params![path])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Start time of the last run that mirrored everything it saw: not
    /// cancelled and without any scan, write or copy error. Becomes `since`
    /// for the next incremental pass, so a failed item is retried until a
    /// clean run covers it.
    pub fn last_scan_time(&self) -> SqliteResult<Option<DateTime<Utc>>> {
        let ts: Option<i64> = self
            .conn
            .query_row(
                "SELECT started_at FROM runs WHERE cancelled = 0 AND errors = 0
                 ORDER BY started_at DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(ts.and_then(|ts| Utc.timestamp_millis_opt(ts).single()))
    }

    /// Append a run to the log
    pub fn record_run(
        &mut self,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        report: &SyncReport,
    ) -> SqliteResult<()> {
        let errors = report.scan_errors
            + report.pointers.failed
            + report.copies.failed
            + report.delete_errors;
        self.conn.execute(
            "INSERT INTO runs
             (started_at, finished_at, incremental, cancelled, scan_errors,
              media, metadata, image, unknown, orphans_deleted, errors)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                started_at.timestamp_millis(),
                finished_at.timestamp_millis(),
                report.incremental as i32,
                report.cancelled as i32,
                report.scan_errors as i64,
                report.counts.media as i64,
                report.counts.metadata as i64,
                report.counts.image as i64,
                report.counts.unknown as i64,
                report.deleted as i64,
                errors as i64,
            ],
        )?;
        Ok(())
    }

    /// Get file count
    pub fn file_count(&self) -> SqliteResult<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Get run count
    pub fn run_count(&self) -> SqliteResult<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM runs", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}
