//! SQLite store: one time-series table per parameter plus the station status
//! table, written in write-ahead-log mode.

pub mod migrations;
pub mod tables;

use crate::catalog::SqlType;
use crate::snapshot::ParameterTables;
use crate::status::{is_valid_recording, StationStatus, EMPTY_RECORDING};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, DatabaseName, OpenFlags};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tables::{table_for_parameter, STATUS_TABLE};

const STATUS_COLUMNS: &str = "time, station, source, onsource, mode, recording, tsys, tau225, scan";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("refusing to overwrite existing database {}", .0.display())]
    AlreadyExists(PathBuf),
    #[error("database {} does not exist", .0.display())]
    NotFound(PathBuf),
    #[error("journal mode is {0:?}, expected wal")]
    JournalMode(String),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct StorageOptions {
    /// WAL pages between automatic checkpoints.
    pub wal_autocheckpoint: u32,
    pub busy_timeout: Duration,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            wal_autocheckpoint: 10_000,
            busy_timeout: Duration::from_millis(5_000),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub tables: usize,
    pub rows: usize,
    pub skipped_tables: usize,
    pub status_rows: usize,
}

/// Creates a fresh store laid out like a fully migrated one.
///
/// A failure removes whatever was written, so the call can simply be retried.
pub fn initialize_schema(
    path: &Path,
    column_types: &BTreeMap<String, SqlType>,
    options: &StorageOptions,
) -> Result<(), StorageError> {
    if path.exists() {
        return Err(StorageError::AlreadyExists(path.to_path_buf()));
    }
    match create_schema(path, column_types, options) {
        Ok(series_tables) => {
            tracing::info!(
                path = %path.display(),
                series_tables,
                wal_autocheckpoint = options.wal_autocheckpoint,
                "initialized database"
            );
            Ok(())
        }
        Err(err) => {
            remove_partial_database(path);
            Err(err)
        }
    }
}

fn create_schema(
    path: &Path,
    column_types: &BTreeMap<String, SqlType>,
    options: &StorageOptions,
) -> Result<usize, StorageError> {
    let mut conn = Connection::open(path)?;
    apply_pragmas(&conn, options)?;

    let layout = tables::fresh_series_layout(column_types);
    let tx = conn.transaction()?;
    for (table, value_type) in &layout {
        for statement in tables::create_series_statements(table, *value_type) {
            tx.execute(&statement, [])?;
        }
    }
    tx.execute(&tables::status_table_statement(), [])?;
    for statement in tables::schedule_table_statements() {
        tx.execute(&statement, [])?;
    }
    migrations::record_all(&tx)?;
    tx.commit()?;

    conn.close().map_err(|(_, err)| StorageError::Sqlite(err))?;
    Ok(layout.len())
}

fn remove_partial_database(path: &Path) {
    let mut leftovers = vec![path.to_path_buf()];
    for suffix in ["-wal", "-shm", "-journal"] {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        leftovers.push(PathBuf::from(name));
    }
    for file in leftovers {
        match std::fs::remove_file(&file) {
            Ok(()) => tracing::debug!(path = %file.display(), "removed partial database file"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %file.display(), error = %err, "failed to remove partial database file")
            }
        }
    }
}

fn apply_pragmas(conn: &Connection, options: &StorageOptions) -> Result<(), StorageError> {
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        return Err(StorageError::JournalMode(mode));
    }
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _: i64 = conn.pragma_update_and_check(
        None,
        "wal_autocheckpoint",
        options.wal_autocheckpoint,
        |row| row.get(0),
    )?;
    conn.busy_timeout(options.busy_timeout)?;
    Ok(())
}

fn is_missing_table(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(_, Some(message)) if message.starts_with("no such table")
    )
}

pub struct Storage {
    conn: Connection,
    path: PathBuf,
}

impl Storage {
    /// Opens an existing store; a missing file is an error, never created.
    pub fn connect(path: &Path, options: &StorageOptions) -> Result<Self, StorageError> {
        if !path.is_file() {
            return Err(StorageError::NotFound(path.to_path_buf()));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        apply_pragmas(&conn, options)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Read-only handle for inspection; no pragmas are written.
    pub fn open_read_only(path: &Path) -> Result<Self, StorageError> {
        if !path.is_file() {
            return Err(StorageError::NotFound(path.to_path_buf()));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Writes one tick in a single transaction.
    ///
    /// Parameters whose table is missing (schema lag) or whose name is not an
    /// identifier are logged and skipped; everything else commits together.
    pub fn commit_batch(
        &mut self,
        batch: &ParameterTables,
        status_rows: &[StationStatus],
    ) -> Result<CommitSummary, StorageError> {
        let tx = self.conn.transaction()?;
        let mut summary = CommitSummary::default();

        for (parameter, rows) in batch {
            let Some(table) = table_for_parameter(parameter) else {
                tracing::warn!(%parameter, rows = rows.len(), "skipping parameter with unsafe name");
                summary.skipped_tables += 1;
                continue;
            };
            let sql = format!("INSERT INTO {table} (time, station, value) VALUES (?1, ?2, ?3)");
            let mut stmt = match tx.prepare_cached(&sql) {
                Ok(stmt) => stmt,
                Err(err) if is_missing_table(&err) => {
                    tracing::warn!(table = %table, rows = rows.len(), error = %err, "skipping rows for missing table");
                    summary.skipped_tables += 1;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            for row in rows {
                stmt.execute(params![row.time, row.station, row.value])?;
            }
            summary.tables += 1;
            summary.rows += rows.len();
        }

        if !status_rows.is_empty() {
            let mut stmt = tx.prepare_cached(&format!(
                "INSERT OR REPLACE INTO {STATUS_TABLE} ({STATUS_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ))?;
            for status in status_rows {
                stmt.execute(params![
                    status.time,
                    status.station,
                    status.source,
                    status.onsource,
                    status.mode,
                    status.recording,
                    status.tsys,
                    status.tau225,
                    status.scan,
                ])?;
            }
            summary.status_rows = status_rows.len();
        }

        tx.commit()?;
        Ok(summary)
    }

    /// Every persisted status row; unusable fields fall back to defaults.
    pub fn read_status(&self) -> Result<Vec<StationStatus>, StorageError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {STATUS_COLUMNS} FROM {STATUS_TABLE}"))?;
        let rows = stmt.query_map([], |row| {
            (0..9)
                .map(|idx| row.get::<_, SqlValue>(idx))
                .collect::<rusqlite::Result<Vec<_>>>()
        })?;

        let mut out = Vec::new();
        for row in rows {
            match status_from_values(row?) {
                Some(status) => out.push(status),
                None => tracing::warn!("skipping status row without a station"),
            }
        }
        Ok(out)
    }

    /// Checkpoints the WAL and copies the database to `dest`.
    pub fn backup_to(&self, dest: &Path) -> Result<(), StorageError> {
        self.conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        self.conn.backup(DatabaseName::Main, dest, None)?;
        tracing::info!(source = %self.path.display(), dest = %dest.display(), "database backup written");
        Ok(())
    }

    pub fn close(self) -> Result<(), StorageError> {
        self.conn
            .close()
            .map_err(|(_, err)| StorageError::Sqlite(err))
    }
}

fn status_from_values(values: Vec<SqlValue>) -> Option<StationStatus> {
    let mut values = values.into_iter();
    let mut next = || values.next().unwrap_or(SqlValue::Null);

    let time = match next() {
        SqlValue::Integer(t) => t,
        SqlValue::Real(t) => t as i64,
        _ => 0,
    };
    let station = match next() {
        SqlValue::Text(s) if !s.is_empty() => s,
        _ => return None,
    };
    let mut status = StationStatus::new(station);
    status.time = time;
    status.source = text_or_default(next());
    status.onsource = match text_or_default(next()).as_str() {
        "on" => "on".to_string(),
        "off" => "off".to_string(),
        _ => String::new(),
    };
    status.mode = text_or_default(next());
    let recording = text_or_default(next());
    status.recording = if is_valid_recording(&recording) {
        recording
    } else {
        EMPTY_RECORDING.to_string()
    };
    status.tsys = real_or_default(next());
    status.tau225 = real_or_default(next());
    status.scan = text_or_default(next());
    Some(status)
}

fn text_or_default(value: SqlValue) -> String {
    match value {
        SqlValue::Text(s) => s,
        _ => String::new(),
    }
}

fn real_or_default(value: SqlValue) -> f64 {
    match value {
        SqlValue::Real(v) if v.is_finite() => v,
        SqlValue::Integer(v) => v as f64,
        _ => 0.0,
    }
}
