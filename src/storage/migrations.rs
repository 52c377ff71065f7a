//! Forward-only schema migrations.
//!
//! A migration is data: the tables it renames, the REAL series it creates and
//! any extra statements. Its precondition is read from the table list alone,
//! so checking never writes. Applied migrations are recorded in
//! `bridge_migrations`.

use super::tables::{create_series_statements, index_names, series_table, MIGRATIONS_TABLE};
use crate::catalog::SqlType;
use rusqlite::{params, Connection};
use std::collections::BTreeSet;

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("migration {id}: {side} tables only partially present, missing {missing:?}")]
    Partial {
        id: String,
        side: &'static str,
        missing: Vec<String>,
    },
    #[error("migration {id}: neither the old nor the new tables are present")]
    NothingToMigrate { id: String },
    #[error("migration {id}: old and new tables are both present")]
    BothPresent { id: String },
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRename {
    pub from: String,
    pub to: String,
    /// Series tables carry `idx_<table>_time` / `idx_<table>_station`.
    pub reindex: bool,
}

impl TableRename {
    fn series(from: &str, to: &str) -> Self {
        Self {
            from: series_table(from),
            to: series_table(to),
            reindex: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Migration {
    pub id: u32,
    pub name: &'static str,
    pub renames: Vec<TableRename>,
    pub new_series: Vec<String>,
    /// Run after renames and new series; not part of the precondition check.
    pub statements: Vec<String>,
    /// Tables created by `statements` that count toward the "after" state.
    pub created_tables: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableSet {
    All(usize),
    None,
    Partial {
        present: Vec<String>,
        missing: Vec<String>,
    },
}

impl TableSet {
    fn classify(expected: &[String], existing: &BTreeSet<String>) -> Self {
        let (present, missing): (Vec<String>, Vec<String>) = expected
            .iter()
            .cloned()
            .partition(|table| existing.contains(table));
        if missing.is_empty() {
            TableSet::All(present.len())
        } else if present.is_empty() {
            TableSet::None
        } else {
            TableSet::Partial { present, missing }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationCheck {
    pub before: TableSet,
    pub after: TableSet,
}

impl MigrationCheck {
    pub fn is_pending(&self) -> bool {
        matches!(self.before, TableSet::All(_)) && self.after == TableSet::None
    }

    pub fn is_applied(&self) -> bool {
        self.before == TableSet::None && matches!(self.after, TableSet::All(_))
    }

    fn require_pending(&self, id: String) -> Result<(), MigrationError> {
        match (&self.before, &self.after) {
            (TableSet::Partial { missing, .. }, _) => Err(MigrationError::Partial {
                id,
                side: "old",
                missing: missing.clone(),
            }),
            (_, TableSet::Partial { missing, .. }) => Err(MigrationError::Partial {
                id,
                side: "new",
                missing: missing.clone(),
            }),
            (TableSet::None, TableSet::None) => Err(MigrationError::NothingToMigrate { id }),
            (TableSet::All(_), TableSet::All(_)) => Err(MigrationError::BothPresent { id }),
            _ => Ok(()),
        }
    }
}

impl Migration {
    pub fn label(&self) -> String {
        format!("{:04}_{}", self.id, self.name)
    }

    fn before_tables(&self) -> Vec<String> {
        self.renames.iter().map(|r| r.from.clone()).collect()
    }

    fn after_tables(&self) -> Vec<String> {
        self.renames
            .iter()
            .map(|r| r.to.clone())
            .chain(self.new_series.iter().cloned())
            .chain(self.created_tables.iter().cloned())
            .collect()
    }

    pub fn check_tables(&self, existing: &BTreeSet<String>) -> MigrationCheck {
        MigrationCheck {
            before: TableSet::classify(&self.before_tables(), existing),
            after: TableSet::classify(&self.after_tables(), existing),
        }
    }

    pub fn check(&self, conn: &Connection) -> Result<MigrationCheck, MigrationError> {
        Ok(self.check_tables(&table_names(conn)?))
    }

    fn apply(&self, conn: &Connection) -> rusqlite::Result<()> {
        for rename in &self.renames {
            conn.execute(
                &format!("ALTER TABLE {} RENAME TO {}", rename.from, rename.to),
                [],
            )?;
            if rename.reindex {
                let (old_time, old_station) = index_names(&rename.from);
                let (new_time, new_station) = index_names(&rename.to);
                conn.execute(&format!("DROP INDEX IF EXISTS {old_time}"), [])?;
                conn.execute(&format!("DROP INDEX IF EXISTS {old_station}"), [])?;
                conn.execute(
                    &format!("CREATE INDEX {new_time} ON {}(time)", rename.to),
                    [],
                )?;
                conn.execute(
                    &format!("CREATE INDEX {new_station} ON {}(station)", rename.to),
                    [],
                )?;
            }
        }
        for table in &self.new_series {
            for statement in create_series_statements(table, SqlType::Real) {
                conn.execute(&statement, [])?;
            }
        }
        for statement in &self.statements {
            conn.execute(statement, [])?;
        }
        Ok(())
    }
}

/// The production history, in order.
pub fn migrations() -> Vec<Migration> {
    let mut azel = vec![TableRename::series(
        "telescope_azimuthElevation_alt",
        "telescope_azimuthElevation_el",
    )];
    for n in 1..=4 {
        azel.push(TableRename::series(
            &format!("if_{n}_systemTempAzel_ra"),
            &format!("if_{n}_systemTempAzel_az"),
        ));
        azel.push(TableRename::series(
            &format!("if_{n}_systemTempAzel_dec"),
            &format!("if_{n}_systemTempAzel_el"),
        ));
    }

    let mut bridge_prefix: Vec<TableRename> = [
        ("points", "bridge_points"),
        ("bridgeLag", "bridge_bridgeLag"),
        ("totalLag", "bridge_totalLag"),
        ("events", "bridge_events"),
        ("forecast_tau225", "bridge_forecastTau225"),
        ("windSpeed", "bridge_avgWindSpeed"),
    ]
    .into_iter()
    .map(|(from, to)| TableRename::series(from, to))
    .collect();
    bridge_prefix.push(TableRename {
        from: "station_status".to_string(),
        to: super::tables::STATUS_TABLE.to_string(),
        reindex: false,
    });

    let schedule = super::tables::schedule_table_statements();

    vec![
        Migration {
            id: 1,
            name: "azel_suffixes",
            renames: azel,
            new_series: Vec::new(),
            statements: Vec::new(),
            created_tables: Vec::new(),
        },
        Migration {
            id: 2,
            name: "status_page_tables",
            renames: vec![TableRename::series("lag", "totalLag")],
            new_series: ["bridgeLag", "forecast_tau225", "windSpeed", "windGust"]
                .into_iter()
                .map(series_table)
                .collect(),
            statements: vec![
                schedule[0].clone(),
                schedule[1].clone(),
                "ALTER TABLE station_status ADD tsys REAL".to_string(),
                "ALTER TABLE station_status ADD tau225 REAL".to_string(),
                "ALTER TABLE station_status ADD scan TEXT NOT NULL DEFAULT ''".to_string(),
            ],
            created_tables: vec![super::tables::SCHEDULE_TABLE.to_string()],
        },
        Migration {
            id: 3,
            name: "bridge_prefix",
            renames: bridge_prefix,
            new_series: Vec::new(),
            statements: Vec::new(),
            created_tables: Vec::new(),
        },
    ]
}

pub fn table_names(conn: &Connection) -> rusqlite::Result<BTreeSet<String>> {
    let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<BTreeSet<_>>>()?;
    Ok(names)
}

pub fn recorded_ids(conn: &Connection) -> rusqlite::Result<BTreeSet<u32>> {
    if !table_names(conn)?.contains(MIGRATIONS_TABLE) {
        return Ok(BTreeSet::new());
    }
    let mut stmt = conn.prepare(&format!("SELECT id FROM {MIGRATIONS_TABLE}"))?;
    let ids = stmt
        .query_map([], |row| row.get::<_, u32>(0))?
        .collect::<rusqlite::Result<BTreeSet<_>>>()?;
    Ok(ids)
}

fn ensure_history_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} \
             (id INTEGER PRIMARY KEY, name TEXT NOT NULL, applied_at TEXT NOT NULL)"
        ),
        [],
    )?;
    Ok(())
}

fn record(conn: &Connection, migration: &Migration) -> rusqlite::Result<()> {
    conn.execute(
        &format!("INSERT OR IGNORE INTO {MIGRATIONS_TABLE} (id, name, applied_at) VALUES (?1, ?2, ?3)"),
        params![migration.id, migration.name, chrono::Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

/// Marks every known migration as applied; used when creating a fresh store.
pub fn record_all(conn: &Connection) -> rusqlite::Result<()> {
    ensure_history_table(conn)?;
    for migration in migrations() {
        record(conn, &migration)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Listed in the history table.
    Recorded,
    /// Tables show it (or a later migration) already ran, but history lacks it.
    AppliedUnrecorded,
    /// Next to run; precondition holds.
    Pending,
    /// Runs after an earlier pending migration; checked when reached.
    Queued,
}

#[derive(Debug, Clone)]
pub struct PlanStep {
    pub migration: Migration,
    pub check: MigrationCheck,
    pub disposition: Disposition,
}

/// Classifies every migration against the current file without writing to it.
pub fn plan(conn: &Connection) -> Result<Vec<PlanStep>, MigrationError> {
    let existing = table_names(conn)?;
    let recorded = recorded_ids(conn)?;
    let steps: Vec<(Migration, MigrationCheck)> = migrations()
        .into_iter()
        .map(|m| {
            let check = m.check_tables(&existing);
            (m, check)
        })
        .collect();

    // the newest migration known to have run implies all earlier ones did
    let boundary = steps
        .iter()
        .enumerate()
        .filter(|(_, (m, check))| recorded.contains(&m.id) || check.is_applied())
        .map(|(idx, _)| idx)
        .max();
    let next = boundary.map_or(0, |idx| idx + 1);

    let mut out = Vec::with_capacity(steps.len());
    for (idx, (migration, check)) in steps.into_iter().enumerate() {
        let disposition = if idx < next {
            if recorded.contains(&migration.id) {
                Disposition::Recorded
            } else {
                Disposition::AppliedUnrecorded
            }
        } else if idx == next {
            check.require_pending(migration.label())?;
            Disposition::Pending
        } else {
            Disposition::Queued
        };
        out.push(PlanStep {
            migration,
            check,
            disposition,
        });
    }
    Ok(out)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixReport {
    pub recorded: Vec<String>,
    pub applied: Vec<String>,
}

/// Brings the file up to date.
///
/// Migrations that already ran are only recorded. Each remaining migration is
/// re-checked right before it runs and applied in its own transaction together
/// with its history row; a failed precondition stops the run and leaves that
/// migration's tables untouched.
pub fn fix(conn: &mut Connection) -> Result<FixReport, MigrationError> {
    let steps = plan(conn)?;
    let mut report = FixReport::default();

    let unrecorded: Vec<&PlanStep> = steps
        .iter()
        .filter(|step| step.disposition == Disposition::AppliedUnrecorded)
        .collect();
    if !unrecorded.is_empty() {
        let tx = conn.transaction()?;
        ensure_history_table(&tx)?;
        for step in &unrecorded {
            record(&tx, &step.migration)?;
            report.recorded.push(step.migration.label());
        }
        tx.commit()?;
    }

    for step in steps.iter().filter(|step| {
        matches!(step.disposition, Disposition::Pending | Disposition::Queued)
    }) {
        let migration = &step.migration;
        let label = migration.label();
        migration.check(conn)?.require_pending(label.clone())?;

        let tx = conn.transaction()?;
        migration.apply(&tx)?;
        ensure_history_table(&tx)?;
        record(&tx, migration)?;
        tx.commit()?;
        tracing::info!(migration = %label, "migration applied");
        report.applied.push(label);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{initialize_schema, StorageOptions};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    /// Layout written by the first production release.
    fn legacy_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        let mut series = vec![
            "telescope_azimuthElevation_alt".to_string(),
            "weather_tau225".to_string(),
        ];
        for n in 1..=4 {
            series.push(format!("if_{n}_systemTempAzel_ra"));
            series.push(format!("if_{n}_systemTempAzel_dec"));
        }
        for name in &series {
            for statement in create_series_statements(&series_table(name), SqlType::Real) {
                conn.execute(&statement, []).unwrap();
            }
        }
        for (name, ty) in [("events", "TEXT"), ("points", "INTEGER"), ("lag", "INTEGER")] {
            conn.execute_batch(&format!(
                "CREATE TABLE ts_param_{name} (time INTEGER NOT NULL, station TEXT NOT NULL, value {ty});
                 CREATE INDEX idx_ts_param_{name}_time ON ts_param_{name}(time);"
            ))
            .unwrap();
        }
        conn.execute_batch(
            "CREATE TABLE station_status (time INTEGER NOT NULL, station TEXT PRIMARY KEY, \
             source TEXT, onsource TEXT, mode TEXT, recording TEXT);
             INSERT INTO station_status VALUES (1, 'ALMA', 'M87', 'on', 'VLBI', '1...');",
        )
        .unwrap();
        conn
    }

    fn dispositions(conn: &Connection) -> Vec<Disposition> {
        plan(conn)
            .unwrap()
            .into_iter()
            .map(|step| step.disposition)
            .collect()
    }

    fn schema_dump(conn: &Connection) -> Vec<(String, String)> {
        let mut stmt = conn
            .prepare("SELECT type, name FROM sqlite_master ORDER BY type, name")
            .unwrap();
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .collect::<rusqlite::Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn check_is_read_only_and_repeatable() {
        let conn = legacy_db();
        let schema = schema_dump(&conn);
        let first: Vec<_> = plan(&conn).unwrap().into_iter().map(|s| s.check).collect();
        let second: Vec<_> = plan(&conn).unwrap().into_iter().map(|s| s.check).collect();
        assert_eq!(first, second);
        assert_eq!(schema, schema_dump(&conn));
        assert_eq!(
            dispositions(&conn),
            vec![Disposition::Pending, Disposition::Queued, Disposition::Queued]
        );
        assert_eq!(first[0].before, TableSet::All(9));
        assert_eq!(first[0].after, TableSet::None);
    }

    #[test]
    fn fix_applies_all_migrations_in_order() {
        let mut conn = legacy_db();
        let report = fix(&mut conn).unwrap();
        assert_eq!(
            report.applied,
            vec!["0001_azel_suffixes", "0002_status_page_tables", "0003_bridge_prefix"]
        );

        let names = table_names(&conn).unwrap();
        assert!(names.contains("ts_param_bridge_totalLag"));
        assert!(names.contains("ts_param_bridge_avgWindSpeed"));
        assert!(names.contains("ts_param_windGust"));
        assert!(names.contains("ts_param_if_3_systemTempAzel_el"));
        assert!(names.contains("bridge_stationStatus"));
        assert!(!names.contains("ts_param_lag"));
        assert!(!names.contains("station_status"));

        let indexes: Vec<String> = schema_dump(&conn)
            .into_iter()
            .filter(|(ty, _)| ty == "index")
            .map(|(_, name)| name)
            .collect();
        assert!(indexes.contains(&"idx_ts_param_bridge_events_station".to_string()));
        assert!(!indexes.iter().any(|name| name.starts_with("idx_ts_param_lag")));

        let scan: String = conn
            .query_row(
                "SELECT scan FROM bridge_stationStatus WHERE station = 'ALMA'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(scan, "");
        assert_eq!(recorded_ids(&conn).unwrap(), BTreeSet::from([1, 2, 3]));
        assert!(dispositions(&conn)
            .iter()
            .all(|d| *d == Disposition::Recorded));
    }

    #[test]
    fn partial_old_tables_refuse_without_writing() {
        let mut conn = legacy_db();
        conn.execute("DROP TABLE ts_param_if_2_systemTempAzel_dec", [])
            .unwrap();
        let schema = schema_dump(&conn);

        let err = fix(&mut conn).unwrap_err();
        match err {
            MigrationError::Partial { side, missing, .. } => {
                assert_eq!(side, "old");
                assert_eq!(missing, vec!["ts_param_if_2_systemTempAzel_dec".to_string()]);
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(schema, schema_dump(&conn));
    }

    #[test]
    fn empty_database_is_refused() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert!(matches!(
            fix(&mut conn),
            Err(MigrationError::NothingToMigrate { .. })
        ));
    }

    #[test]
    fn fresh_store_is_fully_migrated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fresh.db");
        initialize_schema(&path, &BTreeMap::new(), &StorageOptions::default()).unwrap();
        let conn = Connection::open(&path).unwrap();
        assert!(dispositions(&conn)
            .iter()
            .all(|d| *d == Disposition::Recorded));
    }

    #[test]
    fn layout_migrated_by_older_tools_is_only_recorded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("old-tools.db");
        initialize_schema(&path, &BTreeMap::new(), &StorageOptions::default()).unwrap();
        let mut conn = Connection::open(&path).unwrap();
        conn.execute(&format!("DROP TABLE {MIGRATIONS_TABLE}"), [])
            .unwrap();

        assert_eq!(
            dispositions(&conn),
            vec![Disposition::AppliedUnrecorded; 3]
        );
        let report = fix(&mut conn).unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(report.recorded.len(), 3);
        assert_eq!(recorded_ids(&conn).unwrap(), BTreeSet::from([1, 2, 3]));
    }
}
