//! Table-name registry.
//!
//! Every flat parameter reaches SQL text through [`table_for_parameter`], which
//! maps bridge-generated parameters onto their `bridge_` tables and rejects
//! anything that is not a plain identifier.

use crate::catalog::SqlType;
use std::collections::BTreeMap;

pub const SERIES_PREFIX: &str = "ts_param_";
pub const STATUS_TABLE: &str = "bridge_stationStatus";
pub const SCHEDULE_TABLE: &str = "ts_param_schedule";
pub const MIGRATIONS_TABLE: &str = "bridge_migrations";

/// Flat parameter -> series name, for the parameters the bridge generates itself.
const BRIDGE_SERIES: [(&str, &str, SqlType); 3] = [
    ("events", "bridge_events", SqlType::Text),
    ("points", "bridge_points", SqlType::Integer),
    ("lag", "bridge_totalLag", SqlType::Real),
];

/// Series written by external feeds; created so a fresh file matches a migrated one.
pub const AUXILIARY_SERIES: [&str; 4] = [
    "bridge_bridgeLag",
    "bridge_forecastTau225",
    "bridge_avgWindSpeed",
    "windGust",
];

pub fn is_safe_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

pub fn series_table(series: &str) -> String {
    format!("{SERIES_PREFIX}{series}")
}

/// Resolves the table for a flat parameter; `None` when the name is unsafe.
pub fn table_for_parameter(parameter: &str) -> Option<String> {
    if !is_safe_identifier(parameter) {
        return None;
    }
    let series = BRIDGE_SERIES
        .iter()
        .find(|(flat, _, _)| *flat == parameter)
        .map(|(_, series, _)| *series)
        .unwrap_or(parameter);
    Some(series_table(series))
}

pub fn index_names(table: &str) -> (String, String) {
    (format!("idx_{table}_time"), format!("idx_{table}_station"))
}

/// `CREATE` statements for one `(time, station, value)` series table and its indexes.
pub fn create_series_statements(table: &str, value_type: SqlType) -> [String; 3] {
    let (time_idx, station_idx) = index_names(table);
    [
        format!(
            "CREATE TABLE {table} (time INTEGER NOT NULL, station TEXT NOT NULL, value {})",
            value_type.as_sql()
        ),
        format!("CREATE INDEX {time_idx} ON {table}(time)"),
        format!("CREATE INDEX {station_idx} ON {table}(station)"),
    ]
}

pub fn status_table_statement() -> String {
    format!(
        "CREATE TABLE {STATUS_TABLE} (\
         time INTEGER NOT NULL, \
         station TEXT PRIMARY KEY, \
         source TEXT, \
         onsource TEXT, \
         mode TEXT, \
         recording TEXT, \
         tsys REAL, \
         tau225 REAL, \
         scan TEXT NOT NULL DEFAULT '')"
    )
}

pub fn schedule_table_statements() -> [String; 2] {
    [
        format!(
            "CREATE TABLE {SCHEDULE_TABLE} (time INTEGER NOT NULL, stations TEXT NOT NULL, scanname TEXT NOT NULL)"
        ),
        format!("CREATE INDEX idx_{SCHEDULE_TABLE}_time ON {SCHEDULE_TABLE}(time)"),
    ]
}

/// Full set of series tables for a fresh store: catalog columns plus bridge tables.
///
/// Catalog entries whose names are not identifiers are left out.
pub fn fresh_series_layout(column_types: &BTreeMap<String, SqlType>) -> BTreeMap<String, SqlType> {
    let mut layout: BTreeMap<String, SqlType> = column_types
        .iter()
        .filter(|(name, _)| is_safe_identifier(name))
        .filter_map(|(name, ty)| table_for_parameter(name).map(|table| (table, *ty)))
        .collect();
    for (_, series, ty) in BRIDGE_SERIES {
        layout.insert(series_table(series), ty);
    }
    for series in AUXILIARY_SERIES {
        layout.entry(series_table(series)).or_insert(SqlType::Real);
    }
    layout
}
