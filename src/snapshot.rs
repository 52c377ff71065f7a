use crate::record::{FieldValue, FlatRecord};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};

/// Pseudo-station carrying schedule files, not telemetry.
const VEXFILES_STATION: &str = "vexfiles";
/// Pseudo-station the bridge attributes its own metrics to.
pub const BRIDGE_STATION: &str = "bridge";
pub const POINTS_PARAM: &str = "points";
pub const LAG_PARAM: &str = "lag";

#[derive(Debug, Clone, Copy, Default)]
pub struct FlattenOptions {
    /// Append per-station and global point counts plus the global lag.
    pub add_points: bool,
}

/// Flattens one snapshot into `(station, parameter, time, value)` records.
///
/// `now` is the wall-clock reading in (fractional) unix seconds; it is only
/// used for the synthetic `points`/`lag` records.
pub fn flatten(snapshot: &JsonValue, options: FlattenOptions, now: f64) -> Vec<FlatRecord> {
    let mut records = Vec::new();

    if let Some(stations) = snapshot.as_object() {
        for (station, entry) in stations {
            if station == VEXFILES_STATION {
                continue;
            }
            let Some(data) = entry.get("data").and_then(JsonValue::as_object) else {
                continue;
            };
            for (parameter, point) in data {
                match flatten_point(station, parameter, point) {
                    Some(record) => records.push(record),
                    None => {
                        tracing::debug!(%station, %parameter, point = %point, "skipping malformed data point");
                    }
                }
            }
        }
    }

    if options.add_points {
        let synthetic = point_metrics(&records, now);
        records.extend(synthetic);
    }

    records
}

fn flatten_point(station: &str, parameter: &str, point: &JsonValue) -> Option<FlatRecord> {
    let pair = point.as_array()?;
    if pair.len() < 2 {
        return None;
    }
    let time = coerce_seconds(&pair[0])?;
    let value = FieldValue::from_json(&pair[1])?;
    Some(FlatRecord::new(station, parameter, time, value))
}

fn coerce_seconds(raw: &JsonValue) -> Option<i64> {
    match raw {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        JsonValue::String(s) => s.trim().parse::<f64>().ok().map(|f| f as i64),
        _ => None,
    }
}

fn point_metrics(records: &[FlatRecord], now: f64) -> Vec<FlatRecord> {
    let now_secs = now as i64;
    let latest = records
        .iter()
        .map(|r| r.time)
        .max()
        .unwrap_or(now_secs);
    let lag = now - latest as f64;

    let mut per_station: BTreeMap<&str, i64> = BTreeMap::new();
    for record in records {
        *per_station.entry(record.station.as_str()).or_default() += 1;
    }

    let mut out: Vec<FlatRecord> = per_station
        .into_iter()
        .filter(|(_, count)| *count > 0)
        .map(|(station, count)| {
            FlatRecord::new(station, POINTS_PARAM, now_secs, FieldValue::Int(count))
        })
        .collect();
    // global totals go last so they are not counted toward any station
    out.push(FlatRecord::new(
        BRIDGE_STATION,
        POINTS_PARAM,
        now_secs,
        FieldValue::Int(records.len() as i64),
    ));
    out.push(FlatRecord::new(
        BRIDGE_STATION,
        LAG_PARAM,
        now_secs,
        FieldValue::Float(lag),
    ));
    out
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    pub time: i64,
    pub station: String,
    pub value: FieldValue,
}

/// Rows destined for one storage table per parameter name.
pub type ParameterTables = BTreeMap<String, Vec<TableRow>>;

pub fn partition(records: &[FlatRecord]) -> ParameterTables {
    let mut tables: HashMap<&str, Vec<TableRow>> = HashMap::new();
    for record in records {
        tables
            .entry(record.parameter.as_str())
            .or_default()
            .push(TableRow {
                time: record.time,
                station: record.station.clone(),
                value: record.value.clone(),
            });
    }
    tables
        .into_iter()
        .map(|(name, rows)| (name.to_string(), rows))
        .collect()
}
