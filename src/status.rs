use crate::record::{FieldValue, FlatRecord};
use std::collections::{BTreeMap, BTreeSet};

pub const EMPTY_RECORDING: &str = "....";
const RECORDERS: usize = 4;

const SOURCE_PARAM: &str = "telescope_sourceName";
const MODE_PARAM: &str = "telescope_observingMode";
const ON_SOURCE_PARAM: &str = "telescope_onSource";
const TSYS_PARAM: &str = "if_1_systemTemp";
const TAU225_PARAM: &str = "weather_tau225";

/// Latest known operational summary of one station, in storage column order.
#[derive(Debug, Clone, PartialEq)]
pub struct StationStatus {
    pub time: i64,
    pub station: String,
    pub source: String,
    pub onsource: String,
    pub mode: String,
    pub recording: String,
    pub tsys: f64,
    pub tau225: f64,
    pub scan: String,
}

impl StationStatus {
    pub fn new(station: impl Into<String>) -> Self {
        Self {
            time: 0,
            station: station.into(),
            source: String::new(),
            onsource: String::new(),
            mode: String::new(),
            recording: EMPTY_RECORDING.to_string(),
            tsys: 0.0,
            tau225: 0.0,
            scan: String::new(),
        }
    }

    fn set_recorder(&mut self, recorder: usize, recording: bool) {
        let mut bitmap: Vec<u8> = if is_valid_recording(&self.recording) {
            self.recording.as_bytes().to_vec()
        } else {
            EMPTY_RECORDING.as_bytes().to_vec()
        };
        bitmap[recorder - 1] = if recording {
            b'0' + recorder as u8
        } else {
            b'.'
        };
        self.recording = String::from_utf8_lossy(&bitmap).into_owned();
    }
}

/// A recording bitmap is four characters; position `N-1` is `.` or the digit `N`.
pub fn is_valid_recording(bitmap: &str) -> bool {
    bitmap.len() == RECORDERS
        && bitmap
            .bytes()
            .enumerate()
            .all(|(idx, ch)| ch == b'.' || ch == b'1' + idx as u8)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum StatusField {
    Source,
    Mode,
    OnSource,
    Recorder(usize),
    Tsys,
    Tau225,
}

fn tracked_field(parameter: &str) -> Option<StatusField> {
    match parameter {
        SOURCE_PARAM => Some(StatusField::Source),
        MODE_PARAM => Some(StatusField::Mode),
        ON_SOURCE_PARAM => Some(StatusField::OnSource),
        TSYS_PARAM => Some(StatusField::Tsys),
        TAU225_PARAM => Some(StatusField::Tau225),
        other => {
            let n = other
                .strip_prefix("recorder_")?
                .strip_suffix("_shouldRecord")?
                .parse::<usize>()
                .ok()?;
            (1..=RECORDERS).contains(&n).then_some(StatusField::Recorder(n))
        }
    }
}

/// Upstream sometimes blanks a field with a single space.
fn normalize_text(value: &FieldValue) -> String {
    let text = value.to_string();
    if text.trim().is_empty() {
        String::new()
    } else {
        text
    }
}

/// Per-station status state machine fed by flat records.
#[derive(Debug, Default)]
pub struct StatusAggregator {
    stations: BTreeMap<String, StationStatus>,
    changed: BTreeSet<String>,
}

impl StatusAggregator {
    /// Seeds from persisted rows; every listed station missing from storage
    /// starts from defaults.
    pub fn seeded(persisted: Vec<StationStatus>, stations: &[String]) -> Self {
        let mut map: BTreeMap<String, StationStatus> = persisted
            .into_iter()
            .map(|status| (status.station.clone(), status))
            .collect();
        for station in stations {
            map.entry(station.clone())
                .or_insert_with(|| StationStatus::new(station.clone()));
        }
        Self {
            stations: map,
            changed: BTreeSet::new(),
        }
    }

    pub fn get(&self, station: &str) -> Option<&StationStatus> {
        self.stations.get(station)
    }

    pub fn apply(&mut self, records: &[FlatRecord]) {
        for record in records {
            let Some(field) = tracked_field(&record.parameter) else {
                continue;
            };
            if record.value.is_null() {
                continue;
            }
            let status = self
                .stations
                .entry(record.station.clone())
                .or_insert_with(|| StationStatus::new(record.station.clone()));

            let updated = match field {
                StatusField::Source => {
                    status.source = normalize_text(&record.value);
                    true
                }
                StatusField::Mode => {
                    status.mode = normalize_text(&record.value);
                    true
                }
                StatusField::OnSource => {
                    let on = record.value.as_bool() == Some(true);
                    status.onsource = if on { "on" } else { "off" }.to_string();
                    true
                }
                StatusField::Recorder(n) => {
                    status.set_recorder(n, record.value.as_bool() == Some(true));
                    true
                }
                StatusField::Tsys | StatusField::Tau225 => match record.value.as_f64() {
                    Some(v) => {
                        if field == StatusField::Tsys {
                            status.tsys = v;
                        } else {
                            status.tau225 = v;
                        }
                        true
                    }
                    None => {
                        tracing::debug!(
                            station = %record.station,
                            parameter = %record.parameter,
                            value = %record.value,
                            "ignoring non-numeric status value"
                        );
                        false
                    }
                },
            };

            if !updated {
                continue;
            }
            // out-of-order updates still change values but never rewind the time
            if record.time > status.time {
                status.time = record.time;
            }
            self.changed.insert(record.station.clone());
        }
    }

    /// Rows for every station changed since the last call.
    pub fn take_changed(&mut self) -> Vec<StationStatus> {
        let changed = std::mem::take(&mut self.changed);
        changed
            .into_iter()
            .filter_map(|station| self.stations.get(&station).cloned())
            .collect()
    }

    /// Marks rows as changed again after a failed commit.
    pub fn restore_changed(&mut self, rows: &[StationStatus]) {
        self.changed
            .extend(rows.iter().map(|row| row.station.clone()));
    }
}
