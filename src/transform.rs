use crate::catalog::{CoordinateKind, ParameterCatalog};
use crate::record::{FieldValue, FlatRecord};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::OnceLock;

pub const EVENTS_PARAM: &str = "events";
const ON_SOURCE_PARAM: &str = "telescope_onSource";
const EVENT_PREFIXES: [&str; 2] = ["telescope_", "observerMessages_"];

const EVENT_PHRASES: [(&str, &str); 7] = [
    ("telescope_sourceName", "source name is"),
    ("telescope_observingMode", "mode is"),
    ("telescope_pointingCorrection", "pointing is"),
    ("telescope_focusCorrection", "focus is"),
    ("observerMessages_observer", "observer is"),
    ("observerMessages_observatoryStatus", "status is"),
    ("observerMessages_weather", "weather is"),
];

fn coordinate_pair() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*([+\-]?[0-9.]+)([+\-]?[0-9.]+)").unwrap_or_else(|err| {
            unreachable!("coordinate pattern is a constant: {err}")
        })
    })
}

/// Splits `"<num1><num2>"` where either number may carry a sign.
pub fn split_coordinates(value: &str) -> Option<(String, String)> {
    let caps = coordinate_pair().captures(value)?;
    Some((caps[1].to_string(), caps[2].to_string()))
}

type EventKey = (String, String);

/// Dedup cache entries overwritten by one `transform` call, oldest first.
/// Replaying them in reverse restores the cache to its state before the call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventChanges(Vec<(EventKey, Option<String>)>);

impl EventChanges {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Derives `events` records and split coordinates from a flat batch.
///
/// Owns the per-(station, parameter) dedup cache, so one instance must live
/// for the whole process.
#[derive(Debug, Default)]
pub struct Transformer {
    event_params: BTreeSet<String>,
    splitters: BTreeMap<String, CoordinateKind>,
    last_event: HashMap<EventKey, String>,
    changes: EventChanges,
}

impl Transformer {
    pub fn new(
        event_params: BTreeSet<String>,
        splitters: BTreeMap<String, CoordinateKind>,
    ) -> Self {
        Self {
            event_params,
            splitters,
            last_event: HashMap::new(),
            changes: EventChanges::default(),
        }
    }

    pub fn from_catalog(catalog: &ParameterCatalog) -> Self {
        let transformer = Self::new(catalog.event_parameters(), catalog.split_parameters());
        tracing::info!(
            events = transformer.event_params.len(),
            splitters = transformer.splitters.len(),
            "transformer tables loaded"
        );
        transformer
    }

    pub fn transform(&mut self, mut records: Vec<FlatRecord>, dedupe_events: bool) -> Vec<FlatRecord> {
        self.changes = EventChanges::default();
        let events = self.derive_events(&records, dedupe_events);
        let splits = self.derive_splits(&records);
        records.extend(events);
        records.extend(splits);
        records
    }

    /// Cache updates made by the latest `transform` call.
    pub fn take_changes(&mut self) -> EventChanges {
        std::mem::take(&mut self.changes)
    }

    /// Undoes cache updates whose events never reached storage, so the
    /// same values produce their events again.
    pub fn rollback(&mut self, changes: &EventChanges) {
        for (key, previous) in changes.0.iter().rev() {
            match previous {
                Some(value) => {
                    self.last_event.insert(key.clone(), value.clone());
                }
                None => {
                    self.last_event.remove(key);
                }
            }
        }
    }

    fn derive_events(&mut self, records: &[FlatRecord], dedupe: bool) -> Vec<FlatRecord> {
        let mut out = Vec::new();
        for record in records {
            if !self.event_params.contains(&record.parameter) || record.value.is_null() {
                continue;
            }
            if dedupe {
                let key = (record.station.clone(), record.parameter.clone());
                let current = record.value.to_string();
                if self.last_event.get(&key) == Some(&current) {
                    continue;
                }
                let previous = self.last_event.insert(key.clone(), current);
                self.changes.0.push((key, previous));
            }
            let sentence = event_sentence(&record.station, &record.parameter, &record.value);
            tracing::debug!(station = %record.station, event = %sentence, "event");
            out.push(FlatRecord::new(
                record.station.clone(),
                EVENTS_PARAM,
                record.time,
                FieldValue::Text(sentence),
            ));
        }
        out
    }

    fn derive_splits(&self, records: &[FlatRecord]) -> Vec<FlatRecord> {
        let mut out = Vec::new();
        for record in records {
            let Some(kind) = self.splitters.get(&record.parameter) else {
                continue;
            };
            if record.value.is_null() {
                continue;
            }
            let raw = record.value.to_string();
            let Some((first, second)) = split_coordinates(&raw) else {
                tracing::warn!(
                    station = %record.station,
                    parameter = %record.parameter,
                    value = %raw,
                    "failed to split coordinates"
                );
                continue;
            };
            let (first_suffix, second_suffix) = kind.suffixes();
            out.push(FlatRecord::new(
                record.station.clone(),
                format!("{}{}", record.parameter, first_suffix),
                record.time,
                FieldValue::Text(first),
            ));
            out.push(FlatRecord::new(
                record.station.clone(),
                format!("{}{}", record.parameter, second_suffix),
                record.time,
                FieldValue::Text(second),
            ));
        }
        out
    }
}

fn event_sentence(station: &str, parameter: &str, value: &FieldValue) -> String {
    if parameter == ON_SOURCE_PARAM {
        return if value.as_bool() == Some(true) {
            format!("{station} is on source")
        } else {
            format!("{station} is off source")
        };
    }
    let phrase = EVENT_PHRASES
        .iter()
        .find(|(name, _)| *name == parameter)
        .map(|(_, phrase)| (*phrase).to_string())
        .unwrap_or_else(|| format!("{} is", trim_event_prefix(parameter)));
    format!("{station} {phrase} {value}")
}

fn trim_event_prefix(parameter: &str) -> &str {
    EVENT_PREFIXES
        .iter()
        .find_map(|prefix| parameter.strip_prefix(prefix))
        .unwrap_or(parameter)
}
