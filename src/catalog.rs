//! Parameter catalog ("masterlist") loading.
//!
//! The masterlist is a JSON object whose `default` key lists every known
//! parameter with its datatype, and whose remaining keys are station names.
//! Everything the pipeline needs at startup is derived from it: the column
//! type of each time-series table, the event parameters, the compound
//! coordinate parameters to split, and the station list.

use crate::storage::tables::is_safe_identifier;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

const DEFAULT_KEY: &str = "default";
const ON_SOURCE_PARAM: &str = "telescope_onSource";
const EVENT_PREFIXES: [&str; 2] = ["telescope_", "observerMessages_"];
const RECORDER_REAL_SUFFIXES: [&str; 3] = ["SpaceLeft", "TimeLeft", "Datarate"];

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to read parameter catalog {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse parameter catalog: {0}")]
    Parse(String),
    #[error("parameter catalog has no `default` section")]
    MissingDefault,
    #[error("parameter {0:?} is not an identifier")]
    InvalidParameter(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Integer,
    Real,
    Text,
    Boolean,
}

impl SqlType {
    pub fn as_sql(self) -> &'static str {
        match self {
            SqlType::Integer => "INTEGER",
            SqlType::Real => "REAL",
            SqlType::Text => "TEXT",
            SqlType::Boolean => "BOOLEAN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinateKind {
    Celestial,
    Horizontal,
}

impl CoordinateKind {
    pub fn suffixes(self) -> (&'static str, &'static str) {
        match self {
            CoordinateKind::Celestial => ("_ra", "_dec"),
            CoordinateKind::Horizontal => ("_az", "_el"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ParameterEntry {
    #[serde(default)]
    datatype: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ParameterSpec {
    pub name: String,
    pub datatype: Option<String>,
    /// `None` for parameters with datatype `none`, which never get a table.
    pub sql_type: Option<SqlType>,
    pub split: Option<CoordinateKind>,
}

#[derive(Debug, Clone, Default)]
pub struct ParameterCatalog {
    pub stations: Vec<String>,
    pub parameters: BTreeMap<String, ParameterSpec>,
}

impl ParameterCatalog {
    pub fn from_path(path: &Path) -> Result<Self, CatalogError> {
        let mut bytes = std::fs::read(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_bytes(&mut bytes)
    }

    pub fn from_json_bytes(bytes: &mut [u8]) -> Result<Self, CatalogError> {
        let raw: BTreeMap<String, JsonValue> = simd_json::serde::from_slice(bytes)
            .map_err(|err| CatalogError::Parse(err.to_string()))?;

        let stations: Vec<String> = raw
            .keys()
            .filter(|key| key.as_str() != DEFAULT_KEY)
            .cloned()
            .collect();

        let defaults = raw.get(DEFAULT_KEY).ok_or(CatalogError::MissingDefault)?;
        let entries: BTreeMap<String, ParameterEntry> = serde_json::from_value(defaults.clone())
            .map_err(|err| CatalogError::Parse(err.to_string()))?;

        let mut parameters = BTreeMap::new();
        for (name, entry) in entries {
            if !is_safe_identifier(&name) {
                return Err(CatalogError::InvalidParameter(name));
            }
            let sql_type = column_type(&name, entry.datatype.as_deref());
            let split = coordinate_kind(&name, entry.datatype.as_deref());
            parameters.insert(
                name.clone(),
                ParameterSpec {
                    name,
                    datatype: entry.datatype,
                    sql_type,
                    split,
                },
            );
        }

        Ok(Self {
            stations,
            parameters,
        })
    }

    /// Station-scoped string signals that produce `events` records.
    pub fn event_parameters(&self) -> BTreeSet<String> {
        let mut events: BTreeSet<String> = self
            .parameters
            .values()
            .filter(|spec| spec.datatype.as_deref() == Some("string"))
            .filter(|spec| EVENT_PREFIXES.iter().any(|p| spec.name.starts_with(p)))
            .map(|spec| spec.name.clone())
            .collect();
        events.insert(ON_SOURCE_PARAM.to_string());
        events
    }

    pub fn split_parameters(&self) -> BTreeMap<String, CoordinateKind> {
        self.parameters
            .values()
            .filter_map(|spec| spec.split.map(|kind| (spec.name.clone(), kind)))
            .collect()
    }

    /// Column type per parameter table, including the split expansions.
    pub fn column_types(&self) -> BTreeMap<String, SqlType> {
        let mut types: BTreeMap<String, SqlType> = self
            .parameters
            .values()
            .filter_map(|spec| spec.sql_type.map(|ty| (spec.name.clone(), ty)))
            .collect();
        for (name, kind) in self.split_parameters() {
            let (first, second) = kind.suffixes();
            types.entry(format!("{name}{first}")).or_insert(SqlType::Real);
            types.entry(format!("{name}{second}")).or_insert(SqlType::Real);
        }
        types
    }
}

fn column_type(name: &str, datatype: Option<&str>) -> Option<SqlType> {
    if name.starts_with("recorder_")
        && RECORDER_REAL_SUFFIXES
            .iter()
            .any(|suffix| name.ends_with(suffix))
    {
        return Some(SqlType::Real);
    }
    match datatype {
        None => Some(SqlType::Real),
        Some("none") => None,
        Some("boolean") => Some(SqlType::Boolean),
        Some("int") => Some(SqlType::Integer),
        Some("float") | Some("number") => Some(SqlType::Real),
        Some("string") | Some("document") => Some(SqlType::Text),
        Some(other) if other.ends_with("Coordinates") => Some(SqlType::Text),
        Some(other) => {
            tracing::debug!(parameter = %name, datatype = %other, "unknown datatype, storing as REAL");
            Some(SqlType::Real)
        }
    }
}

fn coordinate_kind(name: &str, datatype: Option<&str>) -> Option<CoordinateKind> {
    match datatype {
        Some("AzElCoordinates") => Some(CoordinateKind::Horizontal),
        Some("CelestialCoordinates") => {
            // some az/el parameters are declared celestial upstream
            if name.contains("azimuthElevation") || name.contains("Azel") {
                Some(CoordinateKind::Horizontal)
            } else {
                Some(CoordinateKind::Celestial)
            }
        }
        _ => None,
    }
}
