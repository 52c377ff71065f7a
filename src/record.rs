use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue};
use serde_json::Value as JsonValue;
use std::fmt;

/// Value carried by a flat record. Mirrors what the remote service reports
/// (strings, integers, floats, booleans, null) without forcing a column type
/// early.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    /// Stored as SQL NULL.
    Null,
}

impl FieldValue {
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::String(s) => Some(FieldValue::Text(s.clone())),
            JsonValue::Bool(b) => Some(FieldValue::Bool(*b)),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(FieldValue::Int(i))
                } else {
                    n.as_f64().map(FieldValue::Float)
                }
            }
            JsonValue::Null => Some(FieldValue::Null),
            other => Some(FieldValue::Text(other.to_string())),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Booleans arrive either natively or as the strings "true"/"false".
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            FieldValue::Text(s) => match s.trim() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            FieldValue::Int(i) => Some(*i != 0),
            FieldValue::Float(_) | FieldValue::Null => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Int(i) => Some(*i as f64),
            FieldValue::Float(f) => Some(*f),
            FieldValue::Text(s) => s.trim().parse::<f64>().ok(),
            FieldValue::Bool(_) | FieldValue::Null => None,
        }
        .filter(|v| v.is_finite())
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Int(i) => write!(f, "{i}"),
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Bool(b) => write!(f, "{b}"),
            FieldValue::Null => Ok(()),
        }
    }
}

impl ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let value = match self {
            FieldValue::Text(s) => return Ok(ToSqlOutput::from(s.as_str())),
            FieldValue::Int(i) => SqlValue::Integer(*i),
            FieldValue::Float(f) => SqlValue::Real(*f),
            FieldValue::Bool(b) => SqlValue::Integer(i64::from(*b)),
            FieldValue::Null => SqlValue::Null,
        };
        Ok(ToSqlOutput::Owned(value))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlatRecord {
    pub station: String,
    pub parameter: String,
    pub time: i64,
    pub value: FieldValue,
}

impl FlatRecord {
    pub fn new(
        station: impl Into<String>,
        parameter: impl Into<String>,
        time: i64,
        value: FieldValue,
    ) -> Self {
        Self {
            station: station.into(),
            parameter: parameter.into(),
            time,
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_numbers_keep_integer_precision() {
        assert_eq!(FieldValue::from_json(&json!(42)), Some(FieldValue::Int(42)));
        assert_eq!(
            FieldValue::from_json(&json!(1.5)),
            Some(FieldValue::Float(1.5))
        );
        assert_eq!(
            FieldValue::from_json(&JsonValue::Null),
            Some(FieldValue::Null)
        );
    }

    #[test]
    fn booleans_accept_string_encoding() {
        assert_eq!(FieldValue::Text("true".into()).as_bool(), Some(true));
        assert_eq!(FieldValue::Text("false".into()).as_bool(), Some(false));
        assert_eq!(FieldValue::Bool(true).as_bool(), Some(true));
        assert_eq!(FieldValue::Text("maybe".into()).as_bool(), None);
    }
}
