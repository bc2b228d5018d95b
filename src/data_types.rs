use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, DurationRound, NaiveDate, NaiveDateTime, SecondsFormat, TimeDelta, Utc};
use serde_json::{Map, Value as JsonValue};
use strum_macros::{AsRefStr, Display, EnumString};
use uuid::Uuid;

pub type SequenceNumber = i64;

/// The four record operations a policy can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
}

impl Operation {
    pub const ALL: [Operation; 4] = [
        Operation::Create,
        Operation::Read,
        Operation::Update,
        Operation::Delete,
    ];

    pub fn is_write(&self) -> bool {
        !matches!(self, Operation::Read)
    }
}

/// Semantic type of a column. `Integer` and `Real` are both exposed as
/// "number" to clients, but are kept apart so that values round-trip
/// through the database driver without lossy casts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    Boolean,
    Timestamp,
    Uuid,
    Json,
}

impl ColumnType {
    pub fn semantic_name(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Integer | ColumnType::Real => "number",
            ColumnType::Boolean => "boolean",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Uuid => "uuid",
            ColumnType::Json => "json",
        }
    }

    pub fn is_orderable(&self) -> bool {
        !matches!(self, ColumnType::Json | ColumnType::Boolean)
    }
}

/// A single typed cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Integer(i64),
    Real(f64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
    Uuid(Uuid),
    Json(JsonValue),
}

/// A literal as written by a client in a filter or policy expression,
/// before it has been coerced to the type of the column it is compared to.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Text(String),
    Number(String),
    Boolean(bool),
    Null,
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Text(s) => write!(f, "'{s}'"),
            Literal::Number(n) => write!(f, "{n}"),
            Literal::Boolean(b) => write!(f, "{b}"),
            Literal::Null => write!(f, "null"),
        }
    }
}

const NAIVE_TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];

/// Parse the timestamp representations we accept from clients and read back
/// from SQLite (which stores them as text). The result is rounded to the
/// millisecond, the precision SQLite date functions work at, so that
/// in-memory comparisons agree with SQL ones.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    parse_timestamp_exact(s).map(round_to_millis)
}

fn parse_timestamp_exact(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }

    for format in NAIVE_TIMESTAMP_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(s, format) {
            return Some(ts.and_utc());
        }
    }

    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ts| ts.and_utc())
}

/// Half a millisecond rounds up.
pub fn round_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_round(TimeDelta::milliseconds(1)).unwrap_or(ts)
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Coerce a client-supplied JSON value into a value of the given column
    /// type. Returns `None` on a type mismatch; JSON `null` always maps to
    /// `Value::Null` and nullability is checked by the caller.
    pub fn from_json(column_type: ColumnType, json: &JsonValue) -> Option<Value> {
        if json.is_null() {
            return Some(Value::Null);
        }

        match (column_type, json) {
            (ColumnType::Text, JsonValue::String(s)) => Some(Value::Text(s.clone())),
            (ColumnType::Integer, JsonValue::Number(n)) => n
                .as_i64()
                .or_else(|| {
                    n.as_f64()
                        .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                        .map(|f| f as i64)
                })
                .map(Value::Integer),
            (ColumnType::Real, JsonValue::Number(n)) => n.as_f64().map(Value::Real),
            (ColumnType::Boolean, JsonValue::Bool(b)) => Some(Value::Boolean(*b)),
            (ColumnType::Timestamp, JsonValue::String(s)) => {
                parse_timestamp(s).map(Value::Timestamp)
            }
            (ColumnType::Uuid, JsonValue::String(s)) => {
                Uuid::parse_str(s).ok().map(Value::Uuid)
            }
            (ColumnType::Json, json) => Some(Value::Json(json.clone())),
            _ => None,
        }
    }

    /// Coerce an expression literal into a value of the given column type.
    pub fn from_literal(column_type: ColumnType, literal: &Literal) -> Option<Value> {
        match (column_type, literal) {
            (_, Literal::Null) => Some(Value::Null),
            (ColumnType::Text, Literal::Text(s)) => Some(Value::Text(s.clone())),
            (ColumnType::Integer, Literal::Number(n)) => n.parse::<i64>().ok().map(Value::Integer),
            (ColumnType::Real, Literal::Number(n)) => n.parse::<f64>().ok().map(Value::Real),
            (ColumnType::Boolean, Literal::Boolean(b)) => Some(Value::Boolean(*b)),
            (ColumnType::Timestamp, Literal::Text(s)) => parse_timestamp(s).map(Value::Timestamp),
            (ColumnType::Uuid, Literal::Text(s)) => Uuid::parse_str(s).ok().map(Value::Uuid),
            _ => None,
        }
    }

    /// Coerce a path segment (e.g. a record id in a URL) into a value.
    pub fn from_path_segment(column_type: ColumnType, s: &str) -> Option<Value> {
        match column_type {
            ColumnType::Text => Some(Value::Text(s.to_string())),
            ColumnType::Integer => s.parse::<i64>().ok().map(Value::Integer),
            ColumnType::Real => s.parse::<f64>().ok().map(Value::Real),
            ColumnType::Uuid => Uuid::parse_str(s).ok().map(Value::Uuid),
            ColumnType::Timestamp => parse_timestamp(s).map(Value::Timestamp),
            ColumnType::Boolean | ColumnType::Json => None,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Text(s) => JsonValue::String(s.clone()),
            Value::Integer(i) => JsonValue::from(*i),
            Value::Real(f) => JsonValue::from(*f),
            Value::Boolean(b) => JsonValue::Bool(*b),
            Value::Timestamp(ts) => {
                JsonValue::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            Value::Uuid(u) => JsonValue::String(u.hyphenated().to_string()),
            Value::Json(j) => j.clone(),
        }
    }

    /// SQL-style comparison: anything involving NULL is unordered, and so
    /// are JSON documents.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
            (Value::Real(a), Value::Real(b)) => a.partial_cmp(b),
            (Value::Integer(a), Value::Real(b)) => (*a as f64).partial_cmp(b),
            (Value::Real(a), Value::Integer(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::Uuid(a), Value::Uuid(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(s) => write!(f, "{s}"),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

/// One row of a table: column name to value, in table column order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        match self.fields.iter_mut().find(|(field, _)| *field == name) {
            Some((_, existing)) => *existing = value,
            None => self.fields.push((name, value)),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn to_json(&self) -> JsonValue {
        let map: Map<String, JsonValue> = self
            .fields
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect();
        JsonValue::Object(map)
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        let mut record = Record::new();
        for (name, value) in iter {
            record.insert(name, value);
        }
        record
    }
}
