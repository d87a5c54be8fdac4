//! Core data types for the correlation engine.
//!
//! This module contains the record model flowing through the grouping
//! pipeline:
//! - [`FieldValue`] - the dynamic value type for record fields
//! - [`Record`] - a single log event: field map, timestamps, tags
//! - [`SharedRecord`] - reference-counted record handle used once a record
//!   becomes a window member or is emitted downstream

use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A value in a record field.
///
/// This enum covers the types a log event realistically carries. Structured
/// payloads nest through `Array` and `Map`.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// 64-bit signed integer
    Integer(i64),
    /// 64-bit floating point number
    Float(f64),
    /// UTF-8 string
    String(String),
    /// Boolean value (true/false)
    Boolean(bool),
    /// Absent/unset value
    Null,
    /// Timestamp (naive, wall-clock)
    Timestamp(NaiveDateTime),
    /// Array of values
    Array(Vec<FieldValue>),
    /// Map of string keys to values
    Map(HashMap<String, FieldValue>),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => write!(f, "NULL"),
            FieldValue::Integer(i) => write!(f, "{}", i),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::String(s) => write!(f, "{}", s),
            FieldValue::Boolean(b) => write!(f, "{}", b),
            FieldValue::Timestamp(t) => write!(f, "{}", t),
            FieldValue::Array(arr) => {
                write!(f, "[")?;
                for (i, v) in arr.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            FieldValue::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl FieldValue {
    /// Type name for diagnostics and error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Integer(_) => "Integer",
            FieldValue::Float(_) => "Float",
            FieldValue::String(_) => "String",
            FieldValue::Boolean(_) => "Boolean",
            FieldValue::Null => "Null",
            FieldValue::Timestamp(_) => "Timestamp",
            FieldValue::Array(_) => "Array",
            FieldValue::Map(_) => "Map",
        }
    }

    /// Render the value for template substitution.
    ///
    /// Unlike `Display`, an unset (`Null`) value renders as the empty string,
    /// so templates referencing absent fields produce empty text instead of a
    /// literal `NULL`.
    pub fn render(&self) -> String {
        match self {
            FieldValue::Null => String::new(),
            other => other.to_string(),
        }
    }

    /// Convert a JSON value into a field value.
    ///
    /// Numbers become `Integer` when they fit in an `i64`, otherwise `Float`.
    pub fn from_json(value: &serde_json::Value) -> FieldValue {
        match value {
            serde_json::Value::Null => FieldValue::Null,
            serde_json::Value::Bool(b) => FieldValue::Boolean(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    FieldValue::Integer(i)
                } else {
                    FieldValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => FieldValue::String(s.clone()),
            serde_json::Value::Array(arr) => {
                FieldValue::Array(arr.iter().map(FieldValue::from_json).collect())
            }
            serde_json::Value::Object(map) => FieldValue::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), FieldValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert this field value into a JSON value.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Null => serde_json::Value::Null,
            FieldValue::Integer(i) => serde_json::Value::from(*i),
            FieldValue::Float(v) => {
                serde_json::Number::from_f64(*v).map_or(serde_json::Value::Null, serde_json::Value::Number)
            }
            FieldValue::String(s) => serde_json::Value::String(s.clone()),
            FieldValue::Boolean(b) => serde_json::Value::Bool(*b),
            FieldValue::Timestamp(t) => serde_json::Value::String(t.to_string()),
            FieldValue::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(FieldValue::to_json).collect())
            }
            FieldValue::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

/// A single log event record.
///
/// Records carry a dynamic field map plus the metadata the engine needs for
/// windowing: a processing timestamp in milliseconds since the epoch, an
/// optional event-time override, and a set of tags.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// The field data for this record
    pub fields: HashMap<String, FieldValue>,
    /// Timestamp when this record entered the pipeline (milliseconds since epoch)
    pub timestamp: i64,
    /// Event-time timestamp used for windowing when present.
    /// When `None`, the processing timestamp drives the logical clock.
    pub event_time: Option<DateTime<Utc>>,
    /// Tags attached to this record
    pub tags: Vec<String>,
}

impl Record {
    /// Field name under which the rendered correlation key is cached on a
    /// record before it joins a window.
    pub const FIELD_CONTEXT_ID: &'static str = "_context_id";
    /// Reserved JSON key carrying the processing timestamp.
    pub const JSON_TIMESTAMP: &'static str = "_timestamp";
    /// Reserved JSON key carrying the tag list.
    pub const JSON_TAGS: &'static str = "_tags";

    /// Create a new record with the given fields and default metadata.
    pub fn new(fields: HashMap<String, FieldValue>) -> Self {
        Self {
            fields,
            timestamp: 0,
            event_time: None,
            tags: Vec::new(),
        }
    }

    /// Create a new record with an explicit processing timestamp (millis).
    pub fn with_timestamp(fields: HashMap<String, FieldValue>, timestamp: i64) -> Self {
        Self {
            fields,
            timestamp,
            event_time: None,
            tags: Vec::new(),
        }
    }

    /// The logical scheduler tick for this record, in whole seconds.
    ///
    /// Event time wins over the processing timestamp when set.
    pub fn tick(&self) -> i64 {
        match self.event_time {
            Some(et) => et.timestamp(),
            None => self.timestamp.div_euclid(1000),
        }
    }

    /// Look up a field by name.
    pub fn get_field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Set a field, replacing any existing value.
    pub fn set_field(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    /// Whether this record carries the given tag.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Attach a tag unless already present.
    pub fn add_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        if !self.has_tag(&tag) {
            self.tags.push(tag);
        }
    }

    /// Build a record from a JSON object.
    ///
    /// The reserved keys [`Record::JSON_TIMESTAMP`] and [`Record::JSON_TAGS`]
    /// populate the record metadata; everything else lands in `fields`.
    /// Returns `None` when the value is not a JSON object.
    pub fn from_json(value: &serde_json::Value) -> Option<Record> {
        let obj = value.as_object()?;
        let mut record = Record::new(HashMap::with_capacity(obj.len()));
        for (key, val) in obj {
            match key.as_str() {
                Self::JSON_TIMESTAMP => {
                    record.timestamp = val.as_i64().unwrap_or(0);
                }
                Self::JSON_TAGS => {
                    if let Some(arr) = val.as_array() {
                        for tag in arr.iter().filter_map(|t| t.as_str()) {
                            record.add_tag(tag);
                        }
                    }
                }
                _ => {
                    record
                        .fields
                        .insert(key.clone(), FieldValue::from_json(val));
                }
            }
        }
        Some(record)
    }

    /// Serialize this record to a JSON object, fields plus reserved metadata
    /// keys.
    pub fn to_json(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::with_capacity(self.fields.len() + 2);
        for (key, val) in &self.fields {
            obj.insert(key.clone(), val.to_json());
        }
        obj.insert(
            Self::JSON_TIMESTAMP.to_string(),
            serde_json::Value::from(self.timestamp),
        );
        if !self.tags.is_empty() {
            obj.insert(
                Self::JSON_TAGS.to_string(),
                serde_json::Value::Array(
                    self.tags
                        .iter()
                        .map(|t| serde_json::Value::String(t.clone()))
                        .collect(),
                ),
            );
        }
        serde_json::Value::Object(obj)
    }
}

/// Shared reference to a [`Record`].
///
/// Once a record becomes a window member it may be referenced by the window,
/// by downstream consumers, and by a synthetic aggregate all at once, so it
/// is frozen behind an `Arc`. Cloning a `SharedRecord` only bumps the
/// reference count.
#[derive(Debug, Clone)]
pub struct SharedRecord {
    inner: Arc<Record>,
}

impl SharedRecord {
    /// Freeze a record into a shared handle.
    pub fn new(record: Record) -> Self {
        Self {
            inner: Arc::new(record),
        }
    }

    /// Get a reference to the underlying record.
    pub fn as_record(&self) -> &Record {
        &self.inner
    }

    /// Number of live references, mainly useful in tests.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl From<Record> for SharedRecord {
    fn from(record: Record) -> Self {
        Self::new(record)
    }
}

impl AsRef<Record> for SharedRecord {
    fn as_ref(&self) -> &Record {
        &self.inner
    }
}
