//! Core scalar types: external keys, timestamps and typed field values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// UTC timestamp used for watermarks and upstream `updated_at` values.
pub type Timestamp = DateTime<Utc>;

/// Placeholder values some upstream payloads use instead of a real id.
const PLACEHOLDER_KEYS: [&str; 2] = ["None", "unknown"];

/// Upstream-assigned identifier of a record.
///
/// This is the idempotency key: at most one destination document may carry
/// a given external key. Keys are trimmed on construction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalKey(String);

impl ExternalKey {
    /// Creates a key from raw text, trimming surrounding whitespace.
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_string())
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the key can identify a destination document.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && !PLACEHOLDER_KEYS.contains(&self.0.as_str())
    }
}

impl fmt::Display for ExternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExternalKey {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for ExternalKey {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

/// A typed field value.
///
/// Upstream custom fields and destination properties share this shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    /// Free text.
    Text(String),
    /// Numeric value.
    Number(f64),
    /// Point in time.
    Date(Timestamp),
    /// List of strings (labels, people, tags).
    List(Vec<String>),
}

impl FieldValue {
    /// Creates a text value.
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    /// Creates a list value from anything yielding strings.
    pub fn list<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::List(values.into_iter().map(Into::into).collect())
    }

    /// Returns the text content if this is a text value.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Flattens the value into display strings.
    #[must_use]
    pub fn to_strings(&self) -> Vec<String> {
        match self {
            Self::Text(s) => vec![s.clone()],
            Self::Number(n) => vec![n.to_string()],
            Self::Date(d) => vec![d.to_rfc3339()],
            Self::List(items) => items.clone(),
        }
    }

    /// Converts an arbitrary JSON value into a typed value, if it has a scalar shape.
    ///
    /// Strings that parse as RFC 3339 become dates. Arrays convert only when
    /// every element is a string or number. Objects, booleans and nulls have
    /// no typed form and return `None`.
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        use serde_json::Value;
        match value {
            Value::String(s) => Some(match DateTime::parse_from_rfc3339(s) {
                Ok(d) => Self::Date(d.with_timezone(&Utc)),
                Err(_) => Self::Text(s.clone()),
            }),
            Value::Number(n) => n.as_f64().map(Self::Number),
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect::<Option<Vec<_>>>()
                .map(Self::List),
            _ => None,
        }
    }
}

/// Arbitrary upstream fields with a typed part and an untyped passthrough.
///
/// Values that fit [`FieldValue`] land in `typed`; everything else is kept
/// verbatim in `unknown` so nothing is lost between fetch and write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomFields {
    /// Fields with a recognised scalar shape.
    #[serde(default)]
    pub typed: BTreeMap<String, FieldValue>,
    /// Fields passed through untouched.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub unknown: BTreeMap<String, serde_json::Value>,
}

impl CustomFields {
    /// Creates an empty field set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a typed value.
    pub fn insert(&mut self, key: impl Into<String>, value: FieldValue) {
        let key = key.into();
        self.unknown.remove(&key);
        self.typed.insert(key, value);
    }

    /// Inserts a raw JSON value, typing it when possible.
    pub fn insert_json(&mut self, key: impl Into<String>, value: serde_json::Value) {
        let key = key.into();
        match FieldValue::from_json(&value) {
            Some(typed) => self.insert(key, typed),
            None => {
                self.typed.remove(&key);
                self.unknown.insert(key, value);
            }
        }
    }

    /// Returns a typed value by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.typed.get(key)
    }

    /// Returns true if neither bucket holds anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.typed.is_empty() && self.unknown.is_empty()
    }
}
