// Extracted Data
// Structured key/value outputs parsed from an agent's free-form response.
// Values stay opaque JSON; consumers go through the typed accessors.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error returned by the typed accessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueAccessError {
    Missing(String),
    WrongKind {
        key: String,
        expected: &'static str,
        actual: &'static str,
    },
}

impl std::fmt::Display for ValueAccessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing(key) => write!(f, "output key '{}' is missing", key),
            Self::WrongKind {
                key,
                expected,
                actual,
            } => write!(
                f,
                "output key '{}' is a {} (expected {})",
                key, actual, expected
            ),
        }
    }
}

impl std::error::Error for ValueAccessError {}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

/// Ordered map of extracted outputs. Ordering is stable so serialized state
/// is byte-identical for identical inputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtractedData(BTreeMap<String, Value>);

impl ExtractedData {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    /// Shallow-merge `other` into `self`; keys in `other` win.
    pub fn merge(&mut self, other: ExtractedData) {
        for (key, value) in other.0 {
            self.0.insert(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn get_str(&self, key: &str) -> Result<&str, ValueAccessError> {
        let value = self.require(key)?;
        value.as_str().ok_or_else(|| ValueAccessError::WrongKind {
            key: key.to_string(),
            expected: "string",
            actual: kind_name(value),
        })
    }

    pub fn get_i64(&self, key: &str) -> Result<i64, ValueAccessError> {
        let value = self.require(key)?;
        value.as_i64().ok_or_else(|| ValueAccessError::WrongKind {
            key: key.to_string(),
            expected: "integer",
            actual: kind_name(value),
        })
    }

    pub fn get_f64(&self, key: &str) -> Result<f64, ValueAccessError> {
        let value = self.require(key)?;
        value.as_f64().ok_or_else(|| ValueAccessError::WrongKind {
            key: key.to_string(),
            expected: "number",
            actual: kind_name(value),
        })
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, ValueAccessError> {
        let value = self.require(key)?;
        value.as_bool().ok_or_else(|| ValueAccessError::WrongKind {
            key: key.to_string(),
            expected: "boolean",
            actual: kind_name(value),
        })
    }

    fn require(&self, key: &str) -> Result<&Value, ValueAccessError> {
        self.0
            .get(key)
            .ok_or_else(|| ValueAccessError::Missing(key.to_string()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl FromIterator<(String, Value)> for ExtractedData {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
