//! Typed variable value union
//!
//! Contexts, step configuration, and outputs are maps of `Value` instead of
//! free-form JSON objects. Conversion to and from JSON happens at the
//! serialization boundary; the canonical string encoding is used only when
//! persisting variables.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::enums::VariableType;

/// A context map, ordered for stable serialization
pub type ValueMap = BTreeMap<String, Value>;

/// Errors converting between `Value` and external encodings
#[derive(Debug, Error)]
pub enum ValueError {
    #[error("cannot parse '{raw}' as {expected:?}")]
    Parse {
        raw: String,
        expected: VariableType,
    },

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Typed value held in instance contexts, step configs, and variables
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    String(String),
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
    List(Vec<Value>),
    Object(ValueMap),
}

impl Value {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view; `Int` widens to i64
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(i64::from(*i)),
            Self::Long(l) => Some(*l),
            _ => None,
        }
    }

    /// Floating view; integers widen
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(f64::from(*i)),
            Self::Long(l) => Some(*l as f64),
            Self::Double(d) => Some(*d),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date(d) => Some(*d),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::DateTime(t) => Some(*t),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_object(&self) -> Option<&ValueMap> {
        match self {
            Self::Object(m) => Some(m),
            _ => None,
        }
    }

    // =========================================================================
    // JSON conversion
    // =========================================================================

    /// Convert to the natural JSON representation.
    ///
    /// Dates serialize as ISO-8601 strings; the distinction between `Int` and
    /// `Long` collapses to a JSON number.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Long(l) => serde_json::Value::from(*l),
            Self::Double(d) => serde_json::Number::from_f64(*d)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Date(d) => serde_json::Value::String(d.format("%Y-%m-%d").to_string()),
            Self::DateTime(t) => {
                serde_json::Value::String(t.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
            }
            Self::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Self::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Convert from JSON. Integers that fit i32 become `Int`, larger ones
    /// `Long`; strings stay strings (no date sniffing).
    #[must_use]
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    i32::try_from(i).map(Self::Int).unwrap_or(Self::Long(i))
                } else {
                    Self::Double(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Self::String(s.clone()),
            serde_json::Value::Array(items) => {
                Self::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Self::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    // =========================================================================
    // Canonical string encoding (persistence boundary)
    // =========================================================================

    /// Encode as the canonical string persisted in variable rows.
    ///
    /// Strings are stored raw; everything else uses its JSON form, except
    /// dates which use their ISO-8601 text.
    #[must_use]
    pub fn canonical_string(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Date(d) => d.format("%Y-%m-%d").to_string(),
            Self::DateTime(t) => t.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            other => other.to_json().to_string(),
        }
    }

    /// Decode a canonical string under a declared variable type
    pub fn parse_canonical(value_type: VariableType, raw: &str) -> Result<Self, ValueError> {
        let parse_err = || ValueError::Parse {
            raw: raw.to_string(),
            expected: value_type,
        };

        match value_type {
            VariableType::String => Ok(Self::String(raw.to_string())),
            VariableType::Int => raw.parse::<i32>().map(Self::Int).map_err(|_| parse_err()),
            VariableType::Long => raw.parse::<i64>().map(Self::Long).map_err(|_| parse_err()),
            VariableType::Double => raw
                .parse::<f64>()
                .map(Self::Double)
                .map_err(|_| parse_err()),
            VariableType::Bool => raw.parse::<bool>().map(Self::Bool).map_err(|_| parse_err()),
            VariableType::Date => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map(Self::Date)
                .map_err(|_| parse_err()),
            VariableType::Datetime => DateTime::parse_from_rfc3339(raw)
                .map(|t| Self::DateTime(t.with_timezone(&Utc)))
                .map_err(|_| parse_err()),
            VariableType::Json | VariableType::Array | VariableType::Object => {
                let json: serde_json::Value = serde_json::from_str(raw)?;
                let value = Self::from_json(&json);
                match (value_type, &value) {
                    (VariableType::Array, Self::List(_))
                    | (VariableType::Object, Self::Object(_))
                    | (VariableType::Json, _) => Ok(value),
                    _ => Err(parse_err()),
                }
            }
        }
    }

    /// The variable type this value naturally persists as
    #[must_use]
    pub fn variable_type(&self) -> VariableType {
        match self {
            Self::Null | Self::String(_) => VariableType::String,
            Self::Bool(_) => VariableType::Bool,
            Self::Int(_) => VariableType::Int,
            Self::Long(_) => VariableType::Long,
            Self::Double(_) => VariableType::Double,
            Self::Date(_) => VariableType::Date,
            Self::DateTime(_) => VariableType::Datetime,
            Self::List(_) => VariableType::Array,
            Self::Object(_) => VariableType::Object,
        }
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let json = serde_json::Value::deserialize(deserializer)?;
        Ok(Self::from_json(&json))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i)
    }
}

impl From<i64> for Value {
    fn from(l: i64) -> Self {
        Self::Long(l)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Self::Double(d)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(t: DateTime<Utc>) -> Self {
        Self::DateTime(t)
    }
}

/// Merge `other` into `target`, last writer wins on key conflict
pub fn merge_into(target: &mut ValueMap, other: &ValueMap) {
    for (k, v) in other {
        target.insert(k.clone(), v.clone());
    }
}
