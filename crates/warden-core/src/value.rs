//! Recursive tagged value used for `tool_args` and other free-form request fields.
//!
//! Matchers never operate on `serde_json::Value` directly: the loader and
//! request builders convert at the boundary so the rest of the crate works
//! against one concrete, exhaustively-matched representation.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// A dynamic value: string, number, bool, null, list, or ordered map.
///
/// `Map` uses a `BTreeMap` rather than a `HashMap` so that anything derived
/// from a `Value` (debug output, re-serialization) is deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// True if this value is a number (used by the numeric comparators).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Recursively flattens this value into its leaf string representations,
    /// pushing them onto `out`. Structural characters (braces, keys, quotes)
    /// are never emitted — only leaf content.
    pub fn flatten_into(&self, out: &mut Vec<String>) {
        match self {
            Value::Null => {}
            Value::Bool(b) => out.push(b.to_string()),
            Value::Number(n) => out.push(format_number(*n)),
            Value::String(s) => out.push(s.clone()),
            Value::Array(items) => {
                for item in items {
                    item.flatten_into(out);
                }
            }
            Value::Map(map) => {
                for v in map.values() {
                    v.flatten_into(out);
                }
            }
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

impl From<Json> for Value {
    fn from(json: Json) -> Self {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            Json::String(s) => Value::String(s),
            Json::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            Json::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<Value> for Json {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(b),
            Value::Number(n) => serde_json::Number::from_f64(n)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::String(s) => Json::String(s),
            Value::Array(items) => Json::Array(items.into_iter().map(Json::from).collect()),
            Value::Map(map) => {
                Json::Object(map.into_iter().map(|(k, v)| (k, Json::from(v))).collect())
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        self.flatten_into(&mut parts);
        write!(f, "{}", parts.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flattens_nested_containers_to_leaf_strings() {
        let value: Value = serde_json::json!({
            "sql": "SELECT * FROM users",
            "meta": {"count": 3, "tags": ["a", "b"]},
        })
        .into();

        let mut out = Vec::new();
        value.flatten_into(&mut out);
        out.sort();
        assert_eq!(
            out,
            vec!["3", "SELECT * FROM users", "a", "b"]
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn round_trips_through_json() {
        let json = serde_json::json!({"a": 1, "b": [true, null, "x"]});
        let value: Value = json.clone().into();
        let back: Json = value.into();
        assert_eq!(json, back);
    }

    #[test]
    fn integer_like_numbers_format_without_decimal() {
        let value = Value::Number(1500.0);
        assert_eq!(value.to_string(), "1500");
    }
}
