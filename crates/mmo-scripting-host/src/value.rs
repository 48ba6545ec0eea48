use std::collections::BTreeMap;
use std::fmt;

use rquickjs::{Coerced, FromJs, Value};
use serde::Serialize;

/// Objects nested deeper than this are cut off when copied out of the engine
const MAX_DEPTH: usize = 32;

/// Owned copy of a script value
///
/// Engine values are tied to the context lock, so anything handed back to the
/// host is converted into this form first.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ScriptValue {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<ScriptValue>),
    Object(BTreeMap<String, ScriptValue>),
    /// Functions cannot leave the engine; only their presence is recorded
    Function,
}

impl ScriptValue {
    /// Copy an engine value out of the context
    pub fn from_js(value: &Value<'_>) -> Self {
        convert(value, 0)
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, ScriptValue::Undefined)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScriptValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&ScriptValue> {
        match self {
            ScriptValue::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// JSON view of the value; `undefined` and functions become `null`
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ScriptValue::Undefined | ScriptValue::Null | ScriptValue::Function => {
                serde_json::Value::Null
            }
            ScriptValue::Bool(b) => serde_json::Value::Bool(*b),
            ScriptValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ScriptValue::String(s) => serde_json::Value::String(s.clone()),
            ScriptValue::Array(items) => {
                serde_json::Value::Array(items.iter().map(ScriptValue::to_json).collect())
            }
            ScriptValue::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

impl fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::Undefined => f.write_str("undefined"),
            ScriptValue::Null => f.write_str("null"),
            ScriptValue::Bool(b) => write!(f, "{b}"),
            ScriptValue::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{n}")
                }
            }
            ScriptValue::String(s) => f.write_str(s),
            ScriptValue::Function => f.write_str("[function]"),
            ScriptValue::Array(_) | ScriptValue::Object(_) => write!(f, "{}", self.to_json()),
        }
    }
}

fn convert(value: &Value<'_>, depth: usize) -> ScriptValue {
    if value.is_undefined() {
        return ScriptValue::Undefined;
    }
    if value.is_null() {
        return ScriptValue::Null;
    }
    if let Some(b) = value.as_bool() {
        return ScriptValue::Bool(b);
    }
    if let Some(n) = value.as_number() {
        return ScriptValue::Number(n);
    }
    if let Some(s) = value.as_string() {
        return s
            .to_string()
            .map(ScriptValue::String)
            .unwrap_or(ScriptValue::Undefined);
    }
    if value.is_function() {
        return ScriptValue::Function;
    }
    if depth >= MAX_DEPTH {
        return ScriptValue::Undefined;
    }
    if let Some(array) = value.as_array() {
        return ScriptValue::Array(
            array
                .iter::<Value>()
                .map(|item| match item {
                    Ok(item) => convert(&item, depth + 1),
                    Err(_) => ScriptValue::Undefined,
                })
                .collect(),
        );
    }
    if let Some(object) = value.as_object() {
        let mut map = BTreeMap::new();
        for (key, item) in object.props::<String, Value>().flatten() {
            map.insert(key, convert(&item, depth + 1));
        }
        return ScriptValue::Object(map);
    }

    // Symbols, big integers and anything else: keep their string form
    Coerced::<String>::from_js(value.ctx(), value.clone())
        .map(|s| ScriptValue::String(s.0))
        .unwrap_or(ScriptValue::Undefined)
}
