//! Plugin configuration.
//!
//! The host hands every plugin an identifier and a JSON object before the
//! first protocol line. [`RunnerConfig::from_env`] is the only place that
//! looks at the process environment; the rest of the runtime receives the
//! resulting object explicitly.
//!
//! [`ModuleConfig`] wraps the JSON object with lenient typed accessors:
//!
//! | Accessor      | Accepts                                   |
//! |---------------|-------------------------------------------|
//! | `get_string`  | strings                                   |
//! | `get_int`     | integers, floats (truncated), numeric strings |
//! | `get_float`   | floats, integers, numeric strings         |
//! | `get_bool`    | booleans, "true"/"yes"/"1"/"on", non-zero integers |
//! | `get_list`    | arrays                                    |
//! | `get_dict`    | objects                                   |
//!
//! Anything else falls back to the caller's default.

use crate::error::ConfigError;
use kennel_plugin_api::JsonMap;
use serde_json::Value;
use std::env;

pub use kennel_plugin_api::{PLUGIN_CONFIG_ENV, PLUGIN_ID_ENV};

/// Everything the runner needs before the first protocol byte
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunnerConfig {
    /// Identifier assigned by the host, echoed in the readiness frame
    pub plugin_id: String,

    /// Settings passed to `Module::init`
    pub settings: ModuleConfig,
}

impl RunnerConfig {
    pub fn new(plugin_id: impl Into<String>, settings: ModuleConfig) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            settings,
        }
    }

    /// Read `KENNEL_PLUGIN_ID` and `KENNEL_PLUGIN_CONFIG`.
    ///
    /// A missing id is empty and a missing config is `{}`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let raw = env::var(PLUGIN_CONFIG_ENV).unwrap_or_else(|_| "{}".to_string());
        Ok(Self::new(plugin_id_from_env(), ModuleConfig::parse(PLUGIN_CONFIG_ENV, &raw)?))
    }
}

/// Plugin identifier from the environment, empty when unset
pub fn plugin_id_from_env() -> String {
    env::var(PLUGIN_ID_ENV).unwrap_or_default()
}

/// Module settings with type-coercing accessors
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleConfig {
    settings: JsonMap,
}

impl From<JsonMap> for ModuleConfig {
    fn from(settings: JsonMap) -> Self {
        Self { settings }
    }
}

impl ModuleConfig {
    pub fn new(settings: JsonMap) -> Self {
        Self { settings }
    }

    /// Parse a JSON document that must be an object.
    ///
    /// `source` names where the text came from and is used in errors.
    pub fn parse(source: &'static str, raw: &str) -> Result<Self, ConfigError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|err| ConfigError::InvalidJson { var: source, source: err })?;
        match value {
            Value::Object(settings) => Ok(Self { settings }),
            other => Err(ConfigError::NotAnObject {
                var: source,
                found: json_type_name(&other),
            }),
        }
    }

    /// Raw settings
    pub fn settings(&self) -> &JsonMap {
        &self.settings
    }

    pub fn into_inner(self) -> JsonMap {
        self.settings
    }

    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }

    /// Top-level value, uncoerced
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        coerce_string(self.get(key)).unwrap_or_else(|| default.to_string())
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        coerce_int(self.get(key)).unwrap_or(default)
    }

    pub fn get_float(&self, key: &str, default: f64) -> f64 {
        coerce_float(self.get(key)).unwrap_or(default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        coerce_bool(self.get(key)).unwrap_or(default)
    }

    pub fn get_list(&self, key: &str, default: Vec<Value>) -> Vec<Value> {
        coerce_list(self.get(key)).unwrap_or(default)
    }

    /// String items of a list. Non-string items are dropped; if nothing is
    /// left the default is returned.
    pub fn get_string_list(&self, key: &str, default: Vec<String>) -> Vec<String> {
        let items: Vec<String> = self
            .get(key)
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|item| item.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default();
        if items.is_empty() {
            default
        } else {
            items
        }
    }

    pub fn get_dict(&self, key: &str, default: JsonMap) -> JsonMap {
        coerce_dict(self.get(key)).unwrap_or(default)
    }

    /// Dot-path lookup (`"server.tls.enabled"`).
    ///
    /// Returns `None` at the first segment that is missing or whose parent
    /// is not an object.
    pub fn get_nested(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.settings.get(first)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    pub fn get_nested_string(&self, path: &str, default: &str) -> String {
        coerce_string(self.get_nested(path)).unwrap_or_else(|| default.to_string())
    }

    pub fn get_nested_int(&self, path: &str, default: i64) -> i64 {
        coerce_int(self.get_nested(path)).unwrap_or(default)
    }

    pub fn get_nested_float(&self, path: &str, default: f64) -> f64 {
        coerce_float(self.get_nested(path)).unwrap_or(default)
    }

    pub fn get_nested_bool(&self, path: &str, default: bool) -> bool {
        coerce_bool(self.get_nested(path)).unwrap_or(default)
    }

    pub fn get_nested_list(&self, path: &str, default: Vec<Value>) -> Vec<Value> {
        coerce_list(self.get_nested(path)).unwrap_or(default)
    }

    pub fn get_nested_dict(&self, path: &str, default: JsonMap) -> JsonMap {
        coerce_dict(self.get_nested(path)).unwrap_or(default)
    }
}

fn coerce_string(value: Option<&Value>) -> Option<String> {
    value?.as_str().map(str::to_owned)
}

fn coerce_int(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn coerce_float(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn coerce_bool(value: Option<&Value>) -> Option<bool> {
    match value? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => Some(matches!(
            s.to_ascii_lowercase().as_str(),
            "true" | "yes" | "1" | "on"
        )),
        Value::Number(n) => n
            .as_i64()
            .map(|i| i != 0)
            .or_else(|| n.as_u64().map(|u| u != 0)),
        _ => None,
    }
}

fn coerce_list(value: Option<&Value>) -> Option<Vec<Value>> {
    value?.as_array().cloned()
}

fn coerce_dict(value: Option<&Value>) -> Option<JsonMap> {
    value?.as_object().cloned()
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
