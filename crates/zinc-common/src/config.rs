//! Configuration map for ZincServer
//!
//! Configuration lives inside ordinary datastores (`.config` for global
//! policy, `<name>.config` per datastore). Each entry has a JSON key holding
//! a path string such as `['datastore']['flush']['maxDelay']` and a JSON
//! value. Loading flattens those entries into a [`VarMap`]: a single-level
//! map from path string to a scalar [`ConfigValue`]. Paths are opaque
//! strings; lookups are exact-string equality.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Errors returned by typed configuration lookups
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("configuration key not found: {0}")]
    KeyNotFound(String),

    #[error("configuration key {key} does not hold a {expected} value")]
    UnexpectedType { key: String, expected: &'static str },
}

/// Well-known configuration paths
pub mod keys {
    use super::path;

    pub const MASTER_KEY_HASH: &str = "['server']['masterKeyHash']";
    pub const HTTP_LOOPBACK_ONLY: &str = "['server']['http']['loopbackOnly']";
    pub const HTTPS_LOOPBACK_ONLY: &str = "['server']['https']['loopbackOnly']";

    pub const COMPACTION_ENABLED: &str = "['datastore']['compaction']['enabled']";
    pub const COMPACTION_MIN_SIZE: &str = "['datastore']['compaction']['minSize']";
    pub const COMPACTION_MIN_GROWTH_RATIO: &str = "['datastore']['compaction']['minGrowthRatio']";
    pub const COMPACTION_MIN_UNUSED_SIZE_RATIO: &str =
        "['datastore']['compaction']['minUnusedSizeRatio']";

    pub const FLUSH_ENABLED: &str = "['datastore']['flush']['enabled']";
    pub const FLUSH_MAX_DELAY: &str = "['datastore']['flush']['maxDelay']";

    pub const LIMIT_MAX_SIZE: &str = "['datastore']['limit']['maxSize']";
    pub const LIMIT_MAX_ENTRY_SIZE: &str = "['datastore']['limit']['maxEntrySize']";

    /// `['datastore']['CORS']['origin'][O]['allowed']`
    #[must_use]
    pub fn cors_origin_allowed(origin: &str) -> String {
        path(&["datastore", "CORS", "origin", origin, "allowed"])
    }

    /// `['datastore']['accessKeyHash'][H]`, holds an access profile name
    #[must_use]
    pub fn access_key_profile(key_hash: &str) -> String {
        path(&["datastore", "accessKeyHash", key_hash])
    }

    /// `['accessProfile'][P]['method'][M]['allowed']`
    #[must_use]
    pub fn method_allowed(profile: &str, method: &str) -> String {
        path(&["accessProfile", profile, "method", method, "allowed"])
    }

    /// `['accessProfile'][P]['method'][M]['param'][K]['allowed']`
    #[must_use]
    pub fn param_allowed(profile: &str, method: &str, param: &str) -> String {
        path(&[
            "accessProfile",
            profile,
            "method",
            method,
            "param",
            param,
            "allowed",
        ])
    }

    /// `['accessProfile'][P]['method'][M]['limit']['requests']`
    #[must_use]
    pub fn method_limit_requests(profile: &str, method: &str) -> String {
        path(&["accessProfile", profile, "method", method, "limit", "requests"])
    }

    /// `['accessProfile'][P]['method'][M]['limit']['interval']`, in milliseconds
    #[must_use]
    pub fn method_limit_interval(profile: &str, method: &str) -> String {
        path(&["accessProfile", profile, "method", method, "limit", "interval"])
    }
}

/// Build a path string from its segments: `["a", "b"]` -> `['a']['b']`
#[must_use]
pub fn path(segments: &[&str]) -> String {
    let mut out = String::new();
    for segment in segments {
        push_segment(&mut out, segment);
    }
    out
}

fn push_segment(out: &mut String, segment: &str) {
    out.push_str("['");
    out.push_str(&segment.replace('\'', "\\'"));
    out.push_str("']");
}

/// A scalar configuration value
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl ConfigValue {
    const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::String(_) => "string",
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::from(*i),
            Self::Float(f) => Value::from(*f),
            Self::String(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for ConfigValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for ConfigValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

/// Something that can yield a JSON-formatted key and value.
///
/// Implemented by stored entries; `None` means that side of the entry is not
/// JSON-formatted and the entry is skipped by [`VarMap::append_json_entries`].
pub trait JsonEntrySource {
    fn json_key(&self) -> Option<&[u8]>;
    fn json_value(&self) -> Option<&[u8]>;
}

/// Flat path -> value configuration map
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VarMap {
    values: HashMap<String, ConfigValue>,
}

impl VarMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<ConfigValue>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<ConfigValue> {
        self.values.remove(key)
    }

    /// Remove `prefix` and every path nested below it
    pub fn remove_subtree(&mut self, prefix: &str) {
        self.values.retain(|k, _| !k.starts_with(prefix));
    }

    /// Sorted keys starting with `prefix`
    #[must_use]
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<&str> {
        let mut keys: Vec<&str> = self
            .values
            .keys()
            .filter(|k| k.starts_with(prefix))
            .map(String::as_str)
            .collect();
        keys.sort_unstable();
        keys
    }

    pub fn get_string(&self, key: &str) -> Result<String, ConfigError> {
        match self.lookup(key)? {
            ConfigValue::String(s) => Ok(s.clone()),
            _ => Err(unexpected(key, "string")),
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, ConfigError> {
        match self.lookup(key)? {
            ConfigValue::Bool(b) => Ok(*b),
            _ => Err(unexpected(key, "bool")),
        }
    }

    pub fn get_int64(&self, key: &str) -> Result<i64, ConfigError> {
        match self.lookup(key)? {
            ConfigValue::Int(i) => Ok(*i),
            #[allow(clippy::cast_possible_truncation)]
            ConfigValue::Float(f) if f.fract() == 0.0 && f.is_finite() => Ok(*f as i64),
            _ => Err(unexpected(key, "integer")),
        }
    }

    pub fn get_float64(&self, key: &str) -> Result<f64, ConfigError> {
        match self.lookup(key)? {
            ConfigValue::Float(f) => Ok(*f),
            #[allow(clippy::cast_precision_loss)]
            ConfigValue::Int(i) => Ok(*i as f64),
            _ => Err(unexpected(key, "float")),
        }
    }

    fn lookup(&self, key: &str) -> Result<&ConfigValue, ConfigError> {
        self.values
            .get(key)
            .ok_or_else(|| ConfigError::KeyNotFound(key.to_string()))
    }

    /// Apply every entry whose key and value are both JSON.
    ///
    /// The key must decode to a JSON string holding a path. A scalar value is
    /// stored at that path, an object or array is flattened below it and
    /// `null` deletes the path together with everything nested below it.
    /// Returns the number of entries applied.
    pub fn append_json_entries<'a, I, E>(&mut self, entries: I) -> usize
    where
        I: IntoIterator<Item = &'a E>,
        E: JsonEntrySource + 'a,
    {
        let mut applied = 0;
        for entry in entries {
            let (Some(key), Some(value)) = (entry.json_key(), entry.json_value()) else {
                continue;
            };
            match Self::decode_entry(key, value) {
                Some((path, value)) => {
                    self.apply_json(&path, &value);
                    applied += 1;
                }
                None => warn!("Ignoring malformed configuration entry"),
            }
        }
        applied
    }

    fn decode_entry(key: &[u8], value: &[u8]) -> Option<(String, Value)> {
        let Ok(Value::String(path)) = serde_json::from_slice::<Value>(key) else {
            return None;
        };
        let value = serde_json::from_slice::<Value>(value).ok()?;
        Some((path, value))
    }

    /// Merge a JSON value at `path`
    pub fn apply_json(&mut self, path: &str, value: &Value) {
        match value {
            Value::Null => self.remove_subtree(path),
            Value::Bool(b) => self.set(path, *b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    self.set(path, i);
                } else if let Some(f) = n.as_f64() {
                    self.set(path, f);
                }
            }
            Value::String(s) => self.set(path, s.as_str()),
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    let mut nested = path.to_string();
                    push_segment(&mut nested, &i.to_string());
                    self.apply_json(&nested, item);
                }
            }
            Value::Object(fields) => {
                for (name, item) in fields {
                    let mut nested = path.to_string();
                    push_segment(&mut nested, name);
                    self.apply_json(&nested, item);
                }
            }
        }
    }

    /// Serialize as `(key JSON, value JSON)` pairs, sorted by path
    #[must_use]
    pub fn to_json_entries(&self) -> Vec<(String, String)> {
        let mut keys: Vec<&String> = self.values.keys().collect();
        keys.sort_unstable();
        keys.into_iter()
            .map(|k| {
                (
                    Value::String(k.clone()).to_string(),
                    self.values[k].to_json().to_string(),
                )
            })
            .collect()
    }
}

fn unexpected(key: &str, expected: &'static str) -> ConfigError {
    ConfigError::UnexpectedType {
        key: key.to_string(),
        expected,
    }
}

/// Configuration written to `.config` the first time a server starts
#[must_use]
pub fn default_global_config() -> VarMap {
    let mut map = VarMap::new();
    map.set(keys::HTTP_LOOPBACK_ONLY, false);
    map.set(keys::HTTPS_LOOPBACK_ONLY, false);

    map.set(keys::COMPACTION_ENABLED, true);
    map.set(keys::COMPACTION_MIN_SIZE, 512 * 1024_i64);
    map.set(keys::COMPACTION_MIN_GROWTH_RATIO, 2.0);
    map.set(keys::COMPACTION_MIN_UNUSED_SIZE_RATIO, 0.5);

    map.set(keys::FLUSH_ENABLED, true);
    map.set(keys::FLUSH_MAX_DELAY, 1000_i64);

    map.set(keys::LIMIT_MAX_SIZE, 1024 * 1024 * 1024_i64);
    map.set(keys::LIMIT_MAX_ENTRY_SIZE, 64 * 1024 * 1024_i64);

    map.set(keys::cors_origin_allowed("*"), true);

    for method in ["GET", "POST", "PUT", "DELETE", "WebSocket"] {
        map.set(keys::method_allowed("Anonymous", method), true);
    }
    map
}

/// Per-datastore configuration with fallback to the global configuration
#[derive(Clone, Debug)]
pub struct DatastoreConfigSnapshot {
    specific: Option<Arc<VarMap>>,
    global: Arc<VarMap>,
}

impl DatastoreConfigSnapshot {
    #[must_use]
    pub const fn new(specific: Option<Arc<VarMap>>, global: Arc<VarMap>) -> Self {
        Self { specific, global }
    }

    #[must_use]
    pub fn global(&self) -> &VarMap {
        &self.global
    }

    fn fallback<T>(
        &self,
        key: &str,
        get: impl Fn(&VarMap, &str) -> Result<T, ConfigError>,
    ) -> Result<T, ConfigError> {
        if let Some(specific) = &self.specific {
            match get(specific, key) {
                Err(ConfigError::KeyNotFound(_)) => {}
                other => return other,
            }
        }
        get(&self.global, key)
    }

    pub fn get_string(&self, key: &str) -> Result<String, ConfigError> {
        self.fallback(key, VarMap::get_string)
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, ConfigError> {
        self.fallback(key, VarMap::get_bool)
    }

    pub fn get_int64(&self, key: &str) -> Result<i64, ConfigError> {
        self.fallback(key, VarMap::get_int64)
    }

    pub fn get_float64(&self, key: &str) -> Result<f64, ConfigError> {
        self.fallback(key, VarMap::get_float64)
    }

    /// Like [`Self::get_bool`], but a missing or mistyped value yields `default`
    #[must_use]
    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        or_default(self.get_bool(key), default)
    }

    #[must_use]
    pub fn int64_or(&self, key: &str, default: i64) -> i64 {
        or_default(self.get_int64(key), default)
    }

    #[must_use]
    pub fn float64_or(&self, key: &str, default: f64) -> f64 {
        or_default(self.get_float64(key), default)
    }
}

fn or_default<T>(result: Result<T, ConfigError>, default: T) -> T {
    match result {
        Ok(v) => v,
        Err(ConfigError::KeyNotFound(_)) => default,
        Err(e) => {
            warn!("{e}, using default");
            default
        }
    }
}
