//! Immutable, lazily-failing configuration dictionary.
//!
//! Wraps the `configurations` object of an inbound batch. Nested objects are
//! wrapped recursively at construction. Looking up a missing key returns
//! [`ConfigValue::Unknown`] instead of failing; only *using* that value fails,
//! with an error naming the key. Encrypted markers are decrypted on read and
//! the legacy strings `"true"` / `"false"` read back as booleans.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Number, Value};

use super::crypto::Decryptor;
use crate::error::{AgentError, Result};

#[derive(Debug, Clone)]
enum Entry {
    Dict(ConfigDictionary),
    List(Vec<Entry>),
    Scalar(Value),
}

impl Entry {
    fn wrap(value: Value, decryptor: &Arc<Decryptor>) -> Entry {
        match value {
            Value::Object(map) => Entry::Dict(ConfigDictionary::wrap(map, decryptor)),
            Value::Array(items) => Entry::List(
                items
                    .into_iter()
                    .map(|v| Entry::wrap(v, decryptor))
                    .collect(),
            ),
            scalar => Entry::Scalar(scalar),
        }
    }
}

/// Read-only nested configuration.
#[derive(Debug, Clone)]
pub struct ConfigDictionary {
    entries: Arc<BTreeMap<String, Entry>>,
    decryptor: Arc<Decryptor>,
}

impl ConfigDictionary {
    /// Wrap a JSON value. Anything other than an object yields an empty
    /// dictionary.
    pub fn new(value: Value, decryptor: Decryptor) -> Self {
        let decryptor = Arc::new(decryptor);
        match value {
            Value::Object(map) => ConfigDictionary::wrap(map, &decryptor),
            _ => ConfigDictionary::wrap(Map::new(), &decryptor),
        }
    }

    pub fn empty() -> Self {
        ConfigDictionary::new(Value::Null, Decryptor::new("AGENT_ENCRYPTION_KEY"))
    }

    fn wrap(map: Map<String, Value>, decryptor: &Arc<Decryptor>) -> Self {
        let entries = map
            .into_iter()
            .map(|(k, v)| (k, Entry::wrap(v, decryptor)))
            .collect();
        ConfigDictionary {
            entries: Arc::new(entries),
            decryptor: Arc::clone(decryptor),
        }
    }

    /// Look up `key`. A missing key is not an error here; only decryption
    /// of an encrypted value can fail.
    pub fn get(&self, key: &str) -> Result<ConfigValue> {
        match self.entries.get(key) {
            Some(entry) => self.materialize(entry),
            None => Ok(ConfigValue::Unknown { key: key.to_string() }),
        }
    }

    /// Walk a dotted path. Keys may themselves contain dots
    /// (`core-site.fs.defaultFS`), so at each level the longest matching key
    /// wins.
    pub fn lookup(&self, path: &str) -> Result<ConfigValue> {
        let segments: Vec<&str> = path.split('.').collect();
        Ok(self
            .lookup_segments(&segments)?
            .unwrap_or_else(|| ConfigValue::Unknown { key: path.to_string() }))
    }

    fn lookup_segments(&self, segments: &[&str]) -> Result<Option<ConfigValue>> {
        for end in (1..=segments.len()).rev() {
            let key = segments[..end].join(".");
            let Some(entry) = self.entries.get(&key) else {
                continue;
            };
            let value = self.materialize(entry)?;
            if end == segments.len() {
                return Ok(Some(value));
            }
            if let ConfigValue::Dict(inner) = &value {
                if let Some(found) = inner.lookup_segments(&segments[end..])? {
                    return Ok(Some(found));
                }
            }
        }
        Ok(None)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Always fails: configuration is never mutated after creation.
    pub fn set(&self, key: &str, _value: Value) -> Result<()> {
        Err(AgentError::Immutability {
            op: "set",
            key: key.to_string(),
        })
    }

    /// Always fails: configuration is never mutated after creation.
    pub fn remove(&self, key: &str) -> Result<()> {
        Err(AgentError::Immutability {
            op: "remove",
            key: key.to_string(),
        })
    }

    fn materialize(&self, entry: &Entry) -> Result<ConfigValue> {
        Ok(match entry {
            Entry::Dict(d) => ConfigValue::Dict(d.clone()),
            Entry::List(items) => ConfigValue::List(
                items
                    .iter()
                    .map(|e| self.materialize(e))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Entry::Scalar(Value::String(s)) => match self.decryptor.decrypt_marker(s)? {
                Some(plain) => ConfigValue::String(plain),
                None => match s.as_str() {
                    "true" => ConfigValue::Bool(true),
                    "false" => ConfigValue::Bool(false),
                    _ => ConfigValue::String(s.clone()),
                },
            },
            Entry::Scalar(Value::Bool(b)) => ConfigValue::Bool(*b),
            Entry::Scalar(Value::Number(n)) => ConfigValue::Number(n.clone()),
            Entry::Scalar(_) => ConfigValue::Null,
        })
    }
}

/// A value read out of a [`ConfigDictionary`].
#[derive(Debug, Clone)]
pub enum ConfigValue {
    Dict(ConfigDictionary),
    List(Vec<ConfigValue>),
    String(String),
    Bool(bool),
    Number(Number),
    Null,
    /// Placeholder for a key that was not present. Any use fails.
    Unknown { key: String },
}

impl ConfigValue {
    fn missing(key: &str) -> AgentError {
        AgentError::UnknownConfiguration { key: key.to_string() }
    }

    fn wrong_type(&self, wanted: &str) -> AgentError {
        AgentError::config(format!("expected {}, found {}", wanted, self.type_name()))
    }

    fn type_name(&self) -> &'static str {
        match self {
            ConfigValue::Dict(_) => "mapping",
            ConfigValue::List(_) => "list",
            ConfigValue::String(_) => "string",
            ConfigValue::Bool(_) => "boolean",
            ConfigValue::Number(_) => "number",
            ConfigValue::Null => "null",
            ConfigValue::Unknown { .. } => "unknown",
        }
    }

    /// `false` only for the missing-key placeholder.
    pub fn is_present(&self) -> bool {
        !matches!(self, ConfigValue::Unknown { .. })
    }

    /// Subscript into a mapping.
    pub fn get(&self, key: &str) -> Result<ConfigValue> {
        match self {
            ConfigValue::Dict(d) => d.get(key),
            ConfigValue::Unknown { key: missing } => Err(Self::missing(missing)),
            other => Err(other.wrong_type("mapping")),
        }
    }

    pub fn as_dict(&self) -> Result<&ConfigDictionary> {
        match self {
            ConfigValue::Dict(d) => Ok(d),
            ConfigValue::Unknown { key } => Err(Self::missing(key)),
            other => Err(other.wrong_type("mapping")),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            ConfigValue::String(s) => Ok(s),
            ConfigValue::Unknown { key } => Err(Self::missing(key)),
            other => Err(other.wrong_type("string")),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            ConfigValue::Bool(b) => Ok(*b),
            ConfigValue::Unknown { key } => Err(Self::missing(key)),
            other => Err(other.wrong_type("boolean")),
        }
    }

    pub fn as_i64(&self) -> Result<i64> {
        match self {
            ConfigValue::Number(n) => n.as_i64().ok_or_else(|| self.wrong_type("integer")),
            ConfigValue::String(s) => s.trim().parse().map_err(|_| self.wrong_type("integer")),
            ConfigValue::Unknown { key } => Err(Self::missing(key)),
            other => Err(other.wrong_type("integer")),
        }
    }

    /// Iterate a list's items, or a mapping's keys as strings.
    pub fn iter(&self) -> Result<std::vec::IntoIter<ConfigValue>> {
        match self {
            ConfigValue::List(items) => Ok(items.clone().into_iter()),
            ConfigValue::Dict(d) => Ok(d
                .keys()
                .map(|k| ConfigValue::String(k.to_string()))
                .collect::<Vec<_>>()
                .into_iter()),
            ConfigValue::Unknown { key } => Err(Self::missing(key)),
            other => Err(other.wrong_type("list or mapping")),
        }
    }

    /// Text used when the value is substituted into a template.
    pub fn render(&self) -> Result<String> {
        match self {
            ConfigValue::String(s) => Ok(s.clone()),
            ConfigValue::Bool(b) => Ok(b.to_string()),
            ConfigValue::Number(n) => Ok(n.to_string()),
            ConfigValue::Null => Ok(String::new()),
            ConfigValue::List(items) => Ok(items
                .iter()
                .map(ConfigValue::render)
                .collect::<Result<Vec<_>>>()?
                .join(",")),
            ConfigValue::Dict(_) => Err(self.wrong_type("scalar")),
            ConfigValue::Unknown { key } => Err(Self::missing(key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::crypto;
    use serde_json::json;

    fn dict(value: Value) -> ConfigDictionary {
        ConfigDictionary::new(value, Decryptor::new("FLEET_AGENT_TEST_KEY_DICT"))
    }

    #[test]
    fn nested_mappings_are_wrapped() {
        let cfg = dict(json!({"hdfs-site": {"dfs.replication": "3"}}));
        let inner = cfg.get("hdfs-site").unwrap();
        assert!(matches!(inner, ConfigValue::Dict(_)));
        assert_eq!(inner.get("dfs.replication").unwrap().as_str().unwrap(), "3");
    }

    #[test]
    fn missing_key_lookup_does_not_fail() {
        let cfg = dict(json!({}));
        let v = cfg.get("absent").unwrap();
        assert!(!v.is_present());
    }

    #[test]
    fn using_missing_key_names_it() {
        let cfg = dict(json!({}));
        let v = cfg.get("cluster-env").unwrap();
        for err in [
            v.get("user").unwrap_err(),
            v.as_str().unwrap_err(),
            v.iter().map(|_| ()).unwrap_err(),
            v.render().unwrap_err(),
        ] {
            match err {
                AgentError::UnknownConfiguration { key } => assert_eq!(key, "cluster-env"),
                other => panic!("unexpected error: {}", other),
            }
        }
    }

    #[test]
    fn mutation_is_rejected() {
        let cfg = dict(json!({"a": "1"}));
        let err = cfg.set("a", json!("2")).unwrap_err();
        assert!(matches!(err, AgentError::Immutability { op: "set", .. }));
        assert!(cfg.remove("a").is_err());
        assert_eq!(cfg.get("a").unwrap().as_str().unwrap(), "1");
    }

    #[test]
    fn legacy_boolean_strings() {
        let cfg = dict(json!({"t": "true", "f": "false", "other": "True"}));
        assert!(cfg.get("t").unwrap().as_bool().unwrap());
        assert!(!cfg.get("f").unwrap().as_bool().unwrap());
        assert_eq!(cfg.get("other").unwrap().as_str().unwrap(), "True");
    }

    #[test]
    fn encrypted_values_decrypt_on_read() {
        std::env::set_var("FLEET_AGENT_TEST_KEY_DICT", "dict-pass");
        let marker = crypto::encrypt("hive-pw", "dict-pass").unwrap();
        let cfg = dict(json!({"hive-site": {"password": marker}}));
        let v = cfg.lookup("hive-site.password").unwrap();
        assert_eq!(v.as_str().unwrap(), "hive-pw");
    }

    #[test]
    fn dotted_lookup_prefers_longest_key() {
        let cfg = dict(json!({"core-site": {"fs.defaultFS": "hdfs://nn:8020"}}));
        let v = cfg.lookup("core-site.fs.defaultFS").unwrap();
        assert_eq!(v.as_str().unwrap(), "hdfs://nn:8020");
        let missing = cfg.lookup("core-site.nope").unwrap();
        assert!(!missing.is_present());
    }

    #[test]
    fn render_lists_and_numbers() {
        let cfg = dict(json!({"ports": [8020, 50070], "n": 5, "nothing": null}));
        assert_eq!(cfg.get("ports").unwrap().render().unwrap(), "8020,50070");
        assert_eq!(cfg.get("n").unwrap().as_i64().unwrap(), 5);
        assert_eq!(cfg.get("nothing").unwrap().render().unwrap(), "");
    }
}
