//! Declarative resources.
//!
//! A [`ResourceKind`] is a static record: default action, action vocabulary
//! and attribute schema. [`Resource::new`] binds arguments against that
//! schema once, at construction: the action must be in the vocabulary,
//! unknown attributes are rejected, values are type-checked, defaults are
//! applied (literal, or derived from the resource name) and required
//! attributes must end up present. After that only a provider touches the
//! resource, and only to set its `updated` flag.

pub mod kinds;

use std::time::Duration;

use serde_json::{Map, Value};

use crate::error::{AgentError, Result};

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AttrDefault {
    None,
    /// The resource's name.
    FromName,
    Str(&'static str),
    Bool(bool),
    Int(i64),
    IntList(&'static [i64]),
}

impl AttrDefault {
    fn value(&self, name: &str) -> Option<Value> {
        match self {
            AttrDefault::None => None,
            AttrDefault::FromName => Some(Value::String(name.to_string())),
            AttrDefault::Str(s) => Some(Value::String((*s).to_string())),
            AttrDefault::Bool(b) => Some(Value::Bool(*b)),
            AttrDefault::Int(i) => Some(Value::from(*i)),
            AttrDefault::IntList(items) => {
                Some(Value::Array(items.iter().map(|i| Value::from(*i)).collect()))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrType {
    String,
    Bool,
    Integer,
    List,
    Object,
}

#[derive(Debug, Clone, Copy)]
pub struct AttributeSpec {
    pub name: &'static str,
    pub kind: AttrType,
    pub required: bool,
    pub default: AttrDefault,
}

impl AttributeSpec {
    /// Check `value` against the declared type, normalising the lenient
    /// forms (numeric strings, `"true"`/`"false"`, a bare scalar for a list).
    fn coerce(&self, value: Value) -> std::result::Result<Value, String> {
        match (self.kind, value) {
            (AttrType::String, Value::String(s)) => Ok(Value::String(s)),
            (AttrType::String, Value::Number(n)) => Ok(Value::String(n.to_string())),
            (AttrType::Bool, Value::Bool(b)) => Ok(Value::Bool(b)),
            (AttrType::Bool, Value::String(s)) if s == "true" || s == "false" => {
                Ok(Value::Bool(s == "true"))
            }
            (AttrType::Integer, Value::Number(n)) if n.is_i64() => Ok(Value::Number(n)),
            (AttrType::Integer, Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| format!("'{}' is not an integer", s)),
            (AttrType::List, Value::Array(items)) => Ok(Value::Array(items)),
            (AttrType::List, scalar @ (Value::String(_) | Value::Number(_))) => {
                Ok(Value::Array(vec![scalar]))
            }
            (AttrType::Object, Value::Object(map)) => Ok(Value::Object(map)),
            (kind, other) => Err(format!("expected {:?}, got {}", kind, json_type(&other))),
        }
    }
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// Static description of one resource kind.
#[derive(Debug)]
pub struct ResourceKind {
    pub name: &'static str,
    pub default_action: &'static str,
    pub actions: &'static [&'static str],
    pub attributes: &'static [AttributeSpec],
}

impl ResourceKind {
    pub fn has_action(&self, action: &str) -> bool {
        self.actions.contains(&action)
    }

    fn attribute(&self, name: &str) -> Option<&'static AttributeSpec> {
        self.attributes
            .iter()
            .chain(kinds::COMMON.iter())
            .find(|a| a.name == name)
    }

    /// `File`, `Execute`, ... as used in resource identities.
    pub fn display_name(&self) -> String {
        let mut chars = self.name.chars();
        match chars.next() {
            Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
            None => String::new(),
        }
    }
}

/// Look up a built-in kind by name.
pub fn kind_by_name(name: &str) -> Option<&'static ResourceKind> {
    kinds::ALL.iter().copied().find(|k| k.name == name)
}

// ---------------------------------------------------------------------------
// Resource
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Resource {
    kind: &'static ResourceKind,
    name: String,
    action: String,
    attributes: Map<String, Value>,
    provider: Option<String>,
    updated: bool,
}

impl Resource {
    pub fn new(
        kind: &'static ResourceKind,
        name: &str,
        action: Option<&str>,
        args: Map<String, Value>,
        provider: Option<String>,
    ) -> Result<Resource> {
        let identity = format!("{}['{}']", kind.display_name(), name);
        if name.is_empty() {
            return Err(AgentError::config(format!("{} resource has an empty name", kind.name)));
        }

        let action = action.unwrap_or(kind.default_action);
        if !kind.has_action(action) {
            return Err(AgentError::config(format!(
                "{}: action '{}' is not one of [{}]",
                identity,
                action,
                kind.actions.join(", ")
            )));
        }

        let mut attributes = Map::new();
        for (key, value) in args {
            let Some(spec) = kind.attribute(&key) else {
                return Err(AgentError::config(format!(
                    "{}: unknown attribute '{}'",
                    identity, key
                )));
            };
            if value.is_null() {
                continue;
            }
            let value = spec
                .coerce(value)
                .map_err(|e| AgentError::config(format!("{}: attribute '{}': {}", identity, key, e)))?;
            attributes.insert(key, value);
        }

        for spec in kind.attributes.iter().chain(kinds::COMMON.iter()) {
            if attributes.contains_key(spec.name) {
                continue;
            }
            match spec.default.value(name) {
                Some(v) => {
                    attributes.insert(spec.name.to_string(), v);
                }
                None if spec.required => {
                    return Err(AgentError::config(format!(
                        "{}: required attribute '{}' is missing",
                        identity, spec.name
                    )));
                }
                None => {}
            }
        }

        let tries = attributes.get("tries").and_then(Value::as_i64).unwrap_or(1);
        if tries < 1 || u32::try_from(tries).is_err() {
            return Err(AgentError::config(format!(
                "{}: tries must be between 1 and {}, got {}",
                identity,
                u32::MAX,
                tries
            )));
        }
        let try_sleep = attributes.get("try_sleep").and_then(Value::as_i64).unwrap_or(0);
        if try_sleep < 0 {
            return Err(AgentError::config(format!(
                "{}: try_sleep must not be negative, got {}",
                identity, try_sleep
            )));
        }

        Ok(Resource {
            kind,
            name: name.to_string(),
            action: action.to_string(),
            attributes,
            provider,
            updated: false,
        })
    }

    /// Bind a resource of a built-in kind given by name.
    pub fn of_kind(
        kind: &str,
        name: &str,
        action: Option<&str>,
        args: Map<String, Value>,
        provider: Option<String>,
    ) -> Result<Resource> {
        let kind = kind_by_name(kind)
            .ok_or_else(|| AgentError::config(format!("unknown resource kind '{}'", kind)))?;
        Resource::new(kind, name, action, args, provider)
    }

    pub fn kind(&self) -> &'static ResourceKind {
        self.kind
    }

    pub fn kind_name(&self) -> &'static str {
        self.kind.name
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    /// Explicit provider override key, if one was given.
    pub fn provider_key(&self) -> Option<&str> {
        self.provider.as_deref()
    }

    /// `File['/tmp/x']`
    pub fn identity(&self) -> String {
        format!("{}['{}']", self.kind.display_name(), self.name)
    }

    pub fn attributes(&self) -> &Map<String, Value> {
        &self.attributes
    }

    pub fn attr(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn str_attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(Value::as_str)
    }

    /// Required string attribute; schema defaults make this infallible for
    /// name-derived attributes.
    pub fn required_str(&self, name: &str) -> Result<&str> {
        self.str_attr(name).ok_or_else(|| {
            AgentError::config(format!("{}: attribute '{}' is not set", self.identity(), name))
        })
    }

    pub fn bool_attr(&self, name: &str) -> bool {
        self.attributes.get(name).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn int_attr(&self, name: &str) -> Option<i64> {
        self.attributes.get(name).and_then(Value::as_i64)
    }

    /// List attribute rendered as strings.
    pub fn list_attr(&self, name: &str) -> Vec<String> {
        match self.attributes.get(name) {
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn tries(&self) -> u32 {
        self.int_attr("tries")
            .and_then(|t| u32::try_from(t).ok())
            .unwrap_or(1)
            .max(1)
    }

    pub fn try_sleep(&self) -> Duration {
        Duration::from_secs(self.int_attr("try_sleep").unwrap_or(0).max(0) as u64)
    }

    pub fn is_updated(&self) -> bool {
        self.updated
    }

    /// Called by providers when they changed the system.
    pub fn mark_updated(&mut self) {
        self.updated = true;
    }

    pub(crate) fn begin_invocation(&mut self) {
        self.updated = false;
    }
}
