//! Template formatting with escaping and redaction flags.
//!
//! Templates use `{name}` placeholders, optionally with a conversion flag:
//!
//! ```text
//! {name!e}   shell-escape the value
//! {name!h}   hide the value in log-facing output
//! {name!p}   both (passwords)
//! ```
//!
//! `{{` and `}}` produce literal braces. Values come from the explicit
//! overrides first, then the environment's plain params, then the
//! configuration dictionary (dotted names walk into nested sections).
//!
//! Every template is rendered twice, once for execution and once for logs.
//! Whatever differs between the two renderings is registered with the
//! [`SecretRegistry`], so later log lines never show it either.

use std::fmt;

use crate::environment::Params;
use crate::error::{AgentError, Result};
use crate::logging::{SecretRegistry, REDACTED};

/// A rendered template: the real value and its log-safe twin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Formatted {
    pub value: String,
    pub redacted: String,
}

impl Formatted {
    pub fn is_sensitive(&self) -> bool {
        self.value != self.redacted
    }
}

impl fmt::Display for Formatted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flag {
    None,
    Escape,
    Hide,
    Password,
}

impl Flag {
    fn parse(flag: Option<&str>, field: &str) -> Result<Flag> {
        match flag {
            None => Ok(Flag::None),
            Some("e") => Ok(Flag::Escape),
            Some("h") => Ok(Flag::Hide),
            Some("p") => Ok(Flag::Password),
            Some(other) => Err(AgentError::config(format!(
                "unknown conversion flag '!{}' in placeholder {{{}}}",
                other, field
            ))),
        }
    }

    fn escapes(self) -> bool {
        matches!(self, Flag::Escape | Flag::Password)
    }

    fn hides(self) -> bool {
        matches!(self, Flag::Hide | Flag::Password)
    }
}

/// Renders templates against a [`Params`] namespace.
pub struct Formatter<'a> {
    params: &'a Params,
    secrets: &'a SecretRegistry,
}

impl<'a> Formatter<'a> {
    pub fn new(params: &'a Params, secrets: &'a SecretRegistry) -> Self {
        Formatter { params, secrets }
    }

    /// Render `template`. `overrides` take precedence over every other
    /// binding; an override named `self` is ignored.
    pub fn format(&self, template: &str, overrides: &[(&str, &str)]) -> Result<Formatted> {
        let mut value = String::with_capacity(template.len());
        let mut redacted = String::with_capacity(template.len());
        let mut hidden: Vec<String> = Vec::new();

        let mut rest = template;
        while let Some(pos) = rest.find(|c| c == '{' || c == '}') {
            let (literal, tail) = rest.split_at(pos);
            value.push_str(literal);
            redacted.push_str(literal);

            if tail.starts_with("{{") || tail.starts_with("}}") {
                value.push_str(&tail[..1]);
                redacted.push_str(&tail[..1]);
                rest = &tail[2..];
                continue;
            }
            if tail.starts_with('}') {
                return Err(AgentError::config(format!(
                    "single '}}' in template '{}'",
                    template
                )));
            }
            let Some(end) = tail.find('}') else {
                return Err(AgentError::config(format!(
                    "unclosed '{{' in template '{}'",
                    template
                )));
            };
            let field = &tail[1..end];
            if field.contains('{') {
                return Err(AgentError::config(format!(
                    "nested '{{' in template '{}'",
                    template
                )));
            }

            let (name, flag) = match field.split_once('!') {
                Some((name, flag)) => (name, Some(flag)),
                None => (field, None),
            };
            let flag = Flag::parse(flag, field)?;
            let raw = self.resolve(name.trim(), overrides)?;
            let rendered = if flag.escapes() { shell_quote(&raw) } else { raw.clone() };

            value.push_str(&rendered);
            if flag.hides() {
                redacted.push_str(REDACTED);
                hidden.push(raw);
                hidden.push(rendered);
            } else {
                redacted.push_str(&rendered);
            }
            rest = &tail[end + 1..];
        }
        value.push_str(rest);
        redacted.push_str(rest);

        if value != redacted {
            for secret in &hidden {
                self.secrets.register(secret);
            }
        }
        Ok(Formatted { value, redacted })
    }

    fn resolve(&self, name: &str, overrides: &[(&str, &str)]) -> Result<String> {
        if name.is_empty() {
            return Err(AgentError::config("empty placeholder '{}' in template"));
        }
        if let Some((_, v)) = overrides
            .iter()
            .find(|(k, _)| *k == name && *k != "self")
        {
            return Ok((*v).to_string());
        }
        if let Some(v) = self.params.values.get(name) {
            return Ok(v.clone());
        }
        let path = name.strip_prefix("configurations.").unwrap_or(name);
        let found = self.params.config.lookup(path)?;
        if !found.is_present() {
            return Err(AgentError::config(format!(
                "unknown placeholder {{{}}} in template",
                name
            )));
        }
        found.render()
    }
}

fn is_shell_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c)
}

/// Quote `s` for a POSIX shell command line.
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s.chars().all(is_shell_safe) {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\"'\"'"))
}
