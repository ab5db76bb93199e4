//! Error taxonomy for the agent core.
//!
//! Configuration, unknown-key, immutability and cancellation errors are
//! fatal: they are never retried, whatever a resource declares in `tries`.
//! Everything else is an execution-level failure that a caller may retry.

use std::path::PathBuf;
use std::time::Duration;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Every failure the agent core can surface.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Bad provider key, unresolvable resource kind, invalid attribute,
    /// missing decryption passphrase and the like.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A missing configuration key was used (not merely looked up).
    #[error("configuration parameter '{key}' was not found")]
    UnknownConfiguration { key: String },

    /// Something tried to write into a `ConfigDictionary`.
    #[error("cannot {op} '{key}': configuration is immutable, use template substitution, not mutation")]
    Immutability { op: &'static str, key: String },

    /// A command or provider action failed.
    #[error("execution failed: {0}")]
    Execution(String),

    /// A command did not finish in time and was killed.
    #[error("command '{command}' timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    /// The task was cancelled by the coordinator.
    #[error("task cancelled: {0}")]
    Cancelled(String),

    /// A resource action failed; wraps the underlying cause.
    #[error("{resource}: {source}")]
    Resource {
        resource: String,
        #[source]
        source: Box<AgentError>,
    },

    /// File-system failure on a known path.
    #[error("{path}: {source}")]
    Path {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error("invalid settings: {0}")]
    Settings(#[from] serde_yaml::Error),
}

impl AgentError {
    pub fn config(message: impl Into<String>) -> Self {
        AgentError::Configuration(message.into())
    }

    pub fn execution(message: impl Into<String>) -> Self {
        AgentError::Execution(message.into())
    }

    pub fn path(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AgentError::Path {
            path: path.into(),
            source,
        }
    }

    /// Whether retrying could never help.
    pub fn is_fatal(&self) -> bool {
        match self {
            AgentError::Configuration(_)
            | AgentError::UnknownConfiguration { .. }
            | AgentError::Immutability { .. }
            | AgentError::Cancelled(_) => true,
            AgentError::Resource { source, .. } => source.is_fatal(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(AgentError::config("bad").is_fatal());
        assert!(AgentError::UnknownConfiguration { key: "k".into() }.is_fatal());
        assert!(AgentError::Immutability { op: "set", key: "k".into() }.is_fatal());
        assert!(!AgentError::execution("exit 1").is_fatal());
        assert!(AgentError::Cancelled("operator request".into()).is_fatal());
    }

    #[test]
    fn wrapped_errors_keep_classification() {
        let wrapped = AgentError::Resource {
            resource: "File['/tmp/x']".into(),
            source: Box::new(AgentError::config("missing attribute")),
        };
        assert!(wrapped.is_fatal());
        assert!(wrapped.to_string().starts_with("File['/tmp/x']"));
    }

    #[test]
    fn immutability_message_names_key() {
        let e = AgentError::Immutability { op: "set", key: "hdfs-site".into() };
        let msg = e.to_string();
        assert!(msg.contains("hdfs-site"));
        assert!(msg.contains("template substitution"));
    }
}
