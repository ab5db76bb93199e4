//! Agent settings, loaded from YAML.
//!
//! Every field has a default so a partial (or empty) file is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::convergence::recovery::RecoveryConfig;
use crate::error::{AgentError, Result};

/// Environment variable naming the settings file when `--config` is absent.
pub const CONFIG_ENV: &str = "FLEET_AGENT_CONFIG";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Exponential,
    Linear,
    Fixed,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        LoggingSettings {
            level: "info".into(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentSettings {
    /// Directory holding `<name>.pid` files of tracked processes, the batch
    /// lock and diagnostics dumps.
    pub run_dir: PathBuf,
    /// Pid file of the agent process itself.
    pub pid_file: PathBuf,
    /// Spool directory used by the file-based coordinator.
    pub spool_dir: PathBuf,
    pub coordinator_url: Option<String>,
    /// First wait phase (`timeout1`).
    pub heartbeat_interval_secs: u64,
    /// Second wait phase (`timeout2`): graceful-stop grace window.
    pub stop_grace_secs: u64,
    pub connect_retry_delay_secs: u64,
    /// 0 means retry until stopped.
    pub max_connect_retries: u32,
    pub connect_backoff: BackoffStrategy,
    pub kill_grace_ms: u64,
    pub cleanup_interval_secs: u64,
    /// Name of the environment variable holding the decryption passphrase.
    pub encryption_key_env: String,
    /// Forces the OS family instead of detecting it.
    pub os_family: Option<String>,
    pub logging: LoggingSettings,
    pub recovery: RecoveryConfig,
}

impl Default for AgentSettings {
    fn default() -> Self {
        AgentSettings {
            run_dir: PathBuf::from("/var/run/fleet-agent"),
            pid_file: PathBuf::from("/var/run/fleet-agent.pid"),
            spool_dir: PathBuf::from("/var/lib/fleet-agent/spool"),
            coordinator_url: None,
            heartbeat_interval_secs: 10,
            stop_grace_secs: 5,
            connect_retry_delay_secs: 10,
            max_connect_retries: 0,
            connect_backoff: BackoffStrategy::Fixed,
            kill_grace_ms: 5000,
            cleanup_interval_secs: 60,
            encryption_key_env: "AGENT_ENCRYPTION_KEY".into(),
            os_family: None,
            logging: LoggingSettings::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl AgentSettings {
    pub fn load(path: &Path) -> Result<AgentSettings> {
        let content = std::fs::read_to_string(path).map_err(|e| AgentError::path(path, e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<AgentSettings> {
        if content.trim().is_empty() {
            return Ok(AgentSettings::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let s = AgentSettings::parse("").unwrap();
        assert_eq!(s, AgentSettings::default());
        assert_eq!(s.heartbeat_interval(), Duration::from_secs(10));
    }

    #[test]
    fn partial_yaml_overrides_fields() {
        let yaml = "\
run_dir: /tmp/agent-run
heartbeat_interval_secs: 3
connect_backoff: exponential
logging:
  level: debug
  format: json
";
        let s = AgentSettings::parse(yaml).unwrap();
        assert_eq!(s.run_dir, PathBuf::from("/tmp/agent-run"));
        assert_eq!(s.heartbeat_interval_secs, 3);
        assert_eq!(s.stop_grace_secs, 5);
        assert_eq!(s.connect_backoff, BackoffStrategy::Exponential);
        assert_eq!(s.logging.level, "debug");
        assert_eq!(s.logging.format, LogFormat::Json);
    }

    #[test]
    fn malformed_yaml_is_a_settings_error() {
        let err = AgentSettings::parse("heartbeat_interval_secs: [nope").unwrap_err();
        assert!(matches!(err, AgentError::Settings(_)));
    }

    #[test]
    fn backoff_strategy_serde() {
        let json = serde_json::to_string(&BackoffStrategy::Exponential).unwrap();
        assert_eq!(json, "\"exponential\"");
    }
}
