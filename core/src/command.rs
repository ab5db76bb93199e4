//! Wire types exchanged with the coordinator.
//!
//! The coordinator hands the agent `CommandBatch`es (one per task) and
//! `Cancellation`s; the agent answers with a `CommandReport` per batch and
//! a `HeartbeatReport` per cycle. All of them travel as camelCase JSON.
//!
//! # Wire Format
//!
//! ```json
//! {"taskId": "t-17",
//!  "configurations": {"core-site": {"fs.defaultFS": "hdfs://nn:8020"}},
//!  "params": {"user": "hdfs"},
//!  "resources": [
//!    {"type": "directory", "name": "/etc/hadoop", "create_parents": true},
//!    {"type": "service", "name": "datanode", "provider": "builtin.Tracked",
//!     "command": "exec hdfs datanode"}
//!  ]}
//! ```
//!
//! Resource attributes sit next to `type`/`name`/`action`/`provider` and are
//! validated against the kind's schema when the resource is bound.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::environment::ResourceOutcome;
use crate::monitor::diagnostics::{CounterSnapshot, TrackedEntry};


// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// One resource declaration as sent by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Explicit provider key, `<table>.<Name>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}


/// An ordered list of resources to converge for one task.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CommandBatch {
    pub task_id: String,
    /// Nested configuration dictionaries, read through `ConfigDictionary`.
    pub configurations: Value,
    /// Flat template values.
    pub params: BTreeMap<String, String>,
    pub resources: Vec<ResourceSpec>,
}


#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Cancellation {
    pub task_id: String,
    #[serde(default = "default_reason")]
    pub reason: String,
}

fn default_reason() -> String {
    "cancelled by coordinator".to_string()
}


// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Completed,
    Failed,
    Cancelled,
}


/// Result of one batch. `error` is already redacted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandReport {
    pub task_id: String,
    pub status: CommandStatus,
    pub outcomes: Vec<ResourceOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}


#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatReport {
    pub hostname: String,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
    pub sequence: u64,
    pub tracked: Vec<TrackedEntry>,
    pub counters: CounterSnapshot,
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
