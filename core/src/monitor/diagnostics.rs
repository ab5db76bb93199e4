//! Internal counters and the on-request diagnostics dump.

use std::backtrace::Backtrace;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{AgentError, Result};
use crate::infrastructure::TrackedStatus;

pub const DIAGNOSTICS_FILE: &str = "diagnostics.json";

/// Monotonic counters shared by the daemon threads.
#[derive(Debug, Default)]
pub struct AgentCounters {
    pub batches_received: AtomicU64,
    pub batches_succeeded: AtomicU64,
    pub batches_failed: AtomicU64,
    pub resources_applied: AtomicU64,
    pub resources_updated: AtomicU64,
    pub heartbeats_sent: AtomicU64,
    pub connect_failures: AtomicU64,
    pub restarts: AtomicU64,
}

impl AgentCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            batches_received: get(&self.batches_received),
            batches_succeeded: get(&self.batches_succeeded),
            batches_failed: get(&self.batches_failed),
            resources_applied: get(&self.resources_applied),
            resources_updated: get(&self.resources_updated),
            heartbeats_sent: get(&self.heartbeats_sent),
            connect_failures: get(&self.connect_failures),
            restarts: get(&self.restarts),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    pub batches_received: u64,
    pub batches_succeeded: u64,
    pub batches_failed: u64,
    pub resources_applied: u64,
    pub resources_updated: u64,
    pub heartbeats_sent: u64,
    pub connect_failures: u64,
    pub restarts: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedEntry {
    pub name: String,
    pub pid: u32,
    pub alive: bool,
}

impl From<TrackedStatus> for TrackedEntry {
    fn from(t: TrackedStatus) -> Self {
        TrackedEntry {
            name: t.name,
            pid: t.pid,
            alive: t.alive,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub pid: u32,
    pub generated_at: u64,
    pub uptime_secs: u64,
    pub counters: CounterSnapshot,
    pub tracked: Vec<TrackedEntry>,
    pub secrets_registered: usize,
    pub backtrace: String,
}

impl DiagnosticsSnapshot {
    pub fn capture(
        uptime: Duration,
        counters: &AgentCounters,
        tracked: Vec<TrackedStatus>,
        secrets_registered: usize,
    ) -> Self {
        DiagnosticsSnapshot {
            pid: std::process::id(),
            generated_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            uptime_secs: uptime.as_secs(),
            counters: counters.snapshot(),
            tracked: tracked.into_iter().map(TrackedEntry::from).collect(),
            secrets_registered,
            backtrace: Backtrace::force_capture().to_string(),
        }
    }

    /// Write to `<run_dir>/diagnostics.json` (via a temp file and rename).
    pub fn write(&self, run_dir: &Path) -> Result<PathBuf> {
        let path = run_dir.join(DIAGNOSTICS_FILE);
        let tmp = run_dir.join(format!(".{}.tmp", DIAGNOSTICS_FILE));
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(&tmp, json).map_err(|e| AgentError::path(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| AgentError::path(&path, e))?;
        info!(
            path = %path.display(),
            uptime_secs = self.uptime_secs,
            tracked = self.tracked.len(),
            "diagnostics written"
        );
        Ok(path)
    }

    pub fn read(run_dir: &Path) -> Result<DiagnosticsSnapshot> {
        let path = run_dir.join(DIAGNOSTICS_FILE);
        let content = std::fs::read_to_string(&path).map_err(|e| AgentError::path(&path, e))?;
        Ok(serde_json::from_str(&content)?)
    }
}
