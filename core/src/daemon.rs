//! The agent daemon: main loop, coordinator seam and batch execution.
//!
//! The main thread owns the cycle: fetch batches, converge them, report,
//! send a heartbeat, then wait on the `HeartbeatCoordinator`. A cleanup
//! thread services cancellations and diagnostics requests every second and
//! periodically sweeps exited tracked processes; it talks to the main loop
//! through an mpsc channel, which the main loop drains at the top of each
//! cycle.
//!
//! # Cycle
//!
//! 1. Drain the channel: restart processes that died unexpectedly, within the
//!    recovery budget
//! 2. Fetch and execute pending batches, one report per batch
//! 3. Send a heartbeat
//! 4. `wait(heartbeat_interval, stop_grace)`

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::command::{Cancellation, CommandBatch, CommandReport, CommandStatus, HeartbeatReport};
use crate::context::AgentContext;
use crate::convergence::recovery::RecoveryTracker;
use crate::convergence::retry::RetryPolicy;
use crate::error::{AgentError, Result};
use crate::infrastructure::supervisor::ExitRecord;
use crate::infrastructure::FileBasedProcessLock;
use crate::monitor::diagnostics::{DiagnosticsSnapshot, TrackedEntry};
use crate::monitor::{AgentCounters, ConnectivityProbe, HeartbeatCoordinator, TcpProbe, WaitOutcome};

/// Lock file serialising batch execution between agent processes.
pub const BATCH_LOCK: &str = "agent.lock";


// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// The agent's view of the coordinator.
pub trait Coordinator: Send + Sync {
    /// Human-readable address, for logs.
    fn target(&self) -> String;

    /// Succeeds when the coordinator is reachable.
    fn probe(&self) -> Result<()>;

    /// Pending batches, in execution order. Returned batches are consumed.
    fn fetch_batches(&self) -> Result<Vec<CommandBatch>>;

    /// Whether a batch for `task_id` is waiting to be fetched.
    fn is_pending(&self, task_id: &str) -> bool;

    fn fetch_cancellations(&self) -> Result<Vec<Cancellation>>;

    fn report(&self, report: &CommandReport) -> Result<()>;

    fn heartbeat(&self, report: &HeartbeatReport) -> Result<()>;
}


struct CoordinatorProbe<'a>(&'a dyn Coordinator);

impl ConnectivityProbe for CoordinatorProbe<'_> {
    fn target(&self) -> String {
        self.0.target()
    }

    fn probe(&self) -> Result<()> {
        self.0.probe()
    }
}


/// Coordinator backed by a spool directory:
///
/// ```text
/// <spool>/inbox/*.json      batches, consumed in file-name order
/// <spool>/cancel/*.json     cancellations, consumed in file-name order
/// <spool>/outbox/<task>.json reports
/// <spool>/heartbeat.json    latest heartbeat
/// ```
///
/// Files that do not parse are renamed to `*.bad` and skipped. With an
/// upstream probe, the coordinator only counts as reachable when the
/// upstream answers too.
pub struct SpoolCoordinator {
    root: PathBuf,
    upstream: Option<TcpProbe>,
}

impl SpoolCoordinator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        SpoolCoordinator {
            root: root.into(),
            upstream: None,
        }
    }

    pub fn with_upstream(mut self, probe: TcpProbe) -> Self {
        self.upstream = Some(probe);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn inbox(&self) -> PathBuf {
        self.root.join("inbox")
    }

    pub fn outbox(&self) -> PathBuf {
        self.root.join("outbox")
    }

    pub fn cancel_dir(&self) -> PathBuf {
        self.root.join("cancel")
    }

    pub fn heartbeat_file(&self) -> PathBuf {
        self.root.join("heartbeat.json")
    }

    fn consume<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AgentError::path(dir, e)),
        };
        let mut paths: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect();
        paths.sort();

        let mut items = Vec::with_capacity(paths.len());
        for path in paths {
            let parsed = fs::read_to_string(&path)
                .map_err(|e| AgentError::path(&path, e))
                .and_then(|text| Ok(serde_json::from_str::<T>(&text)?));
            match parsed {
                Ok(item) => {
                    fs::remove_file(&path).map_err(|e| AgentError::path(&path, e))?;
                    items.push(item);
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "unreadable spool file set aside");
                    let bad = path.with_extension("bad");
                    fs::rename(&path, &bad).map_err(|e| AgentError::path(&path, e))?;
                }
            }
        }
        Ok(items)
    }

    fn publish<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| AgentError::path(parent, e))?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(value)?).map_err(|e| AgentError::path(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| AgentError::path(path, e))
    }
}

impl Coordinator for SpoolCoordinator {
    fn target(&self) -> String {
        format!("spool:{}", self.root.display())
    }

    fn probe(&self) -> Result<()> {
        if !self.root.is_dir() {
            return Err(AgentError::execution(format!(
                "spool directory {} does not exist",
                self.root.display()
            )));
        }
        match &self.upstream {
            Some(upstream) => upstream.probe(),
            None => Ok(()),
        }
    }

    fn fetch_batches(&self) -> Result<Vec<CommandBatch>> {
        Self::consume(&self.inbox())
    }

    fn is_pending(&self, task_id: &str) -> bool {
        let Ok(entries) = fs::read_dir(self.inbox()) else {
            return false;
        };
        entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .filter_map(|p| fs::read_to_string(p).ok())
            .filter_map(|text| serde_json::from_str::<Value>(&text).ok())
            .any(|batch| batch.get("taskId").and_then(Value::as_str) == Some(task_id))
    }

    fn fetch_cancellations(&self) -> Result<Vec<Cancellation>> {
        Self::consume(&self.cancel_dir())
    }

    fn report(&self, report: &CommandReport) -> Result<()> {
        let name = report.task_id.replace('/', "_");
        Self::publish(&self.outbox().join(format!("{}.json", name)), report)
    }

    fn heartbeat(&self, report: &HeartbeatReport) -> Result<()> {
        Self::publish(&self.heartbeat_file(), report)
    }
}


// ---------------------------------------------------------------------------
// Batch execution
// ---------------------------------------------------------------------------

/// Converge one batch while holding the batch lock. Never fails: every
/// outcome, including lock or binding errors, ends up in the report.
pub fn execute_batch(context: &AgentContext, batch: &CommandBatch) -> CommandReport {
    let started = Instant::now();
    let counters = &context.counters;
    AgentCounters::bump(&counters.batches_received);
    info!(task_id = %batch.task_id, resources = batch.resources.len(), "executing batch");
    context.supervisor.queue_task(&batch.task_id);

    let mut lock = FileBasedProcessLock::new(context.supervisor.run_dir().join(BATCH_LOCK));
    let result = lock.acquire().and_then(|()| {
        let mut env = context.environment_for(batch);
        let mut scope = env.scope();
        for spec in &batch.resources {
            scope.add(spec)?;
        }
        scope.run()
    });
    lock.release();

    let cancelled = context.supervisor.settle_task(&batch.task_id);
    let redact = |e: &AgentError| context.secrets.redact(&e.to_string()).into_owned();
    let (status, outcomes, error) = match (result, cancelled) {
        (_, Some(reason)) => (CommandStatus::Cancelled, Vec::new(), Some(reason)),
        (Ok(outcomes), None) => (CommandStatus::Completed, outcomes, None),
        (Err(e), None) => (CommandStatus::Failed, Vec::new(), Some(redact(&e))),
    };

    match status {
        CommandStatus::Completed => {
            AgentCounters::bump(&counters.batches_succeeded);
            counters
                .resources_applied
                .fetch_add(outcomes.len() as u64, Ordering::Relaxed);
            let updated = outcomes.iter().filter(|o| o.updated).count() as u64;
            counters.resources_updated.fetch_add(updated, Ordering::Relaxed);
            info!(task_id = %batch.task_id, updated, "batch completed");
        }
        _ => {
            AgentCounters::bump(&counters.batches_failed);
            warn!(task_id = %batch.task_id, ?status, error = ?error, "batch did not complete");
        }
    }

    CommandReport {
        task_id: batch.task_id.clone(),
        status,
        outcomes,
        error,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}


/// Write the diagnostics dump into the run directory.
pub fn write_diagnostics(context: &AgentContext) -> Result<PathBuf> {
    let snapshot = DiagnosticsSnapshot::capture(
        context.uptime(),
        &context.counters,
        context.supervisor.tracked(),
        context.secrets.len(),
    );
    info!(counters = ?snapshot.counters, "diagnostics snapshot");
    snapshot.write(context.supervisor.run_dir())
}


// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Events that can be sent to the daemon's main loop via the channel.
#[derive(Debug)]
pub enum DaemonEvent {
    /// A tracked process exited.
    ProcessExited(ExitRecord),
    /// Request the daemon to shut down gracefully.
    Shutdown,
}


/// Handle returned from `Daemon::handle()` allowing threads to send events.
#[derive(Clone)]
pub struct DaemonHandle {
    sender: mpsc::Sender<DaemonEvent>,
    heartbeat: Arc<HeartbeatCoordinator>,
}

impl DaemonHandle {
    pub fn send(&self, event: DaemonEvent) -> Result<()> {
        self.sender
            .send(event)
            .map_err(|e| AgentError::execution(format!("daemon channel closed: {}", e)))
    }

    /// Ask for the next cycle to start now.
    pub fn request_heartbeat(&self) {
        self.heartbeat.request_heartbeat();
    }

    /// Request daemon shutdown.
    pub fn shutdown(&self) -> Result<()> {
        self.heartbeat.request_stop();
        self.send(DaemonEvent::Shutdown)
    }
}


pub struct Daemon {
    context: Arc<AgentContext>,
    coordinator: Arc<dyn Coordinator>,
    receiver: mpsc::Receiver<DaemonEvent>,
    handle: DaemonHandle,
    recovery: RecoveryTracker,
    sequence: u64,
    hostname: String,
}

impl Daemon {
    pub fn new(context: AgentContext, coordinator: Arc<dyn Coordinator>) -> Daemon {
        let (sender, receiver) = mpsc::channel();
        let handle = DaemonHandle {
            sender,
            heartbeat: Arc::clone(&context.heartbeat),
        };
        let recovery = RecoveryTracker::new(context.settings.recovery.clone());
        Daemon {
            context: Arc::new(context),
            coordinator,
            receiver,
            handle,
            recovery,
            sequence: 0,
            hostname: hostname(),
        }
    }

    /// Get a handle for sending events to this daemon.
    pub fn handle(&self) -> DaemonHandle {
        self.handle.clone()
    }

    pub fn context(&self) -> &Arc<AgentContext> {
        &self.context
    }

    /// Run until a stop is requested. Fails only when the coordinator
    /// cannot be reached.
    pub fn run(&mut self) -> Result<()> {
        if !self.connect()? {
            return Ok(());
        }
        match self.context.supervisor.reap_stale() {
            Ok(killed) if !killed.is_empty() => info!(?killed, "reaped stale processes"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "cannot reap stale processes"),
        }

        let cleanup = self.spawn_cleanup()?;
        let settings = &self.context.settings;
        let (interval, grace) = (settings.heartbeat_interval(), settings.stop_grace());
        info!(?interval, ?grace, "daemon started");

        loop {
            if self.drain_channel() {
                break;
            }
            self.cycle();
            let outcome = self.context.heartbeat.wait(interval, grace);
            debug!(code = outcome.code(), "wait finished");
            if outcome == WaitOutcome::Stop || self.context.heartbeat.stop_requested() {
                break;
            }
        }

        info!("daemon stopping");
        self.context.heartbeat.request_stop();
        if cleanup.join().is_err() {
            error!("cleanup thread panicked");
        }
        self.context.supervisor.stop_all();
        Ok(())
    }

    /// Returns `Ok(false)` when a stop arrived before the coordinator
    /// answered.
    fn connect(&self) -> Result<bool> {
        let settings = &self.context.settings;
        let policy = RetryPolicy::new(
            1,
            settings.connect_backoff,
            Duration::from_secs(settings.connect_retry_delay_secs),
        );
        let probe = CoordinatorProbe(self.coordinator.as_ref());
        let (attempts, ok) =
            self.context
                .heartbeat
                .try_to_connect(&probe, settings.max_connect_retries, &policy);
        let failures = if ok { attempts - 1 } else { attempts };
        self.context
            .counters
            .connect_failures
            .fetch_add(u64::from(failures), Ordering::Relaxed);
        if ok {
            return Ok(true);
        }
        if self.context.heartbeat.stop_requested() {
            return Ok(false);
        }
        Err(AgentError::execution(format!(
            "cannot reach coordinator {} after {} attempts",
            self.coordinator.target(),
            attempts
        )))
    }

    /// Drain all pending events from the channel.
    /// Returns true if a Shutdown event was received.
    fn drain_channel(&mut self) -> bool {
        loop {
            match self.receiver.try_recv() {
                Ok(DaemonEvent::ProcessExited(record)) => self.on_process_exit(record),
                Ok(DaemonEvent::Shutdown) => return true,
                Err(mpsc::TryRecvError::Empty) => return false,
                Err(mpsc::TryRecvError::Disconnected) => return true,
            }
        }
    }

    fn on_process_exit(&mut self, record: ExitRecord) {
        if record.requested {
            return;
        }
        let now = Instant::now();
        if !self.recovery.may_execute(&record.name, now) {
            warn!(
                name = %record.name,
                exit_code = ?record.exit_code,
                lifetime = self.recovery.lifetime_count(&record.name),
                "tracked process died, not restarting"
            );
            return;
        }
        self.recovery.record_attempt(&record.name, now);
        match self.context.supervisor.start_tracked(&record.name, &record.spec) {
            Ok(pid) => {
                AgentCounters::bump(&self.context.counters.restarts);
                info!(name = %record.name, pid, "tracked process restarted");
            }
            Err(e) => warn!(name = %record.name, error = %e, "restart failed"),
        }
    }

    /// One pass: execute pending batches, then heartbeat.
    pub fn cycle(&mut self) {
        let batches = self.coordinator.fetch_batches().unwrap_or_else(|e| {
            warn!(error = %e, "cannot fetch batches");
            Vec::new()
        });
        for batch in &batches {
            self.context.supervisor.queue_task(&batch.task_id);
        }
        for batch in &batches {
            if self.context.heartbeat.stop_requested() {
                warn!(task_id = %batch.task_id, "stop requested, batch left unexecuted");
                self.context.supervisor.settle_task(&batch.task_id);
                continue;
            }
            let report = execute_batch(&self.context, batch);
            if let Err(e) = self.coordinator.report(&report) {
                warn!(task_id = %report.task_id, error = %e, "cannot send report");
            }
        }
        self.send_heartbeat();
    }

    fn send_heartbeat(&mut self) {
        self.sequence += 1;
        let report = HeartbeatReport {
            hostname: self.hostname.clone(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            sequence: self.sequence,
            tracked: self
                .context
                .supervisor
                .tracked()
                .into_iter()
                .map(TrackedEntry::from)
                .collect(),
            counters: self.context.counters.snapshot(),
        };
        match self.coordinator.heartbeat(&report) {
            Ok(()) => AgentCounters::bump(&self.context.counters.heartbeats_sent),
            Err(e) => warn!(error = %e, "cannot send heartbeat"),
        }
    }

    fn spawn_cleanup(&self) -> Result<thread::JoinHandle<()>> {
        let context = Arc::clone(&self.context);
        let coordinator = Arc::clone(&self.coordinator);
        let handle = self.handle.clone();
        let sweep_every = context.settings.cleanup_interval();
        let handle = thread::Builder::new()
            .name("cleanup".into())
            .spawn(move || {
                let mut last_sweep = Instant::now();
                while !context.heartbeat.sleep_unless_stopped(Duration::from_secs(1)) {
                    cleanup_tick(&context, coordinator.as_ref(), &handle);
                    if last_sweep.elapsed() >= sweep_every {
                        last_sweep = Instant::now();
                        sweep_exited(&context, &handle);
                    }
                }
                debug!("cleanup thread finished");
            })?;
        Ok(handle)
    }
}


fn cleanup_tick(context: &AgentContext, coordinator: &dyn Coordinator, handle: &DaemonHandle) {
    match coordinator.fetch_cancellations() {
        Ok(cancellations) => {
            for c in cancellations {
                if coordinator.is_pending(&c.task_id) {
                    context.supervisor.queue_task(&c.task_id);
                }
                context.supervisor.cancel_task(&c.task_id, &c.reason);
            }
        }
        Err(e) => warn!(error = %e, "cannot fetch cancellations"),
    }
    if context.heartbeat.take_diagnostics_request() {
        if let Err(e) = write_diagnostics(context) {
            warn!(error = %e, "cannot write diagnostics");
        }
        handle.request_heartbeat();
    }
}


fn sweep_exited(context: &AgentContext, handle: &DaemonHandle) {
    let exited = context.supervisor.take_exited();
    if exited.is_empty() {
        return;
    }
    debug!(count = exited.len(), "tracked processes exited");
    for record in exited {
        if handle.send(DaemonEvent::ProcessExited(record)).is_err() {
            return;
        }
    }
    handle.request_heartbeat();
}


fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: the buffer is valid for its full length.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::{CommandResult, MockRunner};
    use crate::logging::SecretRegistry;
    use crate::types::config::AgentSettings;
    use serde_json::json;

    fn context(dir: &Path, runner: MockRunner) -> AgentContext {
        let settings = AgentSettings {
            run_dir: dir.join("run"),
            spool_dir: dir.join("spool"),
            heartbeat_interval_secs: 1,
            stop_grace_secs: 0,
            os_family: Some("redhat".into()),
            ..AgentSettings::default()
        };
        AgentContext::new(settings, Arc::new(SecretRegistry::new()))
            .unwrap()
            .with_runner(Arc::new(runner))
    }

    fn drop_json(dir: &Path, name: &str, value: serde_json::Value) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(name), value.to_string()).unwrap();
    }

    // --- spool ---

    #[test]
    fn spool_consumes_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        let spool = SpoolCoordinator::new(dir.path());
        drop_json(&spool.inbox(), "002.json", json!({"taskId": "second"}));
        drop_json(&spool.inbox(), "001.json", json!({"taskId": "first"}));
        fs::write(spool.inbox().join("003.json"), "{not json").unwrap();

        let batches = spool.fetch_batches().unwrap();
        let ids: Vec<_> = batches.iter().map(|b| b.task_id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second"]);
        assert!(spool.inbox().join("003.bad").exists());
        assert!(spool.fetch_batches().unwrap().is_empty());
    }

    #[test]
    fn spool_probe_needs_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SpoolCoordinator::new(dir.path()).probe().is_ok());
        assert!(SpoolCoordinator::new(dir.path().join("missing")).probe().is_err());
    }

    #[test]
    fn spool_probe_checks_upstream() {
        let dir = tempfile::tempdir().unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let up = SpoolCoordinator::new(dir.path())
            .with_upstream(TcpProbe::new(addr.as_str(), Duration::from_secs(1)));
        assert!(up.probe().is_ok());

        drop(listener);
        let down = SpoolCoordinator::new(dir.path())
            .with_upstream(TcpProbe::new(addr.as_str(), Duration::from_millis(200)));
        assert!(down.probe().is_err());
    }

    // --- batches ---

    #[test]
    fn batch_completes_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), MockRunner::new());
        let target = dir.path().join("motd");
        let batch: CommandBatch = serde_json::from_value(json!({
            "taskId": "t-1",
            "params": {"who": "fleet"},
            "resources": [
                {"type": "file", "name": target.to_str().unwrap(), "content": "hello"},
                {"type": "execute", "name": "echo done"}
            ]
        }))
        .unwrap();

        let report = execute_batch(&ctx, &batch);
        assert_eq!(report.status, CommandStatus::Completed);
        assert_eq!(report.outcomes.len(), 2);
        assert!(report.outcomes.iter().all(|o| o.updated));
        assert_eq!(fs::read_to_string(&target).unwrap(), "hello");

        let counters = ctx.counters.snapshot();
        assert_eq!(counters.batches_succeeded, 1);
        assert_eq!(counters.resources_applied, 2);
        assert_eq!(counters.resources_updated, 2);
    }

    #[test]
    fn batch_failure_is_reported_redacted() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(
            dir.path(),
            MockRunner::new().on("deploy", CommandResult::failed(1, "token hunter2 rejected")),
        );
        ctx.secrets.register("hunter2");
        let batch: CommandBatch = serde_json::from_value(json!({
            "taskId": "t-2",
            "resources": [{"type": "execute", "name": "deploy"}]
        }))
        .unwrap();

        let report = execute_batch(&ctx, &batch);
        assert_eq!(report.status, CommandStatus::Failed);
        let error = report.error.unwrap();
        assert!(error.contains("Execute['deploy']"));
        assert!(!error.contains("hunter2"));
        assert_eq!(ctx.counters.snapshot().batches_failed, 1);
    }

    #[test]
    fn invalid_resource_fails_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), MockRunner::new());
        let batch: CommandBatch = serde_json::from_value(json!({
            "taskId": "t-3",
            "resources": [{"type": "execute", "name": "x", "colour": "blue"}]
        }))
        .unwrap();
        let report = execute_batch(&ctx, &batch);
        assert_eq!(report.status, CommandStatus::Failed);
        assert!(report.error.unwrap().contains("colour"));
    }

    #[test]
    fn cancelled_batch() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), MockRunner::new());
        ctx.supervisor.queue_task("t-4");
        ctx.supervisor.cancel_task("t-4", "operator abort");
        let batch: CommandBatch = serde_json::from_value(json!({
            "taskId": "t-4",
            "resources": [{"type": "execute", "name": "echo x"}]
        }))
        .unwrap();
        let report = execute_batch(&ctx, &batch);
        assert_eq!(report.status, CommandStatus::Cancelled);
        assert_eq!(report.error.as_deref(), Some("operator abort"));
        assert!(ctx.supervisor.cancel_reason("t-4").is_none());
    }

    #[test]
    fn cancellations_only_stick_to_known_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), MockRunner::new());
        let spool = SpoolCoordinator::new(dir.path().join("spool"));
        drop_json(&spool.inbox(), "001.json", json!({"taskId": "t-waiting"}));
        drop_json(&spool.cancel_dir(), "001.json", json!({"taskId": "t-waiting", "reason": "superseded"}));
        drop_json(&spool.cancel_dir(), "002.json", json!({"taskId": "t-gone", "reason": "too late"}));
        assert!(spool.is_pending("t-waiting"));
        assert!(!spool.is_pending("t-gone"));

        let (sender, _receiver) = mpsc::channel();
        let handle = DaemonHandle {
            sender,
            heartbeat: Arc::clone(&ctx.heartbeat),
        };
        cleanup_tick(&ctx, &spool, &handle);

        assert_eq!(ctx.supervisor.cancel_reason("t-waiting").as_deref(), Some("superseded"));
        assert_eq!(ctx.supervisor.cancel_reason("t-gone"), None);

        // A later batch with the dropped id is not reported as cancelled.
        let batch: CommandBatch = serde_json::from_value(json!({
            "taskId": "t-gone",
            "resources": [{"type": "execute", "name": "echo x"}]
        }))
        .unwrap();
        assert_eq!(execute_batch(&ctx, &batch).status, CommandStatus::Completed);
    }

    #[test]
    fn diagnostics_file_written() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path(), MockRunner::new());
        let path = write_diagnostics(&ctx).unwrap();
        assert!(path.starts_with(dir.path().join("run")));
        assert_eq!(DiagnosticsSnapshot::read(ctx.supervisor.run_dir()).unwrap().pid, std::process::id());
    }

    // --- daemon ---

    #[test]
    fn daemon_processes_inbox_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Arc::new(SpoolCoordinator::new(dir.path().join("spool")));
        drop_json(
            &spool.inbox(),
            "001.json",
            json!({"taskId": "t-9", "resources": [{"type": "execute", "name": "echo hi"}]}),
        );
        let mut daemon = Daemon::new(context(dir.path(), MockRunner::new()), spool.clone());
        let handle = daemon.handle();
        let worker = thread::spawn(move || daemon.run());

        let report_path = spool.outbox().join("t-9.json");
        let deadline = Instant::now() + Duration::from_secs(10);
        while !(report_path.exists() && spool.heartbeat_file().exists()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        handle.shutdown().unwrap();
        worker.join().unwrap().unwrap();

        let report: CommandReport =
            serde_json::from_str(&fs::read_to_string(&report_path).unwrap()).unwrap();
        assert_eq!(report.status, CommandStatus::Completed);
        let beat: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(spool.heartbeat_file()).unwrap()).unwrap();
        assert!(beat["sequence"].as_u64().unwrap() >= 1);
    }

    #[test]
    fn daemon_gives_up_on_missing_coordinator() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path(), MockRunner::new());
        ctx.settings.max_connect_retries = 2;
        ctx.settings.connect_retry_delay_secs = 0;
        let spool = Arc::new(SpoolCoordinator::new(dir.path().join("absent")));
        let mut daemon = Daemon::new(ctx, spool);
        let err = daemon.run().unwrap_err();
        assert!(err.to_string().contains("after 2 attempts"));
        assert_eq!(daemon.context().counters.snapshot().connect_failures, 2);
    }
}
