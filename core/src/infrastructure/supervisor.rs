//! Process supervision: tracked background processes, pid files, tree kill,
//! stale-process reaping and task cancellation.
//!
//! Every tracked process runs in its own process group and is mirrored to a
//! plain-text pid file at `<run_dir>/<name>.pid`. The presence of that file
//! plus liveness of the pid it names is the status contract external probes
//! rely on, so the file is written before `start_tracked` returns and removed
//! once the process is confirmed gone.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::runner::CommandSpec;
use crate::error::{AgentError, Result};

// ---------------------------------------------------------------------------
// Liveness and tree kill
// ---------------------------------------------------------------------------

/// Process state letter from `/proc/<pid>/stat`.
fn proc_state(pid: u32) -> Option<char> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    let after = &stat[stat.rfind(')')? + 1..];
    after.split_whitespace().next()?.chars().next()
}

fn parent_of(pid: u32) -> Option<u32> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    let after = &stat[stat.rfind(')')? + 1..];
    after.split_whitespace().nth(1)?.parse().ok()
}

/// Whether `pid` exists and is not a zombie.
pub fn is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // SAFETY: signal 0 only checks for existence.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc != 0 && std::io::Error::last_os_error().raw_os_error() != Some(libc::EPERM) {
        return false;
    }
    proc_state(pid) != Some('Z')
}

/// Every live descendant of `root`, found by walking `/proc`.
pub fn descendants(root: u32) -> Vec<u32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        if let Some(ppid) = parent_of(pid) {
            children.entry(ppid).or_default().push(pid);
        }
    }
    let mut found = Vec::new();
    let mut stack = vec![root];
    while let Some(pid) = stack.pop() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                if !found.contains(&kid) {
                    found.push(kid);
                    stack.push(kid);
                }
            }
        }
    }
    found
}

fn signal_all(pid: u32, targets: &[u32], signal: i32) {
    // SAFETY: sending a signal has no memory-safety implications. Failures
    // (ESRCH for an already exited target) are expected and ignored.
    unsafe {
        libc::killpg(pid as libc::pid_t, signal);
        for &t in targets {
            libc::kill(t as libc::pid_t, signal);
        }
    }
}

/// SIGTERM the process group of `pid` and every descendant, wait up to
/// `grace` for them to exit, then SIGKILL survivors. Returns `true` when
/// nothing is left alive; an already exited target counts as success.
pub fn kill_tree(pid: u32, grace: Duration) -> bool {
    if pid == 0 || pid == std::process::id() {
        return false;
    }
    let mut targets = descendants(pid);
    targets.push(pid);
    if !targets.iter().any(|&p| is_alive(p)) {
        return true;
    }

    debug!(pid, count = targets.len(), "terminating process tree");
    signal_all(pid, &targets, libc::SIGTERM);
    if wait_dead(&targets, grace) {
        return true;
    }

    // Late forks during the grace period are caught by a second walk.
    for p in descendants(pid) {
        if !targets.contains(&p) {
            targets.push(p);
        }
    }
    warn!(pid, "process tree survived SIGTERM, sending SIGKILL");
    signal_all(pid, &targets, libc::SIGKILL);
    wait_dead(&targets, Duration::from_secs(2))
}

fn wait_dead(targets: &[u32], limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if !targets.iter().any(|&p| is_alive(p)) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(50));
    }
}

// ---------------------------------------------------------------------------
// ProcessSupervisor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct TrackedProcess {
    pid: u32,
    spec: CommandSpec,
}

/// A tracked process that has exited.
#[derive(Debug, Clone)]
pub struct ExitRecord {
    pub name: String,
    pub pid: u32,
    pub exit_code: Option<i32>,
    /// `true` when the exit followed `stop_tracked`/`stop_all`.
    pub requested: bool,
    pub spec: CommandSpec,
}

/// Snapshot entry for status reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedStatus {
    pub name: String,
    pub pid: u32,
    pub alive: bool,
}

#[derive(Debug, Default)]
struct SupervisorState {
    tracked: BTreeMap<String, TrackedProcess>,
    tasks: HashMap<String, u32>,
    // Fetched or executing batches; only these accept a cancellation.
    queued: HashSet<String>,
    cancelled: HashMap<String, String>,
    exited: Vec<ExitRecord>,
}

/// Process-wide registry of background processes and running task
/// commands.
#[derive(Debug)]
pub struct ProcessSupervisor {
    run_dir: PathBuf,
    kill_grace: Duration,
    state: Mutex<SupervisorState>,
}

impl ProcessSupervisor {
    pub fn new(run_dir: impl Into<PathBuf>, kill_grace: Duration) -> Result<Self> {
        let run_dir = run_dir.into();
        std::fs::create_dir_all(&run_dir).map_err(|e| AgentError::path(&run_dir, e))?;
        Ok(ProcessSupervisor {
            run_dir,
            kill_grace,
            state: Mutex::new(SupervisorState::default()),
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn kill_grace(&self) -> Duration {
        self.kill_grace
    }

    pub fn pid_file(&self, name: &str) -> PathBuf {
        self.run_dir.join(format!("{}.pid", name))
    }

    fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() || name.contains('/') || name.starts_with('.') {
            return Err(AgentError::config(format!("invalid process name '{}'", name)));
        }
        Ok(())
    }

    /// Start `spec` in the background under `name`. Idempotent: when `name`
    /// is already running its pid is returned and nothing is spawned.
    pub fn start_tracked(self: &Arc<Self>, name: &str, spec: &CommandSpec) -> Result<u32> {
        Self::validate_name(name)?;
        if let Some(pid) = self.running_pid(name) {
            debug!(name, pid, "already running");
            return Ok(pid);
        }

        let log_path = self.run_dir.join(format!("{}.log", name));
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| AgentError::path(&log_path, e))?;
        let log_err = log.try_clone()?;

        let mut cmd = spec.to_command()?;
        cmd.stdin(Stdio::null()).stdout(log).stderr(log_err);
        let mut child = cmd
            .spawn()
            .map_err(|e| AgentError::execution(format!("cannot start {}: {}", name, e)))?;
        let pid = child.id();

        let pid_path = self.pid_file(name);
        if let Err(e) = std::fs::write(&pid_path, pid.to_string()) {
            kill_tree(pid, self.kill_grace);
            let _ = child.wait();
            return Err(AgentError::path(&pid_path, e));
        }
        self.state.lock().tracked.insert(
            name.to_string(),
            TrackedProcess {
                pid,
                spec: spec.clone(),
            },
        );
        info!(name, pid, "started tracked process");

        let me = Arc::clone(self);
        let owned = name.to_string();
        let spec = spec.clone();
        thread::Builder::new()
            .name(format!("reap-{}", name))
            .spawn(move || {
                let exit_code = child.wait().ok().and_then(|s| s.code());
                me.on_exit(&owned, pid, exit_code, spec);
            })?;
        Ok(pid)
    }

    fn on_exit(&self, name: &str, pid: u32, exit_code: Option<i32>, spec: CommandSpec) {
        let mut state = self.state.lock();
        let still_tracked = state.tracked.get(name).map(|t| t.pid) == Some(pid);
        if still_tracked {
            state.tracked.remove(name);
            self.remove_pid_file_if(name, pid);
            info!(name, pid, ?exit_code, "tracked process exited");
        }
        state.exited.push(ExitRecord {
            name: name.to_string(),
            pid,
            exit_code,
            requested: !still_tracked,
            spec,
        });
    }

    fn remove_pid_file_if(&self, name: &str, pid: u32) {
        let path = self.pid_file(name);
        if read_pid(&path) == Some(pid) {
            let _ = std::fs::remove_file(&path);
        }
    }

    /// Pid of `name` if it is registered or has a pid file, and is alive.
    pub fn running_pid(&self, name: &str) -> Option<u32> {
        let registered = self.state.lock().tracked.get(name).map(|t| t.pid);
        registered
            .or_else(|| read_pid(&self.pid_file(name)))
            .filter(|&pid| is_alive(pid))
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.running_pid(name).is_some()
    }

    /// Send `signal` to the process group of `name` and deregister it.
    /// Returns `false` when nothing was running.
    pub fn stop_tracked(&self, name: &str, signal: i32) -> Result<bool> {
        Self::validate_name(name)?;
        let registered = self.state.lock().tracked.remove(name).map(|t| t.pid);
        let Some(pid) = registered.or_else(|| read_pid(&self.pid_file(name))) else {
            return Ok(false);
        };
        let alive = is_alive(pid);
        if alive {
            // SAFETY: signalling a process group we started.
            unsafe {
                libc::killpg(pid as libc::pid_t, signal);
            }
            info!(name, pid, signal, "signalled tracked process");
        }
        let _ = std::fs::remove_file(self.pid_file(name));
        Ok(alive)
    }

    /// Tree-kill `name` with the configured grace period. Returns `true`
    /// when nothing is left alive, including when nothing was running.
    pub fn terminate(&self, name: &str) -> Result<bool> {
        Self::validate_name(name)?;
        let registered = self.state.lock().tracked.remove(name).map(|t| t.pid);
        let Some(pid) = registered.or_else(|| read_pid(&self.pid_file(name))) else {
            return Ok(true);
        };
        let dead = kill_tree(pid, self.kill_grace);
        let _ = std::fs::remove_file(self.pid_file(name));
        Ok(dead)
    }

    /// Terminate every tracked process.
    pub fn stop_all(&self) {
        let names: Vec<String> = self.state.lock().tracked.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.terminate(&name) {
                warn!(name, error = %e, "cannot stop tracked process");
            }
        }
    }

    /// Kill leftovers of a previous run: every `*.pid` in the run directory
    /// that is not ours. Returns the pids that were still alive.
    pub fn reap_stale(&self) -> Result<Vec<u32>> {
        let own = std::process::id();
        let tracked: Vec<u32> = self.state.lock().tracked.values().map(|t| t.pid).collect();
        let mut killed = Vec::new();
        let entries = std::fs::read_dir(&self.run_dir).map_err(|e| AgentError::path(&self.run_dir, e))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pid") {
                continue;
            }
            match read_pid(&path) {
                Some(pid) if pid == own || tracked.contains(&pid) => continue,
                Some(pid) if is_alive(pid) => {
                    warn!(pid, file = %path.display(), "killing stale process");
                    kill_tree(pid, self.kill_grace);
                    killed.push(pid);
                }
                _ => {}
            }
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(file = %path.display(), error = %e, "cannot remove stale pid file");
            }
        }
        Ok(killed)
    }

    /// Exits recorded since the last call.
    pub fn take_exited(&self) -> Vec<ExitRecord> {
        std::mem::take(&mut self.state.lock().exited)
    }

    pub fn tracked(&self) -> Vec<TrackedStatus> {
        self.state
            .lock()
            .tracked
            .iter()
            .map(|(name, t)| TrackedStatus {
                name: name.clone(),
                pid: t.pid,
                alive: is_alive(t.pid),
            })
            .collect()
    }

    // -- task cancellation --------------------------------------------------

    /// Remember that `pid` is the command currently running for `task_id`.
    pub fn map_task(&self, task_id: &str, pid: u32) {
        self.state.lock().tasks.insert(task_id.to_string(), pid);
    }

    pub fn finish_task(&self, task_id: &str) {
        self.state.lock().tasks.remove(task_id);
    }

    /// Note that a batch for `task_id` is pending or executing.
    pub fn queue_task(&self, task_id: &str) {
        self.state.lock().queued.insert(task_id.to_string());
    }

    pub fn is_task_queued(&self, task_id: &str) -> bool {
        self.state.lock().queued.contains(task_id)
    }

    /// Cancel `task_id`: record `reason` and tree-kill its running command,
    /// if any. Returns whether a process was killed.
    ///
    /// A task that is neither queued nor running is unknown here, and its
    /// cancellation is dropped.
    pub fn cancel_task(&self, task_id: &str, reason: &str) -> bool {
        let pid = {
            let mut state = self.state.lock();
            let pid = state.tasks.get(task_id).copied();
            if pid.is_none() && !state.queued.contains(task_id) {
                drop(state);
                debug!(task_id, reason, "cancellation for unknown task dropped");
                return false;
            }
            state.cancelled.insert(task_id.to_string(), reason.to_string());
            pid
        };
        info!(task_id, reason, ?pid, "cancelling task");
        match pid {
            Some(pid) => {
                kill_tree(pid, self.kill_grace);
                true
            }
            None => false,
        }
    }

    pub fn cancel_reason(&self, task_id: &str) -> Option<String> {
        self.state.lock().cancelled.get(task_id).cloned()
    }

    /// Forget `task_id` once its batch is done, returning the cancellation
    /// reason if one arrived.
    pub fn settle_task(&self, task_id: &str) -> Option<String> {
        let mut state = self.state.lock();
        state.queued.remove(task_id);
        state.cancelled.remove(task_id)
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;

    fn supervisor(dir: &Path) -> Arc<ProcessSupervisor> {
        Arc::new(ProcessSupervisor::new(dir, Duration::from_millis(500)).unwrap())
    }

    fn wait_for<F: FnMut() -> bool>(mut f: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn start_writes_pid_file_and_stop_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        let pid = sup.start_tracked("sleeper", &CommandSpec::argv(["sleep", "30"])).unwrap();
        assert_eq!(read_pid(&sup.pid_file("sleeper")), Some(pid));
        assert!(sup.is_running("sleeper"));

        // Second start is a no-op.
        assert_eq!(sup.start_tracked("sleeper", &CommandSpec::argv(["sleep", "30"])).unwrap(), pid);

        assert!(sup.stop_tracked("sleeper", libc::SIGTERM).unwrap());
        assert!(!sup.pid_file("sleeper").exists());
        assert!(wait_for(|| !is_alive(pid)));
        assert!(wait_for(|| sup.take_exited().iter().any(|e| e.pid == pid && e.requested)));
    }

    #[test]
    fn unexpected_exit_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        sup.start_tracked("oneshot", &CommandSpec::shell("exit 4")).unwrap();
        let mut exits = Vec::new();
        assert!(wait_for(|| {
            exits.extend(sup.take_exited());
            !exits.is_empty()
        }));
        assert_eq!(exits[0].exit_code, Some(4));
        assert!(!exits[0].requested);
        assert!(!sup.pid_file("oneshot").exists());
    }

    #[test]
    fn stop_of_unknown_name_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        assert!(!sup.stop_tracked("ghost", libc::SIGTERM).unwrap());
        assert!(sup.stop_tracked("../etc", libc::SIGTERM).is_err());
    }

    #[test]
    fn reap_stale_kills_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id();
        std::fs::write(dir.path().join("leftover.pid"), pid.to_string()).unwrap();
        std::fs::write(dir.path().join("garbage.pid"), "not a pid").unwrap();
        std::fs::write(dir.path().join("self.pid"), std::process::id().to_string()).unwrap();

        let sup = supervisor(dir.path());
        let killed = sup.reap_stale().unwrap();
        let _ = child.wait();
        assert_eq!(killed, vec![pid]);
        assert!(!dir.path().join("leftover.pid").exists());
        assert!(!dir.path().join("garbage.pid").exists());
        assert!(dir.path().join("self.pid").exists());
    }

    #[test]
    fn kill_tree_of_exited_process_is_success() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        let _ = child.wait();
        assert!(kill_tree(pid, Duration::from_millis(100)));
    }

    #[test]
    fn kill_tree_escalates_to_sigkill() {
        let mut child = std::process::Command::new("sh")
            .args(["-c", "trap '' TERM; while :; do sleep 1; done"])
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id();
        thread::sleep(Duration::from_millis(200));
        let started = Instant::now();
        assert!(kill_tree(pid, Duration::from_millis(300)));
        assert!(started.elapsed() >= Duration::from_millis(300));
        let _ = child.wait();
    }

    #[test]
    fn cancel_records_reason_and_kills() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        sup.map_task("t-1", child.id());
        assert!(sup.cancel_task("t-1", "operator request"));
        let _ = child.wait();
        assert_eq!(sup.cancel_reason("t-1").as_deref(), Some("operator request"));
        assert_eq!(sup.settle_task("t-1").as_deref(), Some("operator request"));
        assert_eq!(sup.settle_task("t-1"), None);
    }

    #[test]
    fn queued_task_keeps_its_cancellation_until_settled() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        sup.queue_task("t-2");
        assert!(!sup.cancel_task("t-2", "nothing running yet"));
        assert_eq!(sup.cancel_reason("t-2").as_deref(), Some("nothing running yet"));
        assert_eq!(sup.settle_task("t-2").as_deref(), Some("nothing running yet"));
        assert!(!sup.is_task_queued("t-2"));

        // Settled tasks are unknown again.
        assert!(!sup.cancel_task("t-2", "late"));
        assert_eq!(sup.cancel_reason("t-2"), None);
    }

    #[test]
    fn cancellation_for_unknown_task_is_not_kept() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        assert!(!sup.cancel_task("t-404", "never seen"));
        assert_eq!(sup.cancel_reason("t-404"), None);

        // A later batch reusing the id runs normally.
        sup.queue_task("t-404");
        assert_eq!(sup.settle_task("t-404"), None);
    }
}
