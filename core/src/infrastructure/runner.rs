//! Command runner abstraction for executing system commands.
//!
//! `CommandRunner` is the trait providers use to execute commands.
//! `ProcessRunner` is the production implementation; `MockRunner` is the
//! test double that records calls and returns preset responses.
//!
//! A nonzero exit is never an `Err`: callers receive the exit code and both
//! output streams and decide for themselves. `Err` means the command could
//! not be started at all, or the task it belongs to was cancelled.
//!
//! Output is collected until the direct child exits, plus a short linger.
//! Descendants it left in the background (`nohup daemon &`) keep running,
//! but whatever they still write to the inherited pipes is not waited for.

use std::collections::{BTreeMap, VecDeque};
use std::io::Read;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::accounts;
use super::supervisor::{self, ProcessSupervisor};
use crate::error::{AgentError, Result};
use crate::format::shell_quote;
use crate::logging::SecretRegistry;

// ---------------------------------------------------------------------------
// CommandSpec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Program {
    /// Executed directly, no shell.
    Argv(Vec<String>),
    /// Executed through `sh -c`.
    Shell(String),
}

/// Everything needed to start one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: Program,
    pub user: Option<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    pub task_id: Option<String>,
}

impl CommandSpec {
    fn with_program(program: Program) -> Self {
        CommandSpec {
            program,
            user: None,
            cwd: None,
            env: BTreeMap::new(),
            timeout: None,
            task_id: None,
        }
    }

    pub fn argv<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_program(Program::Argv(args.into_iter().map(Into::into).collect()))
    }

    pub fn shell(command: impl Into<String>) -> Self {
        Self::with_program(Program::Shell(command.into()))
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    /// The command line as a shell would read it.
    pub fn display(&self) -> String {
        match &self.program {
            Program::Argv(args) => args
                .iter()
                .map(|a| shell_quote(a))
                .collect::<Vec<_>>()
                .join(" "),
            Program::Shell(cmd) => cmd.clone(),
        }
    }

    /// A `std::process::Command` in its own process group, running as
    /// `user` when that user resolves.
    pub(crate) fn to_command(&self) -> Result<Command> {
        let mut cmd = match &self.program {
            Program::Argv(args) => {
                let (first, rest) = args
                    .split_first()
                    .ok_or_else(|| AgentError::execution("empty command line"))?;
                let mut cmd = Command::new(first);
                cmd.args(rest);
                cmd
            }
            Program::Shell(line) => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(line);
                cmd
            }
        };
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd.envs(&self.env);
        cmd.process_group(0);
        if let Some(user) = &self.user {
            switch_user(&mut cmd, user);
        }
        Ok(cmd)
    }
}

fn switch_user(cmd: &mut Command, user: &str) {
    match accounts::lookup_user(user) {
        Ok(Some(account)) => {
            if account.uid != accounts::current_uid() {
                cmd.uid(account.uid).gid(account.gid);
            }
            cmd.env("HOME", &account.home).env("USER", &account.name);
        }
        Ok(None) => warn!(user, "user not found, running as the current user"),
        Err(e) => warn!(user, error = %e, "user lookup failed, running as the current user"),
    }
}

// ---------------------------------------------------------------------------
// CommandResult
// ---------------------------------------------------------------------------

mod lossy {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&String::from_utf8_lossy(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        Ok(String::deserialize(d)?.into_bytes())
    }
}

/// `{exitCode, output, error}` as returned to every caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub exit_code: i32,
    #[serde(with = "lossy")]
    pub output: Vec<u8>,
    #[serde(with = "lossy")]
    pub error: Vec<u8>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,
}

impl CommandResult {
    pub fn ok(output: &str) -> Self {
        CommandResult {
            exit_code: 0,
            output: output.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    pub fn failed(exit_code: i32, error: &str) -> Self {
        CommandResult {
            exit_code,
            error: error.as_bytes().to_vec(),
            ..Default::default()
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    pub fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }

    pub fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.error).into_owned()
    }
}

// ---------------------------------------------------------------------------
// CommandRunner
// ---------------------------------------------------------------------------

/// Trait for executing commands.
pub trait CommandRunner: Send + Sync {
    fn run(&self, spec: &CommandSpec) -> Result<CommandResult>;
}

/// Production runner: spawns the process, captures both streams, enforces
/// the optional timeout with a tree kill.
pub struct ProcessRunner {
    secrets: Arc<SecretRegistry>,
    supervisor: Option<Arc<ProcessSupervisor>>,
    kill_grace: Duration,
}

impl ProcessRunner {
    pub fn new(secrets: Arc<SecretRegistry>) -> Self {
        ProcessRunner {
            secrets,
            supervisor: None,
            kill_grace: Duration::from_secs(5),
        }
    }

    /// Map task-tagged commands in `supervisor` so they can be cancelled.
    pub fn with_supervisor(mut self, supervisor: Arc<ProcessSupervisor>) -> Self {
        self.kill_grace = supervisor.kill_grace();
        self.supervisor = Some(supervisor);
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    fn check_cancelled(&self, spec: &CommandSpec) -> Result<()> {
        if let (Some(sup), Some(task)) = (&self.supervisor, &spec.task_id) {
            if let Some(reason) = sup.cancel_reason(task) {
                return Err(AgentError::Cancelled(reason));
            }
        }
        Ok(())
    }
}

/// How long output pipes are still read after the direct child exited.
const DRAIN_LINGER: Duration = Duration::from_millis(250);

/// A stream being read on its own thread.
struct Drain {
    buf: Arc<Mutex<Vec<u8>>>,
    closed: mpsc::Receiver<()>,
    abandoned: Arc<AtomicBool>,
}

impl Drain {
    fn start<R: Read + Send + 'static>(stream: Option<R>) -> Drain {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let abandoned = Arc::new(AtomicBool::new(false));
        let (tx, closed) = mpsc::channel();
        let (sink, stop) = (Arc::clone(&buf), Arc::clone(&abandoned));
        thread::spawn(move || {
            if let Some(mut s) = stream {
                let mut chunk = [0u8; 8192];
                loop {
                    match s.read(&mut chunk) {
                        Ok(0) => break,
                        Ok(_) if stop.load(Ordering::Relaxed) => break,
                        Ok(n) => sink.lock().extend_from_slice(&chunk[..n]),
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(_) => break,
                    }
                }
            }
            let _ = tx.send(());
        });
        Drain { buf, closed, abandoned }
    }

    /// Wait for end of stream until `until`, then take what was read.
    /// Returns whether the stream was fully read.
    fn finish(self, until: Instant) -> (Vec<u8>, bool) {
        let complete = !matches!(
            self.closed.recv_timeout(until.saturating_duration_since(Instant::now())),
            Err(mpsc::RecvTimeoutError::Timeout)
        );
        if !complete {
            self.abandoned.store(true, Ordering::Relaxed);
        }
        let data = std::mem::take(&mut *self.buf.lock());
        (data, complete)
    }
}

impl CommandRunner for ProcessRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandResult> {
        self.check_cancelled(spec)?;
        let shown = self.secrets.redact(&spec.display()).into_owned();
        debug!(command = %shown, user = ?spec.user, "running command");

        let mut cmd = spec.to_command()?;
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = cmd
            .spawn()
            .map_err(|e| AgentError::execution(format!("cannot start '{}': {}", shown, e)))?;
        let pid = child.id();
        if let (Some(sup), Some(task)) = (&self.supervisor, &spec.task_id) {
            sup.map_task(task, pid);
        }

        let out = Drain::start(child.stdout.take());
        let err = Drain::start(child.stderr.take());

        let mut timed_out = false;
        let status = match spec.timeout {
            None => child.wait()?,
            Some(limit) => {
                let deadline = Instant::now() + limit;
                loop {
                    if let Some(status) = child.try_wait()? {
                        break status;
                    }
                    if Instant::now() >= deadline {
                        warn!(command = %shown, ?limit, "command timed out, killing process tree");
                        timed_out = true;
                        supervisor::kill_tree(pid, self.kill_grace);
                        break child.wait()?;
                    }
                    thread::sleep(Duration::from_millis(20));
                }
            }
        };

        let linger = Instant::now() + DRAIN_LINGER;
        let (output, out_complete) = out.finish(linger);
        let (mut error, err_complete) = err.finish(linger);
        if !(out_complete && err_complete) {
            debug!(command = %shown, "background processes still hold the output pipes, not waiting for them");
        }

        if let (Some(sup), Some(task)) = (&self.supervisor, &spec.task_id) {
            sup.finish_task(task);
        }
        self.check_cancelled(spec)?;

        let exit_code = if timed_out {
            error.extend_from_slice(
                format!("\ncommand timed out after {:?}", spec.timeout.unwrap_or_default()).as_bytes(),
            );
            -1
        } else {
            status
                .code()
                .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
        };
        debug!(command = %shown, exit_code, "command finished");
        Ok(CommandResult {
            exit_code,
            output,
            error,
            timed_out,
        })
    }
}

// ---------------------------------------------------------------------------
// MockRunner
// ---------------------------------------------------------------------------

/// Test-double runner that records commands and returns pre-configured
/// responses: the first rule whose pattern occurs in the command line wins,
/// otherwise queued responses are returned in order, otherwise an empty
/// success.
#[derive(Default)]
pub struct MockRunner {
    rules: Mutex<Vec<(String, CommandResult)>>,
    responses: Mutex<VecDeque<CommandResult>>,
    commands: Mutex<Vec<CommandSpec>>,
}

impl MockRunner {
    pub fn new() -> Self {
        MockRunner::default()
    }

    pub fn with_responses(responses: Vec<CommandResult>) -> Self {
        MockRunner {
            responses: Mutex::new(responses.into()),
            ..Default::default()
        }
    }

    /// Answer any command containing `pattern` with `result`.
    pub fn on(self, pattern: &str, result: CommandResult) -> Self {
        self.rules.lock().push((pattern.to_string(), result));
        self
    }

    /// Replace the answer for `pattern` on an existing mock.
    pub fn set_rule(&self, pattern: &str, result: CommandResult) {
        let mut rules = self.rules.lock();
        rules.retain(|(p, _)| p != pattern);
        rules.insert(0, (pattern.to_string(), result));
    }

    pub fn executed_commands(&self) -> Vec<String> {
        self.commands.lock().iter().map(CommandSpec::display).collect()
    }

    pub fn executed_specs(&self) -> Vec<CommandSpec> {
        self.commands.lock().clone()
    }

    pub fn clear(&self) {
        self.commands.lock().clear();
    }
}

impl CommandRunner for MockRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandResult> {
        let line = spec.display();
        self.commands.lock().push(spec.clone());
        if let Some((_, result)) = self.rules.lock().iter().find(|(p, _)| line.contains(p.as_str())) {
            return Ok(result.clone());
        }
        Ok(self.responses.lock().pop_front().unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> ProcessRunner {
        ProcessRunner::new(Arc::new(SecretRegistry::new()))
    }

    #[test]
    fn captures_output_and_exit_code() {
        let r = runner()
            .run(&CommandSpec::shell("echo out; echo err >&2; exit 3"))
            .unwrap();
        assert_eq!(r.exit_code, 3);
        assert_eq!(r.stdout(), "out\n");
        assert_eq!(r.stderr(), "err\n");
        assert!(!r.success());
    }

    #[test]
    fn argv_is_not_shell_interpreted() {
        let r = runner().run(&CommandSpec::argv(["echo", "$HOME; ls"])).unwrap();
        assert_eq!(r.stdout(), "$HOME; ls\n");
    }

    #[test]
    fn env_and_cwd_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let spec = CommandSpec::shell("echo $GREETING; pwd")
            .env("GREETING", "hello")
            .cwd(dir.path());
        let r = runner().run(&spec).unwrap();
        let out = r.stdout();
        assert!(out.starts_with("hello\n"));
        let canonical = dir.path().canonicalize().unwrap();
        assert!(out.trim_end().ends_with(canonical.to_str().unwrap()));
    }

    #[test]
    fn missing_program_is_an_error() {
        let err = runner()
            .run(&CommandSpec::argv(["/nonexistent/fleet-agent-binary"]))
            .unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn timeout_kills_and_reports() {
        let spec = CommandSpec::shell("sleep 30").timeout(Duration::from_millis(200));
        let started = Instant::now();
        let r = runner().with_kill_grace(Duration::from_millis(500)).run(&spec).unwrap();
        assert!(r.timed_out);
        assert_eq!(r.exit_code, -1);
        assert!(r.stderr().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn backgrounded_children_do_not_hold_the_runner() {
        let spec = CommandSpec::shell("sleep 3 & echo started").timeout(Duration::from_secs(1));
        let started = Instant::now();
        let r = runner().run(&spec).unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!r.timed_out);
        assert_eq!(r.exit_code, 0);
        assert_eq!(r.stdout(), "started\n");

        let started = Instant::now();
        let r = runner().run(&CommandSpec::shell("sleep 3 & echo started")).unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(r.stdout(), "started\n");
    }

    #[test]
    fn output_after_a_slow_start_is_complete() {
        let r = runner()
            .run(&CommandSpec::shell("sleep 0.3; echo late"))
            .unwrap();
        assert_eq!(r.stdout(), "late\n");
    }

    #[test]
    fn unknown_user_falls_back_to_current_uid() {
        let spec = CommandSpec::argv(["id", "-u"]).user("no-such-user-fleet-agent");
        let r = runner().run(&spec).unwrap();
        assert_eq!(r.stdout().trim(), accounts::current_uid().to_string());
    }

    #[test]
    fn result_serializes_camel_case() {
        let json = serde_json::to_value(CommandResult::ok("hi")).unwrap();
        assert_eq!(json["exitCode"], 0);
        assert_eq!(json["output"], "hi");
        assert_eq!(json["error"], "");
        assert!(json.get("timedOut").is_none());
    }

    #[test]
    fn display_quotes_arguments() {
        let spec = CommandSpec::argv(["echo", "a b", "c"]);
        assert_eq!(spec.display(), "echo 'a b' c");
    }

    #[test]
    fn mock_runner_records_commands() {
        let runner = MockRunner::with_responses(vec![CommandResult::ok("ok"), CommandResult::ok("ok2")]);
        assert_eq!(runner.run(&CommandSpec::shell("echo hello")).unwrap().stdout(), "ok");
        assert_eq!(runner.run(&CommandSpec::shell("echo world")).unwrap().stdout(), "ok2");
        assert_eq!(runner.executed_commands(), vec!["echo hello", "echo world"]);
    }

    #[test]
    fn mock_runner_rules_take_precedence() {
        let runner = MockRunner::new().on("rpm -q", CommandResult::failed(1, "not installed"));
        let r = runner.run(&CommandSpec::argv(["rpm", "-q", "zip"])).unwrap();
        assert_eq!(r.exit_code, 1);
        runner.set_rule("rpm -q", CommandResult::ok("zip-3.0"));
        assert!(runner.run(&CommandSpec::argv(["rpm", "-q", "zip"])).unwrap().success());
        assert!(runner.run(&CommandSpec::shell("anything")).unwrap().success());
    }
}
