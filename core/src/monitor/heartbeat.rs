//! Heartbeat coordination: the dual-event wait, signal routing and the
//! connectivity probe used before talking to the coordinator.
//!
//! `wait(timeout1, timeout2)` first blocks on the heartbeat event. If that
//! phase times out it blocks again on the stop event, giving work already in
//! flight a bounded window to finish before the agent stops. Neither wait is
//! ever unbounded.

use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::convergence::retry::RetryPolicy;
use crate::error::{AgentError, Result};

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A manually reset flag threads can block on.
#[derive(Debug, Default)]
pub struct Event {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Event::default()
    }

    pub fn set(&self) {
        *self.flag.lock() = true;
        self.cond.notify_all();
    }

    pub fn clear(&self) {
        *self.flag.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.flag.lock()
    }

    /// Block until set or `timeout` elapses. Returns whether it was set.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut flag = self.flag.lock();
        while !*flag {
            if self.cond.wait_until(&mut flag, deadline).timed_out() {
                break;
            }
        }
        *flag
    }
}

// ---------------------------------------------------------------------------
// WaitOutcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Heartbeat requested within the first phase.
    Proceed,
    /// Stop requested during the grace phase.
    Stop,
    /// Both phases elapsed. The caller proceeds anyway.
    TimedOut,
}

impl WaitOutcome {
    pub fn code(self) -> i32 {
        match self {
            WaitOutcome::Proceed => 0,
            WaitOutcome::Stop => 1,
            WaitOutcome::TimedOut => -1,
        }
    }
}

// ---------------------------------------------------------------------------
// Connectivity
// ---------------------------------------------------------------------------

/// Something that can tell whether the coordinator is reachable.
pub trait ConnectivityProbe {
    fn target(&self) -> String;
    fn probe(&self) -> Result<()>;
}

/// TCP connect to `host:port`.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    addr: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        TcpProbe {
            addr: addr.into(),
            timeout,
        }
    }

    /// Host and port from a URL such as `https://coordinator:8441/agent`.
    /// The port defaults from the scheme.
    pub fn from_url(url: &str) -> Result<TcpProbe> {
        let (scheme, rest) = url.split_once("://").unwrap_or(("http", url));
        let authority = rest.split('/').next().unwrap_or_default();
        let authority = authority.rsplit('@').next().unwrap_or(authority);
        if authority.is_empty() {
            return Err(AgentError::config(format!("no host in coordinator url '{}'", url)));
        }
        let has_port = match authority.rfind(':') {
            Some(i) => !authority[i..].contains(']'),
            None => false,
        };
        let addr = if has_port {
            authority.to_string()
        } else {
            let port = match scheme {
                "https" => 443,
                "http" => 80,
                other => {
                    return Err(AgentError::config(format!(
                        "no port in coordinator url '{}' and no default for scheme '{}'",
                        url, other
                    )))
                }
            };
            format!("{}:{}", authority, port)
        };
        Ok(TcpProbe::new(addr, Duration::from_secs(5)))
    }
}

impl ConnectivityProbe for TcpProbe {
    fn target(&self) -> String {
        self.addr.clone()
    }

    fn probe(&self) -> Result<()> {
        let addrs = self
            .addr
            .to_socket_addrs()
            .map_err(|e| AgentError::execution(format!("cannot resolve {}: {}", self.addr, e)))?;
        let mut last = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(_) => return Ok(()),
                Err(e) => last = Some(e),
            }
        }
        Err(AgentError::execution(match last {
            Some(e) => format!("cannot connect to {}: {}", self.addr, e),
            None => format!("{} resolved to no addresses", self.addr),
        }))
    }
}

// ---------------------------------------------------------------------------
// HeartbeatCoordinator
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct HeartbeatCoordinator {
    heartbeat_event: Event,
    stop_event: Event,
    diagnostics: AtomicBool,
}

impl HeartbeatCoordinator {
    pub fn new() -> Self {
        HeartbeatCoordinator::default()
    }

    /// Block up to `timeout1` for a heartbeat request, then up to `timeout2`
    /// for a stop request.
    pub fn wait(&self, timeout1: Duration, timeout2: Duration) -> WaitOutcome {
        if self.heartbeat_event.wait(timeout1) {
            self.heartbeat_event.clear();
            return WaitOutcome::Proceed;
        }
        if self.stop_event.wait(timeout2) {
            return WaitOutcome::Stop;
        }
        WaitOutcome::TimedOut
    }

    /// Ask the loop to run its next cycle now.
    pub fn request_heartbeat(&self) {
        self.heartbeat_event.set();
    }

    /// Ask the loop to stop. Also wakes a first-phase wait so the loop sees
    /// the request without sitting out the heartbeat interval.
    pub fn request_stop(&self) {
        self.stop_event.set();
        self.heartbeat_event.set();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_event.is_set()
    }

    /// Sleep up to `timeout`, returning early (with `true`) on stop.
    pub fn sleep_unless_stopped(&self, timeout: Duration) -> bool {
        self.stop_event.wait(timeout)
    }

    pub fn request_diagnostics(&self) {
        self.diagnostics.store(true, Ordering::SeqCst);
    }

    pub fn take_diagnostics_request(&self) -> bool {
        self.diagnostics.swap(false, Ordering::SeqCst)
    }

    /// Route SIGINT/SIGTERM to a stop request and SIGUSR1 to a diagnostics
    /// request. The signals are blocked in the calling thread (and so in
    /// every thread it spawns afterwards) and consumed by a dedicated
    /// `sigwait` thread, so no code runs in signal-handler context. Call
    /// before starting any other thread.
    pub fn install_signal_routing(self: &Arc<Self>) -> Result<()> {
        // SAFETY: sigset_t is plain data initialised by sigemptyset.
        let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
        unsafe {
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, libc::SIGINT);
            libc::sigaddset(&mut set, libc::SIGTERM);
            libc::sigaddset(&mut set, libc::SIGUSR1);
        }
        // SAFETY: `set` is initialised; the old mask is not needed.
        let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) };
        if rc != 0 {
            return Err(std::io::Error::from_raw_os_error(rc).into());
        }

        let me = Arc::clone(self);
        std::thread::Builder::new()
            .name("signals".into())
            .spawn(move || loop {
                let mut sig: libc::c_int = 0;
                // SAFETY: `set` lives in this closure for the thread's life.
                let rc = unsafe { libc::sigwait(&set, &mut sig) };
                if rc != 0 {
                    continue;
                }
                match sig {
                    libc::SIGINT | libc::SIGTERM => {
                        info!(signal = sig, "stop requested by signal");
                        me.request_stop();
                    }
                    libc::SIGUSR1 => {
                        info!("diagnostics requested by signal");
                        me.request_diagnostics();
                    }
                    _ => {}
                }
            })?;
        Ok(())
    }

    /// Probe until it succeeds, `max_retries` attempts have failed (0 means
    /// no limit) or a stop is requested. Sleeps between attempts follow
    /// `policy`. Returns `(attempts_used, success)`.
    pub fn try_to_connect(
        &self,
        probe: &dyn ConnectivityProbe,
        max_retries: u32,
        policy: &RetryPolicy,
    ) -> (u32, bool) {
        let target = probe.target();
        let mut attempts = 0;
        loop {
            attempts += 1;
            match probe.probe() {
                Ok(()) => {
                    info!(target = %target, attempts, "coordinator reachable");
                    return (attempts, true);
                }
                Err(e) => warn!(target = %target, attempt = attempts, error = %e, "coordinator unreachable"),
            }
            if max_retries != 0 && attempts >= max_retries {
                return (attempts, false);
            }
            let delay = policy.delay_for(attempts);
            debug!(?delay, "waiting before next connection attempt");
            if self.sleep_unless_stopped(delay) {
                return (attempts, false);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::thread;

    struct FlakyProbe {
        failures_left: Cell<u32>,
        calls: Cell<u32>,
    }

    impl ConnectivityProbe for FlakyProbe {
        fn target(&self) -> String {
            "flaky".into()
        }

        fn probe(&self) -> Result<()> {
            self.calls.set(self.calls.get() + 1);
            if self.failures_left.get() == 0 {
                return Ok(());
            }
            self.failures_left.set(self.failures_left.get() - 1);
            Err(AgentError::execution("connection refused"))
        }
    }

    fn flaky(failures: u32) -> FlakyProbe {
        FlakyProbe {
            failures_left: Cell::new(failures),
            calls: Cell::new(0),
        }
    }

    fn quick() -> RetryPolicy {
        RetryPolicy::fixed(1, Duration::from_millis(5))
    }

    #[test]
    fn event_wait_times_out_and_wakes() {
        let ev = Arc::new(Event::new());
        assert!(!ev.wait(Duration::from_millis(20)));
        let setter = Arc::clone(&ev);
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            setter.set();
        });
        assert!(ev.wait(Duration::from_secs(5)));
        h.join().unwrap();
        ev.clear();
        assert!(!ev.is_set());
    }

    #[test]
    fn outcome_codes() {
        assert_eq!(WaitOutcome::Proceed.code(), 0);
        assert_eq!(WaitOutcome::Stop.code(), 1);
        assert_eq!(WaitOutcome::TimedOut.code(), -1);
    }

    #[test]
    fn heartbeat_request_is_consumed() {
        let hb = HeartbeatCoordinator::new();
        hb.request_heartbeat();
        assert_eq!(hb.wait(Duration::from_secs(5), Duration::ZERO), WaitOutcome::Proceed);
        let second = hb.wait(Duration::from_millis(10), Duration::from_millis(10));
        assert_eq!(second, WaitOutcome::TimedOut);
    }

    #[test]
    fn connect_succeeds_after_failures() {
        let hb = HeartbeatCoordinator::new();
        let probe = flaky(2);
        assert_eq!(hb.try_to_connect(&probe, 5, &quick()), (3, true));
    }

    #[test]
    fn connect_gives_up_after_max_retries() {
        let hb = HeartbeatCoordinator::new();
        let probe = flaky(10);
        assert_eq!(hb.try_to_connect(&probe, 3, &quick()), (3, false));
        assert_eq!(probe.calls.get(), 3);
    }

    #[test]
    fn unbounded_connect_stops_on_stop_request() {
        let hb = HeartbeatCoordinator::new();
        hb.request_stop();
        let probe = flaky(u32::MAX);
        assert_eq!(hb.try_to_connect(&probe, 0, &quick()), (1, false));
    }

    #[test]
    fn diagnostics_request_is_taken_once() {
        let hb = HeartbeatCoordinator::new();
        assert!(!hb.take_diagnostics_request());
        hb.request_diagnostics();
        assert!(hb.take_diagnostics_request());
        assert!(!hb.take_diagnostics_request());
    }

    #[test]
    fn probe_from_url() {
        assert_eq!(TcpProbe::from_url("https://coord:8441/agent").unwrap().target(), "coord:8441");
        assert_eq!(TcpProbe::from_url("https://coord/agent").unwrap().target(), "coord:443");
        assert_eq!(TcpProbe::from_url("coord:9000").unwrap().target(), "coord:9000");
        assert!(TcpProbe::from_url("ftp://coord").is_err());
        assert!(TcpProbe::from_url("https:///x").is_err());
    }

    #[test]
    fn tcp_probe_against_local_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let probe = TcpProbe::new(addr.to_string(), Duration::from_secs(1));
        assert!(probe.probe().is_ok());
        drop(listener);
        assert!(probe.probe().is_err());
    }
}
