use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fleet_agent_core::infrastructure::supervisor::{descendants, is_alive};
use fleet_agent_core::infrastructure::{kill_tree, CommandSpec, FileBasedProcessLock, ProcessSupervisor};

// --- Helpers ---

fn wait_for<F: Fn() -> bool>(limit: Duration, f: F) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    f()
}

// --- Tree kill ---

#[test]
fn kill_tree_takes_out_background_children() {
    let mut child = Command::new("sh")
        .args(["-c", "sleep 999 & sleep 999 & wait"])
        .stdout(Stdio::null())
        .spawn()
        .unwrap();
    let root = child.id();

    assert!(wait_for(Duration::from_secs(5), || descendants(root).len() >= 2));
    let kids = descendants(root);

    assert!(kill_tree(root, Duration::from_millis(500)));
    let _ = child.wait();
    for pid in kids {
        assert!(!is_alive(pid), "descendant {} survived", pid);
    }
}

#[test]
fn kill_tree_of_exited_process_succeeds() {
    let mut child = Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    assert!(kill_tree(pid, Duration::from_millis(100)));
}

// --- Supervisor ---

#[test]
fn supervisor_tracks_and_stops_a_service() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Arc::new(ProcessSupervisor::new(dir.path(), Duration::from_millis(300)).unwrap());

    let pid = supervisor
        .start_tracked("sleeper", &CommandSpec::shell("exec sleep 30"))
        .unwrap();
    assert!(supervisor.is_running("sleeper"));
    assert_eq!(supervisor.running_pid("sleeper"), Some(pid));
    assert!(supervisor.pid_file("sleeper").exists());

    assert!(supervisor.terminate("sleeper").unwrap());
    assert!(wait_for(Duration::from_secs(2), || !is_alive(pid)));
    assert!(!supervisor.is_running("sleeper"));
}

// --- Lock ---

#[test]
fn lock_is_exclusive_between_handles() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("batch.lock");

    let mut held = FileBasedProcessLock::new(&path);
    held.acquire().unwrap();
    assert!(held.is_held());

    let mut other = FileBasedProcessLock::new(&path);
    assert!(!other.try_acquire().unwrap());

    held.release();
    assert!(other.try_acquire().unwrap());
    other.release();
}
