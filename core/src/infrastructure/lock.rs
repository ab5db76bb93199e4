//! Interprocess mutual exclusion through `flock(2)`.
//!
//! The lock is bound to an open descriptor on a well-known path, so the
//! kernel drops it when the holder exits, however it exits. The lock file
//! itself is left in place on release: removing it would let a newcomer lock
//! a fresh inode while a waiter still blocks on the old one.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{AgentError, Result};

#[derive(Debug)]
pub struct FileBasedProcessLock {
    path: PathBuf,
    file: Option<File>,
}

impl FileBasedProcessLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileBasedProcessLock {
            path: path.into(),
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    fn open(&self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AgentError::path(parent, e))?;
        }
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)
            .map_err(|e| AgentError::path(&self.path, e))
    }

    /// Block until the lock is granted. A no-op if already held.
    pub fn acquire(&mut self) -> Result<()> {
        if self.is_held() {
            return Ok(());
        }
        let file = self.open()?;
        loop {
            // SAFETY: the descriptor is owned by `file` and stays open.
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc == 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(AgentError::path(&self.path, err));
            }
        }
        debug!(path = %self.path.display(), "lock acquired");
        self.file = Some(file);
        Ok(())
    }

    /// Take the lock if it is free. Returns whether it is now held.
    pub fn try_acquire(&mut self) -> Result<bool> {
        if self.is_held() {
            return Ok(true);
        }
        let file = self.open()?;
        // SAFETY: as in `acquire`.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EWOULDBLOCK) => Ok(false),
                _ => Err(AgentError::path(&self.path, err)),
            };
        }
        self.file = Some(file);
        Ok(true)
    }

    /// Unlock and close. Releasing an unheld lock is a no-op.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            // SAFETY: as in `acquire`; closing the file would release it too.
            unsafe {
                libc::flock(file.as_raw_fd(), libc::LOCK_UN);
            }
            debug!(path = %self.path.display(), "lock released");
        }
    }
}

impl Drop for FileBasedProcessLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn second_holder_is_excluded_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.lock");
        let mut a = FileBasedProcessLock::new(&path);
        let mut b = FileBasedProcessLock::new(&path);

        a.acquire().unwrap();
        assert!(a.is_held());
        assert!(!b.try_acquire().unwrap());

        a.release();
        assert!(!a.is_held());
        assert!(b.try_acquire().unwrap());
        assert!(path.exists());
    }

    #[test]
    fn acquire_blocks_until_holder_drops() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.lock");
        let mut first = FileBasedProcessLock::new(&path);
        first.acquire().unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter_path = path.clone();
        let handle = thread::spawn(move || {
            let mut second = FileBasedProcessLock::new(waiter_path);
            second.acquire().unwrap();
            tx.send(()).unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        drop(first);
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        handle.join().unwrap();
    }

    #[test]
    fn lock_is_released_when_holder_process_dies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.lock");
        // flock(1) holds the lock in a child that is then killed.
        let mut holder = std::process::Command::new("sh")
            .arg("-c")
            .arg(format!("exec 9>{}; flock 9; exec sleep 30", path.display()))
            .spawn()
            .unwrap();
        let mut ours = FileBasedProcessLock::new(&path);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            if !ours.try_acquire().unwrap() {
                break;
            }
            ours.release();
            thread::sleep(Duration::from_millis(20));
        }
        holder.kill().unwrap();
        holder.wait().unwrap();
        assert!(ours.try_acquire().unwrap());
    }
}
