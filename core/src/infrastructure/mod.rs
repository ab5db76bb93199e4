//! Operating-system plumbing: command execution, process supervision,
//! interprocess locking and account lookups.
//!
//! Providers reach the OS only through [`runner::CommandRunner`], so tests
//! can swap in [`runner::MockRunner`] and assert on the command lines.

pub mod accounts;
pub mod lock;
pub mod runner;
pub mod supervisor;

pub use lock::FileBasedProcessLock;
pub use runner::{CommandResult, CommandRunner, CommandSpec, MockRunner, ProcessRunner, Program};
pub use supervisor::{kill_tree, ProcessSupervisor, TrackedStatus};
