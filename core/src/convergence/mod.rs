//! Retry and recovery policies used while converging.
//!
//! The `retry` module provides retry policies with backoff, used for
//! resource `tries`/`try_sleep` and coordinator connection attempts. The
//! `recovery` module bounds how often a crashed tracked process is
//! restarted.

pub mod recovery;
pub mod retry;

pub use recovery::{RecoveryConfig, RecoveryTracker};
pub use retry::RetryPolicy;
