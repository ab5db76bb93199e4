//! Monitoring subsystem: heartbeat coordination and diagnostics.
//!
//! The `heartbeat` module owns the wait protocol between cycles, signal
//! routing and the coordinator connectivity check.
//! The `diagnostics` module keeps the agent's counters and writes the
//! on-request diagnostics dump.

pub mod diagnostics;
pub mod heartbeat;

pub use diagnostics::{AgentCounters, DiagnosticsSnapshot};
pub use heartbeat::{ConnectivityProbe, Event, HeartbeatCoordinator, TcpProbe, WaitOutcome};
