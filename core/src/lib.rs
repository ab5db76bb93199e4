//! Fleet agent core.
//!
//! The agent receives ordered batches of declarative resources from a
//! coordinator and converges the local machine to match them, supervises
//! the background processes it starts, and heartbeats between cycles.
//!
//! - [`resource`] and [`provider`]: resource kinds, their schemas and the
//!   providers that converge them, resolved per OS family.
//! - [`environment`]: ordered collection and sequential execution of one
//!   batch of resources.
//! - [`config`] and [`format`]: the immutable, secret-aware configuration
//!   dictionary and template rendering.
//! - [`infrastructure`]: command execution, process supervision, locking.
//! - [`monitor`] and [`daemon`]: heartbeat wait protocol, signals,
//!   diagnostics and the main loop.

pub mod command;
pub mod config;
pub mod context;
pub mod convergence;
pub mod daemon;
pub mod environment;
pub mod error;
pub mod format;
pub mod infrastructure;
pub mod logging;
pub mod monitor;
pub mod platform;
pub mod provider;
pub mod resource;
pub mod types;

pub use error::{AgentError, Result};
