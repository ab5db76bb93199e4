//! Shared value types.

pub mod config;
