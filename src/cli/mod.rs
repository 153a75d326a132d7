//! Command-line interface for jobwarden.
//!
//! Provides commands for checkpoint keys and storage, memory caps, host
//! probing, autoscaling and dependency-driven job submission.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
