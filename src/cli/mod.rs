//! Command-line interface for prompt-relay.
//!
//! Provides commands for serving the queue, submitting and inspecting jobs,
//! probing worker health, and worker administration.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
