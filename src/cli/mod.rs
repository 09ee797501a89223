//! Command-line interface for memo-forge.
//!
//! Provides commands for running task batches and inspecting the response
//! cache.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
