//! Command-line interface for avai-dispatch.
//!
//! Provides the long-running `monitor` and `bridge` services plus operator
//! commands for status, triggers, queueing and canister operations.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
