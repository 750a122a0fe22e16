//! CLI module for the `keel` tool.
//!
//! This module provides the command-line interface: argument parsing and
//! rendering of plans, apply reports, drift and state.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, ProviderKind, StateCommands};
pub use output::OutputFormatter;
