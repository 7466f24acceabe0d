//! CLI module for the stackdiff tool.
//!
//! This module provides the command-line interface for validating, planning
//! and applying stacks.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
