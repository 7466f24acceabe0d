//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// stackdiff - Declarative infrastructure stacks.
#[derive(Parser, Debug)]
#[command(name = "stackdiff")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the stack file.
    #[arg(short, long, global = true, env = "STACKDIFF_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit log lines as JSON.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a starter stack file.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Build and validate the declared graph.
    Validate,

    /// Show the dependency graph in apply order.
    Graph,

    /// Show the change plan against the applied state.
    Plan {
        /// Show property-level changes.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Apply the change plan.
    Apply {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Attempts per operation for retryable errors.
        #[arg(long, default_value = "3")]
        max_attempts: u32,
    },

    /// Delete every resource of the stack.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Inspect or manage the applied state.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show the applied state.
    Show,

    /// Lock the stack.
    Lock {
        /// Lock holder identifier.
        #[arg(long)]
        holder: Option<String>,
    },

    /// Unlock the stack.
    Unlock {
        /// Lock ID to release.
        #[arg(long)]
        lock_id: Option<String>,

        /// Remove the lock whoever holds it.
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_apply() {
        let cli = Cli::try_parse_from(["stackdiff", "-c", "infra/blog.yaml", "apply", "--yes", "--max-attempts", "5"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("infra/blog.yaml")));
        assert!(matches!(cli.command, Commands::Apply { yes: true, max_attempts: 5 }));
    }

    #[test]
    fn test_parse_state_unlock() {
        let cli = Cli::try_parse_from(["stackdiff", "--output", "json", "state", "unlock", "--force"]).unwrap();
        assert!(matches!(cli.output, OutputFormat::Json));
        assert!(matches!(
            cli.command,
            Commands::State { command: StateCommands::Unlock { lock_id: None, force: true } }
        ));
    }

    #[test]
    fn test_verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
