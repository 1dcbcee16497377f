// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::types::ExecutionId;

/// Command-line arguments for `wesflow`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "wesflow",
    version,
    about = "Drive workflow runs on a WES execution service from launch to cleanup.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Wesflow.toml` in the current working directory. A missing
    /// default file means "use built-in defaults".
    #[arg(long, global = true, value_name = "PATH", default_value = "Wesflow.toml")]
    pub config: String,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `WESFLOW_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Create an execution from a workflow description and queue its preparation.
    Launch {
        /// JSON file describing the workflow, its parameters and samples.
        #[arg(long, value_name = "FILE")]
        workflow: PathBuf,

        /// Requester recorded on the execution (defaults to `$USER`).
        #[arg(long)]
        owner: Option<String>,

        /// Human readable name for the execution.
        #[arg(long)]
        name: Option<String>,

        /// Sample identifier the run is launched against (repeatable).
        #[arg(long = "sample", value_name = "ID")]
        samples: Vec<String>,

        /// Keep processing jobs until the queue drains.
        #[arg(long)]
        wait: bool,
    },

    /// Process queued jobs until Ctrl-C.
    Run {
        /// Exit as soon as no job is pending or in flight.
        #[arg(long)]
        once: bool,
    },

    /// Request cancellation of an execution.
    Cancel {
        id: ExecutionId,

        /// Keep processing jobs until the queue drains.
        #[arg(long)]
        wait: bool,
    },

    /// Print the state snapshot of one execution as JSON.
    Status { id: ExecutionId },

    /// Print the state snapshots of all executions as JSON.
    List,

    /// Parse + validate the config and print the effective settings.
    Check,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
