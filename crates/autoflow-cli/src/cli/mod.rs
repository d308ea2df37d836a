//! CLI command definitions for the `autoflow` binary.
//!
//! Uses clap derive macros for argument parsing. Commands are grouped by
//! resource (e.g., `autoflow dag run`, `autoflow instance show`).

pub mod audit;
pub mod dag;
pub mod instance;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Register, run and inspect resumable workflows.
#[derive(Parser)]
#[command(name = "autoflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Data directory (defaults to $AUTOFLOW_DATA_DIR or ~/.autoflow).
    #[arg(long, global = true, env = "AUTOFLOW_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Emit log lines as JSON.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage Dag definitions (register, list, show, run).
    Dag {
        #[command(subcommand)]
        action: dag::DagCommand,
    },

    /// Inspect and steer Dag instances (list, show, tasks, cancel, retry).
    #[command(alias = "ins")]
    Instance {
        #[command(subcommand)]
        action: instance::InstanceCommand,
    },

    /// Browse the run audit log.
    Audit {
        #[command(subcommand)]
        action: audit::AuditCommand,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}
