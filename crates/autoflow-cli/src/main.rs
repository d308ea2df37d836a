//! Autoflow CLI entry point.
//!
//! Binary name: `autoflow`
//!
//! Parses CLI arguments, initializes the database and engine, then
//! dispatches to the command handler. Background work (audit entries,
//! webhooks) is drained before the process exits.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;

use autoflow_observe::tracing_setup::{TracingOptions, init_tracing, shutdown_tracing};
use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing based on verbosity
    let default_directive = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,autoflow_core=debug,autoflow_infra=debug",
        _ => "trace",
    };
    let options = TracingOptions {
        enable_otel: cli.otel,
        json: cli.log_json,
        default_directive: default_directive.to_string(),
    };
    if let Err(e) = init_tracing(&options) {
        eprintln!("Warning: failed to initialize tracing: {e}");
    }

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "autoflow", &mut std::io::stdout());
        return Ok(());
    }

    let state = AppState::init(cli.data_dir.clone()).await?;

    let result = match cli.command {
        Commands::Dag { action } => cli::dag::handle_dag_command(action, &state, cli.json).await,
        Commands::Instance { action } => {
            cli::instance::handle_instance_command(action, &state, cli.json).await
        }
        Commands::Audit { action } => {
            cli::audit::handle_audit_command(action, &state, cli.json).await
        }
        Commands::Completions { .. } => Ok(()),
    };

    state.close().await;
    shutdown_tracing();
    result
}
