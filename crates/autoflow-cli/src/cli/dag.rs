//! CLI Dag management subcommands.
//!
//! Provides register, list, show and run operations for Dag definitions.
//! Definitions are read from YAML or JSON files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use autoflow_core::repository::store::Store;
use autoflow_types::dag::{Dag, DagStatus, Trigger};

use crate::state::AppState;

/// Dag management subcommands.
#[derive(Subcommand)]
pub enum DagCommand {
    /// Register (or update) a Dag from a YAML or JSON file.
    Register {
        /// Path to the definition file.
        file: PathBuf,
    },

    /// List registered Dags.
    List,

    /// Show one Dag definition.
    #[command(disable_version_flag = true)]
    Show {
        /// Dag ID.
        id: String,

        /// Show a pinned version instead of the latest definition.
        #[arg(long)]
        version: Option<String>,
    },

    /// Run a Dag: create a persisted instance ready to be booted.
    Run {
        /// Dag ID.
        id: String,

        /// Run variable as key=value (repeatable).
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, String)>,

        /// Trigger kind recorded on the instance.
        #[arg(long, default_value = "manually")]
        trigger: Trigger,
    },
}

/// Handle a Dag subcommand.
pub async fn handle_dag_command(cmd: DagCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        DagCommand::Register { file } => handle_register(&file, state, json).await,
        DagCommand::List => handle_list(state, json).await,
        DagCommand::Show { id, version } => handle_show(&id, version.as_deref(), state, json).await,
        DagCommand::Run { id, vars, trigger } => handle_run(&id, vars, trigger, state, json).await,
    }
}

/// Parse a `key=value` run variable. The value may itself contain `=`.
pub fn parse_var(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("invalid variable '{s}', expected key=value")),
    }
}

/// Parse a Dag definition. `.json` files are JSON, anything else is YAML.
pub fn parse_definition(path: &Path, content: &str) -> Result<Dag> {
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));

    let dag: Dag = if is_json {
        serde_json::from_str(content).context("invalid JSON Dag definition")?
    } else {
        serde_yaml_ng::from_str(content).context("invalid YAML Dag definition")?
    };

    if dag.id.is_empty() {
        bail!("Dag definition has no id");
    }
    if dag.steps.is_empty() {
        bail!("Dag '{}' has no steps; the first step must be its trigger", dag.id);
    }
    Ok(dag)
}

async fn handle_register(file: &Path, state: &AppState, json: bool) -> Result<()> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let mut dag = parse_definition(file, &content)?;

    // Every registration is a new addressable version.
    dag.version_id = autoflow_types::new_id();
    dag.updated_at = Utc::now();
    if let Some(existing) = state.store.get_dag(&dag.id, None).await? {
        dag.created_at = existing.created_at;
    }

    state.store.save_dag(&dag).await?;

    if json {
        let result = serde_json::json!({
            "id": dag.id,
            "name": dag.name,
            "version_id": dag.version_id,
            "steps": dag.steps.len(),
        });
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!();
        println!(
            "  {} Registered Dag '{}' ({} steps)",
            style("ok").green(),
            style(&dag.name).cyan(),
            dag.steps.len(),
        );
        println!("     ID:      {}", style(&dag.id).dim());
        println!("     Version: {}", style(&dag.version_id).dim());
        println!();
    }

    Ok(())
}

async fn handle_list(state: &AppState, json: bool) -> Result<()> {
    let dags = state.store.list_dags().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&dags)?);
        return Ok(());
    }

    if dags.is_empty() {
        println!();
        println!("  {} No Dags registered.", style("i").blue().bold());
        println!("     Register one with: autoflow dag register <file>");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("ID").fg(Color::White),
        Cell::new("Name").fg(Color::White),
        Cell::new("Status").fg(Color::White),
        Cell::new("Steps").fg(Color::White),
        Cell::new("Updated").fg(Color::White),
    ]);

    for dag in &dags {
        let status = match dag.status {
            DagStatus::Normal => Cell::new("normal").fg(Color::Green),
            DagStatus::Stopped => Cell::new("stopped").fg(Color::Red),
        };
        table.add_row(vec![
            Cell::new(&dag.id).fg(Color::Cyan),
            Cell::new(&dag.name),
            status,
            Cell::new(dag.steps.len()),
            Cell::new(dag.updated_at.format("%Y-%m-%d %H:%M").to_string()).fg(Color::DarkGrey),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

async fn handle_show(id: &str, version: Option<&str>, state: &AppState, json: bool) -> Result<()> {
    let Some(dag) = state.store.get_dag(id, version).await? else {
        match version {
            Some(v) => bail!("Dag '{id}' has no version '{v}'"),
            None => bail!("Dag '{id}' not found"),
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&dag)?);
        return Ok(());
    }

    println!();
    println!("  {} ({})", style(&dag.name).cyan().bold(), style(&dag.id).dim());
    println!("     Version:  {}", dag.version_id);
    println!("     Owner:    {}", dag.user_id);
    println!("     Trigger:  {}", dag.trigger);
    if dag.is_debug {
        println!("     Debug:    {}", style("yes").yellow());
    }
    println!();

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("#").fg(Color::White),
        Cell::new("Step").fg(Color::White),
        Cell::new("Title").fg(Color::White),
        Cell::new("Operator").fg(Color::White),
    ]);
    for (i, step) in dag.steps.iter().enumerate() {
        table.add_row(vec![
            Cell::new(i),
            Cell::new(&step.id).fg(Color::Cyan),
            Cell::new(&step.title),
            Cell::new(&step.operator).fg(Color::DarkGrey),
        ]);
    }
    println!("{table}");
    println!();
    Ok(())
}

async fn handle_run(
    id: &str,
    vars: Vec<(String, String)>,
    trigger: Trigger,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let vars: HashMap<String, String> = vars.into_iter().collect();
    let ins = state.engine.start_dag(id, trigger, vars).await?;

    if json {
        let result = serde_json::json!({
            "id": ins.id,
            "dag_id": ins.dag_id,
            "status": ins.status.as_str(),
            "priority": ins.priority,
        });
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!();
        println!(
            "  {} Created instance {} of Dag '{}'",
            style("ok").green(),
            style(&ins.id).cyan(),
            style(&ins.dag_id).cyan(),
        );
        println!("     Status:   {}", ins.status);
        println!("     Priority: {}", ins.priority);
        println!();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_var() {
        assert_eq!(
            parse_var("folder=/tmp/a=b").unwrap(),
            ("folder".to_string(), "/tmp/a=b".to_string())
        );
        assert_eq!(parse_var("empty=").unwrap(), ("empty".to_string(), String::new()));
        assert!(parse_var("novalue").is_err());
        assert!(parse_var("=x").is_err());
    }

    #[test]
    fn test_parse_yaml_definition() {
        let yaml = r#"
id: nightly
name: Nightly sync
user_id: user-1
steps:
  - id: trigger
    title: Start
    operator: "@trigger/manual"
  - id: copy
    title: Copy files
    operator: "@internal/echo"
    parameters:
      path: "{{folder}}"
"#;
        let dag = parse_definition(Path::new("nightly.yaml"), yaml).unwrap();
        assert_eq!(dag.id, "nightly");
        assert_eq!(dag.steps.len(), 2);
        assert_eq!(dag.steps[1].operator, "@internal/echo");
        assert_eq!(dag.status, DagStatus::Normal);
    }

    #[test]
    fn test_parse_json_definition() {
        let json = r#"{"id":"d","name":"D","steps":[{"id":"t","operator":"@trigger/cron"}]}"#;
        let dag = parse_definition(Path::new("d.JSON"), json).unwrap();
        assert_eq!(dag.steps[0].operator, "@trigger/cron");
    }

    #[test]
    fn test_definition_without_steps_is_rejected() {
        let err = parse_definition(Path::new("d.yaml"), "id: d\nname: D\n").unwrap_err();
        assert!(err.to_string().contains("no steps"));
    }
}
