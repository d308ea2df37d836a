//! CLI audit log subcommands.

use anyhow::Result;
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use autoflow_types::audit::AuditOperation;

use crate::state::AppState;

/// Audit log subcommands.
#[derive(Subcommand)]
pub enum AuditCommand {
    /// Show the most recent run audit entries.
    List {
        /// Maximum number of entries to show.
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

/// Handle an audit subcommand.
pub async fn handle_audit_command(cmd: AuditCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        AuditCommand::List { limit } => handle_list(limit, state, json).await,
    }
}

async fn handle_list(limit: u32, state: &AppState, json: bool) -> Result<()> {
    let entries = state.audit.list_recent(limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!();
        println!("  {} No audit entries yet.", style("i").blue().bold());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Time").fg(Color::White),
        Cell::new("Op").fg(Color::White),
        Cell::new("User").fg(Color::White),
        Cell::new("Description").fg(Color::White),
    ]);

    for entry in &entries {
        let op = match entry.operation {
            AuditOperation::Start => Cell::new("start").fg(Color::Cyan),
            AuditOperation::End => Cell::new("end").fg(Color::Green),
        };
        let user = if entry.user.name.is_empty() {
            &entry.user.id
        } else {
            &entry.user.name
        };
        table.add_row(vec![
            Cell::new(entry.created_at.format("%Y-%m-%d %H:%M:%S").to_string()).fg(Color::DarkGrey),
            op,
            Cell::new(user),
            Cell::new(&entry.description),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}
