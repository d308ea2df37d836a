//! CLI instance subcommands: inspect runs and attach cancel/retry commands.

use anyhow::{Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use autoflow_core::repository::store::Store;
use autoflow_types::instance::DagInstanceStatus;
use autoflow_types::task::TaskInstanceStatus;

use crate::state::AppState;

/// Instance subcommands.
#[derive(Subcommand)]
pub enum InstanceCommand {
    /// List instances, newest first.
    List {
        /// Only instances of this Dag.
        #[arg(long)]
        dag: Option<String>,

        /// Maximum number of instances to show.
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },

    /// Show one instance.
    Show {
        /// Instance ID.
        id: String,
    },

    /// List the task records of an instance.
    Tasks {
        /// Instance ID.
        id: String,
    },

    /// Attach a cancel command to a running instance.
    Cancel {
        /// Instance ID.
        id: String,

        /// Task instance to cancel (repeatable). Empty cancels the whole run.
        #[arg(long = "task")]
        tasks: Vec<String>,
    },

    /// Attach a retry command to a failed or blocked instance.
    Retry {
        /// Instance ID.
        id: String,

        /// Task instance to retry (repeatable).
        #[arg(long = "task")]
        tasks: Vec<String>,
    },
}

/// Handle an instance subcommand.
pub async fn handle_instance_command(
    cmd: InstanceCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        InstanceCommand::List { dag, limit } => {
            handle_list(dag.as_deref(), limit, state, json).await
        }
        InstanceCommand::Show { id } => handle_show(&id, state, json).await,
        InstanceCommand::Tasks { id } => handle_tasks(&id, state, json).await,
        InstanceCommand::Cancel { id, tasks } => {
            let ins = state.engine.cancel_dag_ins(&id, tasks).await?;
            print_command_result("Cancel", &ins.id, json)
        }
        InstanceCommand::Retry { id, tasks } => {
            let ins = state.engine.retry_dag_ins(&id, tasks).await?;
            print_command_result("Retry", &ins.id, json)
        }
    }
}

fn status_color(status: DagInstanceStatus) -> Color {
    match status {
        DagInstanceStatus::Init | DagInstanceStatus::Scheduled => Color::DarkGrey,
        DagInstanceStatus::Running => Color::Cyan,
        DagInstanceStatus::Blocked => Color::Yellow,
        DagInstanceStatus::Failed => Color::Red,
        DagInstanceStatus::Success => Color::Green,
        DagInstanceStatus::Canceled => Color::Magenta,
    }
}

fn task_status_color(status: TaskInstanceStatus) -> Color {
    match status {
        TaskInstanceStatus::Success => Color::Green,
        TaskInstanceStatus::Failed => Color::Red,
        TaskInstanceStatus::Blocked | TaskInstanceStatus::Retrying => Color::Yellow,
        TaskInstanceStatus::Running | TaskInstanceStatus::Ending => Color::Cyan,
        TaskInstanceStatus::Canceled | TaskInstanceStatus::Skipped => Color::Magenta,
        TaskInstanceStatus::Init => Color::DarkGrey,
    }
}

async fn handle_list(dag_id: Option<&str>, limit: u32, state: &AppState, json: bool) -> Result<()> {
    let instances = state.store.list_dag_ins(dag_id, limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&instances)?);
        return Ok(());
    }

    if instances.is_empty() {
        println!();
        println!("  {} No instances found.", style("i").blue().bold());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("ID").fg(Color::White),
        Cell::new("Dag").fg(Color::White),
        Cell::new("Status").fg(Color::White),
        Cell::new("Trigger").fg(Color::White),
        Cell::new("Created").fg(Color::White),
    ]);

    for ins in &instances {
        table.add_row(vec![
            Cell::new(&ins.id).fg(Color::Cyan),
            Cell::new(&ins.dag_id),
            Cell::new(ins.status).fg(status_color(ins.status)),
            Cell::new(ins.trigger),
            Cell::new(ins.created_at.format("%Y-%m-%d %H:%M:%S").to_string()).fg(Color::DarkGrey),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

async fn handle_show(id: &str, state: &AppState, json: bool) -> Result<()> {
    let Some(ins) = state.store.get_dag_ins(id).await? else {
        bail!("Instance '{id}' not found");
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&ins)?);
        return Ok(());
    }

    println!();
    println!("  Instance {}", style(&ins.id).cyan().bold());
    println!("     Dag:      {}", ins.dag_id);
    println!(
        "     Status:   {}",
        style(ins.status.as_str()).fg(console_color(ins.status))
    );
    if !ins.reason.is_empty() {
        println!("     Reason:   {}", ins.reason);
    }
    println!("     Trigger:  {}", ins.trigger);
    println!("     Priority: {}", ins.priority);
    println!("     Created:  {}", ins.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(ended) = ins.ended_at {
        println!("     Ended:    {}", ended.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(cmd) = &ins.cmd {
        println!("     Command:  {:?} {:?}", cmd.name, cmd.target_task_ins_ids);
    }
    if ins.dump_ext.is_some() || ins.share_data_ext.is_some() {
        println!("     Offload:  {}", style("yes").dim());
    }

    let vars: Vec<(&str, &str)> = ins.vars_iter().collect();
    if !vars.is_empty() {
        println!();
        println!("  {}", style("Vars").bold());
        for (key, value) in vars {
            println!("     {key} = {value}");
        }
    }
    println!();
    Ok(())
}

async fn handle_tasks(id: &str, state: &AppState, json: bool) -> Result<()> {
    if state.store.get_dag_ins(id).await?.is_none() {
        bail!("Instance '{id}' not found");
    }
    let tasks = state.store.list_task_ins(id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }

    if tasks.is_empty() {
        println!();
        println!("  {} No task records for instance {id}.", style("i").blue().bold());
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Task").fg(Color::White),
        Cell::new("Action").fg(Color::White),
        Cell::new("Status").fg(Color::White),
        Cell::new("Reason").fg(Color::White),
        Cell::new("Updated").fg(Color::White),
    ]);

    for task in &tasks {
        table.add_row(vec![
            Cell::new(&task.task_id).fg(Color::Cyan),
            Cell::new(&task.action_name),
            Cell::new(task.status.as_str()).fg(task_status_color(task.status)),
            Cell::new(&task.reason),
            Cell::new(task.updated_at.format("%H:%M:%S").to_string()).fg(Color::DarkGrey),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn console_color(status: DagInstanceStatus) -> console::Color {
    match status_color(status) {
        Color::Green => console::Color::Green,
        Color::Red => console::Color::Red,
        Color::Yellow => console::Color::Yellow,
        Color::Cyan => console::Color::Cyan,
        Color::Magenta => console::Color::Magenta,
        _ => console::Color::White,
    }
}

fn print_command_result(verb: &str, id: &str, json: bool) -> Result<()> {
    if json {
        let result = serde_json::json!({ "id": id, "command": verb.to_lowercase() });
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!();
        println!(
            "  {} {verb} command attached to instance {}",
            style("ok").green(),
            style(id).cyan(),
        );
        println!();
    }
    Ok(())
}
