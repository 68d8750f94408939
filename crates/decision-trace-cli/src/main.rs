use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use decision_trace_domain::ExecutionId;
use decision_trace_interpreter::{InterpreterConfig, WorkflowInterpreter};
use decision_trace_rules::{RuleSet, RuleSource};
use decision_trace_trace_core::TraceStore;
use decision_trace_trace_sqlite::SqliteTraceStore;
use decision_trace_workflow::{load_dataset_from_path, load_workflow_from_path};
use serde::Serialize;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dtrace")]
#[command(about = "Run declarative decision workflows and inspect their SQLite traces")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Run(RunArgs),
    Show(ShowArgs),
    List(ListArgs),
    Delete(ShowArgs),
    Rules(RulesArgs),
    Workflow(WorkflowArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    workflow: PathBuf,
    #[arg(long)]
    dataset: PathBuf,
    #[arg(long)]
    name: Option<String>,
}

#[derive(Debug, Args)]
struct ShowArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long)]
    db: PathBuf,
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

#[derive(Debug, Args)]
struct RulesArgs {
    #[arg(long)]
    rules: String,
    #[arg(long)]
    step: Option<String>,
}

#[derive(Debug, Args)]
struct WorkflowArgs {
    #[command(subcommand)]
    command: WorkflowSubcommand,
}

#[derive(Debug, Subcommand)]
enum WorkflowSubcommand {
    Save {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        workflow: PathBuf,
    },
    Get {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        id: String,
    },
    List {
        #[arg(long)]
        db: PathBuf,
    },
    Delete {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        id: String,
    },
}

fn main() -> Result<()> {
    init_tracing("warn");
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_command(args),
        Commands::Show(args) => show_command(&args),
        Commands::List(args) => list_command(&args),
        Commands::Delete(args) => delete_command(&args),
        Commands::Rules(args) => rules_command(&args),
        Commands::Workflow(args) => workflow_command(args),
    }
}

/// Logs go to stderr so stdout stays machine-readable JSON.
fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_env("RUST_LOG")
        .or_else(|_| EnvFilter::try_from_env("LOG_LEVEL"))
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn open_store(db: &Path) -> Result<SqliteTraceStore> {
    let store = SqliteTraceStore::open(db)?;
    store.migrate()?;
    Ok(store)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_command(args: RunArgs) -> Result<()> {
    let workflow = load_workflow_from_path(&args.workflow)?;
    let dataset = load_dataset_from_path(&args.dataset)?;
    let store = open_store(&args.db)?;

    let interpreter = WorkflowInterpreter::new(
        Some(&store as &dyn TraceStore),
        InterpreterConfig {
            execution_name: args.name,
            auto_persist: true,
        },
    );
    let run = interpreter.execute(&workflow.definition, &dataset)?;
    info!(
        execution_id = %run.execution.id,
        workflow_hash = %workflow.workflow_hash,
        "workflow run recorded"
    );

    print_json(&json!({
        "execution_id": run.execution.id,
        "name": run.execution.name,
        "steps": run.execution.steps.len(),
        "rows_in": dataset.len(),
        "rows_out": run.rows.len(),
        "workflow_hash": workflow.workflow_hash,
    }))
}

fn show_command(args: &ShowArgs) -> Result<()> {
    let store = open_store(&args.db)?;
    let execution_id = ExecutionId::from(args.id.as_str());
    let execution = store
        .get_execution(&execution_id)?
        .ok_or_else(|| anyhow!("execution not found: {execution_id}"))?;
    print_json(&execution)
}

fn list_command(args: &ListArgs) -> Result<()> {
    let store = open_store(&args.db)?;
    print_json(&store.list_executions(args.limit)?)
}

fn delete_command(args: &ShowArgs) -> Result<()> {
    let store = open_store(&args.db)?;
    store.delete_execution(&ExecutionId::from(args.id.as_str()))?;
    print_json(&json!({"deleted": args.id}))
}

fn rules_command(args: &RulesArgs) -> Result<()> {
    let source = RuleSource::detect(&args.rules);
    let rules = RuleSet::load(&source);
    let step = args.step.as_deref();
    print_json(&json!({
        "source": source.kind().as_str(),
        "rules": rules.rules(),
        "filters": rules.filters(step),
        "ranking_criteria": rules.ranking_criteria(step),
    }))
}

fn workflow_command(args: WorkflowArgs) -> Result<()> {
    match args.command {
        WorkflowSubcommand::Save { db, workflow } => {
            let normalized = load_workflow_from_path(&workflow)?;
            let store = open_store(&db)?;
            store.save_workflow(&normalized.definition)?;
            print_json(&json!({
                "workflow_id": normalized.definition.workflow_id,
                "workflow_hash": normalized.workflow_hash,
                "steps": normalized.definition.steps.len(),
                "warnings": normalized.warnings,
            }))
        }
        WorkflowSubcommand::Get { db, id } => {
            let store = open_store(&db)?;
            let workflow = store
                .get_workflow(&id)?
                .ok_or_else(|| anyhow!("workflow not found: {id}"))?;
            print_json(&workflow)
        }
        WorkflowSubcommand::List { db } => {
            let store = open_store(&db)?;
            print_json(&store.list_workflows()?)
        }
        WorkflowSubcommand::Delete { db, id } => {
            let store = open_store(&db)?;
            store.delete_workflow(&id)?;
            print_json(&json!({"deleted": id}))
        }
    }
}
