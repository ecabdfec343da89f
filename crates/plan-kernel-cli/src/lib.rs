//! Command surface for the plan kernel.
//!
//! Hosts embed it through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`tools::dispatch`] / [`tools::dispatch_json`] for the JSON tool
//!   envelope against an open [`SqlitePlanStore`].
//!
//! Everything machine-readable goes to stdout as JSON; logs go to stderr.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use plan_kernel_core::config::stale_threshold;
use plan_kernel_core::{KernelConfig, PlanId, ProgramId, WorkspaceId};
use plan_kernel_store_sqlite::{SqlitePlanStore, StoreContext};
use serde::Serialize;
use serde_json::json;
use tracing::debug;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub mod tools;

#[cfg(test)]
mod test_support;

#[derive(Debug, Parser)]
#[command(name = "pk")]
#[command(about = "Plan Kernel CLI")]
pub struct Cli {
    #[arg(long, default_value = "./plan_kernel.sqlite3")]
    db: PathBuf,

    /// JSON configuration file; every field is optional.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Migrate,
    Tool(ToolArgs),
    Workspace {
        #[command(subcommand)]
        command: WorkspaceCommand,
    },
    Plan {
        #[command(subcommand)]
        command: PlanCommand,
    },
    Program {
        #[command(subcommand)]
        command: ProgramCommand,
    },
    Sessions {
        #[command(subcommand)]
        command: SessionsCommand,
    },
    Events {
        #[command(subcommand)]
        command: EventsCommand,
    },
}

#[derive(Debug, Args)]
pub struct ToolArgs {
    /// Request JSON; read from stdin when omitted.
    #[arg(long)]
    request: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum WorkspaceCommand {
    Register(WorkspaceRegisterArgs),
    List,
}

#[derive(Debug, Args)]
pub struct WorkspaceRegisterArgs {
    #[arg(long)]
    path: String,
    #[arg(long)]
    name: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum PlanCommand {
    Show(PlanShowArgs),
    List(PlanListArgs),
}

#[derive(Debug, Args)]
pub struct PlanShowArgs {
    #[arg(long)]
    plan_id: String,
}

#[derive(Debug, Args)]
pub struct PlanListArgs {
    #[arg(long)]
    workspace_id: String,
    #[arg(long)]
    include_archived: bool,
}

#[derive(Debug, Subcommand)]
pub enum ProgramCommand {
    Show(ProgramShowArgs),
}

#[derive(Debug, Args)]
pub struct ProgramShowArgs {
    #[arg(long)]
    program_id: String,
}

#[derive(Debug, Subcommand)]
pub enum SessionsCommand {
    Sweep(SessionsSweepArgs),
}

#[derive(Debug, Args)]
pub struct SessionsSweepArgs {
    /// Overrides `stale_session_minutes` from the configuration.
    #[arg(long)]
    stale_after_minutes: Option<i64>,
}

#[derive(Debug, Subcommand)]
pub enum EventsCommand {
    List(EventsListArgs),
}

#[derive(Debug, Args)]
pub struct EventsListArgs {
    #[arg(long)]
    plan_id: Option<String>,
    #[arg(long, default_value_t = 0)]
    after_seq: i64,
    #[arg(long, default_value_t = 100)]
    limit: usize,
}

/// Installs the stderr log subscriber. `RUST_LOG` wins over `verbose`.
pub fn init_logging(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let installed = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| fallback.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
    if installed.is_err() {
        debug!("tracing subscriber already installed");
    }
}

/// Reads the `--config` file, or falls back to defaults.
///
/// # Errors
/// Returns an error when the file cannot be read, is not JSON, or holds
/// out-of-range values.
pub fn load_config(path: Option<&Path>) -> Result<KernelConfig> {
    let Some(path) = path else {
        return Ok(KernelConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("config file {} is not valid JSON", path.display()))?;
    Ok(KernelConfig::from_json(&value)?)
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when configuration, store open, migration, or a direct
/// command fails. Tool requests report failures inside their envelope
/// instead.
pub fn run_cli(cli: Cli) -> Result<()> {
    init_logging(cli.verbose);
    let config = load_config(cli.config.as_deref())?;
    let context = StoreContext::new(cli.db.clone(), config)?;
    let mut store = context.connect()?;
    let applied = store.migrate()?;
    if !applied.is_empty() {
        debug!(?applied, db = %cli.db.display(), "applied migrations");
    }

    match cli.command {
        Command::Migrate => {
            let migrations = store.applied_migrations()?;
            print_json(&json!({ "applied_now": applied, "migrations": migrations }))
        }
        Command::Tool(args) => run_tool(args, &mut store),
        Command::Workspace { command } => run_workspace(command, &mut store),
        Command::Plan { command } => run_plan(command, &store),
        Command::Program { command } => run_program(command, &store),
        Command::Sessions { command } => run_sessions(command, &mut store),
        Command::Events { command } => run_events(command, &store),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_tool(args: ToolArgs, store: &mut SqlitePlanStore) -> Result<()> {
    let raw = match args.request {
        Some(raw) => raw,
        None => {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .context("failed to read tool request from stdin")?;
            buffer
        }
    };
    print_json(&tools::dispatch_json(store, &raw))
}

fn run_workspace(command: WorkspaceCommand, store: &mut SqlitePlanStore) -> Result<()> {
    match command {
        WorkspaceCommand::Register(args) => {
            print_json(&store.register_workspace(&args.path, args.name.as_deref())?)
        }
        WorkspaceCommand::List => print_json(&store.list_workspaces()?),
    }
}

fn run_plan(command: PlanCommand, store: &SqlitePlanStore) -> Result<()> {
    match command {
        PlanCommand::Show(args) => print_json(&store.get_plan(&PlanId::from(args.plan_id))?),
        PlanCommand::List(args) => print_json(
            &store.list_plans(&WorkspaceId::from(args.workspace_id.as_str()), args.include_archived)?,
        ),
    }
}

fn run_program(command: ProgramCommand, store: &SqlitePlanStore) -> Result<()> {
    match command {
        ProgramCommand::Show(args) => {
            print_json(&store.get_program(&ProgramId::from(args.program_id))?)
        }
    }
}

fn run_sessions(command: SessionsCommand, store: &mut SqlitePlanStore) -> Result<()> {
    match command {
        SessionsCommand::Sweep(args) => {
            let threshold = match args.stale_after_minutes {
                Some(minutes) => stale_threshold(minutes)?,
                None => store.config().stale_session_after(),
            };
            let flagged = store.sweep_stale_sessions(threshold)?;
            print_json(&json!({ "flagged": flagged }))
        }
    }
}

fn run_events(command: EventsCommand, store: &SqlitePlanStore) -> Result<()> {
    match command {
        EventsCommand::List(args) => {
            let plan_id = args.plan_id.map(PlanId::from);
            print_json(&store.list_events(plan_id.as_ref(), args.after_seq, args.limit)?)
        }
    }
}
