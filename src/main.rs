use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "forgeflow")]
#[command(
    version,
    about = "Human-gated development pipeline: research, plan, implement, validate, integrate"
)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Worker command. Overrides forgeflow.toml and FORGEFLOW_WORKER_CMD.
    #[arg(long, global = true)]
    pub worker_cmd: Option<String>,

    /// Trunk branch that INTEGRATE merges into. Overrides forgeflow.toml and FORGEFLOW_TRUNK.
    #[arg(long, global = true)]
    pub trunk: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize forgeflow in a git repository
    Init,
    /// Start a new run for a task
    Start {
        task: String,
        /// Stop after the current phase is decided instead of running to completion
        #[arg(long)]
        step: bool,
    },
    /// Resume a run from its last recorded state
    Resume {
        run: String,
        #[arg(long)]
        step: bool,
    },
    /// List runs
    Runs {
        /// Only show runs in this status (active, completed, aborted)
        #[arg(long)]
        status: Option<String>,
    },
    /// Show a run and its phase records
    Show { run: String },
    /// Print an artifact's summary, or its full output with --full
    Artifact {
        id: String,
        #[arg(long)]
        full: bool,
    },
    /// Inspect or reclaim run workspaces
    Workspace {
        #[command(subcommand)]
        command: WorkspaceCommands,
    },
}

#[derive(Subcommand, Clone)]
pub enum WorkspaceCommands {
    List,
    /// Abandon a workspace without merging
    Reclaim {
        name: String,
        /// Discard uncommitted changes
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let log_dir = forgeflow::config::Config::is_initialized(&project_dir)
        .then(|| project_dir.join(".forge").join("logs"));
    let _log_guard = forgeflow::logging::init(cli.verbose, log_dir.as_deref())?;

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir, &cli)?,
        Commands::Start { task, step } => {
            cmd::cmd_start(&cli, &project_dir, task, *step).await?;
        }
        Commands::Resume { run, step } => {
            cmd::cmd_resume(&cli, &project_dir, run, *step).await?;
        }
        Commands::Runs { status } => cmd::cmd_runs(&cli, &project_dir, status.as_deref()).await?,
        Commands::Show { run } => cmd::cmd_show(&cli, &project_dir, run).await?,
        Commands::Artifact { id, full } => cmd::cmd_artifact(&cli, &project_dir, id, *full)?,
        Commands::Workspace { command } => {
            cmd::cmd_workspace(&cli, &project_dir, command.clone()).await?
        }
    }

    Ok(())
}
