mod cmd;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "longagent")]
#[command(version, about = "Staged, parallel coding-agent orchestrator")]
pub struct Cli {
    /// Maps to `debug` logging and `--verbose` driver behavior.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Skip interactive first-run prompts (git gating, gate selection).
    #[arg(long, global = true)]
    pub yes: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Drive a session to completion, or until it blocks on an unclear objective.
    Run {
        /// Free-form description of what the session should accomplish.
        objective: String,
        /// Resume (or start) a specific session id; a fresh one is generated if omitted.
        #[arg(long)]
        session: Option<String>,
    },
    /// Show one session's current state.
    Status { session: String },
    /// List every known session, most recently updated first.
    List,
    /// Request a running session stop at its next safe checkpoint.
    Stop { session: String },
    /// Re-run a stage (and everything after it) on the session's next `run`.
    RetryStage {
        session: String,
        stage_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run { objective, session } => {
            cmd::cmd_run(&project_dir, objective, session.clone(), cli.verbose, cli.yes).await?;
        }
        Commands::Status { session } => cmd::cmd_status(&project_dir, session).await?,
        Commands::List => cmd::cmd_list(&project_dir).await?,
        Commands::Stop { session } => cmd::cmd_stop(&project_dir, session).await?,
        Commands::RetryStage { session, stage_id } => {
            cmd::cmd_retry_stage(&project_dir, session, stage_id).await?
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}
