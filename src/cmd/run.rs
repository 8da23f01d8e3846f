//! `longagent run` — drives one session to a terminal status.

use anyhow::{Context, Result};
use dialoguer::{Confirm, MultiSelect};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use longagent::checkpoint::CheckpointStore;
use longagent::config::{DriverConfig, PromptPolicy};
use longagent::driver::{CliPlanner, Driver};
use longagent::state::{SessionStatus, StateStore};
use longagent::ui::DriverProgress;
use longagent::worker::{ProcessWorkerPool, WorkerPool};

const APP_NAME: &str = "longagent";

pub async fn cmd_run(
    project_dir: &Path,
    objective: &str,
    session_id: Option<String>,
    verbose: bool,
    yes: bool,
) -> Result<()> {
    let mut config = DriverConfig::load(project_dir)?.with_verbose(verbose);
    config.ensure_directories()?;

    if !yes && !project_dir.join("forge.toml").exists() {
        maybe_prompt_first_run(&mut config)?;
    }

    let session_id = session_id.unwrap_or_else(|| format!("sess_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]));

    let state_store = StateStore::for_project(&config.project_dir, Duration::from_millis(config.lock_timeout_ms));
    let checkpoint_store = CheckpointStore::for_app(APP_NAME)?;

    let worker_pool: Arc<dyn WorkerPool> = Arc::new(ProcessWorkerPool::new(
        config.claude_cmd.clone(),
        config.claude_args.clone(),
        config.project_dir.clone(),
        config.parallel.max_concurrency,
    ));
    let planner = Arc::new(CliPlanner::new(
        config.claude_cmd.clone(),
        config.claude_args.clone(),
        config.project_dir.clone(),
    ));

    let driver = Driver::new(config, state_store, checkpoint_store, worker_pool, planner.clone())
        .with_completion_verifier(planner);

    let progress = DriverProgress::new(verbose).spawn(driver.events());

    let result = driver
        .run(&session_id, objective)
        .await
        .with_context(|| format!("session '{session_id}' failed"))?;
    drop(driver);
    progress.await.ok();

    println!();
    println!("Session:    {}", result.session_id);
    println!("Status:     {:?}", result.status);
    println!("Phase:      {:?}", result.phase);
    println!("Stages:     {}/{}", result.stage_progress.0, result.stage_progress.1);
    println!("Iterations: {}", result.iterations);
    println!("Elapsed:    {:.1}s", result.elapsed_secs);
    if result.usage_usd > 0.0 {
        println!("Spent:      ${:.2}", result.usage_usd);
    }
    if !result.reply.is_empty() {
        println!();
        println!("{}", result.reply);
    }
    println!();

    if matches!(result.status, SessionStatus::Failed | SessionStatus::Error | SessionStatus::Blocked) {
        anyhow::bail!("session ended with status {:?}", result.status);
    }
    Ok(())
}

/// One-time interactive confirmation for git gating and gate selection,
/// mirroring the teacher's approval-gate prompts. Only held in memory; a
/// user who wants this to stick across runs should write a `forge.toml`.
fn maybe_prompt_first_run(config: &mut DriverConfig) -> Result<()> {
    if config.gate_prompt_policy == PromptPolicy::Never {
        return Ok(());
    }

    if !config.git_gating_enabled {
        config.git_gating_enabled = Confirm::new()
            .with_prompt("Stash local changes and run this session on a dedicated git branch?")
            .default(false)
            .interact()
            .unwrap_or(false);
    }

    let labels = ["build", "test", "review", "health", "budget"];
    let defaults = [
        config.gates.build,
        config.gates.test,
        config.gates.review,
        config.gates.health,
        config.gates.budget,
    ];
    let selection = MultiSelect::new()
        .with_prompt("Quality gates to run before completing the session")
        .items(&labels)
        .defaults(&defaults)
        .interact_opt()
        .unwrap_or(None);

    if let Some(chosen) = selection {
        config.gates.build = chosen.contains(&0);
        config.gates.test = chosen.contains(&1);
        config.gates.review = chosen.contains(&2);
        config.gates.health = chosen.contains(&3);
        config.gates.budget = chosen.contains(&4);
    }

    Ok(())
}
