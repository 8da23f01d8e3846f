//! `longagent status` / `list` / `stop` / `retry-stage` — read-mostly session
//! inspection and control, operating directly on the `StateStore` without
//! spinning up a `Driver`.

use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;

use longagent::config::DriverConfig;
use longagent::state::StateStore;

fn store_for(project_dir: &Path) -> Result<StateStore> {
    let config = DriverConfig::load(project_dir)?;
    Ok(StateStore::for_project(&config.project_dir, Duration::from_millis(config.lock_timeout_ms)))
}

pub async fn cmd_status(project_dir: &Path, session_id: &str) -> Result<()> {
    let store = store_for(project_dir)?;
    let session = store
        .get(session_id)
        .await?
        .with_context(|| format!("no such session '{session_id}'"))?;

    println!();
    println!("Session:    {session_id}");
    println!("Status:     {:?}", session.status);
    println!("Phase:      {:?}", session.phase);
    println!("Current gate: {}", session.current_gate);
    println!("Stage:      {}/{}", session.stage_index, session.stage_count);
    if let Some(stage_id) = &session.current_stage_id {
        println!("Stage id:   {stage_id}");
    }
    println!("Recoveries: {}", session.recovery_count);
    println!("Iterations: {}", session.iterations);
    println!("Updated:    {}", session.updated_at);
    if session.stop_requested {
        println!("(stop requested)");
    }
    if !session.gate_status.is_empty() {
        println!();
        println!("Gates:");
        for (name, status) in &session.gate_status {
            println!("  {name:<10} {:?}  {}", status.status, status.reason);
        }
    }
    println!();
    Ok(())
}

pub async fn cmd_list(project_dir: &Path) -> Result<()> {
    let store = store_for(project_dir)?;
    let sessions = store.list().await?;

    if sessions.is_empty() {
        println!("No sessions found.");
        return Ok(());
    }

    println!();
    println!("{:<24} {:<10} {:<16} {:<8} {}", "Session", "Status", "Phase", "Stage", "Updated");
    println!("{:<24} {:<10} {:<16} {:<8} {}", "-------", "------", "-----", "-----", "-------");
    for (id, session) in &sessions {
        println!(
            "{:<24} {:<10} {:<16} {:<8} {}",
            id,
            format!("{:?}", session.status),
            format!("{:?}", session.phase),
            format!("{}/{}", session.stage_index, session.stage_count),
            session.updated_at,
        );
    }
    println!();
    Ok(())
}

pub async fn cmd_stop(project_dir: &Path, session_id: &str) -> Result<()> {
    let store = store_for(project_dir)?;
    store.stop(session_id).await?;
    println!("Stop requested for session '{session_id}'.");
    Ok(())
}

/// Marks `stage_id` (and every later stage) for re-execution on the next
/// `run` of this session: the driver drops their `task_progress` entries and
/// rewinds `stage_index` the moment it observes `retry_stage_id`.
pub async fn cmd_retry_stage(project_dir: &Path, session_id: &str, stage_id: &str) -> Result<()> {
    let store = store_for(project_dir)?;
    let session = store
        .get(session_id)
        .await?
        .with_context(|| format!("no such session '{session_id}'"))?;
    let plan = session
        .stage_plan
        .as_ref()
        .context("session has no frozen plan yet; nothing to retry")?;
    if plan.stage_index_of(stage_id).is_none() {
        anyhow::bail!("stage '{stage_id}' is not part of this session's plan");
    }

    store
        .update(
            session_id,
            longagent::state::SessionStatePatch {
                retry_stage_id: Some(stage_id.to_string()),
                status: Some(longagent::state::SessionStatus::Running),
                ..Default::default()
            },
        )
        .await?;
    println!("Session '{session_id}' will retry from stage '{stage_id}' on its next run.");
    Ok(())
}
