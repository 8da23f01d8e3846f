//! Stage Scheduler — the barrier (§4.5). Runs one stage to completion:
//! bounded-concurrency dispatch, per-task retry, ownership precheck/audit,
//! and the budget circuit-breaker. Grounded on this codebase's wave-dispatch
//! shape (bounded concurrency + cooperative polling loop) generalized from a
//! single phase to many tasks within one stage.

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::errors::SchedulerError;
use crate::events::{Event, EventSink};
use crate::state::{FileChangeRecord, Stage, Task, TaskProgress, TaskStatus};
use crate::util::merge::merge_file_changes;
use crate::worker::{HandleStatus, TaskDescriptor, TaskHandle, WorkerPool};

pub const COMPLETION_SENTINEL: &str = "[TASK_COMPLETE]";
const POLL_INTERVAL: Duration = Duration::from_millis(300);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrency: usize,
    pub task_timeout_ms: u64,
    pub task_max_retries: u32,
    pub budget_limit_usd: f64,
    pub file_changes_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            max_concurrency: 3,
            task_timeout_ms: 600_000,
            task_max_retries: 2,
            budget_limit_usd: 0.0,
            file_changes_limit: 400,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageSummary {
    pub all_success: bool,
    pub success_count: usize,
    pub fail_count: usize,
    pub retry_count: usize,
    pub remaining_files: Vec<String>,
    pub completion_marker_seen: bool,
    pub total_cost: f64,
    pub file_changes: Vec<FileChangeRecord>,
    pub task_progress: HashMap<String, TaskProgress>,
}

pub struct StageScheduler<'a> {
    session_id: String,
    objective: String,
    stage_index: usize,
    prior_context: &'a str,
    events: &'a EventSink,
}

impl<'a> StageScheduler<'a> {
    pub fn new(
        session_id: impl Into<String>,
        objective: impl Into<String>,
        stage_index: usize,
        prior_context: &'a str,
        events: &'a EventSink,
    ) -> Self {
        StageScheduler {
            session_id: session_id.into(),
            objective: objective.into(),
            stage_index,
            prior_context,
            events,
        }
    }

    /// Runs `stage` to completion against `pool`, seeded from any prior
    /// progress (to resume a partially completed stage).
    #[instrument(skip(self, stage, pool, seed), fields(stage_id = %stage.stage_id))]
    pub async fn run(
        &self,
        stage: &Stage,
        config: &SchedulerConfig,
        pool: &dyn WorkerPool,
        seed: HashMap<String, TaskProgress>,
    ) -> Result<StageSummary> {
        // 1. Ownership precheck.
        if let Some(violation) = ownership_precheck(stage) {
            self.events.emit(Event::Alert {
                kind: "file_ownership_violation".to_string(),
                message: violation.to_string(),
            });
            self.events.emit(Event::StageStarted {
                stage_id: stage.stage_id.clone(),
                task_count: stage.tasks.len(),
                pass_rule: stage.pass_rule.clone(),
            });
            return Err(violation.into());
        }

        self.events.emit(Event::StageStarted {
            stage_id: stage.stage_id.clone(),
            task_count: stage.tasks.len(),
            pass_rule: stage.pass_rule.clone(),
        });

        // 2. Seed.
        let mut progress: HashMap<String, TaskProgress> = stage
            .tasks
            .iter()
            .map(|t| {
                let mut p = seed.get(&t.task_id).cloned().unwrap_or_else(|| TaskProgress::seed(t));
                if p.remaining_files.is_empty() && !p.completed_files.is_empty() {
                    p.remaining_files = remaining(&t.planned_files, &p.completed_files);
                }
                (t.task_id.clone(), p)
            })
            .collect();

        let mut handles: HashMap<String, TaskHandle> = HashMap::new();
        let tasks_by_id: HashMap<&str, &Task> =
            stage.tasks.iter().map(|t| (t.task_id.as_str(), t)).collect();
        let mut completion_marker_seen = false;

        loop {
            pool.tick().await?;

            // Dispatch: launch tasks while under the concurrency cap.
            let running = progress
                .values()
                .filter(|p| p.status == TaskStatus::Running)
                .count();
            let mut slots = config.max_concurrency.saturating_sub(running);

            if slots > 0 {
                let launchable: Vec<String> = stage
                    .tasks
                    .iter()
                    .map(|t| t.task_id.clone())
                    .filter(|id| progress[id].status.is_launchable())
                    .collect();

                for task_id in launchable {
                    if slots == 0 {
                        break;
                    }
                    let task = tasks_by_id[task_id.as_str()];
                    let entry = progress.get_mut(&task_id).unwrap();
                    entry.attempt += 1;

                    let prompt = if entry.attempt > 1 {
                        build_retry_prompt(task, entry)
                    } else {
                        build_prompt(task, &self.objective, self.prior_context)
                    };

                    let descriptor = TaskDescriptor {
                        session_id: self.session_id.clone(),
                        sub_session_id: format!("{}-{}-{}", self.session_id, stage.stage_id, task_id),
                        prompt,
                        model: None,
                        subagent_hint: None,
                        stage_id: stage.stage_id.clone(),
                        task_id: task_id.clone(),
                        planned_files: task.planned_files.clone(),
                        attempt: entry.attempt,
                        timeout_ms: config.task_timeout_ms,
                    };

                    match pool.launch(descriptor).await {
                        Ok(handle) => {
                            entry.status = TaskStatus::Running;
                            self.events.emit(Event::StageTaskDispatched {
                                stage_id: stage.stage_id.clone(),
                                task_id: task_id.clone(),
                                worker_handle: handle.0.clone(),
                                attempt: entry.attempt,
                            });
                            handles.insert(task_id.clone(), handle);
                            slots -= 1;
                        }
                        Err(e) => {
                            entry.status = TaskStatus::Error;
                            entry.last_error = Some(e.to_string());
                            warn!(task_id = %task_id, error = %e, "failed to launch worker");
                        }
                    }
                }
            }

            // Poll in-flight tasks.
            let in_flight: Vec<String> = handles.keys().cloned().collect();
            for task_id in in_flight {
                let handle = handles.get(&task_id).unwrap().clone();
                let poll = pool.poll(&handle).await?;
                if !poll.status.is_terminal() {
                    continue;
                }
                handles.remove(&task_id);

                let task = tasks_by_id[task_id.as_str()];
                let entry = progress.get_mut(&task_id).unwrap();

                if let Some(result) = &poll.result {
                    for f in &result.completed_files {
                        if !entry.completed_files.contains(f) {
                            entry.completed_files.push(f.clone());
                        }
                    }
                    entry.remaining_files = if result.remaining_files.is_empty()
                        && !result.completed_files.is_empty()
                    {
                        remaining(&task.planned_files, &entry.completed_files)
                    } else {
                        result.remaining_files.clone()
                    };
                    entry.file_changes =
                        merge_file_changes(&entry.file_changes, &result.file_changes, config.file_changes_limit);
                    entry.last_reply = Some(result.reply.clone());
                    entry.last_cost += result.cost;
                    entry.last_error = result.error.clone();

                    if result.reply.to_lowercase().contains(&COMPLETION_SENTINEL.to_lowercase()) {
                        completion_marker_seen = true;
                    }

                    for change in &result.file_changes {
                        if !task.planned_files.contains(&change.path) {
                            self.events.emit(Event::Alert {
                                kind: "file_ownership_violation".to_string(),
                                message: format!(
                                    "task '{}' touched '{}' outside its planned files",
                                    task_id, change.path
                                ),
                            });
                        }
                    }
                }

                entry.status = match poll.status {
                    HandleStatus::Completed if entry.remaining_files.is_empty() => {
                        TaskStatus::Completed
                    }
                    HandleStatus::Completed if entry.attempt <= task.max_retries => {
                        TaskStatus::Retrying
                    }
                    HandleStatus::Completed => TaskStatus::Error,
                    HandleStatus::Cancelled => TaskStatus::Cancelled,
                    _ => {
                        if entry.attempt <= task.max_retries {
                            TaskStatus::Retrying
                        } else {
                            TaskStatus::Error
                        }
                    }
                };

                self.events.emit(Event::StageTaskFinished {
                    stage_id: stage.stage_id.clone(),
                    task_id: task_id.clone(),
                    status: format!("{:?}", entry.status),
                    attempt: entry.attempt,
                    remaining_files: entry.remaining_files.clone(),
                });
            }

            // Budget breaker.
            if config.budget_limit_usd > 0.0 {
                let total_cost: f64 = progress.values().map(|p| p.last_cost).sum();
                if total_cost >= config.budget_limit_usd {
                    for (task_id, entry) in progress.iter_mut() {
                        if matches!(entry.status, TaskStatus::Pending | TaskStatus::Retrying) {
                            entry.status = TaskStatus::Error;
                            entry.last_error = Some("budget limit exceeded".to_string());
                        }
                        if let Some(handle) = handles.remove(task_id) {
                            let _ = pool.cancel(&handle).await;
                        }
                    }
                    self.events.emit(Event::Alert {
                        kind: "budget_breaker".to_string(),
                        message: format!(
                            "stage '{}' cancelled: total cost {:.2} >= limit {:.2}",
                            stage.stage_id, total_cost, config.budget_limit_usd
                        ),
                    });
                    break;
                }
            }

            let unfinished = progress
                .values()
                .any(|p| matches!(p.status, TaskStatus::Pending | TaskStatus::Retrying | TaskStatus::Running));
            if !unfinished {
                break;
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }

        let success_count = progress.values().filter(|p| p.status == TaskStatus::Completed).count();
        let fail_count = progress.values().filter(|p| p.status == TaskStatus::Error).count();
        let retry_count = progress.values().filter(|p| p.attempt > 1).count();
        let all_success = success_count == stage.tasks.len();

        let mut remaining_files = Vec::new();
        let mut seen = HashSet::new();
        for p in progress.values() {
            for f in &p.remaining_files {
                if seen.insert(f.clone()) {
                    remaining_files.push(f.clone());
                }
            }
        }

        let mut merged_changes: Vec<FileChangeRecord> = Vec::new();
        for p in progress.values() {
            merged_changes = merge_file_changes(&merged_changes, &p.file_changes, config.file_changes_limit);
        }

        let total_cost: f64 = progress.values().map(|p| p.last_cost).sum();

        let summary = StageSummary {
            all_success,
            success_count,
            fail_count,
            retry_count,
            remaining_files,
            completion_marker_seen,
            total_cost,
            file_changes: merged_changes,
            task_progress: progress,
        };

        info!(
            stage_id = %stage.stage_id,
            all_success,
            success_count,
            fail_count,
            "stage finished"
        );
        self.events.emit(Event::StageFinished {
            stage_id: stage.stage_id.clone(),
            all_success,
            success_count,
            fail_count,
        });

        let _ = self.stage_index; // reserved for future per-stage-index event enrichment
        Ok(summary)
    }
}

fn ownership_precheck(stage: &Stage) -> Option<SchedulerError> {
    let mut owners: HashMap<&str, &str> = HashMap::new();
    for task in &stage.tasks {
        for path in &task.planned_files {
            if let Some(existing) = owners.get(path.as_str()) {
                return Some(SchedulerError::OwnershipViolation {
                    stage_id: stage.stage_id.clone(),
                    path: path.clone(),
                    task_ids: vec![(*existing).to_string(), task.task_id.clone()],
                });
            }
            owners.insert(path.as_str(), &task.task_id);
        }
    }
    None
}

fn remaining(planned: &[String], completed: &[String]) -> Vec<String> {
    planned
        .iter()
        .filter(|f| !completed.contains(f))
        .cloned()
        .collect()
}

fn build_prompt(task: &Task, objective: &str, prior_context: &str) -> String {
    format!(
        "Objective: {objective}\n\n{prior_context}\n\nTask: {}\n\nFiles you own: {:?}\n\nAcceptance criteria:\n{}",
        task.prompt,
        task.planned_files,
        task.acceptance.join("\n- ")
    )
}

fn build_retry_prompt(task: &Task, progress: &TaskProgress) -> String {
    format!(
        "Retry (attempt {}). Remaining files: {:?}. Last error: {}\n\nTask: {}",
        progress.attempt,
        progress.remaining_files,
        progress.last_error.clone().unwrap_or_else(|| "none".to_string()),
        task.prompt
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Complexity;
    use crate::worker::{ScriptedOutcome, ScriptedWorkerPool};

    fn task(id: &str, files: &[&str], max_retries: u32) -> Task {
        Task {
            task_id: id.to_string(),
            prompt: format!("do {id}"),
            planned_files: files.iter().map(|s| s.to_string()).collect(),
            acceptance: Vec::new(),
            depends_on: Vec::new(),
            complexity: Complexity::Medium,
            timeout_ms: 60_000,
            max_retries,
        }
    }

    fn stage(id: &str, tasks: Vec<Task>) -> Stage {
        Stage {
            stage_id: id.to_string(),
            name: id.to_string(),
            pass_rule: "all_success".to_string(),
            tasks,
        }
    }

    #[tokio::test]
    async fn happy_path_single_task_completes() {
        let pool = ScriptedWorkerPool::new(3);
        let events = EventSink::new();
        let scheduler = StageScheduler::new("sess", "print hello", 0, "", &events);
        let stage = stage("s1", vec![task("t1", &["hello.txt"], 2)]);
        let summary = scheduler
            .run(&stage, &SchedulerConfig::default(), &pool, HashMap::new())
            .await
            .unwrap();
        assert!(summary.all_success);
        assert_eq!(summary.success_count, 1);
        assert!(summary.completion_marker_seen);
    }

    #[tokio::test]
    async fn retry_then_succeed() {
        let pool = ScriptedWorkerPool::new(3);
        pool.script(
            "t1",
            vec![
                ScriptedOutcome::Completed(crate::worker::TaskResultEnvelope {
                    completed_files: vec!["a".to_string()],
                    remaining_files: vec!["b".to_string()],
                    reply: String::new(),
                    ..Default::default()
                }),
                ScriptedOutcome::Completed(crate::worker::TaskResultEnvelope {
                    completed_files: vec!["a".to_string(), "b".to_string()],
                    remaining_files: Vec::new(),
                    reply: "[TASK_COMPLETE]".to_string(),
                    ..Default::default()
                }),
            ],
        )
        .await;

        let events = EventSink::new();
        let scheduler = StageScheduler::new("sess", "obj", 0, "", &events);
        let stage = stage("s1", vec![task("t1", &["a", "b"], 2)]);
        let summary = scheduler
            .run(&stage, &SchedulerConfig::default(), &pool, HashMap::new())
            .await
            .unwrap();
        assert!(summary.all_success);
        assert_eq!(summary.task_progress["t1"].attempt, 2);
    }

    #[tokio::test]
    async fn ownership_violation_rejects_before_launch() {
        let pool = ScriptedWorkerPool::new(3);
        let events = EventSink::new();
        let scheduler = StageScheduler::new("sess", "obj", 0, "", &events);
        let stage = stage(
            "s1",
            vec![task("t1", &["x.js"], 2), task("t2", &["x.js"], 2)],
        );
        let result = scheduler
            .run(&stage, &SchedulerConfig::default(), &pool, HashMap::new())
            .await;
        assert!(result.is_err());
        let msg = result.unwrap_err().to_string();
        assert!(msg.contains("x.js"));
        assert!(msg.contains("t1"));
        assert!(msg.contains("t2"));
    }

    #[tokio::test]
    async fn budget_breaker_cancels_pending_tasks() {
        let pool = ScriptedWorkerPool::new(3);
        pool.script(
            "t1",
            vec![ScriptedOutcome::Completed(crate::worker::TaskResultEnvelope {
                completed_files: vec!["a".to_string()],
                cost: 0.60,
                reply: "[TASK_COMPLETE]".to_string(),
                ..Default::default()
            })],
        )
        .await;
        pool.script(
            "t2",
            vec![ScriptedOutcome::Completed(crate::worker::TaskResultEnvelope {
                completed_files: vec!["b".to_string()],
                cost: 0.50,
                reply: "[TASK_COMPLETE]".to_string(),
                ..Default::default()
            })],
        )
        .await;

        let events = EventSink::new();
        let scheduler = StageScheduler::new("sess", "obj", 0, "", &events);
        let stage = stage(
            "s1",
            vec![task("t1", &["a"], 2), task("t2", &["b"], 2), task("t3", &["c"], 2)],
        );
        let mut config = SchedulerConfig::default();
        config.max_concurrency = 2;
        config.budget_limit_usd = 1.0;
        let summary = scheduler.run(&stage, &config, &pool, HashMap::new()).await.unwrap();
        assert!(!summary.all_success);
        assert_eq!(
            summary.task_progress["t3"].last_error.as_deref(),
            Some("budget limit exceeded")
        );
    }

    #[tokio::test]
    async fn max_concurrency_one_runs_tasks_sequentially() {
        let pool = ScriptedWorkerPool::new(3);
        let events = EventSink::new();
        let scheduler = StageScheduler::new("sess", "obj", 0, "", &events);
        let stage = stage(
            "s1",
            vec![task("t1", &["a"], 2), task("t2", &["b"], 2), task("t3", &["c"], 2)],
        );
        let mut config = SchedulerConfig::default();
        config.max_concurrency = 1;
        let summary = scheduler.run(&stage, &config, &pool, HashMap::new()).await.unwrap();
        assert!(summary.all_success);
        assert_eq!(summary.success_count, 3);
    }

    #[tokio::test]
    async fn budget_limit_zero_never_triggers() {
        let pool = ScriptedWorkerPool::new(3);
        let events = EventSink::new();
        let scheduler = StageScheduler::new("sess", "obj", 0, "", &events);
        let stage = stage("s1", vec![task("t1", &["a"], 2)]);
        let config = SchedulerConfig::default();
        assert_eq!(config.budget_limit_usd, 0.0);
        let summary = scheduler.run(&stage, &config, &pool, HashMap::new()).await.unwrap();
        assert!(summary.all_success);
    }
}
