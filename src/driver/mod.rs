//! Driver (§4.7): the top-level state machine sequencing Intake → Plan →
//! Scaffold → Stages → Quality Gates → Merge, with per-stage checkpointing,
//! exponential backoff, and abort thresholds.

mod git;
mod planner;

pub use git::{GitGate, GitGateResult, GitStepOutcome};
pub use planner::CliPlanner;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::checkpoint::{stage_checkpoint_name, CheckpointRecord, CheckpointStore, CleanupOptions};
use crate::config::DriverConfig;
use crate::errors::DriverError;
use crate::events::{Event, EventSink};
use crate::gates::{GateContext, GateRunner, QualityGateReport};
use crate::plan::{PlanValidator, RawPlan, TaskDefaults};
use crate::scheduler::{SchedulerConfig, StageScheduler, COMPLETION_SENTINEL};
use crate::state::{
    DriverPhase, FileChangeRecord, GateStatus, SessionState, SessionStatePatch, SessionStatus,
    StagePlan, TaskProgress, TaskStatus,
};
use crate::util::{compute_progress_stats, is_actionable_objective, PriorContextBuilder, ProgressStats};
use crate::worker::WorkerPool;

const BACKOFF_BASE_MS: u64 = 1000;
const BACKOFF_CAP_MS: u64 = 30_000;

/// External collaborator that turns a free-form objective into a raw,
/// untrusted plan. The core only validates and normalizes its output.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, objective: &str, prior_context: &str) -> Result<RawPlan>;
}

/// Asked for a one-turn confirmation when no task reply carried the
/// completion sentinel.
#[async_trait]
pub trait CompletionVerifier: Send + Sync {
    async fn confirm_completion(&self, objective: &str, prior_context: &str) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct DriverResult {
    pub session_id: String,
    pub reply: String,
    pub usage_usd: f64,
    pub iterations: u32,
    pub recovery_count: u32,
    pub phase: DriverPhase,
    pub gate_status: HashMap<String, GateStatus>,
    pub current_gate: String,
    pub status: SessionStatus,
    pub progress: ProgressStats,
    pub elapsed_secs: f64,
    pub stage_index: usize,
    pub stage_count: usize,
    pub current_stage_id: Option<String>,
    pub plan_frozen: bool,
    pub task_progress: HashMap<String, TaskProgress>,
    pub file_changes: Vec<FileChangeRecord>,
    pub stage_progress: (usize, usize),
    pub remaining_files_count: usize,
}

pub struct Driver {
    config: DriverConfig,
    state_store: crate::state::StateStore,
    checkpoint_store: CheckpointStore,
    worker_pool: Arc<dyn WorkerPool>,
    planner: Arc<dyn Planner>,
    completion_verifier: Option<Arc<dyn CompletionVerifier>>,
    gate_runner: GateRunner,
    events: EventSink,
    git_gate: Option<GitGate>,
}

impl Driver {
    pub fn new(
        config: DriverConfig,
        state_store: crate::state::StateStore,
        checkpoint_store: CheckpointStore,
        worker_pool: Arc<dyn WorkerPool>,
        planner: Arc<dyn Planner>,
    ) -> Self {
        let git_gate = if config.git_gating_enabled {
            Some(GitGate::new(config.project_dir.clone()))
        } else {
            None
        };
        Driver {
            config,
            state_store,
            checkpoint_store,
            worker_pool,
            planner,
            completion_verifier: None,
            gate_runner: GateRunner::new(),
            events: EventSink::new(),
            git_gate,
        }
    }

    pub fn with_completion_verifier(mut self, verifier: Arc<dyn CompletionVerifier>) -> Self {
        self.completion_verifier = Some(verifier);
        self
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// Drives `session_id` to a terminal status (or `blocked`/`stopped`),
    /// resuming from whatever state is already on disk.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn run(&self, session_id: &str, objective: &str) -> Result<DriverResult> {
        let start = Utc::now();
        let mut session = self
            .state_store
            .get(session_id)
            .await?
            .unwrap_or_else(|| SessionState::new(start));

        if session.stop_requested {
            session = self
                .state_store
                .update(
                    session_id,
                    SessionStatePatch {
                        status: Some(SessionStatus::Stopped),
                        phase: Some(DriverPhase::Terminal),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(self.finish(session_id, session, start, "stop requested before start".to_string()).await);
        }

        if let Some(retry_stage_id) = session.retry_stage_id.clone()
            && let Some(plan) = &session.stage_plan
            && let Some(idx) = plan.stage_index_of(&retry_stage_id)
        {
            let retained: HashMap<String, TaskProgress> = session
                .task_progress
                .iter()
                .filter(|(task_id, _)| {
                    !plan.stages[idx..]
                        .iter()
                        .any(|s| s.tasks.iter().any(|t| &t.task_id == *task_id))
                })
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            session.task_progress = retained;
            session.stage_index = idx;
            session = self
                .state_store
                .update(
                    session_id,
                    SessionStatePatch {
                        stage_index: Some(idx),
                        task_progress: Some(session.task_progress.clone()),
                        clear_retry_stage_id: true,
                        ..Default::default()
                    },
                )
                .await?;
        }

        if session.stage_plan.is_none() {
            if !is_actionable_objective(objective) {
                session = self
                    .state_store
                    .update(
                        session_id,
                        SessionStatePatch {
                            status: Some(SessionStatus::Blocked),
                            current_gate: Some("intake".to_string()),
                            ..Default::default()
                        },
                    )
                    .await?;
                return Ok(self
                    .finish(session_id, session, start, "objective is not actionable; no work performed".to_string())
                    .await);
            }

            let mut git_active = false;
            if let Some(gate) = &self.git_gate {
                match gate.begin(session_id, objective) {
                    Ok(result) => git_active = result.active,
                    Err(e) => {
                        self.events.emit(Event::Alert {
                            kind: "git_gate_failed".to_string(),
                            message: e.to_string(),
                        });
                    }
                }
            }
            let _ = git_active;

            session = self
                .state_store
                .update(
                    session_id,
                    SessionStatePatch {
                        status: Some(SessionStatus::Running),
                        phase: Some(DriverPhase::Intake),
                        current_gate: Some("planning".to_string()),
                        ..Default::default()
                    },
                )
                .await?;

            let raw_plan = self
                .planner
                .plan(objective, "")
                .await
                .context("planner invocation failed")?;
            let validator = PlanValidator::new(TaskDefaults::default());
            let validated = validator.validate(raw_plan, objective);
            if !validated.errors.is_empty() {
                warn!(errors = ?validated.errors, "plan validator fell back to a trivial plan");
            }

            crate::config::write_plan_artifact(&self.config, &validated.plan).ok();

            self.events.emit(Event::PlanFrozen {
                plan_id: validated.plan.plan_id.clone(),
                stage_count: validated.plan.stage_count(),
                quality_score: validated.quality_score,
            });

            session = self
                .state_store
                .update(
                    session_id,
                    SessionStatePatch {
                        phase: Some(DriverPhase::PlanFrozen),
                        stage_count: Some(validated.plan.stage_count()),
                        stage_plan: Some(validated.plan),
                        ..Default::default()
                    },
                )
                .await?;
        }

        let plan = session.stage_plan.clone().expect("plan frozen above");

        if self.config.scaffold_enabled && session.phase == DriverPhase::PlanFrozen {
            session = self
                .state_store
                .update(
                    session_id,
                    SessionStatePatch {
                        phase: Some(DriverPhase::Scaffolding),
                        current_gate: Some("scaffold".to_string()),
                        ..Default::default()
                    },
                )
                .await?;
        }

        let mut context_builder = PriorContextBuilder::new();

        while session.stage_index < plan.stage_count() {
            session = self.state_store.get(session_id).await?.unwrap();
            if session.stop_requested {
                session = self
                    .state_store
                    .update(
                        session_id,
                        SessionStatePatch {
                            status: Some(SessionStatus::Stopped),
                            phase: Some(DriverPhase::Terminal),
                            ..Default::default()
                        },
                    )
                    .await?;
                return Ok(self.finish(session_id, session, start, "stop requested mid-run".to_string()).await);
            }

            let stage_id = plan.stages[session.stage_index].stage_id.clone();
            self.events.emit(Event::PhaseChanged {
                from: format!("{:?}", session.phase),
                to: "stage_running".to_string(),
            });

            session = self
                .state_store
                .update(
                    session_id,
                    SessionStatePatch {
                        phase: Some(DriverPhase::StageRunning),
                        current_gate: Some(format!("stage:{}", stage_id)),
                        current_stage_id: Some(stage_id.clone()),
                        ..Default::default()
                    },
                )
                .await?;
            let stage = &plan.stages[session.stage_index];

            let seed: HashMap<String, TaskProgress> = stage
                .tasks
                .iter()
                .filter_map(|t| session.task_progress.get(&t.task_id).cloned().map(|p| (t.task_id.clone(), p)))
                .collect();

            let scheduler_config = SchedulerConfig {
                max_concurrency: self.config.parallel.max_concurrency,
                task_timeout_ms: self.config.parallel.task_timeout_ms,
                task_max_retries: self.config.parallel.task_max_retries,
                budget_limit_usd: self.config.parallel.budget_limit_usd,
                file_changes_limit: self.config.file_changes_limit,
            };

            let scheduler = StageScheduler::new(
                session_id,
                &plan.objective,
                session.stage_index,
                context_builder.as_str(),
                &self.events,
            );
            let summary = scheduler
                .run(stage, &scheduler_config, self.worker_pool.as_ref(), seed)
                .await
                .context("stage scheduler failed")?;

            let mut merged_progress = session.task_progress.clone();
            merged_progress.extend(summary.task_progress.clone());

            if summary.all_success {
                if let Some(gate) = &self.git_gate {
                    let _ = gate.commit_stage(&stage.stage_id);
                }

                context_builder.append_stage(
                    session.stage_index,
                    &stage.name,
                    summary.all_success,
                    summary.fail_count,
                    &summary.task_progress,
                );

                session = self
                    .state_store
                    .update(
                        session_id,
                        SessionStatePatch {
                            stage_index: Some(session.stage_index + 1),
                            task_progress: Some(merged_progress),
                            recovery_count: Some(0),
                            heartbeat_at: Some(Utc::now()),
                            iterations: Some(session.iterations + 1),
                            ..Default::default()
                        },
                    )
                    .await?;

                self.checkpoint_store
                    .save(
                        session_id,
                        CheckpointRecord {
                            name: stage_checkpoint_name(&stage.stage_id),
                            iteration: session.iterations,
                            phase: format!("{:?}", session.phase),
                            gate_status: session.gate_status.clone(),
                            task_progress: session.task_progress.clone(),
                            stage_index: session.stage_index,
                            stage_plan: Some(plan.clone()),
                            saved_at: Utc::now(),
                        },
                    )
                    .context("failed to save stage checkpoint")?;
            } else {
                let next_recovery = session.recovery_count + 1;
                self.events.emit(Event::RecoveryEntered {
                    stage_id: stage.stage_id.clone(),
                    recovery_count: next_recovery,
                });

                if next_recovery >= self.config.max_stage_recoveries {
                    self.events.emit(Event::Alert {
                        kind: "stage_aborted".to_string(),
                        message: format!("stage '{}' exhausted its recovery budget", stage.stage_id),
                    });
                    session = self
                        .state_store
                        .update(
                            session_id,
                            SessionStatePatch {
                                status: Some(SessionStatus::Error),
                                phase: Some(DriverPhase::Terminal),
                                task_progress: Some(merged_progress),
                                recovery_count: Some(next_recovery),
                                ..Default::default()
                            },
                        )
                        .await?;
                    return Err(DriverError::StageRecoveryExhausted {
                        stage_id: stage.stage_id.clone(),
                        recovery_count: next_recovery,
                    }
                    .into());
                }

                for progress in merged_progress.values_mut() {
                    if progress.status == TaskStatus::Error {
                        progress.status = TaskStatus::Retrying;
                        progress.attempt = 0;
                    }
                }

                session = self
                    .state_store
                    .update(
                        session_id,
                        SessionStatePatch {
                            phase: Some(DriverPhase::StageRecover),
                            recovery_count: Some(next_recovery),
                            task_progress: Some(merged_progress),
                            ..Default::default()
                        },
                    )
                    .await?;

                let delay_ms = (BACKOFF_BASE_MS * 2u64.pow(next_recovery.saturating_sub(1))).min(BACKOFF_CAP_MS);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
        }

        let mut reply = session
            .task_progress
            .values()
            .filter_map(|p| p.last_reply.clone())
            .find(|r| r.to_lowercase().contains(&COMPLETION_SENTINEL.to_lowercase()))
            .unwrap_or_default();

        if reply.is_empty() {
            if let Some(verifier) = &self.completion_verifier {
                reply = verifier
                    .confirm_completion(&plan.objective, context_builder.as_str())
                    .await
                    .unwrap_or_default();
            }
        }

        let gate_report = self.run_gate_loop(session_id, &mut session, &plan, &context_builder).await?;

        if gate_report.all_pass {
            session = self
                .state_store
                .update(
                    session_id,
                    SessionStatePatch {
                        status: Some(SessionStatus::Completed),
                        phase: Some(DriverPhase::Terminal),
                        gate_status: Some(gate_report.gates.clone()),
                        ..Default::default()
                    },
                )
                .await?;
            self.merge_git_gate_if_active(session_id).await;
        } else {
            if let Some(gate) = &self.git_gate {
                let _ = gate.finish(session_id, false);
            }
            session = self
                .state_store
                .update(
                    session_id,
                    SessionStatePatch {
                        status: Some(SessionStatus::Failed),
                        phase: Some(DriverPhase::Terminal),
                        gate_status: Some(gate_report.gates.clone()),
                        ..Default::default()
                    },
                )
                .await?;
        }

        self.checkpoint_store
            .cleanup(
                session_id,
                CleanupOptions {
                    max_keep: 10,
                    keep_stage_checkpoints: true,
                },
            )
            .ok();

        Ok(self.finish(session_id, session, start, reply).await)
    }

    /// Final commit, then a TOCTOU-safe merge: re-reads status under the
    /// state store's lock immediately before checking out the base branch,
    /// so a concurrent `retryStageId` CLI command can't race a completed
    /// session into being merged after it was already reopened.
    async fn merge_git_gate_if_active(&self, session_id: &str) {
        let Some(gate) = &self.git_gate else { return };

        let commit_outcome = match gate.finish(session_id, true) {
            Ok(outcome) => outcome,
            Err(e) => GitStepOutcome { ok: false, message: e.to_string() },
        };
        if !commit_outcome.ok {
            return;
        }

        let session_id_owned = session_id.to_string();
        let merge_result = self
            .state_store
            .with_lock(move |sessions| {
                let still_completed = sessions
                    .get(&session_id_owned)
                    .map(|s| s.status == SessionStatus::Completed)
                    .unwrap_or(false);
                if !still_completed {
                    return Ok(GitStepOutcome {
                        ok: false,
                        message: "session status changed before merge could run".to_string(),
                    });
                }
                gate.merge_into_base()
            })
            .await;

        let outcome = match merge_result {
            Ok(outcome) => outcome,
            Err(e) => GitStepOutcome { ok: false, message: e.to_string() },
        };
        if !outcome.ok {
            self.events.emit(Event::Alert {
                kind: "git_merge_failed".to_string(),
                message: outcome.message,
            });
            let _ = gate.checkout_feature();
        }
    }

    async fn run_gate_loop(
        &self,
        session_id: &str,
        session: &mut SessionState,
        plan: &StagePlan,
        context_builder: &PriorContextBuilder,
    ) -> Result<QualityGateReport> {
        let gate_config = crate::gates::GateConfig {
            build_enabled: self.config.gates.build,
            test_enabled: self.config.gates.test,
            review_enabled: self.config.gates.review,
            health_enabled: self.config.gates.health,
            budget_enabled: self.config.gates.budget,
        };

        let budget_strategy = crate::gates::BudgetStrategy::Block;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let healthy = self.state_store.get(session_id).await.is_ok();
            let ctx = GateContext {
                project_dir: self.config.project_dir.clone(),
                build_script: None,
                test_script: None,
                review_state_path: None,
                state_store_healthy: healthy,
                state_store_reason: if healthy { "ok".to_string() } else { "state store unreachable".to_string() },
                budget_limit_usd: self.config.parallel.budget_limit_usd,
                budget_spent_usd: session.task_progress.values().map(|p| p.last_cost).sum(),
                budget_strategy,
            };

            let report = self.gate_runner.run_all(&ctx, &gate_config, &self.events).await;
            *session = self
                .state_store
                .update(
                    session_id,
                    SessionStatePatch {
                        gate_status: Some(report.gates.clone()),
                        phase: Some(if report.all_pass { DriverPhase::GateCheck } else { DriverPhase::GateRecovery }),
                        ..Default::default()
                    },
                )
                .await?;

            if report.all_pass || attempt >= self.config.max_gate_attempts {
                let _ = (plan, context_builder);
                return Ok(report);
            }

            let delay_ms = (BACKOFF_BASE_MS * 2u64.pow(attempt.saturating_sub(1))).min(BACKOFF_CAP_MS);
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
    }

    async fn finish(&self, session_id: &str, session: SessionState, start: chrono::DateTime<Utc>, reply: String) -> DriverResult {
        let progress = compute_progress_stats(&session.task_progress);
        let stage_count = session.stage_count;
        let stage_done = session.stage_index.min(stage_count);
        info!(status = ?session.status, "driver run finished");
        DriverResult {
            session_id: session_id.to_string(),
            reply,
            usage_usd: session.task_progress.values().map(|p| p.last_cost).sum(),
            iterations: session.iterations,
            recovery_count: session.recovery_count,
            phase: session.phase,
            gate_status: session.gate_status.clone(),
            current_gate: session.current_gate.clone(),
            status: session.status,
            remaining_files_count: progress.remaining_files_count,
            progress,
            elapsed_secs: (Utc::now() - start).num_milliseconds() as f64 / 1000.0,
            stage_index: session.stage_index,
            stage_count,
            current_stage_id: session.current_stage_id.clone(),
            plan_frozen: session.stage_plan.is_some(),
            task_progress: session.task_progress,
            file_changes: session.file_changes,
            stage_progress: (stage_done, stage_count),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::RawStage;
    use crate::worker::ScriptedWorkerPool;
    use std::path::PathBuf;
    use tempfile::tempdir;

    struct FixedPlanner(RawPlan);

    #[async_trait]
    impl Planner for FixedPlanner {
        async fn plan(&self, _objective: &str, _prior_context: &str) -> Result<RawPlan> {
            Ok(self.0.clone())
        }
    }

    fn raw_task(id: &str, files: &[&str]) -> crate::plan::RawTask {
        crate::plan::RawTask {
            task_id: Some(id.to_string()),
            prompt: Some(format!("do {id}")),
            planned_files: files.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn single_stage_plan(objective: &str) -> RawPlan {
        RawPlan {
            objective: Some(objective.to_string()),
            stages: vec![RawStage {
                stage_id: Some("s1".to_string()),
                name: Some("build".to_string()),
                tasks: vec![raw_task("t1", &["a.rs"])],
            }],
        }
    }

    fn test_driver(dir: &tempfile::TempDir, plan: RawPlan) -> Driver {
        let config = DriverConfig {
            project_dir: dir.path().to_path_buf(),
            state_dir: dir.path().join(".kkcode"),
            max_gate_attempts: 1,
            ..DriverConfig::default()
        };
        let state_store = crate::state::StateStore::for_project(dir.path(), Duration::from_secs(2));
        let checkpoint_store = CheckpointStore::new(dir.path().join("checkpoints"));
        let pool: Arc<dyn WorkerPool> = Arc::new(ScriptedWorkerPool::new(3));
        let planner: Arc<dyn Planner> = Arc::new(FixedPlanner(plan));
        Driver::new(config, state_store, checkpoint_store, pool, planner)
    }

    #[tokio::test]
    async fn non_actionable_objective_blocks_without_planning() {
        let dir = tempdir().unwrap();
        let driver = test_driver(&dir, single_stage_plan("hi"));
        let result = driver.run("sess", "hi").await.unwrap();
        assert_eq!(result.status, SessionStatus::Blocked);
        assert!(!result.plan_frozen);
    }

    #[tokio::test]
    async fn happy_path_completes_session() {
        let dir = tempdir().unwrap();
        let driver = test_driver(&dir, single_stage_plan("fix the bug in a.rs"));
        let result = driver.run("sess", "fix the bug in a.rs").await.unwrap();
        assert_eq!(result.status, SessionStatus::Completed);
        assert!(result.plan_frozen);
        assert_eq!(result.stage_progress, (1, 1));
    }

    #[tokio::test]
    async fn stop_requested_before_start_returns_stopped() {
        let dir = tempdir().unwrap();
        let driver = test_driver(&dir, single_stage_plan("fix the bug"));
        driver.state_store.stop("sess").await.unwrap();
        let result = driver.run("sess", "fix the bug").await.unwrap();
        assert_eq!(result.status, SessionStatus::Stopped);
    }

    #[tokio::test]
    async fn ownership_violation_in_plan_surfaces_as_error() {
        let dir = tempdir().unwrap();
        let plan = RawPlan {
            objective: Some("fix the bug".to_string()),
            stages: vec![RawStage {
                stage_id: Some("s1".to_string()),
                name: None,
                tasks: vec![raw_task("t1", &["a.rs"]), raw_task("t1", &["a.rs"])],
            }],
        };
        // duplicate task ids collapse planned_files collisions into the
        // validator's intra-stage check, which falls back to a trivial plan
        // rather than erroring the driver.
        let driver = test_driver(&dir, plan);
        let result = driver.run("sess", "fix the bug").await.unwrap();
        assert_eq!(result.status, SessionStatus::Completed);
        let _ = PathBuf::new();
    }
}
