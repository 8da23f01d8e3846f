//! Data model for session state, the frozen stage plan, and task-level progress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level lifecycle status of a session. `status` is the authoritative field
/// consumers read; everything else is detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Running,
    Recovering,
    Completed,
    Failed,
    Blocked,
    Stopped,
    Error,
}

/// Driver state-machine phase label (see driver module for transitions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverPhase {
    Intake,
    PlanFrozen,
    Scaffolding,
    StageRunning,
    StageRecover,
    GateCheck,
    GateRecovery,
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Retrying,
    Completed,
    Error,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Error | TaskStatus::Cancelled
        )
    }

    pub fn is_in_flight(self) -> bool {
        matches!(self, TaskStatus::Running)
    }

    pub fn is_launchable(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Retrying)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl std::str::FromStr for Complexity {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Complexity::Low),
            "high" => Ok(Complexity::High),
            "medium" => Ok(Complexity::Medium),
            _ => Err(()),
        }
    }
}

/// A single file-change record, as produced by a worker and merged into
/// session state by the capped file-change merger (see `crate::util::merge`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChangeRecord {
    pub path: String,
    pub added_lines: u64,
    pub removed_lines: u64,
    pub stage_id: String,
    pub task_id: String,
}

/// One task within a frozen stage plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub prompt: String,
    pub planned_files: Vec<String>,
    #[serde(default)]
    pub acceptance: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_complexity")]
    pub complexity: Complexity,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

pub fn default_complexity() -> Complexity {
    Complexity::Medium
}

pub fn default_timeout_ms() -> u64 {
    600_000
}

pub fn default_max_retries() -> u32 {
    2
}

/// Unit of barrier synchronization: all tasks in a stage run concurrently,
/// the next stage only begins once every task here has reached a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub stage_id: String,
    pub name: String,
    #[serde(default = "default_pass_rule")]
    pub pass_rule: String,
    pub tasks: Vec<Task>,
}

fn default_pass_rule() -> String {
    "all_success".to_string()
}

/// Frozen, validated plan: once stored in `SessionState::stage_plan` it is
/// never mutated again for the life of the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagePlan {
    pub plan_id: String,
    pub objective: String,
    pub stages: Vec<Stage>,
}

impl StagePlan {
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn stage(&self, stage_id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.stage_id == stage_id)
    }

    pub fn stage_index_of(&self, stage_id: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.stage_id == stage_id)
    }
}

/// Per-task progress tracked by the scheduler and persisted in session state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProgress {
    pub attempt: u32,
    pub status: TaskStatus,
    pub planned_files: Vec<String>,
    #[serde(default)]
    pub completed_files: Vec<String>,
    #[serde(default)]
    pub remaining_files: Vec<String>,
    #[serde(default)]
    pub file_changes: Vec<FileChangeRecord>,
    pub last_error: Option<String>,
    pub last_reply: Option<String>,
    #[serde(default)]
    pub last_cost: f64,
}

impl TaskProgress {
    pub fn seed(task: &Task) -> Self {
        TaskProgress {
            attempt: 0,
            status: TaskStatus::Pending,
            planned_files: task.planned_files.clone(),
            completed_files: Vec::new(),
            remaining_files: task.planned_files.clone(),
            file_changes: Vec::new(),
            last_error: None,
            last_reply: None,
            last_cost: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateVerdict {
    Pass,
    Fail,
    Warn,
    NotApplicable,
    Disabled,
}

impl GateVerdict {
    pub fn is_passing(self) -> bool {
        matches!(self, GateVerdict::Pass | GateVerdict::NotApplicable)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateStatus {
    pub enabled: bool,
    pub status: GateVerdict,
    pub reason: String,
    pub output: Option<String>,
}

/// The durable, per-session record stored under `sessions.<id>` in the state
/// file. Everything the driver needs to resume across a crash lives here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub status: SessionStatus,
    pub phase: DriverPhase,
    pub current_gate: String,
    pub stage_plan: Option<StagePlan>,
    pub stage_index: usize,
    pub stage_count: usize,
    pub current_stage_id: Option<String>,
    pub task_progress: HashMap<String, TaskProgress>,
    pub file_changes: Vec<FileChangeRecord>,
    pub gate_status: HashMap<String, GateStatus>,
    pub recovery_count: u32,
    pub iterations: u32,
    pub heartbeat_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub stop_requested: bool,
    pub retry_stage_id: Option<String>,
}

impl SessionState {
    /// The default template a new session starts from before its first patch.
    pub fn new(now: DateTime<Utc>) -> Self {
        SessionState {
            status: SessionStatus::Idle,
            phase: DriverPhase::Intake,
            current_gate: "intake".to_string(),
            stage_plan: None,
            stage_index: 0,
            stage_count: 0,
            current_stage_id: None,
            task_progress: HashMap::new(),
            file_changes: Vec::new(),
            gate_status: HashMap::new(),
            recovery_count: 0,
            iterations: 0,
            heartbeat_at: now,
            updated_at: now,
            created_at: now,
            stop_requested: false,
            retry_stage_id: None,
        }
    }

    /// Shallow-merges `patch` over `self`: only `Some` fields override, every
    /// other field (including unknown-to-us future fields, were this JSON
    /// instead of a typed struct) is preserved untouched. `updated_at` is
    /// always stamped to `now`, even for an empty patch.
    pub fn apply_patch(&mut self, patch: SessionStatePatch, now: DateTime<Utc>) {
        if let Some(v) = patch.status {
            self.status = v;
        }
        if let Some(v) = patch.phase {
            self.phase = v;
        }
        if let Some(v) = patch.current_gate {
            self.current_gate = v;
        }
        if let Some(v) = patch.stage_plan {
            self.stage_plan = Some(v);
        }
        if let Some(v) = patch.stage_index {
            self.stage_index = v;
        }
        if let Some(v) = patch.stage_count {
            self.stage_count = v;
        }
        if let Some(v) = patch.current_stage_id {
            self.current_stage_id = Some(v);
        }
        if let Some(v) = patch.task_progress {
            self.task_progress = v;
        }
        if let Some(v) = patch.file_changes {
            self.file_changes = v;
        }
        if let Some(v) = patch.gate_status {
            self.gate_status = v;
        }
        if let Some(v) = patch.recovery_count {
            self.recovery_count = v;
        }
        if let Some(v) = patch.iterations {
            self.iterations = v;
        }
        if let Some(v) = patch.heartbeat_at {
            self.heartbeat_at = v;
        }
        if let Some(v) = patch.stop_requested {
            self.stop_requested = v;
        }
        if patch.clear_retry_stage_id {
            self.retry_stage_id = None;
        } else if let Some(v) = patch.retry_stage_id {
            self.retry_stage_id = Some(v);
        }
        self.updated_at = now;
    }
}

/// A typed patch: every field is optional, matching `update(patch)`'s shallow-
/// merge contract without resorting to a dynamic map.
#[derive(Debug, Clone, Default)]
pub struct SessionStatePatch {
    pub status: Option<SessionStatus>,
    pub phase: Option<DriverPhase>,
    pub current_gate: Option<String>,
    pub stage_plan: Option<StagePlan>,
    pub stage_index: Option<usize>,
    pub stage_count: Option<usize>,
    pub current_stage_id: Option<String>,
    pub task_progress: Option<HashMap<String, TaskProgress>>,
    pub file_changes: Option<Vec<FileChangeRecord>>,
    pub gate_status: Option<HashMap<String, GateStatus>>,
    pub recovery_count: Option<u32>,
    pub iterations: Option<u32>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub stop_requested: Option<bool>,
    pub retry_stage_id: Option<String>,
    /// Distinguishes "no opinion" from "clear this field", since `Option<String>`
    /// alone can't express removing `retry_stage_id` through a shallow merge.
    pub clear_retry_stage_id: bool,
}

impl SessionStatePatch {
    pub fn stop() -> Self {
        SessionStatePatch {
            stop_requested: Some(true),
            ..Default::default()
        }
    }

    pub fn clear_stop() -> Self {
        SessionStatePatch {
            stop_requested: Some(false),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_patch_is_shallow_merge() {
        let t0 = Utc::now();
        let mut state = SessionState::new(t0);
        state.iterations = 3;
        state.current_gate = "planning".to_string();

        let t1 = t0 + chrono::Duration::seconds(1);
        state.apply_patch(
            SessionStatePatch {
                iterations: Some(4),
                ..Default::default()
            },
            t1,
        );

        assert_eq!(state.iterations, 4);
        assert_eq!(state.current_gate, "planning");
        assert_eq!(state.updated_at, t1);
    }

    #[test]
    fn empty_patch_only_touches_updated_at() {
        let t0 = Utc::now();
        let mut state = SessionState::new(t0);
        state.iterations = 7;
        let t1 = t0 + chrono::Duration::seconds(1);
        state.apply_patch(SessionStatePatch::default(), t1);
        assert_eq!(state.iterations, 7);
        assert_eq!(state.updated_at, t1);
    }

    #[test]
    fn clear_retry_stage_id_wins_over_stale_value() {
        let t0 = Utc::now();
        let mut state = SessionState::new(t0);
        state.retry_stage_id = Some("s2".to_string());
        state.apply_patch(
            SessionStatePatch {
                clear_retry_stage_id: true,
                ..Default::default()
            },
            t0,
        );
        assert!(state.retry_stage_id.is_none());
    }

    #[test]
    fn task_status_terminal_classification() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Error.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
    }

    #[test]
    fn gate_verdict_passing_includes_not_applicable() {
        assert!(GateVerdict::Pass.is_passing());
        assert!(GateVerdict::NotApplicable.is_passing());
        assert!(!GateVerdict::Fail.is_passing());
        assert!(!GateVerdict::Warn.is_passing());
    }
}
