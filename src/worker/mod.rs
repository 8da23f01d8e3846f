//! Worker Pool (§4.4): the narrow, external-facing capability the scheduler
//! consumes to launch, poll, and cancel sub-tasks. Two implementations ship
//! here: a spawned-CLI-process pool for production use, and an in-memory
//! scripted pool for tests.

mod process;
mod scripted;

pub use process::ProcessWorkerPool;
pub use scripted::{ScriptedOutcome, ScriptedWorkerPool};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::state::FileChangeRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleStatus {
    Running,
    Completed,
    Error,
    Interrupted,
    Cancelled,
}

impl HandleStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, HandleStatus::Running)
    }
}

/// Everything the pool needs to start one task's sub-session.
#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    pub session_id: String,
    pub sub_session_id: String,
    pub prompt: String,
    pub model: Option<String>,
    pub subagent_hint: Option<String>,
    pub stage_id: String,
    pub task_id: String,
    pub planned_files: Vec<String>,
    pub attempt: u32,
    pub timeout_ms: u64,
}

/// Returned by a terminal `poll`; mirrors the task result envelope (§3).
#[derive(Debug, Clone, Default)]
pub struct TaskResultEnvelope {
    pub completed_files: Vec<String>,
    pub remaining_files: Vec<String>,
    pub file_changes: Vec<FileChangeRecord>,
    pub reply: String,
    pub cost: f64,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PollResult {
    pub status: HandleStatus,
    pub result: Option<TaskResultEnvelope>,
    pub error: Option<String>,
}

/// Opaque handle identifying an in-flight or completed worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskHandle(pub String);

/// The scheduler's view of the worker pool. Implementations may back this
/// with OS processes, threads, or pure in-memory scripting; the scheduler
/// never assumes which.
#[async_trait]
pub trait WorkerPool: Send + Sync {
    async fn launch(&self, descriptor: TaskDescriptor) -> anyhow::Result<TaskHandle>;

    async fn poll(&self, handle: &TaskHandle) -> anyhow::Result<PollResult>;

    async fn cancel(&self, handle: &TaskHandle) -> anyhow::Result<()>;

    /// Advances internal worker state (reaping finished children, etc).
    /// Called once per dispatch-loop round before polling.
    async fn tick(&self) -> anyhow::Result<()>;

    /// The pool's own concurrency ceiling, independent of any particular
    /// stage's configured `max_concurrency`. Informational: the scheduler
    /// still enforces the stage's own limit as a hard cap on running tasks.
    fn max_parallel(&self) -> usize;
}
