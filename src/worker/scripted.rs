//! In-memory, scripted worker pool used by the test suite to drive the
//! scheduler and driver deterministically without spawning real processes.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

use super::{HandleStatus, PollResult, TaskDescriptor, TaskHandle, TaskResultEnvelope, WorkerPool};

/// What a scripted worker should do when launched for a given task id. Each
/// outcome is consumed once; a task's later attempts pull the next outcome
/// in its queue (or repeat the last one if the queue is exhausted).
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    Completed(TaskResultEnvelope),
    Error(String),
}

pub struct ScriptedWorkerPool {
    scripts: Mutex<HashMap<String, Vec<ScriptedOutcome>>>,
    handles: Mutex<HashMap<String, (String, ScriptedOutcome)>>,
    next_id: AtomicU64,
    max_parallel: usize,
}

impl ScriptedWorkerPool {
    pub fn new(max_parallel: usize) -> Self {
        ScriptedWorkerPool {
            scripts: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            max_parallel,
        }
    }

    pub async fn script(&self, task_id: impl Into<String>, outcomes: Vec<ScriptedOutcome>) {
        self.scripts.lock().await.insert(task_id.into(), outcomes);
    }
}

#[async_trait]
impl WorkerPool for ScriptedWorkerPool {
    async fn launch(&self, descriptor: TaskDescriptor) -> anyhow::Result<TaskHandle> {
        let mut scripts = self.scripts.lock().await;
        let queue = scripts.entry(descriptor.task_id.clone()).or_insert_with(Vec::new);
        let outcome = if queue.is_empty() {
            ScriptedOutcome::Completed(TaskResultEnvelope {
                completed_files: descriptor.planned_files.clone(),
                reply: "[TASK_COMPLETE]".to_string(),
                ..Default::default()
            })
        } else if queue.len() == 1 {
            queue[0].clone()
        } else {
            queue.remove(0)
        };

        let handle_id = format!("scripted-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.handles
            .lock()
            .await
            .insert(handle_id.clone(), (descriptor.task_id.clone(), outcome));
        Ok(TaskHandle(handle_id))
    }

    async fn poll(&self, handle: &TaskHandle) -> anyhow::Result<PollResult> {
        let handles = self.handles.lock().await;
        let Some((_, outcome)) = handles.get(&handle.0) else {
            return Ok(PollResult {
                status: HandleStatus::Error,
                result: None,
                error: Some(format!("unknown handle {}", handle.0)),
            });
        };

        Ok(match outcome {
            ScriptedOutcome::Completed(envelope) => PollResult {
                status: HandleStatus::Completed,
                result: Some(envelope.clone()),
                error: None,
            },
            ScriptedOutcome::Error(message) => PollResult {
                status: HandleStatus::Error,
                result: Some(TaskResultEnvelope {
                    error: Some(message.clone()),
                    ..Default::default()
                }),
                error: Some(message.clone()),
            },
        })
    }

    async fn cancel(&self, handle: &TaskHandle) -> anyhow::Result<()> {
        let mut handles = self.handles.lock().await;
        handles.insert(
            handle.0.clone(),
            (
                String::new(),
                ScriptedOutcome::Error("cancelled".to_string()),
            ),
        );
        Ok(())
    }

    async fn tick(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn max_parallel(&self) -> usize {
        self.max_parallel
    }
}
