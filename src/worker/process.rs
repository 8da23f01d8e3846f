//! Spawns the configured coding-agent CLI as a child process per task,
//! writing the prompt to stdin and capturing stdout as the worker's reply.
//! Grounded on the stdin-piped child-process pattern used elsewhere in this
//! codebase for driving an external coding-agent CLI.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::sync::Mutex;

use super::{HandleStatus, PollResult, TaskDescriptor, TaskHandle, TaskResultEnvelope, WorkerPool};

struct InFlight {
    child: Child,
    descriptor: TaskDescriptor,
}

enum Slot {
    Running(InFlight),
    Done(PollResult),
}

pub struct ProcessWorkerPool {
    command: String,
    extra_args: Vec<String>,
    project_dir: std::path::PathBuf,
    max_parallel: usize,
    next_id: AtomicU64,
    slots: Mutex<HashMap<String, Slot>>,
}

impl ProcessWorkerPool {
    pub fn new(
        command: impl Into<String>,
        extra_args: Vec<String>,
        project_dir: impl Into<std::path::PathBuf>,
        max_parallel: usize,
    ) -> Self {
        ProcessWorkerPool {
            command: command.into(),
            extra_args,
            project_dir: project_dir.into(),
            max_parallel,
            next_id: AtomicU64::new(0),
            slots: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl WorkerPool for ProcessWorkerPool {
    async fn launch(&self, descriptor: TaskDescriptor) -> Result<TaskHandle> {
        let mut cmd = tokio::process::Command::new(&self.command);
        cmd.args(&self.extra_args)
            .current_dir(&self.project_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn worker command '{}'", self.command))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(descriptor.prompt.as_bytes())
                .await
                .context("failed to write prompt to worker stdin")?;
            stdin.shutdown().await.context("failed to close worker stdin")?;
        }

        let handle_id = format!("w{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.slots.lock().await.insert(
            handle_id.clone(),
            Slot::Running(InFlight { child, descriptor }),
        );
        Ok(TaskHandle(handle_id))
    }

    async fn poll(&self, handle: &TaskHandle) -> Result<PollResult> {
        let mut slots = self.slots.lock().await;
        let Some(slot) = slots.get_mut(&handle.0) else {
            return Ok(PollResult {
                status: HandleStatus::Error,
                result: None,
                error: Some(format!("unknown handle {}", handle.0)),
            });
        };

        if let Slot::Done(result) = slot {
            return Ok(result.clone());
        }

        let Slot::Running(in_flight) = slot else {
            unreachable!()
        };

        match in_flight.child.try_wait() {
            Ok(Some(status)) => {
                let output = in_flight
                    .child
                    .stdout
                    .take();
                let reply = match output {
                    Some(mut stdout) => read_to_string_best_effort(&mut stdout).await,
                    None => String::new(),
                };

                let poll_result = if status.success() {
                    PollResult {
                        status: HandleStatus::Completed,
                        result: Some(TaskResultEnvelope {
                            completed_files: in_flight.descriptor.planned_files.clone(),
                            remaining_files: Vec::new(),
                            file_changes: Vec::new(),
                            reply,
                            cost: 0.0,
                            error: None,
                        }),
                        error: None,
                    }
                } else {
                    PollResult {
                        status: HandleStatus::Error,
                        result: Some(TaskResultEnvelope {
                            reply,
                            error: Some(format!("worker exited with status {status}")),
                            ..Default::default()
                        }),
                        error: Some(format!("worker exited with status {status}")),
                    }
                };

                slots.insert(handle.0.clone(), Slot::Done(poll_result.clone()));
                Ok(poll_result)
            }
            Ok(None) => Ok(PollResult {
                status: HandleStatus::Running,
                result: None,
                error: None,
            }),
            Err(e) => Ok(PollResult {
                status: HandleStatus::Error,
                result: None,
                error: Some(e.to_string()),
            }),
        }
    }

    async fn cancel(&self, handle: &TaskHandle) -> Result<()> {
        let mut slots = self.slots.lock().await;
        if let Some(Slot::Running(in_flight)) = slots.get_mut(&handle.0) {
            let _ = in_flight.child.start_kill();
            slots.insert(
                handle.0.clone(),
                Slot::Done(PollResult {
                    status: HandleStatus::Cancelled,
                    result: None,
                    error: None,
                }),
            );
        }
        Ok(())
    }

    async fn tick(&self) -> Result<()> {
        // Reap any children that exited between poll rounds so `try_wait`
        // doesn't accumulate zombies; `poll` already does the reaping work
        // lazily, so there is nothing further to do here.
        Ok(())
    }

    fn max_parallel(&self) -> usize {
        self.max_parallel
    }
}

async fn read_to_string_best_effort(stdout: &mut tokio::process::ChildStdout) -> String {
    use tokio::io::AsyncReadExt;
    let mut buf = String::new();
    let _ = stdout.read_to_string(&mut buf).await;
    buf
}

pub fn shared(pool: ProcessWorkerPool) -> Arc<dyn WorkerPool> {
    Arc::new(pool)
}
