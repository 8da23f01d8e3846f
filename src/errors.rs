//! Typed error hierarchy for the orchestrator core.
//!
//! Three enums cover the three load-bearing subsystem boundaries:
//! - `StateStoreError` — session state persistence and locking
//! - `SchedulerError` — stage dispatch and worker-pool failures
//! - `DriverError` — top-level state-machine failures

use thiserror::Error;

/// Errors from the durable session-state store and its advisory lock.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("failed to acquire lock for {path} within {timeout_ms}ms")]
    LockTimeout {
        path: std::path::PathBuf,
        timeout_ms: u64,
    },

    #[error("failed to read state file at {path}: {source}")]
    ReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write state file at {path}: {source}")]
    WriteFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state file at {path} contains invalid JSON: {source}")]
    Corrupt {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from stage dispatch (the barrier) and the worker pool it drives.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(
        "file '{path}' is claimed by more than one task in stage '{stage_id}': {task_ids:?}"
    )]
    OwnershipViolation {
        stage_id: String,
        path: String,
        task_ids: Vec<String>,
    },

    #[error("failed to launch worker for task '{task_id}': {source}")]
    LaunchFailed {
        task_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("task '{task_id}' has no matching entry in seeded progress")]
    UnknownTask { task_id: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors surfaced by the top-level driver state machine.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("planner produced an invalid plan and no fallback could be derived: {0}")]
    PlanUnrecoverable(String),

    #[error("stage '{stage_id}' exhausted its recovery budget after {recovery_count} attempts")]
    StageRecoveryExhausted {
        stage_id: String,
        recovery_count: u32,
    },

    #[error(transparent)]
    State(#[from] StateStoreError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_store_error_lock_timeout_carries_fields() {
        let err = StateStoreError::LockTimeout {
            path: std::path::PathBuf::from("/tmp/state.json"),
            timeout_ms: 5000,
        };
        assert!(err.to_string().contains("5000"));
    }

    #[test]
    fn scheduler_error_ownership_violation_carries_task_ids() {
        let err = SchedulerError::OwnershipViolation {
            stage_id: "s1".into(),
            path: "x.js".into(),
            task_ids: vec!["t1".into(), "t2".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("x.js"));
        assert!(msg.contains("s1"));
    }

    #[test]
    fn driver_error_converts_from_scheduler_error() {
        let inner = SchedulerError::UnknownTask {
            task_id: "t9".into(),
        };
        let driver_err: DriverError = inner.into();
        match &driver_err {
            DriverError::Scheduler(SchedulerError::UnknownTask { task_id }) => {
                assert_eq!(task_id, "t9");
            }
            _ => panic!("expected DriverError::Scheduler(UnknownTask)"),
        }
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StateStoreError::Other(anyhow::anyhow!("x")));
        assert_std_error(&SchedulerError::Other(anyhow::anyhow!("x")));
        assert_std_error(&DriverError::Other(anyhow::anyhow!("x")));
    }
}
