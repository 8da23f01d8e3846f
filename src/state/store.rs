//! Durable `sessionId -> SessionState` map backed by a single JSON file with
//! PID-aware advisory locking (see `crate::state::lock`).

use anyhow::{Context, Result};
use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::lock::FileLock;
use super::types::{SessionState, SessionStatePatch};
use crate::errors::StateStoreError;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    sessions: HashMap<String, SessionState>,
}

/// Owns the on-disk path and lock timeout; safe to share across tasks within
/// one process behind an `Arc` (each `update` still re-acquires the
/// cross-process file lock for the critical section).
#[derive(Clone)]
pub struct StateStore {
    path: PathBuf,
    lock_timeout: Duration,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        StateStore {
            path: path.into(),
            lock_timeout,
        }
    }

    /// Runs `f` with the store's cross-process lock held, reading and writing
    /// the whole file so multi-step critical sections (e.g. read-status-then-
    /// merge) observe a consistent snapshot.
    pub async fn with_lock<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut HashMap<String, SessionState>) -> Result<T>,
    {
        let lock = FileLock::acquire(&self.path, self.lock_timeout).await?;
        let mut file = self.read_file()?;
        let result = f(&mut file.sessions)?;
        self.write_file(&file)?;
        lock.release();
        Ok(result)
    }

    pub async fn update(
        &self,
        session_id: &str,
        patch: SessionStatePatch,
    ) -> Result<SessionState> {
        let session_id = session_id.to_string();
        self.with_lock(move |sessions| {
            let now = Utc::now();
            let mut state = sessions
                .remove(&session_id)
                .unwrap_or_else(|| SessionState::new(now));
            state.apply_patch(patch, now);
            sessions.insert(session_id.clone(), state.clone());
            Ok(state)
        })
        .await
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<SessionState>> {
        let file = self.read_file()?;
        Ok(file.sessions.get(session_id).cloned())
    }

    /// Sessions ordered by `updated_at` descending (most recently touched
    /// first).
    pub async fn list(&self) -> Result<Vec<(String, SessionState)>> {
        let file = self.read_file()?;
        let mut entries: Vec<(String, SessionState)> = file.sessions.into_iter().collect();
        entries.sort_by(|a, b| b.1.updated_at.cmp(&a.1.updated_at));
        Ok(entries)
    }

    pub async fn stop(&self, session_id: &str) -> Result<SessionState> {
        self.update(session_id, SessionStatePatch::stop()).await
    }

    pub async fn clear_stop(&self, session_id: &str) -> Result<SessionState> {
        self.update(session_id, SessionStatePatch::clear_stop())
            .await
    }

    fn read_file(&self) -> Result<StateFile> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => Ok(StateFile::default()),
            Ok(contents) => serde_json::from_str(&contents).map_err(|source| {
                StateStoreError::Corrupt {
                    path: self.path.clone(),
                    source,
                }
                .into()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StateFile::default()),
            Err(source) => Err(StateStoreError::ReadFailed {
                path: self.path.clone(),
                source,
            }
            .into()),
        }
    }

    /// Truncates and rewrites the whole file, additionally taking an
    /// OS-level advisory exclusive lock on the file handle itself for the
    /// duration of the write.
    fn write_file(&self, file: &StateFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let handle = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|source| StateStoreError::WriteFailed {
                path: self.path.clone(),
                source,
            })?;
        handle
            .lock_exclusive()
            .context("failed to take advisory OS lock on state file")?;
        serde_json::to_writer_pretty(&handle, file).map_err(|e| {
            anyhow::Error::from(StateStoreError::Corrupt {
                path: self.path.clone(),
                source: e,
            })
        })?;
        FileExt::unlock(&handle).context("failed to release advisory OS lock")?;
        Ok(())
    }
}

fn path_for_project(project_dir: &Path) -> PathBuf {
    project_dir.join(".kkcode").join("longagent-state.json")
}

impl StateStore {
    /// Convenience constructor matching the external interface's documented
    /// path: `<project>/.kkcode/longagent-state.json`.
    pub fn for_project(project_dir: &Path, lock_timeout: Duration) -> Self {
        StateStore::new(path_for_project(project_dir), lock_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::types::SessionStatus;
    use tempfile::tempdir;

    fn store(dir: &tempfile::TempDir) -> StateStore {
        StateStore::new(dir.path().join("state.json"), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn update_creates_session_with_monotonic_updated_at() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        let s1 = store.update("sess-1", SessionStatePatch::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let s2 = store
            .update(
                "sess-1",
                SessionStatePatch {
                    iterations: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(s2.updated_at > s1.updated_at);
        assert_eq!(s2.iterations, 1);
    }

    #[tokio::test]
    async fn empty_patch_is_a_noop_except_for_updated_at() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        store
            .update(
                "sess-1",
                SessionStatePatch {
                    iterations: Some(5),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let before = store.get("sess-1").await.unwrap().unwrap();
        let after = store
            .update("sess-1", SessionStatePatch::default())
            .await
            .unwrap();
        assert_eq!(before.iterations, after.iterations);
        assert!(after.updated_at >= before.updated_at);
    }

    #[tokio::test]
    async fn list_orders_by_updated_at_descending() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        store.update("a", SessionStatePatch::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.update("b", SessionStatePatch::default()).await.unwrap();
        let entries = store.list().await.unwrap();
        assert_eq!(entries[0].0, "b");
        assert_eq!(entries[1].0, "a");
    }

    #[tokio::test]
    async fn stop_and_clear_stop_round_trip() {
        let dir = tempdir().unwrap();
        let store = store(&dir);
        store.update("a", SessionStatePatch::default()).await.unwrap();
        let stopped = store.stop("a").await.unwrap();
        assert!(stopped.stop_requested);
        let cleared = store.clear_stop("a").await.unwrap();
        assert!(!cleared.stop_requested);
    }

    #[tokio::test]
    async fn concurrent_updates_to_same_session_both_succeed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store_a = StateStore::new(&path, Duration::from_secs(5));
        let store_b = StateStore::new(&path, Duration::from_secs(5));

        let (r1, r2) = tokio::join!(
            store_a.update(
                "sess",
                SessionStatePatch {
                    iterations: Some(1),
                    ..Default::default()
                },
            ),
            store_b.update(
                "sess",
                SessionStatePatch {
                    current_gate: Some("planning".into()),
                    ..Default::default()
                },
            ),
        );
        assert!(r1.is_ok());
        assert!(r2.is_ok());

        let final_state = store_a.get("sess").await.unwrap().unwrap();
        assert_eq!(final_state.iterations, 1);
        assert_eq!(final_state.current_gate, "planning");
        assert_eq!(final_state.status, SessionStatus::Idle);
    }
}
