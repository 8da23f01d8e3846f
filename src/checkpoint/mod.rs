//! Checkpoint Store (§4.2): named, self-contained snapshots per session,
//! written atomically (write-temp-then-rename) and independent of the state
//! lock.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::state::{GateStatus, StagePlan, TaskProgress};

pub const LATEST: &str = "latest";
const STAGE_PREFIX: &str = "stage_";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointRecord {
    pub name: String,
    pub iteration: u32,
    pub phase: String,
    pub gate_status: HashMap<String, GateStatus>,
    pub task_progress: HashMap<String, TaskProgress>,
    pub stage_index: usize,
    pub stage_plan: Option<StagePlan>,
    pub saved_at: DateTime<Utc>,
}

pub struct CleanupOptions {
    pub max_keep: usize,
    pub keep_stage_checkpoints: bool,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        CleanupOptions {
            max_keep: 10,
            keep_stage_checkpoints: true,
        }
    }
}

/// Root directory under which `<sessionId>/<name>.json` checkpoints live.
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        CheckpointStore { root: root.into() }
    }

    /// Matches the documented external path:
    /// `<user-home>/<app>/checkpoints/<sessionId>/<name>.json`.
    pub fn for_app(app: &str) -> Result<Self> {
        let home = dirs::home_dir().context("could not resolve user home directory")?;
        Ok(CheckpointStore::new(home.join(app).join("checkpoints")))
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    pub fn save(&self, session_id: &str, mut record: CheckpointRecord) -> Result<()> {
        record.saved_at = Utc::now();
        let dir = self.session_dir(session_id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create checkpoint dir {}", dir.display()))?;
        let final_path = dir.join(format!("{}.json", record.name));
        let tmp_path = dir.join(format!("{}.json.tmp", record.name));

        let contents = serde_json::to_vec_pretty(&record).context("failed to serialize checkpoint")?;
        std::fs::write(&tmp_path, &contents)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &final_path)
            .with_context(|| format!("failed to rename checkpoint into {}", final_path.display()))?;
        Ok(())
    }

    pub fn load(&self, session_id: &str, name: &str) -> Result<Option<CheckpointRecord>> {
        let path = self.session_dir(session_id).join(format!("{}.json", name));
        match std::fs::read(&path) {
            Ok(bytes) => {
                let record = serde_json::from_slice(&bytes)
                    .with_context(|| format!("corrupt checkpoint at {}", path.display()))?;
                Ok(Some(record))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    pub fn load_latest(&self, session_id: &str) -> Result<Option<CheckpointRecord>> {
        self.load(session_id, LATEST)
    }

    /// Keeps the newest `max_keep` records by `saved_at`; when
    /// `keep_stage_checkpoints` is set, any record whose name starts with
    /// `stage_` survives regardless of age or count.
    pub fn cleanup(&self, session_id: &str, options: CleanupOptions) -> Result<()> {
        let dir = self.session_dir(session_id);
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).with_context(|| format!("failed to list {}", dir.display())),
        };

        let mut records: Vec<(PathBuf, CheckpointRecord)> = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(bytes) = std::fs::read(&path)
                && let Ok(record) = serde_json::from_slice::<CheckpointRecord>(&bytes)
            {
                records.push((path, record));
            }
        }

        records.sort_by(|a, b| b.1.saved_at.cmp(&a.1.saved_at));

        let mut kept = 0usize;
        for (path, record) in records {
            let is_stage = options.keep_stage_checkpoints && record.name.starts_with(STAGE_PREFIX);
            if is_stage || kept < options.max_keep {
                if !is_stage {
                    kept += 1;
                }
                continue;
            }
            let _ = std::fs::remove_file(&path);
        }
        Ok(())
    }
}

pub fn stage_checkpoint_name(stage_id: &str) -> String {
    format!("{}{}", STAGE_PREFIX, stage_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(name: &str) -> CheckpointRecord {
        CheckpointRecord {
            name: name.to_string(),
            iteration: 1,
            phase: "stage_running".to_string(),
            gate_status: HashMap::new(),
            task_progress: HashMap::new(),
            stage_index: 0,
            stage_plan: None,
            saved_at: Utc::now(),
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let record = sample(LATEST);
        store.save("sess-1", record.clone()).unwrap();
        let loaded = store.load_latest("sess-1").unwrap().unwrap();
        assert_eq!(loaded.name, record.name);
        assert_eq!(loaded.iteration, record.iteration);
    }

    #[test]
    fn load_missing_returns_none() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert!(store.load("sess-1", "latest").unwrap().is_none());
    }

    #[test]
    fn cleanup_prunes_beyond_max_keep_but_retains_stage_checkpoints() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());

        for i in 0..5 {
            let mut record = sample(&format!("checkpoint_{i}"));
            record.saved_at = Utc::now() - chrono::Duration::seconds(5 - i);
            store.save("sess-1", record).unwrap();
        }
        store.save("sess-1", sample(&stage_checkpoint_name("s1"))).unwrap();

        store
            .cleanup(
                "sess-1",
                CleanupOptions {
                    max_keep: 2,
                    keep_stage_checkpoints: true,
                },
            )
            .unwrap();

        let dir_entries: Vec<_> = std::fs::read_dir(dir.path().join("sess-1"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();

        assert!(dir_entries.contains(&"stage_s1.json".to_string()));
        let non_stage_count = dir_entries
            .iter()
            .filter(|n| !n.starts_with("stage_"))
            .count();
        assert_eq!(non_stage_count, 2);
    }
}
