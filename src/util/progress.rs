//! Progress stats rollup over a stage's task progress map (§4.8).

use std::collections::{HashMap, HashSet};

use crate::state::{TaskProgress, TaskStatus};

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressStats {
    pub done: usize,
    pub total: usize,
    pub remaining_files: Vec<String>,
    pub remaining_files_count: usize,
}

pub fn compute_progress_stats(task_progress: &HashMap<String, TaskProgress>) -> ProgressStats {
    let total = task_progress.len();
    let done = task_progress
        .values()
        .filter(|p| p.status == TaskStatus::Completed)
        .count();

    let mut seen = HashSet::new();
    let mut remaining_files = Vec::new();
    for progress in task_progress.values() {
        for path in &progress.remaining_files {
            if seen.insert(path.clone()) {
                remaining_files.push(path.clone());
            }
        }
    }

    ProgressStats {
        done,
        total,
        remaining_files_count: remaining_files.len(),
        remaining_files,
    }
}
