//! Capped, order-preserving merge of file-change records. Used to fold a
//! worker's reported changes into a task's or stage's running total without
//! letting a noisy worker grow the record list without bound.

use crate::state::FileChangeRecord;

/// Merges `incoming` into `existing`, summing line counts when a record with
/// the same `(path, stage_id, task_id)` key already exists. A collision moves
/// that key to the end (newest-insertion-order), and the result is truncated
/// to `limit` entries (oldest dropped first) if it would exceed it.
pub fn merge_file_changes(
    existing: &[FileChangeRecord],
    incoming: &[FileChangeRecord],
    limit: usize,
) -> Vec<FileChangeRecord> {
    let mut merged: Vec<FileChangeRecord> = existing.to_vec();

    for record in incoming {
        let existing_idx = merged.iter().position(|r| {
            r.path == record.path && r.stage_id == record.stage_id && r.task_id == record.task_id
        });
        let mut next = record.clone();
        if let Some(idx) = existing_idx {
            let prior = merged.remove(idx);
            next.added_lines += prior.added_lines;
            next.removed_lines += prior.removed_lines;
        }
        merged.push(next);
    }

    if merged.len() > limit {
        let drop = merged.len() - limit;
        merged.drain(0..drop);
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str, stage: &str, task: &str, added: u64) -> FileChangeRecord {
        FileChangeRecord {
            path: path.to_string(),
            added_lines: added,
            removed_lines: 0,
            stage_id: stage.to_string(),
            task_id: task.to_string(),
        }
    }

    #[test]
    fn sums_lines_on_matching_key() {
        let existing = vec![record("a.rs", "s1", "t1", 5)];
        let incoming = vec![record("a.rs", "s1", "t1", 3)];
        let merged = merge_file_changes(&existing, &incoming, 400);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].added_lines, 8);
    }

    #[test]
    fn appends_distinct_keys_in_order() {
        let existing = vec![record("a.rs", "s1", "t1", 1)];
        let incoming = vec![record("b.rs", "s1", "t2", 2)];
        let merged = merge_file_changes(&existing, &incoming, 400);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[1].path, "b.rs");
    }

    #[test]
    fn truncates_oldest_entries_beyond_limit() {
        let existing: Vec<FileChangeRecord> = (0..5)
            .map(|i| record(&format!("f{i}.rs"), "s1", "t1", 1))
            .collect();
        let incoming = vec![record("new.rs", "s1", "t1", 1)];
        let merged = merge_file_changes(&existing, &incoming, 3);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged.last().unwrap().path, "new.rs");
        assert_eq!(merged[0].path, "f3.rs");
    }
}
