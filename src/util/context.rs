//! Builds the rolling `priorContext` text handed to each new stage's
//! prompts, condensing prior stage outcomes instead of replaying full
//! transcripts. Grounded on this codebase's iteration-summarization
//! approach to bounding prompt growth across many rounds.

use std::collections::HashSet;

use crate::state::TaskProgress;

const REPLY_SNIPPET_CHARS: usize = 250;

/// Accumulates stage summaries into a single block of text, deduplicating
/// file paths already mentioned in an earlier stage so repeated stages on
/// the same files don't grow the context without bound.
#[derive(Debug, Default)]
pub struct PriorContextBuilder {
    seen_files: HashSet<String>,
    text: String,
}

impl PriorContextBuilder {
    pub fn new() -> Self {
        PriorContextBuilder::default()
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn append_stage(
        &mut self,
        stage_index: usize,
        stage_name: &str,
        all_success: bool,
        fail_count: usize,
        task_progress: &std::collections::HashMap<String, TaskProgress>,
    ) {
        let verdict = if all_success {
            "PASS".to_string()
        } else {
            format!("FAIL, {fail_count}")
        };
        self.text
            .push_str(&format!("### Stage {stage_index}: {stage_name} ({verdict})\n"));

        let mut task_ids: Vec<&String> = task_progress.keys().collect();
        task_ids.sort();
        for task_id in task_ids {
            let progress = &task_progress[task_id];
            let snippet: String = progress
                .last_reply
                .as_deref()
                .unwrap_or("")
                .chars()
                .take(REPLY_SNIPPET_CHARS)
                .collect();
            self.text
                .push_str(&format!("  - [{task_id}] status: {snippet}\n"));
        }

        let mut new_files = Vec::new();
        for progress in task_progress.values() {
            for path in &progress.completed_files {
                if self.seen_files.insert(path.clone()) {
                    new_files.push(path.clone());
                }
            }
        }
        if !new_files.is_empty() {
            self.text.push_str(&format!("  New files: {}\n", new_files.join(", ")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Complexity, Task};
    use std::collections::HashMap;

    fn progress(files: &[&str], reply: &str) -> TaskProgress {
        let task = Task {
            task_id: "t1".to_string(),
            prompt: String::new(),
            planned_files: files.iter().map(|s| s.to_string()).collect(),
            acceptance: Vec::new(),
            depends_on: Vec::new(),
            complexity: Complexity::Medium,
            timeout_ms: 1,
            max_retries: 0,
        };
        let mut p = TaskProgress::seed(&task);
        p.completed_files = files.iter().map(|s| s.to_string()).collect();
        p.last_reply = Some(reply.to_string());
        p
    }

    #[test]
    fn first_stage_lists_all_new_files() {
        let mut builder = PriorContextBuilder::new();
        let mut map = HashMap::new();
        map.insert("t1".to_string(), progress(&["a.rs"], "done"));
        builder.append_stage(0, "setup", true, 0, &map);
        assert!(builder.as_str().contains("PASS"));
        assert!(builder.as_str().contains("New files: a.rs"));
    }

    #[test]
    fn second_stage_does_not_repeat_seen_files() {
        let mut builder = PriorContextBuilder::new();
        let mut map1 = HashMap::new();
        map1.insert("t1".to_string(), progress(&["a.rs"], "done"));
        builder.append_stage(0, "setup", true, 0, &map1);

        let mut map2 = HashMap::new();
        map2.insert("t2".to_string(), progress(&["a.rs", "b.rs"], "done again"));
        builder.append_stage(1, "build", false, 1, &map2);

        let stage_two_section = builder.as_str().split("### Stage 1").nth(1).unwrap();
        assert!(!stage_two_section.contains("a.rs"));
        assert!(stage_two_section.contains("b.rs"));
        assert!(stage_two_section.contains("FAIL, 1"));
    }
}
