//! Plan Validator (§4.3): normalizes and validates an arbitrary planner
//! response into a frozen `StagePlan`, enforcing the file-ownership
//! invariants. Grounded on the planner-response parsing/validation shape
//! used elsewhere in this codebase for LLM-produced JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::state::{Complexity, Stage, StagePlan, Task};

const MAX_PLANNED_FILES: usize = 80;
const MAX_ACCEPTANCE: usize = 50;

/// Raw, untrusted shape the planner (an external LLM collaborator) is
/// expected to emit. Every field is as permissive as possible; normalization
/// and validation happen in `PlanValidator::validate`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawPlan {
    #[serde(default)]
    pub objective: Option<String>,
    #[serde(default)]
    pub stages: Vec<RawStage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawStage {
    #[serde(default)]
    pub stage_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tasks: Vec<RawTask>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawTask {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub planned_files: Vec<String>,
    #[serde(default)]
    pub acceptance: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub complexity: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

/// Defaults applied while normalizing a task that omitted a field.
#[derive(Debug, Clone, Copy)]
pub struct TaskDefaults {
    pub timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for TaskDefaults {
    fn default() -> Self {
        TaskDefaults {
            timeout_ms: 600_000,
            max_retries: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidatedPlan {
    pub plan: StagePlan,
    pub errors: Vec<String>,
    pub quality_score: i32,
}

pub struct PlanValidator {
    defaults: TaskDefaults,
}

impl PlanValidator {
    pub fn new(defaults: TaskDefaults) -> Self {
        PlanValidator { defaults }
    }

    /// Validates and normalizes `raw`. On any invariant failure, returns a
    /// trivial single-stage single-task fallback plan derived from
    /// `objective_fallback`, with every violation recorded in `errors` — it
    /// is up to the caller whether to proceed with the fallback.
    pub fn validate(&self, raw: RawPlan, objective_fallback: &str) -> ValidatedPlan {
        let mut errors = Vec::new();
        let objective = raw
            .objective
            .clone()
            .unwrap_or_else(|| objective_fallback.to_string());

        if objective.trim().is_empty() {
            errors.push("objective must be non-empty".to_string());
        }
        if raw.stages.is_empty() {
            errors.push("plan must contain at least one stage".to_string());
        }

        let mut stages = Vec::new();
        let mut seen_files: HashMap<String, String> = HashMap::new();

        for (stage_idx, raw_stage) in raw.stages.iter().enumerate() {
            let stage_id = raw_stage
                .stage_id
                .clone()
                .unwrap_or_else(|| format!("stage_{}", stage_idx));

            if raw_stage.tasks.is_empty() {
                errors.push(format!("stage '{stage_id}' must have at least one task"));
            }

            let mut stage_files: HashMap<String, String> = HashMap::new();
            let mut tasks = Vec::new();

            for raw_task in &raw_stage.tasks {
                let task_id = raw_task
                    .task_id
                    .clone()
                    .unwrap_or_else(|| format!("{}_task_{}", stage_id, random_suffix()));

                let prompt = raw_task.prompt.clone().unwrap_or_default();
                if prompt.trim().is_empty() {
                    errors.push(format!("task '{task_id}' must have a non-empty prompt"));
                }

                let planned_files = normalize_planned_files(&raw_task.planned_files);
                for path in &planned_files {
                    if let Some(owner) = stage_files.get(path) {
                        errors.push(format!(
                            "file '{path}' is claimed by both '{owner}' and '{task_id}' in stage '{stage_id}'"
                        ));
                    } else {
                        stage_files.insert(path.clone(), task_id.clone());
                    }
                    if let Some(owner_stage) = seen_files.get(path)
                        && owner_stage != &stage_id
                    {
                        errors.push(format!(
                            "file '{path}' appears in both stage '{owner_stage}' and stage '{stage_id}'"
                        ));
                    }
                }

                let acceptance = normalize_capped(&raw_task.acceptance, MAX_ACCEPTANCE);
                let complexity = raw_task
                    .complexity
                    .as_deref()
                    .and_then(|s| s.parse::<Complexity>().ok())
                    .unwrap_or(Complexity::Medium);
                let timeout_ms = raw_task.timeout_ms.unwrap_or(self.defaults.timeout_ms).max(1000);
                let max_retries = raw_task.max_retries.unwrap_or(self.defaults.max_retries);

                tasks.push(Task {
                    task_id,
                    prompt,
                    planned_files,
                    acceptance,
                    depends_on: raw_task.depends_on.clone(),
                    complexity,
                    timeout_ms,
                    max_retries,
                });
            }

            for path in stage_files.keys() {
                seen_files.insert(path.clone(), stage_id.clone());
            }

            stages.push(Stage {
                stage_id,
                name: raw_stage.name.clone().unwrap_or_else(|| "stage".to_string()),
                pass_rule: "all_success".to_string(),
                tasks,
            });
        }

        if !errors.is_empty() {
            return ValidatedPlan {
                plan: fallback_plan(&objective),
                errors,
                quality_score: 0,
            };
        }

        let quality_score = compute_quality_score(&stages);
        ValidatedPlan {
            plan: StagePlan {
                plan_id: format!("plan_{}", random_suffix()),
                objective,
                stages,
            },
            errors,
            quality_score,
        }
    }
}

fn normalize_planned_files(raw: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for path in raw {
        let trimmed = path.trim().replace('\\', "/");
        if trimmed.is_empty() || !seen.insert(trimmed.clone()) {
            continue;
        }
        out.push(trimmed);
        if out.len() >= MAX_PLANNED_FILES {
            break;
        }
    }
    out
}

fn normalize_capped(raw: &[String], cap: usize) -> Vec<String> {
    raw.iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .take(cap)
        .collect()
}

fn compute_quality_score(stages: &[Stage]) -> i32 {
    let mut score: i32 = 100;
    for stage in stages {
        for task in &stage.tasks {
            if task.planned_files.is_empty() {
                score -= 15;
            }
            if task.acceptance.is_empty() {
                score -= 10;
            }
        }
    }
    score.max(0)
}

fn fallback_plan(objective: &str) -> StagePlan {
    StagePlan {
        plan_id: format!("plan_fallback_{}", random_suffix()),
        objective: objective.to_string(),
        stages: vec![Stage {
            stage_id: "stage_0".to_string(),
            name: "fallback".to_string(),
            pass_rule: "all_success".to_string(),
            tasks: vec![Task {
                task_id: "stage_0_task_0".to_string(),
                prompt: format!("Implement the following objective:\n\n{objective}"),
                planned_files: Vec::new(),
                acceptance: Vec::new(),
                depends_on: Vec::new(),
                complexity: Complexity::Medium,
                timeout_ms: 600_000,
                max_retries: 2,
            }],
        }],
    }
}

fn random_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, files: &[&str]) -> RawTask {
        RawTask {
            task_id: Some(id.to_string()),
            prompt: Some(format!("do {id}")),
            planned_files: files.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn happy_path_single_stage_single_task() {
        let raw = RawPlan {
            objective: Some("print hello".to_string()),
            stages: vec![RawStage {
                stage_id: Some("s1".to_string()),
                name: Some("print".to_string()),
                tasks: vec![task("t1", &["hello.txt"])],
            }],
        };
        let validator = PlanValidator::new(TaskDefaults::default());
        let result = validator.validate(raw, "fallback");
        assert!(result.errors.is_empty());
        assert_eq!(result.plan.stages.len(), 1);
        assert_eq!(result.plan.stages[0].tasks[0].planned_files, vec!["hello.txt"]);
    }

    #[test]
    fn intra_stage_file_collision_rejected_with_fallback() {
        let raw = RawPlan {
            objective: Some("x".to_string()),
            stages: vec![RawStage {
                stage_id: Some("s1".to_string()),
                name: None,
                tasks: vec![task("t1", &["x.js"]), task("t2", &["x.js"])],
            }],
        };
        let validator = PlanValidator::new(TaskDefaults::default());
        let result = validator.validate(raw, "fallback objective");
        assert!(!result.errors.is_empty());
        assert!(result.errors.iter().any(|e| e.contains("x.js") && e.contains("t1") && e.contains("t2")));
        // fallback plan is single stage/task derived from the objective
        assert_eq!(result.plan.stages.len(), 1);
        assert_eq!(result.plan.stages[0].tasks.len(), 1);
    }

    #[test]
    fn inter_stage_file_collision_rejected() {
        let raw = RawPlan {
            objective: Some("x".to_string()),
            stages: vec![
                RawStage {
                    stage_id: Some("s1".to_string()),
                    name: None,
                    tasks: vec![task("t1", &["shared.rs"])],
                },
                RawStage {
                    stage_id: Some("s2".to_string()),
                    name: None,
                    tasks: vec![task("t2", &["shared.rs"])],
                },
            ],
        };
        let validator = PlanValidator::new(TaskDefaults::default());
        let result = validator.validate(raw, "fallback");
        assert!(result.errors.iter().any(|e| e.contains("shared.rs")));
    }

    #[test]
    fn quality_score_deducts_for_missing_files_and_acceptance() {
        let raw = RawPlan {
            objective: Some("x".to_string()),
            stages: vec![RawStage {
                stage_id: Some("s1".to_string()),
                name: None,
                tasks: vec![RawTask {
                    task_id: Some("t1".to_string()),
                    prompt: Some("do it".to_string()),
                    ..Default::default()
                }],
            }],
        };
        let validator = PlanValidator::new(TaskDefaults::default());
        let result = validator.validate(raw, "fallback");
        assert_eq!(result.quality_score, 100 - 15 - 10);
    }

    #[test]
    fn planned_files_deduplicated_and_capped() {
        let many: Vec<String> = (0..100).map(|i| format!("f{i}.rs")).collect();
        let normalized = normalize_planned_files(&many);
        assert_eq!(normalized.len(), MAX_PLANNED_FILES);
    }

    #[test]
    fn empty_prompt_is_rejected() {
        let raw = RawPlan {
            objective: Some("x".to_string()),
            stages: vec![RawStage {
                stage_id: Some("s1".to_string()),
                name: None,
                tasks: vec![RawTask {
                    task_id: Some("t1".to_string()),
                    prompt: Some("   ".to_string()),
                    ..Default::default()
                }],
            }],
        };
        let validator = PlanValidator::new(TaskDefaults::default());
        let result = validator.validate(raw, "fallback");
        assert!(!result.errors.is_empty());
    }
}
