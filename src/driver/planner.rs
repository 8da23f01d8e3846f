//! Production `Planner`/`CompletionVerifier`: invoke the configured
//! coding-agent CLI and parse its JSON reply into a `RawPlan`. Grounded on
//! the call-claude-and-extract-json pattern of this crate's own
//! issue-decomposition planner, generalized from the wave/task shape to
//! this crate's stage/task `RawPlan` shape.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

use super::{CompletionVerifier, Planner};
use crate::plan::RawPlan;

const PLAN_SYSTEM_PROMPT: &str = r#"You are a staged task planner for a coding agent. Decompose the
objective into an ordered list of stages; within a stage every task must touch a disjoint set of
files so they can run in parallel. Respond with JSON only (no markdown fences), matching:
{
  "objective": "restated objective",
  "stages": [
    {
      "stage_id": "stage_0",
      "name": "short name",
      "tasks": [
        {
          "task_id": "stage_0_task_0",
          "prompt": "full instructions for the agent doing this task",
          "planned_files": ["path/touched.rs"],
          "acceptance": ["criterion the task must satisfy"],
          "complexity": "low" | "medium" | "high"
        }
      ]
    }
  ]
}
Keep stages to the minimum needed for correctness; a simple objective should produce one stage
with one task."#;

pub struct CliPlanner {
    command: String,
    extra_args: Vec<String>,
    project_dir: PathBuf,
}

impl CliPlanner {
    pub fn new(command: impl Into<String>, extra_args: Vec<String>, project_dir: impl Into<PathBuf>) -> Self {
        CliPlanner {
            command: command.into(),
            extra_args,
            project_dir: project_dir.into(),
        }
    }

    async fn call(&self, prompt: &str) -> Result<String> {
        let output = Command::new(&self.command)
            .args(&self.extra_args)
            .current_dir(&self.project_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to run planner command '{}'", self.command))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("planner command exited with {}: {}", output.status, stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl Planner for CliPlanner {
    async fn plan(&self, objective: &str, prior_context: &str) -> Result<RawPlan> {
        let prompt = format!(
            "{PLAN_SYSTEM_PROMPT}\n\n## Objective\n{objective}\n\n## Prior stage context\n{prior_context}\n\nRespond with JSON only."
        );
        let reply = self.call(&prompt).await?;
        parse_raw_plan(&reply).context("failed to parse planner reply as a stage plan")
    }
}

#[async_trait]
impl CompletionVerifier for CliPlanner {
    async fn confirm_completion(&self, objective: &str, prior_context: &str) -> Result<String> {
        let prompt = format!(
            "The objective was:\n{objective}\n\nWork completed so far:\n{prior_context}\n\n\
             Reply with a one-paragraph summary of what was done. If the objective is fully met, \
             include the exact phrase [TASK_COMPLETE]."
        );
        self.call(&prompt).await
    }
}

fn parse_raw_plan(text: &str) -> Result<RawPlan> {
    if let Ok(plan) = serde_json::from_str::<RawPlan>(text) {
        return Ok(plan);
    }
    let cleaned = text.replace("```json", "").replace("```", "");
    if let Ok(plan) = serde_json::from_str::<RawPlan>(cleaned.trim()) {
        return Ok(plan);
    }
    let extracted = extract_json_object(&cleaned).unwrap_or(cleaned.trim());
    serde_json::from_str(extracted).context("planner reply is not valid JSON")
}

/// Finds the first balanced top-level `{...}` object in `text`, tolerating
/// leading/trailing prose and escaped quotes within strings.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0;
    let mut in_string = false;
    let mut escape = false;
    for (i, ch) in text[start..].char_indices() {
        if escape {
            escape = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + i]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_direct_json() {
        let raw = parse_raw_plan(r#"{"objective":"x","stages":[]}"#).unwrap();
        assert_eq!(raw.objective.as_deref(), Some("x"));
    }

    #[test]
    fn parses_json_wrapped_in_markdown_fence() {
        let text = "Here is the plan:\n```json\n{\"objective\":\"x\",\"stages\":[]}\n```\n";
        let raw = parse_raw_plan(text).unwrap();
        assert_eq!(raw.objective.as_deref(), Some("x"));
    }

    #[test]
    fn parses_json_with_leading_and_trailing_prose() {
        let text = r#"Sure thing: {"objective": "x", "stages": []} — let me know if you need changes."#;
        let raw = parse_raw_plan(text).unwrap();
        assert_eq!(raw.objective.as_deref(), Some("x"));
    }

    #[test]
    fn rejects_non_json() {
        assert!(parse_raw_plan("not json at all").is_err());
    }
}
