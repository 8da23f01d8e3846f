//! Layered runtime configuration for the driver: built-in defaults, then an
//! optional `forge.toml` under the project directory, then environment
//! variables (`.env` loaded via `dotenvy`), then explicit CLI flags — each
//! layer only overrides the fields it actually sets.

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptPolicy {
    FirstRun,
    Always,
    Never,
}

impl std::str::FromStr for PromptPolicy {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "first_run" => Ok(PromptPolicy::FirstRun),
            "always" => Ok(PromptPolicy::Always),
            "never" => Ok(PromptPolicy::Never),
            other => Err(anyhow!("unknown prompt policy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParallelConfig {
    pub max_concurrency: usize,
    pub task_timeout_ms: u64,
    pub task_max_retries: u32,
    pub budget_limit_usd: f64,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        ParallelConfig {
            max_concurrency: 3,
            task_timeout_ms: 600_000,
            task_max_retries: 2,
            budget_limit_usd: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateToggles {
    pub build: bool,
    pub test: bool,
    pub review: bool,
    pub health: bool,
    pub budget: bool,
}

impl Default for GateToggles {
    fn default() -> Self {
        GateToggles {
            build: true,
            test: true,
            review: true,
            health: true,
            budget: true,
        }
    }
}

/// The driver's full set of tunables (§6 "Configuration"). Every field has a
/// documented default; loading only ever narrows from there.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub project_dir: PathBuf,
    pub state_dir: PathBuf,
    pub claude_cmd: String,
    pub claude_args: Vec<String>,
    pub verbose: bool,

    pub max_iterations: u32,
    pub no_progress_warning: u32,
    pub no_progress_limit: u32,
    pub max_stage_recoveries: u32,
    pub max_gate_attempts: u32,
    pub heartbeat_timeout_ms: u64,
    pub checkpoint_interval: u32,
    pub lock_timeout_ms: u64,

    pub parallel: ParallelConfig,

    pub scaffold_enabled: bool,
    pub intake_questions_enabled: bool,
    pub intake_questions_max_rounds: u32,

    pub gates: GateToggles,
    pub gate_prompt_policy: PromptPolicy,

    pub file_changes_limit: usize,

    pub git_gating_enabled: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            project_dir: PathBuf::from("."),
            state_dir: PathBuf::from(".kkcode"),
            claude_cmd: "claude".to_string(),
            claude_args: Vec::new(),
            verbose: false,
            max_iterations: 0,
            no_progress_warning: 3,
            no_progress_limit: 5,
            max_stage_recoveries: 3,
            max_gate_attempts: 5,
            heartbeat_timeout_ms: 120_000,
            checkpoint_interval: 5,
            lock_timeout_ms: 5_000,
            parallel: ParallelConfig::default(),
            scaffold_enabled: true,
            intake_questions_enabled: true,
            intake_questions_max_rounds: 6,
            gates: GateToggles::default(),
            gate_prompt_policy: PromptPolicy::FirstRun,
            file_changes_limit: 400,
            git_gating_enabled: false,
        }
    }
}

/// Mirrors `DriverConfig` but with every field optional, for deserializing a
/// partial `forge.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
struct TomlOverrides {
    claude_cmd: Option<String>,
    verbose: Option<bool>,
    max_iterations: Option<u32>,
    no_progress_warning: Option<u32>,
    no_progress_limit: Option<u32>,
    max_stage_recoveries: Option<u32>,
    max_gate_attempts: Option<u32>,
    heartbeat_timeout_ms: Option<u64>,
    checkpoint_interval: Option<u32>,
    lock_timeout_ms: Option<u64>,
    file_changes_limit: Option<usize>,
    git_gating_enabled: Option<bool>,
    scaffold: Option<ScaffoldOverrides>,
    planner: Option<PlannerOverrides>,
    parallel: Option<ParallelOverrides>,
    usability_gates: Option<GateOverrides>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
struct ScaffoldOverrides {
    enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
struct PlannerOverrides {
    intake_questions: Option<IntakeOverrides>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
struct IntakeOverrides {
    enabled: Option<bool>,
    max_rounds: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
struct ParallelOverrides {
    max_concurrency: Option<usize>,
    task_timeout_ms: Option<u64>,
    task_max_retries: Option<u32>,
    budget_limit_usd: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
struct GateOverrides {
    build: Option<GateToggleOverride>,
    test: Option<GateToggleOverride>,
    review: Option<GateToggleOverride>,
    health: Option<GateToggleOverride>,
    budget: Option<GateToggleOverride>,
    prompt_user: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
struct GateToggleOverride {
    enabled: Option<bool>,
}

impl DriverConfig {
    /// Loads configuration for `project_dir`: defaults, then `forge.toml` if
    /// present, then environment variables (after loading a sibling `.env`
    /// via `dotenvy`, best-effort). CLI flags should be applied afterward by
    /// the caller via the `with_*` builder methods.
    pub fn load(project_dir: impl Into<PathBuf>) -> Result<Self> {
        let project_dir = project_dir.into();
        let _ = dotenvy::from_path(project_dir.join(".env"));

        let mut config = DriverConfig {
            project_dir: project_dir.clone(),
            state_dir: project_dir.join(".kkcode"),
            ..DriverConfig::default()
        };

        let toml_path = project_dir.join("forge.toml");
        if toml_path.exists() {
            let contents = std::fs::read_to_string(&toml_path)
                .with_context(|| format!("failed to read {}", toml_path.display()))?;
            let overrides: TomlOverrides = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", toml_path.display()))?;
            config.apply_toml(overrides);
        }

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_toml(&mut self, overrides: TomlOverrides) {
        if let Some(v) = overrides.claude_cmd {
            self.claude_cmd = v;
        }
        if let Some(v) = overrides.verbose {
            self.verbose = v;
        }
        if let Some(v) = overrides.max_iterations {
            self.max_iterations = v;
        }
        if let Some(v) = overrides.no_progress_warning {
            self.no_progress_warning = v;
        }
        if let Some(v) = overrides.no_progress_limit {
            self.no_progress_limit = v;
        }
        if let Some(v) = overrides.max_stage_recoveries {
            self.max_stage_recoveries = v;
        }
        if let Some(v) = overrides.max_gate_attempts {
            self.max_gate_attempts = v;
        }
        if let Some(v) = overrides.heartbeat_timeout_ms {
            self.heartbeat_timeout_ms = v;
        }
        if let Some(v) = overrides.checkpoint_interval {
            self.checkpoint_interval = v;
        }
        if let Some(v) = overrides.lock_timeout_ms {
            self.lock_timeout_ms = v;
        }
        if let Some(v) = overrides.file_changes_limit {
            self.file_changes_limit = v;
        }
        if let Some(v) = overrides.git_gating_enabled {
            self.git_gating_enabled = v;
        }
        if let Some(scaffold) = overrides.scaffold
            && let Some(v) = scaffold.enabled
        {
            self.scaffold_enabled = v;
        }
        if let Some(planner) = overrides.planner
            && let Some(intake) = planner.intake_questions
        {
            if let Some(v) = intake.enabled {
                self.intake_questions_enabled = v;
            }
            if let Some(v) = intake.max_rounds {
                self.intake_questions_max_rounds = v;
            }
        }
        if let Some(parallel) = overrides.parallel {
            if let Some(v) = parallel.max_concurrency {
                self.parallel.max_concurrency = v;
            }
            if let Some(v) = parallel.task_timeout_ms {
                self.parallel.task_timeout_ms = v;
            }
            if let Some(v) = parallel.task_max_retries {
                self.parallel.task_max_retries = v;
            }
            if let Some(v) = parallel.budget_limit_usd {
                self.parallel.budget_limit_usd = v;
            }
        }
        if let Some(gates) = overrides.usability_gates {
            if let Some(v) = gates.build.and_then(|g| g.enabled) {
                self.gates.build = v;
            }
            if let Some(v) = gates.test.and_then(|g| g.enabled) {
                self.gates.test = v;
            }
            if let Some(v) = gates.review.and_then(|g| g.enabled) {
                self.gates.review = v;
            }
            if let Some(v) = gates.health.and_then(|g| g.enabled) {
                self.gates.health = v;
            }
            if let Some(v) = gates.budget.and_then(|g| g.enabled) {
                self.gates.budget = v;
            }
            if let Some(policy) = gates.prompt_user.and_then(|s| s.parse().ok()) {
                self.gate_prompt_policy = policy;
            }
        }
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("CLAUDE_CMD") {
            self.claude_cmd = v;
        }
        if let Ok(v) = std::env::var("LONGAGENT_VERBOSE") {
            self.verbose = v != "false" && v != "0";
        }
        if let Ok(v) = std::env::var("LONGAGENT_MAX_CONCURRENCY")
            && let Ok(n) = v.parse()
        {
            self.parallel.max_concurrency = n;
        }
        if let Ok(v) = std::env::var("LONGAGENT_BUDGET_LIMIT_USD")
            && let Ok(n) = v.parse()
        {
            self.parallel.budget_limit_usd = n;
        }
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_claude_cmd(mut self, cmd: impl Into<String>) -> Self {
        self.claude_cmd = cmd.into();
        self
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.parallel.max_concurrency = n;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.project_dir.as_os_str().is_empty() {
            return Err(anyhow!("project_dir must not be empty"));
        }
        if self.parallel.max_concurrency == 0 {
            return Err(anyhow!("parallel.max_concurrency must be positive"));
        }
        if self.parallel.task_timeout_ms == 0 {
            return Err(anyhow!("parallel.task_timeout_ms must be positive"));
        }
        Ok(())
    }

    pub fn state_file_path(&self) -> PathBuf {
        self.state_dir.join("longagent-state.json")
    }

    pub fn plan_file_path(&self, plan_id: &str) -> PathBuf {
        self.state_dir.join(format!("longagent-plan-{plan_id}.json"))
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir)
            .with_context(|| format!("failed to create {}", self.state_dir.display()))
    }
}

/// Writes the frozen plan to `<state_dir>/longagent-plan-<id>.json` as a
/// read-only debugging artifact; never consulted for correctness.
pub fn write_plan_artifact(config: &DriverConfig, plan: &crate::state::StagePlan) -> Result<()> {
    let path = config.plan_file_path(&plan.plan_id);
    let json = serde_json::to_string_pretty(plan).context("failed to serialize plan artifact")?;
    std::fs::write(&path, json)
        .with_context(|| format!("failed to write plan artifact to {}", path.display()))
}

pub fn find_spec_file(project_dir: &Path) -> Result<PathBuf> {
    let forge_spec = project_dir.join(".forge/spec.md");
    if forge_spec.exists() {
        return Ok(forge_spec);
    }

    let pattern = project_dir.join("docs/plans/*spec*.md").to_string_lossy().to_string();
    let mut spec_files: Vec<PathBuf> = glob::glob(&pattern)
        .context("failed to read glob pattern")?
        .filter_map(|entry| entry.ok())
        .collect();

    if spec_files.is_empty() {
        return Err(anyhow!(
            "no spec file found; create .forge/spec.md or pass --spec-file"
        ));
    }

    spec_files.sort_by(|a, b| {
        let a_time = a.metadata().and_then(|m| m.modified()).ok();
        let b_time = b.metadata().and_then(|m| m.modified()).ok();
        b_time.cmp(&a_time)
    });
    Ok(spec_files.remove(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_are_sane() {
        let config = DriverConfig::default();
        assert_eq!(config.parallel.max_concurrency, 3);
        assert_eq!(config.max_stage_recoveries, 3);
        config.validate().unwrap();
    }

    #[test]
    fn forge_toml_overrides_only_set_fields() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("forge.toml"),
            r#"
            max_stage_recoveries = 7

            [parallel]
            max_concurrency = 8
            "#,
        )
        .unwrap();
        let config = DriverConfig::load(dir.path()).unwrap();
        assert_eq!(config.max_stage_recoveries, 7);
        assert_eq!(config.parallel.max_concurrency, 8);
        // untouched fields keep their defaults
        assert_eq!(config.max_gate_attempts, 5);
    }

    #[test]
    fn missing_forge_toml_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = DriverConfig::load(dir.path()).unwrap();
        assert_eq!(config.parallel.max_concurrency, 3);
    }

    #[test]
    fn zero_concurrency_fails_validation() {
        let mut config = DriverConfig::default();
        config.parallel.max_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn state_file_path_is_rooted_under_kkcode() {
        let config = DriverConfig {
            project_dir: PathBuf::from("/tmp/proj"),
            state_dir: PathBuf::from("/tmp/proj/.kkcode"),
            ..DriverConfig::default()
        };
        assert_eq!(
            config.state_file_path(),
            PathBuf::from("/tmp/proj/.kkcode/longagent-state.json")
        );
    }
}
