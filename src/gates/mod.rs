//! Quality Gate Runner (§4.6): a fixed set of independent pass/fail checks
//! run concurrently at the end of a session, with short-TTL caching of
//! non-failing results so a flaky build script isn't re-run every gate
//! recovery round.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{instrument, warn};

use crate::events::{Event, EventSink};
use crate::state::{GateStatus, GateVerdict};

const CACHE_TTL: Duration = Duration::from_secs(300);
const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetStrategy {
    Block,
    Warn,
}

/// Facts the individual gates need, gathered by the driver before a gate
/// pass so each gate stays a pure-ish function over known state rather than
/// probing the filesystem itself.
#[derive(Debug, Clone)]
pub struct GateContext {
    pub project_dir: PathBuf,
    pub build_script: Option<String>,
    pub test_script: Option<String>,
    pub review_state_path: Option<PathBuf>,
    pub state_store_healthy: bool,
    pub state_store_reason: String,
    pub budget_limit_usd: f64,
    pub budget_spent_usd: f64,
    pub budget_strategy: BudgetStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateConfig {
    pub build_enabled: bool,
    pub test_enabled: bool,
    pub review_enabled: bool,
    pub health_enabled: bool,
    pub budget_enabled: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        GateConfig {
            build_enabled: true,
            test_enabled: true,
            review_enabled: true,
            health_enabled: true,
            budget_enabled: true,
        }
    }
}

#[async_trait]
trait Gate: Send + Sync {
    fn name(&self) -> &'static str;
    fn enabled(&self, config: &GateConfig) -> bool;
    async fn run(&self, ctx: &GateContext) -> GateStatus;
}

struct BuildGate;
struct TestGate;
struct ReviewGate;
struct HealthGate;
struct BudgetGate;

async fn run_script(project_dir: &PathBuf, script: &str, limit: Duration) -> (bool, String) {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg(script).current_dir(project_dir);
    match timeout(limit, cmd.output()).await {
        Ok(Ok(output)) => (
            output.status.success(),
            String::from_utf8_lossy(&output.stdout).into_owned(),
        ),
        Ok(Err(e)) => (false, format!("failed to spawn: {e}")),
        Err(_) => (false, format!("timed out after {}s", limit.as_secs())),
    }
}

#[async_trait]
impl Gate for BuildGate {
    fn name(&self) -> &'static str {
        "build"
    }
    fn enabled(&self, config: &GateConfig) -> bool {
        config.build_enabled
    }
    async fn run(&self, ctx: &GateContext) -> GateStatus {
        let Some(script) = &ctx.build_script else {
            return GateStatus {
                enabled: true,
                status: GateVerdict::NotApplicable,
                reason: "no build script declared".to_string(),
                output: None,
            };
        };
        let (ok, output) = run_script(&ctx.project_dir, script, DEFAULT_BUILD_TIMEOUT).await;
        GateStatus {
            enabled: true,
            status: if ok { GateVerdict::Pass } else { GateVerdict::Fail },
            reason: if ok {
                "build succeeded".to_string()
            } else {
                "build script exited non-zero or timed out".to_string()
            },
            output: Some(output),
        }
    }
}

#[async_trait]
impl Gate for TestGate {
    fn name(&self) -> &'static str {
        "test"
    }
    fn enabled(&self, config: &GateConfig) -> bool {
        config.test_enabled
    }
    async fn run(&self, ctx: &GateContext) -> GateStatus {
        let Some(script) = &ctx.test_script else {
            return GateStatus {
                enabled: true,
                status: GateVerdict::NotApplicable,
                reason: "no test script or test directory".to_string(),
                output: None,
            };
        };
        let (ok, output) = run_script(&ctx.project_dir, script, DEFAULT_TEST_TIMEOUT).await;
        GateStatus {
            enabled: true,
            status: if ok { GateVerdict::Pass } else { GateVerdict::Fail },
            reason: if ok {
                "tests passed".to_string()
            } else {
                "test runner exited non-zero or timed out".to_string()
            },
            output: Some(output),
        }
    }
}

#[async_trait]
impl Gate for ReviewGate {
    fn name(&self) -> &'static str {
        "review"
    }
    fn enabled(&self, config: &GateConfig) -> bool {
        config.review_enabled
    }
    async fn run(&self, ctx: &GateContext) -> GateStatus {
        let Some(path) = &ctx.review_state_path else {
            return GateStatus {
                enabled: true,
                status: GateVerdict::NotApplicable,
                reason: "no review state file".to_string(),
                output: None,
            };
        };
        let pending = tokio::fs::read_to_string(path)
            .await
            .map(|contents| contents.contains("\"pending\""))
            .unwrap_or(false);
        GateStatus {
            enabled: true,
            status: if pending { GateVerdict::Fail } else { GateVerdict::Pass },
            reason: if pending {
                "a review item is pending approval".to_string()
            } else {
                "no review item pending".to_string()
            },
            output: None,
        }
    }
}

#[async_trait]
impl Gate for HealthGate {
    fn name(&self) -> &'static str {
        "health"
    }
    fn enabled(&self, config: &GateConfig) -> bool {
        config.health_enabled
    }
    async fn run(&self, ctx: &GateContext) -> GateStatus {
        GateStatus {
            enabled: true,
            status: if ctx.state_store_healthy {
                GateVerdict::Pass
            } else {
                GateVerdict::Fail
            },
            reason: ctx.state_store_reason.clone(),
            output: None,
        }
    }
}

#[async_trait]
impl Gate for BudgetGate {
    fn name(&self) -> &'static str {
        "budget"
    }
    fn enabled(&self, config: &GateConfig) -> bool {
        config.budget_enabled
    }
    async fn run(&self, ctx: &GateContext) -> GateStatus {
        if ctx.budget_limit_usd <= 0.0 {
            return GateStatus {
                enabled: true,
                status: GateVerdict::NotApplicable,
                reason: "no budget state recorded".to_string(),
                output: None,
            };
        }
        let over_budget = ctx.budget_spent_usd >= ctx.budget_limit_usd;
        let status = match (over_budget, ctx.budget_strategy) {
            (false, _) => GateVerdict::Pass,
            (true, BudgetStrategy::Block) => GateVerdict::Fail,
            (true, BudgetStrategy::Warn) => GateVerdict::Warn,
        };
        GateStatus {
            enabled: true,
            status,
            reason: format!(
                "spent ${:.2} of ${:.2} budget",
                ctx.budget_spent_usd, ctx.budget_limit_usd
            ),
            output: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QualityGateReport {
    pub all_pass: bool,
    pub gates: HashMap<String, GateStatus>,
    pub failures: Vec<GateFailure>,
}

#[derive(Debug, Clone)]
pub struct GateFailure {
    pub gate: String,
    pub status: GateVerdict,
    pub reason: String,
    pub output: Option<String>,
}

struct CacheEntry {
    status: GateStatus,
    recorded_at: Instant,
}

/// Runs the fixed gate set concurrently, memoizing passing/not-applicable
/// results for `CACHE_TTL`. Failing results are never cached so a remediation
/// round always re-checks.
pub struct GateRunner {
    gates: Vec<Box<dyn Gate>>,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl GateRunner {
    pub fn new() -> Self {
        GateRunner {
            gates: vec![
                Box::new(BuildGate),
                Box::new(TestGate),
                Box::new(ReviewGate),
                Box::new(HealthGate),
                Box::new(BudgetGate),
            ],
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn clear_cache(&self) {
        self.cache.lock().unwrap().clear();
    }

    #[instrument(skip(self, ctx, config, events))]
    pub async fn run_all(
        &self,
        ctx: &GateContext,
        config: &GateConfig,
        events: &EventSink,
    ) -> QualityGateReport {
        let mut results = HashMap::new();

        for gate in &self.gates {
            let name = gate.name().to_string();

            if !gate.enabled(config) {
                let status = GateStatus {
                    enabled: false,
                    status: GateVerdict::Disabled,
                    reason: "disabled by configuration".to_string(),
                    output: None,
                };
                events.emit(Event::GateChecked {
                    gate: name.clone(),
                    verdict: format!("{:?}", status.status),
                    reason: status.reason.clone(),
                });
                results.insert(name, status);
                continue;
            }

            if let Some(cached) = self.cached(&name) {
                results.insert(name, cached);
                continue;
            }

            let status = gate.run(ctx).await;
            if status.status.is_passing() {
                self.cache.lock().unwrap().insert(
                    name.clone(),
                    CacheEntry {
                        status: status.clone(),
                        recorded_at: Instant::now(),
                    },
                );
            }
            events.emit(Event::GateChecked {
                gate: name.clone(),
                verdict: format!("{:?}", status.status),
                reason: status.reason.clone(),
            });
            if !status.status.is_passing() {
                warn!(gate = %name, reason = %status.reason, "gate failed");
            }
            results.insert(name, status);
        }

        let failures: Vec<GateFailure> = results
            .iter()
            .filter(|(_, status)| !status.status.is_passing() && status.enabled)
            .map(|(name, status)| GateFailure {
                gate: name.clone(),
                status: status.status,
                reason: status.reason.clone(),
                output: status.output.clone(),
            })
            .collect();

        QualityGateReport {
            all_pass: failures.is_empty(),
            gates: results,
            failures,
        }
    }

    fn cached(&self, name: &str) -> Option<GateStatus> {
        let cache = self.cache.lock().unwrap();
        let entry = cache.get(name)?;
        if entry.recorded_at.elapsed() < CACHE_TTL {
            Some(entry.status.clone())
        } else {
            None
        }
    }
}

impl Default for GateRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(dir: PathBuf) -> GateContext {
        GateContext {
            project_dir: dir,
            build_script: None,
            test_script: None,
            review_state_path: None,
            state_store_healthy: true,
            state_store_reason: "ok".to_string(),
            budget_limit_usd: 0.0,
            budget_spent_usd: 0.0,
            budget_strategy: BudgetStrategy::Block,
        }
    }

    #[tokio::test]
    async fn all_not_applicable_gates_pass() {
        let runner = GateRunner::new();
        let events = EventSink::new();
        let report = runner
            .run_all(&ctx(std::env::temp_dir()), &GateConfig::default(), &events)
            .await;
        assert!(report.all_pass);
        assert_eq!(report.gates["build"].status, GateVerdict::NotApplicable);
    }

    #[tokio::test]
    async fn disabled_gate_is_reported_disabled_and_passing() {
        let runner = GateRunner::new();
        let events = EventSink::new();
        let mut config = GateConfig::default();
        config.build_enabled = false;
        let report = runner
            .run_all(&ctx(std::env::temp_dir()), &config, &events)
            .await;
        assert_eq!(report.gates["build"].status, GateVerdict::Disabled);
        assert!(report.all_pass);
    }

    #[tokio::test]
    async fn build_script_failure_is_reported_and_not_cached() {
        let runner = GateRunner::new();
        let events = EventSink::new();
        let mut context = ctx(std::env::temp_dir());
        context.build_script = Some("exit 1".to_string());
        let report = runner.run_all(&context, &GateConfig::default(), &events).await;
        assert!(!report.all_pass);
        assert_eq!(report.gates["build"].status, GateVerdict::Fail);
        assert!(runner.cached("build").is_none());
    }

    #[tokio::test]
    async fn passing_gate_is_cached_until_cleared() {
        let runner = GateRunner::new();
        let events = EventSink::new();
        let context = ctx(std::env::temp_dir());
        runner.run_all(&context, &GateConfig::default(), &events).await;
        assert!(runner.cached("health").is_some());
        runner.clear_cache();
        assert!(runner.cached("health").is_none());
    }

    #[tokio::test]
    async fn budget_over_limit_with_block_strategy_fails() {
        let runner = GateRunner::new();
        let events = EventSink::new();
        let mut context = ctx(std::env::temp_dir());
        context.budget_limit_usd = 10.0;
        context.budget_spent_usd = 12.0;
        context.budget_strategy = BudgetStrategy::Block;
        let report = runner.run_all(&context, &GateConfig::default(), &events).await;
        assert_eq!(report.gates["budget"].status, GateVerdict::Fail);
        assert!(!report.all_pass);
    }

    #[tokio::test]
    async fn budget_over_limit_with_warn_strategy_still_passes() {
        let runner = GateRunner::new();
        let events = EventSink::new();
        let mut context = ctx(std::env::temp_dir());
        context.budget_limit_usd = 10.0;
        context.budget_spent_usd = 12.0;
        context.budget_strategy = BudgetStrategy::Warn;
        let report = runner.run_all(&context, &GateConfig::default(), &events).await;
        assert_eq!(report.gates["budget"].status, GateVerdict::Warn);
        assert!(report.all_pass);
    }
}
