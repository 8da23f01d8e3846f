//! Git gating (§4.7): an optional, best-effort stash/branch/commit/merge
//! dance around a session. Every operation degrades to `ok: false` on
//! failure rather than propagating an error up through the driver — a
//! broken git step only loses the git convenience, it never fails the run.
//! Uses `git2` directly, the same way the session-branch tracker this is
//! grounded on does.

use anyhow::{Context, Result};
use git2::{IndexAddOption, Repository, Signature};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

/// The result shape every git step reports through, matched on rather than
/// propagated as an error — expected failures (dirty repo, detached HEAD,
/// merge conflict) are normal outcomes here, not exceptions.
#[derive(Debug, Clone)]
pub struct GitStepOutcome {
    pub ok: bool,
    pub message: String,
}

impl GitStepOutcome {
    fn ok(message: impl Into<String>) -> Self {
        GitStepOutcome { ok: true, message: message.into() }
    }

    fn fail(message: impl Into<String>) -> Self {
        GitStepOutcome { ok: false, message: message.into() }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GitGateResult {
    pub active: bool,
}

/// Owns the feature-branch bookkeeping for one session. `begin` is the only
/// call that can make the gate active; every later call is a no-op returning
/// a failing outcome if the gate never started.
pub struct GitGate {
    project_dir: PathBuf,
    base_branch: Mutex<Option<String>>,
    feature_branch: Mutex<Option<String>>,
}

impl GitGate {
    pub fn new(project_dir: PathBuf) -> Self {
        GitGate {
            project_dir,
            base_branch: Mutex::new(None),
            feature_branch: Mutex::new(None),
        }
    }

    pub fn begin(&self, session_id: &str, objective: &str) -> Result<GitGateResult> {
        let repo = match Repository::open(&self.project_dir) {
            Ok(repo) => repo,
            Err(e) => {
                warn!(error = %e, "project dir is not a git repository; git gating disabled");
                return Ok(GitGateResult { active: false });
            }
        };

        match self.try_begin(&repo, session_id, objective) {
            Ok(outcome) if outcome.ok => Ok(GitGateResult { active: true }),
            Ok(outcome) => {
                warn!(message = %outcome.message, "git gating could not start");
                Ok(GitGateResult { active: false })
            }
            Err(e) => {
                warn!(error = %e, "git gating failed unexpectedly");
                Ok(GitGateResult { active: false })
            }
        }
    }

    fn try_begin(&self, repo: &Repository, session_id: &str, objective: &str) -> Result<GitStepOutcome> {
        let head = repo.head().context("repository has no HEAD (no commits yet)")?;
        let base_name = head.shorthand().unwrap_or("main").to_string();

        let dirty = repo
            .statuses(None)
            .context("failed to read working tree status")?
            .iter()
            .any(|entry| !entry.status().is_ignored());
        if dirty {
            let mut repo_mut = Repository::open(&self.project_dir)?;
            let sig = Signature::now("longagent", "longagent@localhost")?;
            repo_mut
                .stash_save(&sig, &format!("longagent auto-stash for {session_id}"), None)
                .context("failed to stash dirty working tree")?;
        }

        let branch_name = feature_branch_name(session_id, objective);
        let commit = head.peel_to_commit().context("HEAD does not point at a commit")?;
        repo.branch(&branch_name, &commit, false)
            .context("failed to create feature branch")?;

        let branch_ref = format!("refs/heads/{branch_name}");
        let obj = repo.revparse_single(&branch_ref)?;
        repo.checkout_tree(&obj, None).context("failed to check out feature branch")?;
        repo.set_head(&branch_ref).context("failed to move HEAD to feature branch")?;

        *self.base_branch.lock().unwrap() = Some(base_name);
        *self.feature_branch.lock().unwrap() = Some(branch_name.clone());

        Ok(GitStepOutcome::ok(format!("checked out '{branch_name}'")))
    }

    pub fn commit_stage(&self, stage_id: &str) -> Result<GitStepOutcome> {
        if self.feature_branch.lock().unwrap().is_none() {
            return Ok(GitStepOutcome::fail("git gate is not active"));
        }
        self.commit(&format!("[longagent] stage {stage_id} complete"))
    }

    pub fn finish(&self, session_id: &str, success: bool) -> Result<GitStepOutcome> {
        let _ = session_id;
        if self.feature_branch.lock().unwrap().is_none() {
            return Ok(GitStepOutcome::fail("git gate is not active"));
        }
        let outcome = self.commit("[longagent] final commit")?;
        Ok(GitStepOutcome { ok: outcome.ok && success, message: outcome.message })
    }

    fn commit(&self, message: &str) -> Result<GitStepOutcome> {
        let repo = Repository::open(&self.project_dir)?;
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;
        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = Signature::now("longagent", "longagent@localhost")?;

        let Some(parent) = repo.head().ok().and_then(|h| h.peel_to_commit().ok()) else {
            return Ok(GitStepOutcome::fail("no parent commit to extend"));
        };

        // Nothing changed since the parent commit; treat as a successful no-op.
        if parent.tree_id() == tree_id {
            return Ok(GitStepOutcome::ok("nothing to commit"));
        }

        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])
            .context("failed to create commit")?;
        Ok(GitStepOutcome::ok(message.to_string()))
    }

    /// Checks out the base branch, fast-forwards or merges the feature
    /// branch into it, and deletes the feature branch on success. Called
    /// from under the state store's lock so the caller can re-verify
    /// `status == completed` immediately beforehand (TOCTOU safety).
    pub fn merge_into_base(&self) -> Result<GitStepOutcome> {
        let (Some(base), Some(feature)) = (
            self.base_branch.lock().unwrap().clone(),
            self.feature_branch.lock().unwrap().clone(),
        ) else {
            return Ok(GitStepOutcome::fail("git gate is not active"));
        };

        let repo = Repository::open(&self.project_dir)?;
        let base_ref = format!("refs/heads/{base}");
        let base_obj = repo.revparse_single(&base_ref)?;
        repo.checkout_tree(&base_obj, None).context("failed to check out base branch")?;
        repo.set_head(&base_ref)?;

        let feature_ref = format!("refs/heads/{feature}");
        let feature_commit = repo.revparse_single(&feature_ref)?.peel_to_commit()?;
        let annotated = repo.find_annotated_commit(feature_commit.id())?;

        let (analysis, _) = repo.merge_analysis(&[&annotated])?;
        if analysis.is_up_to_date() {
            // already merged, nothing to do
        } else if analysis.is_fast_forward() {
            let mut reference = repo.find_reference(&base_ref)?;
            reference.set_target(feature_commit.id(), "longagent fast-forward merge")?;
            repo.set_head(&base_ref)?;
            repo.checkout_head(None)?;
        } else {
            repo.merge(&[&annotated], None, None).context("merge failed")?;
            if repo.index()?.has_conflicts() {
                let _ = repo.cleanup_state();
                return Ok(GitStepOutcome::fail("merge produced conflicts"));
            }
            let tree_id = repo.index()?.write_tree()?;
            let tree = repo.find_tree(tree_id)?;
            let sig = Signature::now("longagent", "longagent@localhost")?;
            let base_commit = repo.find_reference(&base_ref)?.peel_to_commit()?;
            repo.commit(
                Some("HEAD"),
                &sig,
                &sig,
                &format!("[longagent] merge {feature} into {base}"),
                &tree,
                &[&base_commit, &feature_commit],
            )?;
            repo.cleanup_state()?;
        }

        repo.find_branch(&feature, git2::BranchType::Local)?.delete().ok();
        Ok(GitStepOutcome::ok(format!("merged '{feature}' into '{base}'")))
    }

    /// Best-effort fallback used when an exception interrupts a merge
    /// attempt: returns to the feature branch so the session's work is not
    /// left checked out on base mid-merge.
    pub fn checkout_feature(&self) -> Result<GitStepOutcome> {
        let Some(feature) = self.feature_branch.lock().unwrap().clone() else {
            return Ok(GitStepOutcome::fail("git gate is not active"));
        };
        let repo = Repository::open(&self.project_dir)?;
        let feature_ref = format!("refs/heads/{feature}");
        let obj = repo.revparse_single(&feature_ref)?;
        repo.checkout_tree(&obj, None)?;
        repo.set_head(&feature_ref)?;
        Ok(GitStepOutcome::ok(format!("checked out '{feature}'")))
    }
}

fn feature_branch_name(session_id: &str, objective: &str) -> String {
    let mut slug: String = objective
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    slug = slug
        .split('-')
        .filter(|s| !s.is_empty())
        .take(6)
        .collect::<Vec<_>>()
        .join("-");
    if slug.is_empty() {
        format!("longagent/{session_id}")
    } else {
        format!("longagent/{session_id}/{slug}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn init_repo() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        drop(config);
        fs::write(dir.path().join("a.txt"), "hello\n").unwrap();
        let mut index = repo.index().unwrap();
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("test", "test@test.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[]).unwrap();
        dir
    }

    #[test]
    fn begin_on_non_repo_is_inactive_not_an_error() {
        let dir = tempdir().unwrap();
        let gate = GitGate::new(dir.path().to_path_buf());
        let result = gate.begin("sess", "fix the bug").unwrap();
        assert!(!result.active);
    }

    #[test]
    fn begin_on_clean_repo_checks_out_feature_branch() {
        let dir = init_repo();
        let gate = GitGate::new(dir.path().to_path_buf());
        let result = gate.begin("sess-1", "fix the login bug").unwrap();
        assert!(result.active);
        let repo = Repository::open(dir.path()).unwrap();
        let head = repo.head().unwrap();
        assert!(head.shorthand().unwrap().starts_with("longagent/sess-1"));
    }

    #[test]
    fn commit_stage_without_begin_fails_gracefully() {
        let dir = init_repo();
        let gate = GitGate::new(dir.path().to_path_buf());
        let outcome = gate.commit_stage("s1").unwrap();
        assert!(!outcome.ok);
    }

    #[test]
    fn feature_branch_name_is_deterministic_and_slugged() {
        let a = feature_branch_name("sess-1", "Fix the Login Bug!!!");
        let b = feature_branch_name("sess-1", "Fix the Login Bug!!!");
        assert_eq!(a, b);
        assert!(a.starts_with("longagent/sess-1/fix-the-login-bug"));
    }

    #[test]
    fn merge_into_base_fast_forwards_and_deletes_feature_branch() {
        let dir = init_repo();
        let gate = GitGate::new(dir.path().to_path_buf());
        gate.begin("sess-2", "add a new feature").unwrap();
        fs::write(dir.path().join("b.txt"), "new\n").unwrap();
        let outcome = gate.commit_stage("s1").unwrap();
        assert!(outcome.ok);

        let merge_outcome = gate.merge_into_base().unwrap();
        assert!(merge_outcome.ok);

        let repo = Repository::open(dir.path()).unwrap();
        assert!(repo.find_branch("longagent/sess-2/add-a-new-feature", git2::BranchType::Local).is_err());
        assert!(dir.path().join("b.txt").exists());
    }
}
