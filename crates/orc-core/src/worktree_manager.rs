use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::types::{Job, Repository};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WorktreeManagerError {
    #[error("git command failed: {0}")]
    GitCommand(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("worktree already exists at {0}")]
    AlreadyExists(String),
    #[error("worktree not found for job: {0}")]
    NotFound(String),
    #[error("hosting cli failed: {0}")]
    Hosting(String),
}

pub type Result<T> = std::result::Result<T, WorktreeManagerError>;

// ---------------------------------------------------------------------------
// GitRunner trait (for testability)
// ---------------------------------------------------------------------------

/// Abstraction over git CLI operations so they can be mocked in tests.
pub trait GitRunner: Send + Sync {
    fn run_git(&self, dir: &str, args: &[&str]) -> std::result::Result<GitOutput, String>;
}

#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Real git runner that shells out to the `git` binary.
pub struct RealGitRunner;

impl GitRunner for RealGitRunner {
    fn run_git(&self, dir: &str, args: &[&str]) -> std::result::Result<GitOutput, String> {
        let output = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| e.to_string())?;

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// HostingCli trait -- PR creation via an external hosting CLI (e.g. `gh`)
// ---------------------------------------------------------------------------

/// Abstraction over a hosting CLI's pull-request command, so PR creation can
/// be mocked in tests. Real implementations shell out to a tool like `gh`.
pub trait HostingCli: Send + Sync {
    /// Create a pull request from `head` into `base` and return its URL.
    fn create_pull_request(
        &self,
        dir: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> std::result::Result<String, String>;
}

/// Real hosting CLI runner that shells out to `gh pr create`.
pub struct RealHostingCli {
    pub bin: String,
}

impl Default for RealHostingCli {
    fn default() -> Self {
        Self { bin: "gh".to_string() }
    }
}

impl HostingCli for RealHostingCli {
    fn create_pull_request(
        &self,
        dir: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> std::result::Result<String, String> {
        let output = std::process::Command::new(&self.bin)
            .args([
                "pr", "create", "--head", head, "--base", base, "--title", title, "--body", body,
            ])
            .current_dir(dir)
            .output()
            .map_err(|e| e.to_string())?;

        if !output.status.success() {
            return Err(String::from_utf8_lossy(&output.stderr).to_string());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Parse a PR number from the trailing path segment of a hosting CLI's URL
/// output, e.g. `https://github.com/acme/widgets/pull/42` -> `42`.
pub fn parse_pr_number(url: &str) -> Option<i64> {
    url.rsplit('/').next()?.parse().ok()
}

// ---------------------------------------------------------------------------
// WorktreeHandle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeHandle {
    pub path: String,
    pub branch: String,
    pub base_branch: String,
    pub created_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedPullRequest {
    pub url: String,
    pub number: i64,
}

// ---------------------------------------------------------------------------
// WorktreeManager
// ---------------------------------------------------------------------------

/// Git workspace lifecycle manager: bare-repo maintenance, per-job worktree
/// create/remove, commit/push, and PR creation through a hosting CLI.
pub struct WorktreeManager {
    repos_dir: PathBuf,
    worktrees_dir: PathBuf,
    git: Box<dyn GitRunner>,
    hosting: Box<dyn HostingCli>,
}

impl WorktreeManager {
    pub fn new(repos_dir: impl Into<PathBuf>, worktrees_dir: impl Into<PathBuf>) -> Self {
        Self {
            repos_dir: repos_dir.into(),
            worktrees_dir: worktrees_dir.into(),
            git: Box::new(RealGitRunner),
            hosting: Box::new(RealHostingCli::default()),
        }
    }

    /// Construct with custom git/hosting backends (for testing).
    pub fn with_backends(
        repos_dir: impl Into<PathBuf>,
        worktrees_dir: impl Into<PathBuf>,
        git: Box<dyn GitRunner>,
        hosting: Box<dyn HostingCli>,
    ) -> Self {
        Self {
            repos_dir: repos_dir.into(),
            worktrees_dir: worktrees_dir.into(),
            git,
            hosting,
        }
    }

    fn bare_repo_path(&self, repo: &Repository) -> PathBuf {
        self.repos_dir.join(format!("{}.git", repo.repo_name))
    }

    /// Ensure `<repos_dir>/<repo_name>.git` exists as a bare clone of `repo.url`.
    pub fn ensure_bare_repo(&self, repo: &Repository) -> Result<PathBuf> {
        let bare_path = self.bare_repo_path(repo);
        if bare_path.exists() {
            return Ok(bare_path);
        }
        std::fs::create_dir_all(&self.repos_dir)?;

        let repos_dir_str = self.repos_dir.to_str().unwrap_or(".");
        let bare_path_str = bare_path.to_str().unwrap_or(".");
        info!(repo = %repo.repo_name, path = %bare_path.display(), "cloning bare repository");

        let result = self
            .git
            .run_git(repos_dir_str, &["clone", "--bare", &repo.url, bare_path_str]);

        match result {
            Ok(output) if output.success => Ok(bare_path),
            Ok(output) => Err(WorktreeManagerError::GitCommand(output.stderr)),
            Err(e) => Err(WorktreeManagerError::GitCommand(e)),
        }
    }

    /// Fetch all refs into the bare repository, mirroring origin's branches
    /// exactly (stale local refs are pruned) so branching off them is fresh.
    pub fn fetch_origin(&self, repo: &Repository) -> Result<()> {
        let bare_path = self.bare_repo_path(repo);
        let bare_path_str = bare_path.to_str().unwrap_or(".");
        match self.git.run_git(
            bare_path_str,
            &["fetch", "origin", "+refs/heads/*:refs/heads/*", "--prune"],
        ) {
            Ok(output) if output.success => Ok(()),
            Ok(output) => Err(WorktreeManagerError::GitCommand(output.stderr)),
            Err(e) => Err(WorktreeManagerError::GitCommand(e)),
        }
    }

    fn prune_worktrees(&self, bare_path_str: &str) {
        if let Err(e) = self.git.run_git(bare_path_str, &["worktree", "prune"]) {
            warn!(error = %e, "failed to prune stale worktree metadata");
        }
    }

    fn branch_ref_exists(&self, bare_path_str: &str, branch: &str) -> bool {
        matches!(
            self.git.run_git(
                bare_path_str,
                &["show-ref", "--verify", "--quiet", &format!("refs/heads/{branch}")],
            ),
            Ok(output) if output.success
        )
    }

    /// Parse `git worktree list --porcelain` for the checkout path of
    /// `branch`, if any worktree currently has it checked out.
    fn worktree_path_for_branch(&self, bare_path_str: &str, branch: &str) -> Option<String> {
        let output = self.git.run_git(bare_path_str, &["worktree", "list", "--porcelain"]).ok()?;
        if !output.success {
            return None;
        }
        let target = format!("refs/heads/{branch}");
        let mut current_path: Option<String> = None;
        for line in output.stdout.lines() {
            if let Some(path) = line.strip_prefix("worktree ") {
                current_path = Some(path.to_string());
            } else if let Some(branch_ref) = line.strip_prefix("branch ") {
                if branch_ref == target {
                    return current_path;
                }
            }
        }
        None
    }

    /// Force-remove whatever worktree holds `branch` checked out, if any,
    /// falling back to a plain directory delete when git itself can't.
    fn reclaim_branch(&self, bare_path_str: &str, branch: &str) {
        let Some(path) = self.worktree_path_for_branch(bare_path_str, branch) else {
            return;
        };
        warn!(branch, path = %path, "branch already checked out elsewhere, reclaiming worktree");
        let removed = matches!(
            self.git.run_git(bare_path_str, &["worktree", "remove", "--force", &path]),
            Ok(output) if output.success
        );
        if !removed {
            let _ = std::fs::remove_dir_all(&path);
        }
        self.prune_worktrees(bare_path_str);
    }

    /// Create a worktree at `<worktrees_dir>/<repo_name>/<job_id>` holding
    /// `job.branch_name`. Prunes stale worktree metadata first; if the
    /// branch ref already exists (e.g. a retried job reusing its name), any
    /// worktree that already has it checked out is force-removed and the
    /// existing branch is checked out rather than recreated. Otherwise a new
    /// branch is cut from the repository's default branch.
    pub fn create_worktree(&self, repo: &Repository, job: &Job) -> Result<WorktreeHandle> {
        let bare_path = self.ensure_bare_repo(repo)?;
        let wt_path = self
            .worktrees_dir
            .join(&repo.repo_name)
            .join(job.id.to_string());

        if wt_path.exists() {
            return Err(WorktreeManagerError::AlreadyExists(
                wt_path.display().to_string(),
            ));
        }

        if let Some(parent) = wt_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let bare_path_str = bare_path.to_str().unwrap_or(".");
        let wt_path_str = wt_path.to_str().unwrap_or(".");

        self.prune_worktrees(bare_path_str);

        let branch_exists = self.branch_ref_exists(bare_path_str, &job.branch_name);
        if branch_exists {
            self.reclaim_branch(bare_path_str, &job.branch_name);
        }

        info!(
            job_id = %job.id,
            repo = %repo.repo_name,
            worktree = %wt_path.display(),
            branch = %job.branch_name,
            reusing_branch = branch_exists,
            "creating worktree"
        );

        let args: Vec<&str> = if branch_exists {
            vec!["worktree", "add", wt_path_str, &job.branch_name]
        } else {
            vec!["worktree", "add", "-b", &job.branch_name, wt_path_str, &repo.default_branch]
        };
        let result = self.git.run_git(bare_path_str, &args);

        match result {
            Ok(output) if output.success => Ok(WorktreeHandle {
                path: wt_path.display().to_string(),
                branch: job.branch_name.clone(),
                base_branch: repo.default_branch.clone(),
                created_at: Utc::now(),
            }),
            Ok(output) => Err(WorktreeManagerError::GitCommand(output.stderr)),
            Err(e) => Err(WorktreeManagerError::GitCommand(e)),
        }
    }

    /// Remove a worktree and its branch, ignoring failures (best-effort
    /// cleanup after a job reaches a terminal status). Falls back to a plain
    /// filesystem delete plus a worktree prune if `git worktree remove`
    /// itself fails; never returns an error.
    pub fn remove_worktree(&self, repo: &Repository, handle: &WorktreeHandle) {
        let bare_path = self.bare_repo_path(repo);
        let bare_path_str = bare_path.to_str().unwrap_or(".");

        let removed = matches!(
            self.git.run_git(bare_path_str, &["worktree", "remove", "--force", &handle.path]),
            Ok(output) if output.success
        );

        if !removed {
            warn!(path = %handle.path, "git worktree remove failed, falling back to filesystem delete");
            if let Err(e) = std::fs::remove_dir_all(&handle.path) {
                warn!(path = %handle.path, error = %e, "failed to delete worktree directory");
            }
        }

        self.prune_worktrees(bare_path_str);
    }

    /// `true` if the worktree has any uncommitted or committed-but-unpushed
    /// changes relative to its base branch.
    pub fn has_changes(&self, handle: &WorktreeHandle) -> Result<bool> {
        match self.git.run_git(&handle.path, &["status", "--porcelain"]) {
            Ok(output) if output.success => Ok(!output.stdout.trim().is_empty()),
            Ok(output) => Err(WorktreeManagerError::GitCommand(output.stderr)),
            Err(e) => Err(WorktreeManagerError::GitCommand(e)),
        }
    }

    /// Stage all changes and commit with the given message, returning the
    /// resulting commit sha. Returns `Ok(None)` if there was nothing to commit.
    pub fn commit_all(&self, handle: &WorktreeHandle, message: &str) -> Result<Option<String>> {
        if !self.has_changes(handle)? {
            return Ok(None);
        }

        match self.git.run_git(&handle.path, &["add", "-A"]) {
            Ok(output) if output.success => {}
            Ok(output) => return Err(WorktreeManagerError::GitCommand(output.stderr)),
            Err(e) => return Err(WorktreeManagerError::GitCommand(e)),
        }

        match self.git.run_git(&handle.path, &["commit", "-m", message]) {
            Ok(output) if output.success => {}
            Ok(output) => return Err(WorktreeManagerError::GitCommand(output.stderr)),
            Err(e) => return Err(WorktreeManagerError::GitCommand(e)),
        }

        match self.git.run_git(&handle.path, &["rev-parse", "HEAD"]) {
            Ok(output) if output.success => Ok(Some(output.stdout.trim().to_string())),
            Ok(output) => Err(WorktreeManagerError::GitCommand(output.stderr)),
            Err(e) => Err(WorktreeManagerError::GitCommand(e)),
        }
    }

    /// Push the worktree's branch to `origin`.
    pub fn push_branch(&self, handle: &WorktreeHandle) -> Result<()> {
        match self
            .git
            .run_git(&handle.path, &["push", "-u", "origin", &handle.branch])
        {
            Ok(output) if output.success => Ok(()),
            Ok(output) => Err(WorktreeManagerError::GitCommand(output.stderr)),
            Err(e) => Err(WorktreeManagerError::GitCommand(e)),
        }
    }

    /// Commit any outstanding changes (if present) and push the branch in one
    /// step. Returns the commit sha, or `None` if there was nothing to push.
    pub fn commit_and_push(&self, handle: &WorktreeHandle, message: &str) -> Result<Option<String>> {
        let sha = self.commit_all(handle, message)?;
        if sha.is_some() {
            self.push_branch(handle)?;
        }
        Ok(sha)
    }

    /// Create a pull request for the worktree's branch via the hosting CLI.
    pub fn create_pull_request(
        &self,
        handle: &WorktreeHandle,
        title: &str,
        body: &str,
    ) -> Result<CreatedPullRequest> {
        let url = self
            .hosting
            .create_pull_request(&handle.path, &handle.branch, &handle.base_branch, title, body)
            .map_err(WorktreeManagerError::Hosting)?;

        let number = parse_pr_number(&url).ok_or_else(|| {
            WorktreeManagerError::Hosting(format!("could not parse PR number from {url}"))
        })?;

        Ok(CreatedPullRequest { url, number })
    }
}
