//! One-Shot Runner (§4.5): ensure-bare -> fetch -> create-worktree -> invoke
//! CLI once -> commit+push -> create PR -> report outcome. The worktree is
//! always removed, success or failure.

use orc_core::types::{Job, JobMessageKind, Repository};
use orc_core::worktree_manager::WorktreeManager;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cli_invoker::{build_cli_args, CliInvoker};

#[derive(Debug, Error)]
pub enum OneShotError {
    #[error("workspace error: {0}")]
    Workspace(#[from] orc_core::worktree_manager::WorktreeManagerError),
    #[error("cli invocation error: {0}")]
    Cli(#[from] crate::cli_invoker::CliInvokerError),
}

pub type Result<T> = std::result::Result<T, OneShotError>;

/// A line emitted during the run, destined for persistence as a `JobMessage`.
#[derive(Debug, Clone)]
pub struct RunnerMessage {
    pub kind: JobMessageKind,
    pub content: String,
}

/// Outcome of a one-shot run, carrying everything the caller needs to
/// update the job row.
#[derive(Debug, Clone)]
pub struct OneShotOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub worktree_path: String,
    pub pr_url: Option<String>,
    pub pr_number: Option<i64>,
    pub files_changed: Option<i64>,
    pub error: Option<String>,
    pub messages: Vec<RunnerMessage>,
}

pub struct OneShotRunner<'a> {
    workspace: &'a WorktreeManager,
    cli: &'a CliInvoker,
    coder_cli_bin: &'a str,
}

impl<'a> OneShotRunner<'a> {
    pub fn new(workspace: &'a WorktreeManager, cli: &'a CliInvoker, coder_cli_bin: &'a str) -> Self {
        Self {
            workspace,
            cli,
            coder_cli_bin,
        }
    }

    pub async fn run(&self, job: &Job, repo: &Repository) -> Result<OneShotOutcome> {
        let mut messages = Vec::new();

        self.workspace.ensure_bare_repo(repo)?;
        self.workspace.fetch_origin(repo)?;
        let handle = self.workspace.create_worktree(repo, job)?;

        let outcome = self.run_in_worktree(job, &handle.path, &mut messages).await;

        let (mut success, exit_code, mut pr_url, mut pr_number, files_changed, mut error) = match outcome {
            Ok(inner) => inner,
            Err(e) => (false, None, None, None, None, Some(e.to_string())),
        };

        if success {
            match self.finalize(job, &handle) {
                Ok((url, number)) => {
                    pr_url = url;
                    pr_number = number;
                }
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "failed to finalize one-shot job");
                    success = false;
                    error = Some(e.to_string());
                }
            }
        }

        // Worktree cleanup always runs, regardless of how the run finished.
        self.workspace.remove_worktree(repo, &handle);

        Ok(OneShotOutcome {
            success,
            exit_code,
            worktree_path: handle.path,
            pr_url,
            pr_number,
            files_changed,
            error,
            messages,
        })
    }

    async fn run_in_worktree(
        &self,
        job: &Job,
        worktree_path: &str,
        messages: &mut Vec<RunnerMessage>,
    ) -> std::result::Result<
        (
            bool,
            Option<i32>,
            Option<String>,
            Option<i64>,
            Option<i64>,
            Option<String>,
        ),
        OneShotError,
    > {
        let args = build_cli_args(&job.prompt, None);
        let stdout_messages = std::sync::Mutex::new(Vec::new());
        let stderr_messages = std::sync::Mutex::new(Vec::new());

        let invocation = self
            .cli
            .invoke(
                job.id,
                self.coder_cli_bin,
                &args,
                worktree_path,
                &[],
                &|line| stdout_messages.lock().unwrap().push(line),
                &|line| stderr_messages.lock().unwrap().push(line),
            )
            .await?;

        for line in stdout_messages.into_inner().unwrap() {
            messages.push(RunnerMessage {
                kind: JobMessageKind::Stdout,
                content: line,
            });
        }
        for line in stderr_messages.into_inner().unwrap() {
            messages.push(RunnerMessage {
                kind: JobMessageKind::Stderr,
                content: line,
            });
        }

        if invocation.exit_code != Some(0) {
            warn!(job_id = %job.id, exit_code = ?invocation.exit_code, "one-shot CLI invocation failed");
            return Ok((false, invocation.exit_code, None, None, None, Some("coder CLI exited non-zero".to_string())));
        }

        Ok((true, invocation.exit_code, None, None, None, None))
    }

    /// Stage, commit, push, and open a PR for the work already done in
    /// `worktree`. Called after a successful CLI invocation.
    pub fn finalize(
        &self,
        job: &Job,
        handle: &orc_core::worktree_manager::WorktreeHandle,
    ) -> Result<(Option<String>, Option<i64>)> {
        let message = job.title.clone().unwrap_or_else(|| "automated changes".to_string());
        self.workspace.commit_and_push(handle, &message)?;

        let pr = self
            .workspace
            .create_pull_request(handle, &message, &job.prompt)?;
        info!(job_id = %job.id, pr_number = pr.number, "opened pull request");
        Ok((Some(pr.url), Some(pr.number)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orc_core::types::JobType;
    use orc_core::worktree_manager::{GitOutput, GitRunner, HostingCli, WorktreeHandle};

    struct AlwaysOkGit;
    impl GitRunner for AlwaysOkGit {
        fn run_git(&self, _dir: &str, _args: &[&str]) -> std::result::Result<GitOutput, String> {
            Ok(GitOutput {
                success: true,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    struct StubHosting;
    impl HostingCli for StubHosting {
        fn create_pull_request(
            &self,
            _dir: &str,
            _head: &str,
            _base: &str,
            _title: &str,
            _body: &str,
        ) -> std::result::Result<String, String> {
            Ok("https://example.com/pull/1".to_string())
        }
    }

    fn test_repo() -> Repository {
        Repository {
            id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            provider: "github".into(),
            owner_name: "acme".into(),
            repo_name: "widgets".into(),
            default_branch: "main".into(),
            url: "https://example.com/acme/widgets.git".into(),
        }
    }

    #[tokio::test]
    async fn run_marks_failure_on_non_zero_exit() {
        use crate::cli_invoker::{CliInvocation, CliSpawner};

        struct FailingSpawner;
        #[async_trait::async_trait]
        impl CliSpawner for FailingSpawner {
            async fn run(
                &self,
                _bin: &str,
                _args: &[String],
                _cwd: &str,
                _env: &[(String, String)],
                _on_spawn: &(dyn Fn(u32) + Send + Sync),
                on_stdout: &(dyn Fn(String) + Send + Sync),
                _on_stderr: &(dyn Fn(String) + Send + Sync),
            ) -> crate::cli_invoker::Result<CliInvocation> {
                on_stdout("working...".to_string());
                Ok(CliInvocation {
                    exit_code: Some(1),
                    pid: Some(99),
                })
            }
        }

        let tmp = std::env::temp_dir().join(format!("orc-one-shot-{}", Uuid::new_v4()));
        let _ = std::fs::remove_dir_all(&tmp);
        let workspace = WorktreeManager::with_backends(
            tmp.join("repos"),
            tmp.join("worktrees"),
            Box::new(AlwaysOkGit),
            Box::new(StubHosting),
        );

        let registry = std::sync::Arc::new(orc_harness::pid_registry::PidRegistry::new());
        let cli = CliInvoker::with_spawner(Box::new(FailingSpawner), registry);
        let runner = OneShotRunner::new(&workspace, &cli, "coder");

        let repo = test_repo();
        let job = Job::new(repo.client_id, JobType::Code, "do the thing", "feat/one-shot");

        let outcome = runner.run(&job, &repo).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, Some(1));
        assert!(outcome.error.is_some());
        assert!(outcome.messages.iter().any(|m| m.content == "working..."));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn finalize_returns_pr_info() {
        let tmp = std::env::temp_dir();
        let workspace = WorktreeManager::with_backends(
            tmp.join("repos"),
            tmp.join("worktrees"),
            Box::new(AlwaysOkGit),
            Box::new(StubHosting),
        );
        let registry = std::sync::Arc::new(orc_harness::pid_registry::PidRegistry::new());
        let cli = CliInvoker::new(registry);
        let runner = OneShotRunner::new(&workspace, &cli, "coder");

        let repo = test_repo();
        let job = Job::new(repo.client_id, JobType::Code, "do it", "feat/finalize");
        let handle = WorktreeHandle {
            path: "/tmp/wt".into(),
            branch: "feat/finalize".into(),
            base_branch: "main".into(),
            created_at: chrono::Utc::now(),
        };

        let (pr_url, pr_number) = runner.finalize(&job, &handle).unwrap();
        assert_eq!(pr_number, Some(1));
        assert!(pr_url.unwrap().contains("pull/1"));
    }
}
