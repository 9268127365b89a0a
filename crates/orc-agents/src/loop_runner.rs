//! Loop Runner (§4.6): repeatedly invokes the coder CLI against one worktree,
//! one commit per iteration, until a promise token appears, `max_iterations`
//! is exhausted, or an iteration fails outright. Also drives spec-task mode
//! (§4.11), where each iteration targets the next dependency-eligible task
//! instead of a standing promise token.

use std::collections::HashSet;
use std::path::Path;

use orc_core::types::{
    CompletionReason, FeedbackReport, Job, JobIteration, Repository, SpecTask,
};
use orc_core::worktree_manager::WorktreeManager;
use thiserror::Error;
use tracing::{info, warn};

use crate::cli_invoker::{build_cli_args, CliInvoker};
use crate::feedback::FeedbackRunner;
use crate::prompts::{build_loop_iteration_prompt, build_spec_task_prompt, extract_summary};

const PROGRESS_FILE: &str = ".ralph-progress.md";
const DEFAULT_PROMISE_TOKEN: &str = "<promise>COMPLETE</promise>";

#[derive(Debug, Error)]
pub enum LoopError {
    #[error("workspace error: {0}")]
    Workspace(#[from] orc_core::worktree_manager::WorktreeManagerError),
    #[error("cli invocation error: {0}")]
    Cli(#[from] crate::cli_invoker::CliInvokerError),
}

pub type Result<T> = std::result::Result<T, LoopError>;

#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub completion_reason: CompletionReason,
    pub iterations: Vec<JobIteration>,
    pub pr_url: Option<String>,
    pub pr_number: Option<i64>,
    pub error: Option<String>,
}

/// Pick the first eligible task in list order: not yet completed, and every
/// dependency already completed (§4.11).
fn next_eligible_task<'a>(tasks: &'a [SpecTask], completed: &HashSet<i64>) -> Option<&'a SpecTask> {
    tasks
        .iter()
        .find(|t| !completed.contains(&t.id) && t.dependencies.iter().all(|d| completed.contains(d)))
}

/// Detect a `<task-complete>ID</task-complete>` marker and return the id.
fn detect_task_complete(output: &str) -> Option<i64> {
    let start = output.find("<task-complete>")? + "<task-complete>".len();
    let rest = &output[start..];
    let end = rest.find("</task-complete>")?;
    rest[..end].trim().parse().ok()
}

pub struct LoopRunner<'a> {
    workspace: &'a WorktreeManager,
    cli: &'a CliInvoker,
    feedback: &'a FeedbackRunner,
    coder_cli_bin: &'a str,
}

impl<'a> LoopRunner<'a> {
    pub fn new(
        workspace: &'a WorktreeManager,
        cli: &'a CliInvoker,
        feedback: &'a FeedbackRunner,
        coder_cli_bin: &'a str,
    ) -> Self {
        Self {
            workspace,
            cli,
            feedback,
            coder_cli_bin,
        }
    }

    pub async fn run(&self, job: &Job, repo: &Repository) -> Result<LoopOutcome> {
        self.workspace.ensure_bare_repo(repo)?;
        self.workspace.fetch_origin(repo)?;
        let handle = self.workspace.create_worktree(repo, job)?;

        let max_iterations = job.max_iterations.unwrap_or(10);
        let promise_token = job
            .completion_promise
            .clone()
            .unwrap_or_else(|| DEFAULT_PROMISE_TOKEN.to_string());

        let spec_task_mode = job.is_spec_task_mode();
        let tasks: Vec<SpecTask> = job
            .spec_output
            .as_ref()
            .and_then(|s| s.tasks.clone())
            .unwrap_or_default();
        let mut completed_tasks: HashSet<i64> = HashSet::new();

        let mut iterations = Vec::new();
        let mut completion_reason = CompletionReason::MaxIterations;
        let mut run_error = None;

        for iter_num in 1..=max_iterations {
            let prompt = if spec_task_mode {
                match next_eligible_task(&tasks, &completed_tasks) {
                    Some(task) => build_spec_task_prompt(task.id, &task.title, &task.description),
                    None => {
                        completion_reason = CompletionReason::AllStoriesComplete;
                        break;
                    }
                }
            } else {
                let previous_progress = read_progress_file(Path::new(&handle.path));
                build_loop_iteration_prompt(iter_num, max_iterations, &promise_token, &previous_progress, &job.prompt)
            };

            let mut iteration = JobIteration::new(job.id, iter_num, &prompt);
            let mut full_output = String::new();

            let invocation = self
                .cli
                .invoke(
                    job.id,
                    self.coder_cli_bin,
                    &build_cli_args(&prompt, None),
                    &handle.path,
                    &[],
                    &|line| full_output.push_str(&line),
                    &|_line| {},
                )
                .await?;

            iteration.exit_code = invocation.exit_code;

            if invocation.exit_code != Some(0) {
                warn!(job_id = %job.id, iteration = iter_num, "loop iteration failed");
                iterations.push(iteration);
                if iter_num >= max_iterations {
                    completion_reason = CompletionReason::IterationError;
                    run_error = Some("coder CLI exited non-zero".to_string());
                    break;
                }
                continue;
            }

            let summary = extract_summary(&full_output);
            iteration.output_summary = Some(summary.clone());

            let excerpt: String = summary.chars().take(72).collect();
            let commit_message = format!("iter {iter_num}: {excerpt}");
            iteration.commit_sha = self.workspace.commit_all(&handle, &commit_message)?;

            let report: FeedbackReport = self.feedback.run(Path::new(&handle.path), &job.feedback_commands).await;
            iteration.feedback_results = Some(report);

            if spec_task_mode {
                if let Some(done_id) = detect_task_complete(&full_output) {
                    completed_tasks.insert(done_id);
                    iteration.story_id = Some(done_id);
                }
                iteration.promise_detected = false;
                iterations.push(iteration);

                if next_eligible_task(&tasks, &completed_tasks).is_none() {
                    completion_reason = CompletionReason::AllStoriesComplete;
                    break;
                }
            } else {
                let promise_detected = full_output.contains(&promise_token);
                iteration.promise_detected = promise_detected;
                iterations.push(iteration);

                if promise_detected {
                    completion_reason = CompletionReason::PromiseDetected;
                    break;
                }
            }
        }

        info!(job_id = %job.id, reason = ?completion_reason, iterations = iterations.len(), "loop runner terminated");

        let (pr_url, pr_number) = if self.workspace.has_changes(&handle).unwrap_or(false)
            || iterations.iter().any(|i| i.commit_sha.is_some())
        {
            let title = job.title.clone().unwrap_or_else(|| "automated changes".to_string());
            match self.workspace.create_pull_request(&handle, &title, &job.prompt) {
                Ok(pr) => (Some(pr.url), Some(pr.number)),
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "failed to open pull request");
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        self.workspace.remove_worktree(repo, &handle);

        Ok(LoopOutcome {
            completion_reason,
            iterations,
            pr_url,
            pr_number,
            error: run_error,
        })
    }
}

fn read_progress_file(worktree: &Path) -> String {
    std::fs::read_to_string(worktree.join(PROGRESS_FILE)).unwrap_or_default()
}
