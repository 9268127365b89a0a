//! PRD Runner (§4.7): drives the coder CLI one story at a time against a
//! `prd.json` snapshot written into the worktree, so exactly one story is
//! expected to complete per iteration.

use std::collections::HashSet;
use std::path::Path;

use chrono::Utc;
use orc_core::types::{
    CompletionReason, FeedbackReport, Job, JobIteration, Prd, PrdCommitEntry, PrdProgress,
    Repository,
};
use orc_core::worktree_manager::WorktreeManager;
use thiserror::Error;
use tracing::{info, warn};

use crate::cli_invoker::{build_cli_args, CliInvoker};
use crate::feedback::FeedbackRunner;
use crate::prompts::build_prd_iteration_prompt;

const PRD_FILE: &str = "prd.json";
const DEFAULT_PROMISE_TOKEN: &str = "<promise>COMPLETE</promise>";

#[derive(Debug, Error)]
pub enum PrdRunnerError {
    #[error("workspace error: {0}")]
    Workspace(#[from] orc_core::worktree_manager::WorktreeManagerError),
    #[error("cli invocation error: {0}")]
    Cli(#[from] crate::cli_invoker::CliInvokerError),
    #[error("job has no PRD attached")]
    MissingPrd,
}

pub type Result<T> = std::result::Result<T, PrdRunnerError>;

#[derive(Debug, Clone)]
pub struct PrdOutcome {
    pub completion_reason: CompletionReason,
    pub iterations: Vec<JobIteration>,
    pub prd: Prd,
    pub progress: PrdProgress,
    pub pr_url: Option<String>,
    pub pr_number: Option<i64>,
}

pub struct PrdRunner<'a> {
    workspace: &'a WorktreeManager,
    cli: &'a CliInvoker,
    feedback: &'a FeedbackRunner,
    coder_cli_bin: &'a str,
}

impl<'a> PrdRunner<'a> {
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

    pub async fn run(&self, job: &Job, repo: &Repository) -> Result<PrdOutcome> {
        let mut prd = job.prd.clone().ok_or(PrdRunnerError::MissingPrd)?;
        let mut progress = job.prd_progress.clone().unwrap_or_default();

        self.workspace.ensure_bare_repo(repo)?;
        self.workspace.fetch_origin(repo)?;
        let handle = self.workspace.create_worktree(repo, job)?;

        let max_iterations = job.max_iterations.unwrap_or(20);
        let mut iterations = Vec::new();
        let mut completion_reason = CompletionReason::MaxIterations;

        for iter_num in 1..=max_iterations {
            let completed: HashSet<i64> = progress.completed_story_ids.iter().copied().collect();
            let story = match prd.next_unpassed_story(&completed) {
                Some(s) => s.clone(),
                None => {
                    completion_reason = CompletionReason::AllStoriesComplete;
                    break;
                }
            };

            write_prd_file(Path::new(&handle.path), &prd);

            let prompt = build_prd_iteration_prompt(story.id, &story.title, &prd.title, &job.branch_name);
            let mut iteration = JobIteration::new(job.id, iter_num, &prompt);
            iteration.story_id = Some(story.id);

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
                warn!(job_id = %job.id, iteration = iter_num, story_id = story.id, "prd iteration failed");
                iterations.push(iteration);
                if iter_num >= max_iterations {
                    completion_reason = CompletionReason::IterationError;
                }
                continue;
            }

            let commit_message = format!("feat: [{}] {}", story.id, story.title);
            let sha = self.workspace.commit_all(&handle, &commit_message)?;
            iteration.commit_sha = sha.clone();

            let report: FeedbackReport = self.feedback.run(Path::new(&handle.path), &job.feedback_commands).await;
            iteration.feedback_results = Some(report);

            if let Some(updated) = read_prd_file(Path::new(&handle.path)) {
                let newly_passing: Vec<i64> = updated
                    .stories
                    .iter()
                    .filter(|s| s.passes && !completed.contains(&s.id))
                    .map(|s| s.id)
                    .collect();

                if let Some(sha) = &sha {
                    for story_id in &newly_passing {
                        progress.commits.push(PrdCommitEntry {
                            story_id: *story_id,
                            sha: sha.clone(),
                            message: commit_message.clone(),
                            timestamp: Utc::now(),
                        });
                        progress.completed_story_ids.push(*story_id);
                    }
                }
                prd = updated;
            }

            let promise_detected = full_output.contains(DEFAULT_PROMISE_TOKEN);
            iteration.promise_detected = promise_detected;
            iterations.push(iteration);

            if promise_detected {
                completion_reason = CompletionReason::PromiseDetected;
                break;
            }

            let completed_now: HashSet<i64> = progress.completed_story_ids.iter().copied().collect();
            if prd.next_unpassed_story(&completed_now).is_none() {
                completion_reason = CompletionReason::AllStoriesComplete;
                break;
            }
        }

        info!(job_id = %job.id, reason = ?completion_reason, iterations = iterations.len(), "prd runner terminated");

        // Push and open a PR regardless of whether every story finished.
        let (pr_url, pr_number) = match self.workspace.create_pull_request(&handle, &prd.title, &job.prompt) {
            Ok(pr) => (Some(pr.url), Some(pr.number)),
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "failed to open pull request");
                (None, None)
            }
        };

        self.workspace.remove_worktree(repo, &handle);

        Ok(PrdOutcome {
            completion_reason,
            iterations,
            prd,
            progress,
            pr_url,
            pr_number,
        })
    }
}

fn write_prd_file(worktree: &Path, prd: &Prd) {
    if let Ok(json) = serde_json::to_string_pretty(prd) {
        let _ = std::fs::write(worktree.join(PRD_FILE), json);
    }
}

fn read_prd_file(worktree: &Path) -> Option<Prd> {
    let content = std::fs::read_to_string(worktree.join(PRD_FILE)).ok()?;
    serde_json::from_str(&content).ok()
}
