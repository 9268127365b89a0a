//! Job Scheduler (§4.1): a single-flight, bounded-concurrency dispatch loop
//! that claims queued jobs FIFO by `created_at`, routes each to the runner
//! named by its `(job_type, prd_mode, specMode)`, and persists whatever the
//! runner reports back onto the job (and, for spec jobs, the feature) row.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use orc_agents::cli_invoker::CliInvoker;
use orc_agents::feedback::FeedbackRunner;
use orc_agents::loop_runner::LoopRunner;
use orc_agents::one_shot::OneShotRunner;
use orc_agents::prd_generation_runner::{PrdGenerationContext, PrdGenerationOutcome, PrdGenerationRunner};
use orc_agents::prd_runner::{PrdOutcome, PrdRunner};
use orc_agents::prompts::PhaseContext;
use orc_agents::spec_pipeline_runner::{SpecAction, SpecPhaseOutcome, SpecPipelineRunner};
use orc_core::db::Db;
use orc_core::types::{
    CodeBranch, CodePullRequest, CompletionReason, Feature, FeatureId, Job, JobId, JobMessage,
    JobMessageKind, JobStatus, JobType, Repository,
};
use orc_core::worktree_manager::WorktreeManager;
use orc_harness::pid_registry::PidRegistry;
use orc_harness::shutdown::ShutdownSignal;

/// How long the dispatch loop waits between passes when nothing wakes it
/// early via `enqueue_notify()` or a job completion.
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// The outcome of driving one job to completion, still in need of being
/// written onto the job row (and, for some job types, a feature row).
enum JobOutcome {
    OneShot(orc_agents::one_shot::OneShotOutcome),
    Loop(orc_agents::loop_runner::LoopOutcome),
    Prd(PrdOutcome),
    PrdGeneration(PrdGenerationOutcome),
    SpecPhase(SpecPhaseOutcome),
    Failed(String),
}

pub struct Scheduler {
    db: Arc<Db>,
    workspace: Arc<WorktreeManager>,
    cli: Arc<CliInvoker>,
    feedback: Arc<FeedbackRunner>,
    pid_registry: Arc<PidRegistry>,
    coder_cli_bin: String,
    max_concurrent: u32,
    cosmetic_feature_type_id: Option<Uuid>,
    shutdown: ShutdownSignal,
    notify: Arc<Notify>,
    dispatching: Arc<AtomicBool>,
    feature_locks: Arc<DashMap<FeatureId, Arc<Mutex<()>>>>,
}

impl Scheduler {
    pub fn new(
        db: Arc<Db>,
        workspace: Arc<WorktreeManager>,
        pid_registry: Arc<PidRegistry>,
        feedback: Arc<FeedbackRunner>,
        coder_cli_bin: String,
        max_concurrent: u32,
        cosmetic_feature_type_id: Option<Uuid>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let cli = Arc::new(CliInvoker::new(pid_registry.clone()));
        Self {
            db,
            workspace,
            cli,
            feedback,
            pid_registry,
            coder_cli_bin,
            max_concurrent,
            cosmetic_feature_type_id,
            shutdown,
            notify: Arc::new(Notify::new()),
            dispatching: Arc::new(AtomicBool::new(false)),
            feature_locks: Arc::new(DashMap::new()),
        }
    }

    /// Wake the dispatch loop. Callers (the HTTP layer's `enqueue`, in
    /// production) call this after inserting a new queued job row so a job
    /// arriving between two passes doesn't wait for unrelated completion
    /// churn to notice it.
    pub fn enqueue_notify(&self) {
        self.notify.notify_one();
    }

    /// §4.1 restart recovery: any job left `running` by a prior process is
    /// rewritten to `failed` before dispatch begins. No resumption is
    /// attempted.
    pub async fn recover_interrupted_jobs(&self) -> Result<()> {
        let running = self
            .db
            .list_running_jobs()
            .await
            .context("listing running jobs for restart recovery")?;
        for mut job in running {
            warn!(job_id = %job.id, "rewriting interrupted job to failed on restart");
            job.status = JobStatus::Failed;
            job.error = Some("interrupted by restart".to_string());
            job.completed_at = Some(Utc::now());
            self.db.upsert_job(&job).await?;
        }
        Ok(())
    }

    /// Run the dispatch loop until the shutdown signal fires. Jobs already
    /// in flight at shutdown are left to finish; only new claims stop.
    pub async fn run(&self) {
        if let Err(e) = self.recover_interrupted_jobs().await {
            error!(error = %e, "restart recovery failed");
        }

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            self.dispatch_pass().await;

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received, scheduler stopping dispatch loop");
                    break;
                }
            }
        }
    }

    /// Single-flight wrapper (§4.1 step 1): if a pass is already running,
    /// the in-flight pass's eventual re-wake (via `notify`) covers whatever
    /// this call would have claimed.
    async fn dispatch_pass(&self) {
        if self
            .dispatching
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("dispatch pass already in flight, skipping");
            return;
        }
        let result = self.dispatch_pass_inner().await;
        self.dispatching.store(false, Ordering::SeqCst);
        if let Err(e) = result {
            error!(error = %e, "dispatch pass failed");
        }
    }

    async fn dispatch_pass_inner(&self) -> Result<()> {
        if self.shutdown.is_shutting_down() {
            debug!("shutting down, not claiming new jobs");
            return Ok(());
        }

        let running = self.db.list_running_jobs().await?;
        if running.len() as u32 >= self.max_concurrent {
            debug!(running = running.len(), max = self.max_concurrent, "at capacity");
            return Ok(());
        }
        let free_slots = self.max_concurrent - running.len() as u32;

        let queued = self.db.list_jobs_by_status(JobStatus::Queued).await?;
        for job in queued.into_iter().take(free_slots as usize) {
            self.launch(job);
        }
        Ok(())
    }

    /// Route `job` and spawn it as an independent concurrent task (§4.1 step
    /// 4). The dispatch pass re-invokes on completion via `notify`.
    fn launch(&self, mut job: Job) {
        let job_id = job.id;
        info!(job_id = %job_id, job_type = ?job.job_type, prd_mode = job.prd_mode, "dispatching job");

        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());

        let db = self.db.clone();
        let workspace = self.workspace.clone();
        let cli = self.cli.clone();
        let feedback = self.feedback.clone();
        let pid_registry = self.pid_registry.clone();
        let coder_cli_bin = self.coder_cli_bin.clone();
        let notify = self.notify.clone();
        let feature_locks = self.feature_locks.clone();
        let cosmetic_feature_type_id = self.cosmetic_feature_type_id;

        tokio::spawn(async move {
            if let Err(e) = db.upsert_job(&job).await {
                error!(job_id = %job_id, error = %e, "failed to mark job running, abandoning dispatch");
                return;
            }

            // §5 shared resources: a spec job holds its feature's lock for
            // the duration of the phase run, guarding single-writer access
            // to the feature's SpecOutput.
            let _feature_guard = match (job.job_type, job.feature_id) {
                (JobType::Spec, Some(feature_id)) => {
                    let lock = feature_locks
                        .entry(feature_id)
                        .or_insert_with(|| Arc::new(Mutex::new(())))
                        .clone();
                    Some(lock.lock_owned().await)
                }
                _ => None,
            };

            // §3's invariant is "job.pid is set while status=running and the
            // subprocess is alive". The pid itself isn't known until the
            // runner's CliInvoker actually spawns it, so watch the registry
            // and write it onto the row the moment it appears.
            let pid_watcher = tokio::spawn(watch_and_persist_pid(db.clone(), pid_registry.clone(), job_id));

            let outcome = run_job(
                &db,
                &workspace,
                &cli,
                &feedback,
                &coder_cli_bin,
                cosmetic_feature_type_id,
                &job,
            )
            .await;
            pid_watcher.abort();
            if let Err(e) = finalize_job(&db, &pid_registry, job, outcome).await {
                error!(job_id = %job_id, error = %e, "failed to finalize job");
            }

            notify.notify_one();
        });
    }

    /// §4.1 cancel(jobId): best-effort pid signal plus an unconditional
    /// terminal status write. Races with natural completion — whichever
    /// write lands last wins; `finalize_job` re-reads the row and skips its
    /// own write if it finds a terminal status already there.
    pub async fn cancel(&self, job_id: JobId) -> Result<()> {
        let Some(mut job) = self.db.get_job(job_id).await? else {
            return Ok(());
        };
        if job.status.is_terminal() {
            return Ok(());
        }
        if job.status == JobStatus::Running {
            let signalled = self.pid_registry.cancel(job_id);
            debug!(job_id = %job_id, signalled, "sent cancellation signal to job's pid");
        }
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(Utc::now());
        self.db.upsert_job(&job).await?;
        self.notify.notify_one();
        Ok(())
    }
}

/// Poll `pid_registry` until a pid shows up for `job_id`, then persist it
/// onto the job row. Aborted by the caller once the job finishes, so it
/// never races `finalize_job`'s own write.
async fn watch_and_persist_pid(db: Arc<Db>, pid_registry: Arc<PidRegistry>, job_id: JobId) {
    loop {
        if let Some(pid) = pid_registry.pid_for(job_id) {
            match db.get_job(job_id).await {
                Ok(Some(mut row)) if row.pid != Some(pid) => {
                    row.pid = Some(pid);
                    if let Err(e) = db.upsert_job(&row).await {
                        warn!(job_id = %job_id, error = %e, "failed to persist job pid");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(job_id = %job_id, error = %e, "failed to load job while persisting pid"),
            }
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Look up the job's repository and drive it through the runner its
/// `(job_type, prd_mode, specMode)` names, per the §4.1 routing table.
async fn run_job(
    db: &Db,
    workspace: &WorktreeManager,
    cli: &CliInvoker,
    feedback: &FeedbackRunner,
    coder_cli_bin: &str,
    cosmetic_feature_type_id: Option<Uuid>,
    job: &Job,
) -> JobOutcome {
    if job.job_type == JobType::PrdGeneration {
        return run_prd_generation(db, cli, coder_cli_bin, job).await;
    }

    let repo = match load_repository(db, job).await {
        Ok(repo) => repo,
        Err(e) => return JobOutcome::Failed(e),
    };

    match job.job_type {
        JobType::Ralph if job.is_spec_task_mode() => {
            let runner = LoopRunner::new(workspace, cli, feedback, coder_cli_bin);
            match runner.run(job, &repo).await {
                Ok(o) => JobOutcome::Loop(o),
                Err(e) => JobOutcome::Failed(e.to_string()),
            }
        }
        JobType::Ralph if job.prd_mode => {
            let runner = PrdRunner::new(workspace, cli, feedback, coder_cli_bin);
            match runner.run(job, &repo).await {
                Ok(o) => JobOutcome::Prd(o),
                Err(e) => JobOutcome::Failed(e.to_string()),
            }
        }
        JobType::Ralph => {
            let runner = LoopRunner::new(workspace, cli, feedback, coder_cli_bin);
            match runner.run(job, &repo).await {
                Ok(o) => JobOutcome::Loop(o),
                Err(e) => JobOutcome::Failed(e.to_string()),
            }
        }
        JobType::Spec => {
            run_spec_phase(db, workspace, cli, coder_cli_bin, cosmetic_feature_type_id, job, &repo).await
        }
        JobType::Code => {
            let runner = OneShotRunner::new(workspace, cli, coder_cli_bin);
            match runner.run(job, &repo).await {
                Ok(o) => JobOutcome::OneShot(o),
                Err(e) => JobOutcome::Failed(e.to_string()),
            }
        }
        JobType::PrdGeneration => unreachable!("handled above"),
    }
}

async fn load_repository(db: &Db, job: &Job) -> std::result::Result<Repository, String> {
    let repository_id = job
        .repository_id
        .ok_or_else(|| "job has no repository_id".to_string())?;
    db.get_repository(repository_id)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("repository {repository_id} not found"))
}

async fn load_feature(db: &Db, feature_id: FeatureId) -> std::result::Result<Feature, String> {
    db.get_feature(feature_id)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("feature {feature_id} not found"))
}

async fn run_spec_phase(
    db: &Db,
    workspace: &WorktreeManager,
    cli: &CliInvoker,
    coder_cli_bin: &str,
    cosmetic_feature_type_id: Option<Uuid>,
    job: &Job,
    repo: &Repository,
) -> JobOutcome {
    let Some(feature_id) = job.feature_id else {
        return JobOutcome::Failed("spec job has no feature_id".to_string());
    };
    let feature = match load_feature(db, feature_id).await {
        Ok(f) => f,
        Err(e) => return JobOutcome::Failed(e),
    };
    let client = match db.get_client(feature.client_id).await {
        Ok(Some(c)) => c,
        Ok(None) => return JobOutcome::Failed(format!("client {} not found", feature.client_id)),
        Err(e) => return JobOutcome::Failed(e.to_string()),
    };

    let existing_output = feature.spec_output.clone().unwrap_or_default();
    let clarification_responses = existing_output
        .clarifications
        .as_ref()
        .map(|cs| {
            cs.iter()
                .filter_map(|c| c.response.clone().map(|r| (c.question.clone(), r)))
                .collect()
        })
        .unwrap_or_default();

    let ctx = PhaseContext {
        feature_title: feature.title.clone(),
        feature_description: feature.functionality_notes.clone(),
        is_cosmetic_feature: cosmetic_feature_type_id.is_some()
            && cosmetic_feature_type_id == feature.feature_type_id,
        client_name: client.name.clone(),
        repo_name: repo.repo_name.clone(),
        tech_stack: None,
        existing_constitution: client.constitution.clone(),
        existing_spec: existing_output.spec.as_ref().map(|v| v.to_string()),
        existing_plan: existing_output.plan.as_ref().map(|v| v.to_string()),
        clarification_responses,
        relevant_memories: None,
    };

    let runner = SpecPipelineRunner::new(workspace, cli, coder_cli_bin);
    match runner
        .run_phase(job, repo, &feature, &ctx, existing_output, false)
        .await
    {
        Ok(o) => JobOutcome::SpecPhase(o),
        Err(e) => JobOutcome::Failed(e.to_string()),
    }
}

async fn run_prd_generation(db: &Db, cli: &CliInvoker, coder_cli_bin: &str, job: &Job) -> JobOutcome {
    let Some(feature_id) = job.feature_id else {
        return JobOutcome::Failed("prd_generation job has no feature_id".to_string());
    };
    let feature = match load_feature(db, feature_id).await {
        Ok(f) => f,
        Err(e) => return JobOutcome::Failed(e),
    };
    let client = match db.get_client(feature.client_id).await {
        Ok(Some(c)) => c,
        Ok(None) => return JobOutcome::Failed(format!("client {} not found", feature.client_id)),
        Err(e) => return JobOutcome::Failed(e.to_string()),
    };

    let ctx = PrdGenerationContext {
        feature_title: feature.title.clone(),
        feature_description: feature.functionality_notes.clone(),
        client_name: client.name.clone(),
        client_context: feature.client_context.clone(),
    };

    // PRD generation touches no repository, so it runs in a private scratch
    // directory rather than a checked-out repo.
    let scratch_dir = std::env::temp_dir().join(format!("coderd-prd-{}", job.id));
    if let Err(e) = tokio::fs::create_dir_all(&scratch_dir).await {
        return JobOutcome::Failed(format!("failed to create scratch dir: {e}"));
    }

    let runner = PrdGenerationRunner::new(cli, coder_cli_bin);
    match runner.run(job, &ctx, &scratch_dir.to_string_lossy()).await {
        Ok(o) => JobOutcome::PrdGeneration(o),
        Err(e) => JobOutcome::Failed(e.to_string()),
    }
}

/// Persist a finished job's outcome onto its row (and, for spec/PRD-gen
/// jobs, its feature). Re-reads the row first so a cancellation that raced
/// ahead of completion is not clobbered (§4.1 cancellation semantics).
async fn finalize_job(db: &Db, pid_registry: &PidRegistry, mut job: Job, outcome: JobOutcome) -> Result<()> {
    pid_registry.unregister(job.id);

    if let Some(current) = db.get_job(job.id).await? {
        if current.status == JobStatus::Cancelled {
            debug!(job_id = %job.id, "job was cancelled before completion, not overwriting");
            return Ok(());
        }
    }

    job.completed_at = Some(Utc::now());
    job.pid = None;

    match outcome {
        JobOutcome::OneShot(o) => {
            job.status = if o.success { JobStatus::Completed } else { JobStatus::Failed };
            job.exit_code = o.exit_code;
            job.pr_url = o.pr_url.clone();
            job.pr_number = o.pr_number;
            job.files_changed = o.files_changed;
            job.error = o.error;
            job.worktree_path = Some(o.worktree_path);
            record_messages(db, job.id, o.messages.into_iter().map(|m| (m.kind, m.content))).await;
            if let (Some(url), Some(number)) = (o.pr_url, o.pr_number) {
                record_pull_request(db, &job, url, number, o.files_changed.unwrap_or(0)).await;
            }
        }
        JobOutcome::Loop(o) => {
            job.status = match o.completion_reason {
                CompletionReason::IterationError => JobStatus::Failed,
                _ => JobStatus::Completed,
            };
            job.completion_reason = Some(o.completion_reason);
            job.pr_url = o.pr_url.clone();
            job.pr_number = o.pr_number;
            job.error = o.error;
            job.current_iteration = o.iterations.len() as i64;
            job.total_iterations = Some(o.iterations.len() as i64);
            for iteration in &o.iterations {
                if let Err(e) = db.insert_iteration(iteration).await {
                    warn!(job_id = %job.id, error = %e, "failed to persist loop iteration");
                }
            }
            if let (Some(url), Some(number)) = (o.pr_url, o.pr_number) {
                record_pull_request(db, &job, url, number, 0).await;
            }
        }
        JobOutcome::Prd(o) => {
            job.status = JobStatus::Completed;
            job.completion_reason = Some(o.completion_reason);
            job.prd = Some(o.prd);
            job.prd_progress = Some(o.progress);
            job.pr_url = o.pr_url.clone();
            job.pr_number = o.pr_number;
            for iteration in &o.iterations {
                if let Err(e) = db.insert_iteration(iteration).await {
                    warn!(job_id = %job.id, error = %e, "failed to persist prd iteration");
                }
            }
            if let (Some(url), Some(number)) = (o.pr_url, o.pr_number) {
                record_pull_request(db, &job, url, number, 0).await;
            }
        }
        JobOutcome::PrdGeneration(o) => {
            job.status = if o.prd.is_some() { JobStatus::Completed } else { JobStatus::Failed };
            job.error = o.parse_failure.clone();
            job.prd = o.prd.clone();
            record_messages(db, job.id, std::iter::once((JobMessageKind::Stdout, o.raw_output))).await;
            if let (Some(feature_id), Some(prd)) = (job.feature_id, o.prd) {
                if let Ok(Some(mut feature)) = db.get_feature(feature_id).await {
                    feature.prd = Some(prd);
                    if let Err(e) = db.upsert_feature(&feature).await {
                        warn!(job_id = %job.id, error = %e, "failed to persist generated prd onto feature");
                    }
                }
            }
        }
        JobOutcome::SpecPhase(o) => {
            if o.parse_failure.is_some() {
                job.status = JobStatus::Failed;
                job.error = o.parse_failure;
            } else {
                job.status = JobStatus::Completed;
                job.completion_reason = Some(match o.action {
                    SpecAction::WaitHuman => CompletionReason::WaitHuman,
                    SpecAction::AnalyzeFailed => CompletionReason::AnalyzeFailed,
                    SpecAction::SpecComplete => CompletionReason::SpecComplete,
                    SpecAction::AutoProgress { .. } => CompletionReason::SpecComplete,
                });
            }
            job.spec_output = Some(o.spec_output.clone());
            job.spec_phase = Some(o.phase);

            if let Some(feature_id) = job.feature_id {
                if let Ok(Some(mut feature)) = db.get_feature(feature_id).await {
                    feature.spec_output = Some(o.spec_output);
                    feature.spec_phase = Some(o.phase);
                    feature.feature_workflow_stage_id = Some(o.workflow_stage);
                    if let Err(e) = db.upsert_feature(&feature).await {
                        warn!(job_id = %job.id, error = %e, "failed to persist spec output onto feature");
                    }
                }

                if let SpecAction::AutoProgress { next_phase } = o.action {
                    let mut next_job =
                        Job::new(job.client_id, JobType::Spec, job.prompt.clone(), job.branch_name.clone());
                    next_job.feature_id = job.feature_id;
                    next_job.repository_id = job.repository_id;
                    next_job.spec_phase = Some(next_phase);
                    if let Err(e) = db.upsert_job(&next_job).await {
                        warn!(job_id = %job.id, error = %e, "failed to enqueue next spec phase job");
                    } else {
                        info!(job_id = %job.id, next_job_id = %next_job.id, next_phase = ?next_phase, "auto-progressed to next spec phase");
                    }
                }
            }
        }
        JobOutcome::Failed(msg) => {
            job.status = JobStatus::Failed;
            job.error = Some(msg);
        }
    }

    db.upsert_job(&job).await?;
    Ok(())
}

async fn record_messages(
    db: &Db,
    job_id: JobId,
    lines: impl IntoIterator<Item = (JobMessageKind, String)>,
) {
    for (kind, content) in lines {
        let message = JobMessage::new(job_id, kind, content);
        if let Err(e) = db.insert_message(&message).await {
            warn!(job_id = %job_id, error = %e, "failed to persist job message");
        }
    }
}

async fn record_pull_request(db: &Db, job: &Job, url: String, number: i64, files_changed: i64) {
    let Some(repository_id) = job.repository_id else {
        return;
    };
    let branch = CodeBranch {
        id: Uuid::new_v4(),
        repository_id,
        name: job.branch_name.clone(),
        created_at: Utc::now(),
    };
    if let Err(e) = db.insert_branch(&branch).await {
        warn!(job_id = %job.id, error = %e, "failed to persist code branch");
    }
    let pr = CodePullRequest {
        id: Uuid::new_v4(),
        repository_id,
        number,
        url,
        title: job.title.clone().unwrap_or_else(|| job.prompt.clone()),
        files_changed,
        created_at: Utc::now(),
    };
    if let Err(e) = db.insert_pull_request(&pr).await {
        warn!(job_id = %job.id, error = %e, "failed to persist pull request");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orc_core::types::{Client, Repository};
    use orc_core::worktree_manager::{GitOutput, GitRunner, HostingCli};

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
            Ok("https://example.com/pr/1".to_string())
        }
    }

    fn test_repo(client_id: Uuid) -> Repository {
        Repository {
            id: Uuid::new_v4(),
            client_id,
            provider: "github".to_string(),
            owner_name: "acme".to_string(),
            repo_name: "widgets".to_string(),
            default_branch: "main".to_string(),
            url: "git@example.com:acme/widgets.git".to_string(),
        }
    }

    async fn seeded_scheduler() -> (Scheduler, Arc<Db>, Client, Repository) {
        let db = Arc::new(Db::new_in_memory().await.unwrap());
        let client = Client {
            id: Uuid::new_v4(),
            name: "Acme".to_string(),
            constitution: None,
            constitution_generated_at: None,
        };
        db.upsert_client(&client).await.unwrap();
        let repo = test_repo(client.id);
        db.upsert_repository(&repo).await.unwrap();

        let workspace = Arc::new(WorktreeManager::with_backends(
            "/tmp/repos",
            "/tmp/worktrees",
            Box::new(AlwaysOkGit),
            Box::new(StubHosting),
        ));
        let pid_registry = Arc::new(PidRegistry::new());
        let feedback = Arc::new(FeedbackRunner::new());
        let shutdown = ShutdownSignal::new();

        let scheduler = Scheduler::new(
            db.clone(),
            workspace,
            pid_registry,
            feedback,
            "coder".to_string(),
            2,
            None,
            shutdown,
        );
        (scheduler, db, client, repo)
    }

    #[tokio::test]
    async fn recover_interrupted_jobs_marks_running_as_failed() {
        let (scheduler, db, client, repo) = seeded_scheduler().await;
        let mut job = Job::new(client.id, JobType::Code, "add a feature", "feat/x");
        job.repository_id = Some(repo.id);
        job.status = JobStatus::Running;
        db.upsert_job(&job).await.unwrap();

        scheduler.recover_interrupted_jobs().await.unwrap();

        let reloaded = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, JobStatus::Failed);
        assert_eq!(reloaded.error.as_deref(), Some("interrupted by restart"));
    }

    #[tokio::test]
    async fn dispatch_pass_respects_max_concurrent() {
        let (scheduler, db, client, repo) = seeded_scheduler().await;

        for i in 0..3 {
            let mut job = Job::new(client.id, JobType::Code, format!("task {i}"), format!("feat/{i}"));
            job.repository_id = Some(repo.id);
            db.upsert_job(&job).await.unwrap();
        }

        scheduler.dispatch_pass_inner().await.unwrap();
        // Give spawned tasks a moment to mark themselves running.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let running = db.list_running_jobs().await.unwrap();
        assert!(running.len() <= 2, "at most max_concurrent jobs should be running, got {}", running.len());
    }

    #[tokio::test]
    async fn cancel_on_queued_job_marks_it_cancelled_without_signalling() {
        let (scheduler, db, client, repo) = seeded_scheduler().await;
        let mut job = Job::new(client.id, JobType::Code, "add a feature", "feat/x");
        job.repository_id = Some(repo.id);
        db.upsert_job(&job).await.unwrap();

        scheduler.cancel(job.id).await.unwrap();

        let reloaded = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_on_already_terminal_job_is_a_no_op() {
        let (scheduler, db, client, repo) = seeded_scheduler().await;
        let mut job = Job::new(client.id, JobType::Code, "add a feature", "feat/x");
        job.repository_id = Some(repo.id);
        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now());
        db.upsert_job(&job).await.unwrap();

        scheduler.cancel(job.id).await.unwrap();

        let reloaded = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn finalize_job_does_not_overwrite_a_job_cancelled_mid_flight() {
        let (_scheduler, db, client, repo) = seeded_scheduler().await;
        let mut job = Job::new(client.id, JobType::Code, "add a feature", "feat/x");
        job.repository_id = Some(repo.id);
        job.status = JobStatus::Running;
        db.upsert_job(&job).await.unwrap();

        // Simulate a cancel racing ahead of the runner's completion.
        let mut cancelled = job.clone();
        cancelled.status = JobStatus::Cancelled;
        cancelled.completed_at = Some(Utc::now());
        db.upsert_job(&cancelled).await.unwrap();

        let pid_registry = PidRegistry::new();
        let outcome = JobOutcome::Failed("coder CLI exited non-zero".to_string());
        finalize_job(&db, &pid_registry, job.clone(), outcome).await.unwrap();

        let reloaded = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, JobStatus::Cancelled);
    }
}
