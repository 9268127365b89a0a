//! Spec Pipeline Runner (§4.8): executes exactly one phase of the six-phase
//! spec state machine per job, merges the result into the feature's
//! `SpecOutput`, runs the judge/improve loop (§4.10) for the plan phase, and
//! computes the auto-progression action for the caller to act on.

use chrono::Utc;
use orc_core::types::{Feature, Job, Repository, SpecOutput, SpecPhase};
use orc_core::worktree_manager::WorktreeManager;
use orc_pipeline::judge::{ImprovedPlan, JudgeVerdict};
use orc_pipeline::spec::{PhaseMetrics, PhaseResult, PhaseStatus, SpecError, SpecPipeline};
use thiserror::Error;
use tracing::{info, warn};

use crate::cli_invoker::{build_cli_args, CliInvoker};
use crate::prompts::{build_phase_prompt, extract_json, PhaseContext};

#[derive(Debug, Error)]
pub enum SpecPipelineError {
    #[error("workspace error: {0}")]
    Workspace(#[from] orc_core::worktree_manager::WorktreeManagerError),
    #[error("cli invocation error: {0}")]
    Cli(#[from] crate::cli_invoker::CliInvokerError),
    #[error("spec pipeline error: {0}")]
    Spec(#[from] SpecError),
}

pub type Result<T> = std::result::Result<T, SpecPipelineError>;

/// The decision made after merging a completed phase (§4.8 step 9).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecAction {
    WaitHuman,
    AnalyzeFailed,
    AutoProgress { next_phase: SpecPhase },
    SpecComplete,
}

#[derive(Debug, Clone)]
pub struct SpecPhaseOutcome {
    pub phase: SpecPhase,
    pub spec_output: SpecOutput,
    pub workflow_stage: String,
    pub action: SpecAction,
    pub manual_review_note: Option<String>,
    /// Set instead of `spec_output`/`action` being meaningful when the CLI's
    /// output could not be parsed as JSON at all.
    pub parse_failure: Option<String>,
}

pub struct SpecPipelineRunner<'a> {
    workspace: &'a WorktreeManager,
    cli: &'a CliInvoker,
    coder_cli_bin: &'a str,
}

impl<'a> SpecPipelineRunner<'a> {
    pub fn new(workspace: &'a WorktreeManager, cli: &'a CliInvoker, coder_cli_bin: &'a str) -> Self {
        Self {
            workspace,
            cli,
            coder_cli_bin,
        }
    }

    /// Run the single phase named by `job.spec_phase` (defaulting to
    /// `constitution` for a feature's first spec job).
    #[allow(clippy::too_many_arguments)]
    pub async fn run_phase(
        &self,
        job: &Job,
        repo: &Repository,
        feature: &Feature,
        ctx: &PhaseContext,
        existing_output: SpecOutput,
        force_regenerate: bool,
    ) -> Result<SpecPhaseOutcome> {
        let phase = job.spec_phase.unwrap_or(SpecPhase::Constitution);

        self.workspace.ensure_bare_repo(repo)?;
        self.workspace.fetch_origin(repo)?;
        let handle = self.workspace.create_worktree(repo, job)?;

        let reuse_constitution =
            phase == SpecPhase::Constitution && !force_regenerate && ctx.existing_constitution.is_some();

        let content = if reuse_constitution {
            info!(feature_id = %feature.id, "reusing stored constitution, skipping CLI invocation");
            Some(serde_json::json!({
                "constitution": ctx.existing_constitution,
                "techStack": ctx.tech_stack,
                "keyPatterns": [],
            }))
        } else {
            let prompt = build_phase_prompt(phase, ctx);
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

            if invocation.exit_code != Some(0) {
                self.workspace.remove_worktree(repo, &handle);
                return Ok(SpecPhaseOutcome {
                    phase,
                    spec_output: existing_output,
                    workflow_stage: format!("{}_failed", phase.label()),
                    action: SpecAction::AnalyzeFailed,
                    manual_review_note: None,
                    parse_failure: Some("coder CLI exited non-zero".to_string()),
                });
            }

            match extract_json(&full_output) {
                Some(v) => Some(v),
                None => {
                    warn!(feature_id = %feature.id, phase = phase.label(), "failed to extract JSON from phase output");
                    None
                }
            }
        };

        let content = match content {
            Some(v) => v,
            None => {
                self.workspace.remove_worktree(repo, &handle);
                return Ok(SpecPhaseOutcome {
                    phase,
                    spec_output: existing_output,
                    workflow_stage: format!("{}_failed", phase.label()),
                    action: SpecAction::AnalyzeFailed,
                    manual_review_note: None,
                    parse_failure: Some("could not extract JSON from phase output".to_string()),
                });
            }
        };

        let (final_content, manual_review_note) = if phase == SpecPhase::Plan {
            self.run_judge_loop(job, &handle.path, content).await?
        } else {
            (content, None)
        };

        // The worktree is only needed to give the phase (and, for `plan`,
        // the judge/improve loop) a `cwd` to run in; it is removed once
        // both are done, success or failure.
        self.workspace.remove_worktree(repo, &handle);

        let mut pipeline = SpecPipeline::new();
        pipeline.load(feature.id, existing_output);

        pipeline.record_phase(
            feature.id,
            PhaseResult::complete(phase, final_content, PhaseMetrics::default()),
        )?;

        let spec_output = pipeline.get(feature.id).cloned().unwrap_or_default();

        let action = if phase == SpecPhase::Clarify && !spec_output.clarifications_all_answered() {
            SpecAction::WaitHuman
        } else if phase == SpecPhase::Analyze && !spec_output.analysis_passed() {
            SpecAction::AnalyzeFailed
        } else if let Some(next) = pipeline.next_phase(feature.id) {
            SpecAction::AutoProgress { next_phase: next }
        } else {
            SpecAction::SpecComplete
        };

        let workflow_stage = match &action {
            SpecAction::WaitHuman => format!("{}_waiting", phase.label()),
            _ => format!("{}_complete", phase.label()),
        };

        info!(feature_id = %feature.id, phase = phase.label(), action = ?action, "spec phase complete");

        Ok(SpecPhaseOutcome {
            phase,
            spec_output,
            workflow_stage,
            action,
            manual_review_note,
            parse_failure: None,
        })
    }

    /// Run the judge/improve loop (§4.10) over a freshly produced plan,
    /// invoking the coder CLI for each judge/improve pass.
    async fn run_judge_loop(
        &self,
        job: &Job,
        worktree: &str,
        plan: serde_json::Value,
    ) -> Result<(serde_json::Value, Option<String>)> {
        // run_judge_loop's callbacks are synchronous; the CLI invocation is
        // async, so each pass is driven outside the closure and the parsed
        // result handed in. We unroll the loop here rather than adapting
        // `orc_pipeline::judge::run_judge_loop` to async closures.
        let mut current_plan = plan;
        let mut last_verdict: Option<JudgeVerdict> = None;

        for cycle in 0..orc_pipeline::judge::MAX_REVISION_CYCLES {
            let verdict = self.judge_pass(job, worktree, &current_plan).await?;
            let passed = verdict.passed;
            last_verdict = Some(verdict.clone());

            if passed {
                return Ok((current_plan, None));
            }

            if cycle + 1 == orc_pipeline::judge::MAX_REVISION_CYCLES {
                break;
            }

            let improved = self.improve_pass(job, worktree, &current_plan, &verdict).await?;
            current_plan = improved.improved_plan;
        }

        let note = last_verdict.map(|_| {
            format!(
                "plan did not pass judge review after {} revision cycle(s); manual review required",
                orc_pipeline::judge::MAX_REVISION_CYCLES
            )
        });
        Ok((current_plan, note))
    }

    async fn judge_pass(&self, job: &Job, worktree: &str, plan: &serde_json::Value) -> Result<JudgeVerdict> {
        let prompt = build_judge_prompt(plan);
        let mut output = String::new();
        self.cli
            .invoke(
                job.id,
                self.coder_cli_bin,
                &build_cli_args(&prompt, None),
                worktree,
                &[],
                &|line| output.push_str(&line),
                &|_| {},
            )
            .await?;

        let value = extract_json(&output).unwrap_or(serde_json::Value::Null);
        Ok(serde_json::from_value(value).unwrap_or(JudgeVerdict {
            passed: false,
            overall_score: 0,
            criteria: Vec::new(),
            summary: "judge output could not be parsed".to_string(),
            improvements: Vec::new(),
        }))
    }

    async fn improve_pass(
        &self,
        job: &Job,
        worktree: &str,
        plan: &serde_json::Value,
        verdict: &JudgeVerdict,
    ) -> Result<ImprovedPlan> {
        let prompt = build_improve_prompt(plan, verdict);
        let mut output = String::new();
        self.cli
            .invoke(
                job.id,
                self.coder_cli_bin,
                &build_cli_args(&prompt, None),
                worktree,
                &[],
                &|line| output.push_str(&line),
                &|_| {},
            )
            .await?;

        let value = extract_json(&output).unwrap_or(serde_json::Value::Null);
        Ok(serde_json::from_value(value).unwrap_or(ImprovedPlan {
            improved_plan: plan.clone(),
            changes_summary: Vec::new(),
        }))
    }
}

fn build_judge_prompt(plan: &serde_json::Value) -> String {
    let criteria_names: Vec<&str> = orc_pipeline::judge::JudgeCriterion::ALL
        .iter()
        .map(|c| match c {
            orc_pipeline::judge::JudgeCriterion::Patterns => "patterns",
            orc_pipeline::judge::JudgeCriterion::ErrorHandling => "error handling",
            orc_pipeline::judge::JudgeCriterion::NoHardcodedValues => "no hardcoded values",
            orc_pipeline::judge::JudgeCriterion::FunctionSize => "function size",
            orc_pipeline::judge::JudgeCriterion::CommentIntent => "comment intent",
            orc_pipeline::judge::JudgeCriterion::TypeStrictness => "type strictness",
            orc_pipeline::judge::JudgeCriterion::ApiErrorBoundaries => "api error boundaries",
            orc_pipeline::judge::JudgeCriterion::Security => "security",
            orc_pipeline::judge::JudgeCriterion::Performance => "performance",
        })
        .collect();

    format!(
        "Judge the following implementation plan against these criteria: {}.\n\
Required output keys: passed, overallScore (0-100), criteria[{{criterion, passed, reasoning, suggestions?}}], summary, improvements[].\n\n\
Plan:\n{}",
        criteria_names.join(", "),
        plan
    )
}

fn build_improve_prompt(plan: &serde_json::Value, verdict: &JudgeVerdict) -> String {
    let failing = verdict.failing_criteria();
    let mut notes = String::new();
    for c in &failing {
        notes.push_str(&format!("- {:?}: {}\n", c.criterion, c.reasoning));
        if let Some(s) = &c.suggestions {
            notes.push_str(&format!("  suggestion: {s}\n"));
        }
    }

    format!(
        "Improve this plan to address the following failing criteria:\n{notes}\n\
Required output keys: improvedPlan, changesSummary[].\n\n\
Plan:\n{plan}\n\n\
Timestamp: {}",
        Utc::now().to_rfc3339()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use orc_core::types::{JobType, SpecTask};
    use orc_core::worktree_manager::{GitOutput, GitRunner, HostingCli};
    use std::sync::Arc;
    use uuid::Uuid;

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

    fn test_feature(repo: &Repository) -> Feature {
        Feature {
            id: Uuid::new_v4(),
            client_id: repo.client_id,
            title: "Checkout flow".into(),
            functionality_notes: None,
            client_context: None,
            feature_type_id: None,
            prd: None,
            spec_output: None,
            spec_phase: None,
            feature_workflow_stage_id: None,
        }
    }

    #[tokio::test]
    async fn constitution_phase_merges_parsed_json() {
        use crate::cli_invoker::{CliInvocation, CliSpawner};

        struct JsonSpawner;
        #[async_trait::async_trait]
        impl CliSpawner for JsonSpawner {
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
                on_stdout("```json\n{\"constitution\":\"# Rules\",\"techStack\":\"rust\",\"keyPatterns\":[]}\n```".to_string());
                Ok(CliInvocation {
                    exit_code: Some(0),
                    pid: Some(1),
                })
            }
        }

        let tmp = std::env::temp_dir().join(format!("orc-spec-{}", Uuid::new_v4()));
        let _ = std::fs::remove_dir_all(&tmp);
        let workspace = WorktreeManager::with_backends(
            tmp.join("repos"),
            tmp.join("worktrees"),
            Box::new(AlwaysOkGit),
            Box::new(StubHosting),
        );
        let registry = Arc::new(orc_harness::pid_registry::PidRegistry::new());
        let cli = CliInvoker::with_spawner(Box::new(JsonSpawner), registry);
        let runner = SpecPipelineRunner::new(&workspace, &cli, "coder");

        let repo = test_repo();
        let feature = test_feature(&repo);
        let mut job = Job::new(repo.client_id, JobType::Spec, "spec this feature", "spec/checkout");
        job.feature_id = Some(feature.id);
        job.spec_phase = Some(SpecPhase::Constitution);

        let ctx = PhaseContext {
            feature_title: feature.title.clone(),
            client_name: "Acme".into(),
            repo_name: repo.repo_name.clone(),
            ..Default::default()
        };

        let outcome = runner
            .run_phase(&job, &repo, &feature, &ctx, SpecOutput::default(), false)
            .await
            .unwrap();

        assert!(outcome.parse_failure.is_none());
        assert!(outcome.spec_output.constitution.is_some());
        assert_eq!(outcome.action, SpecAction::AutoProgress { next_phase: SpecPhase::Specify });

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn constitution_phase_short_circuits_when_stored_and_not_forced() {
        use crate::cli_invoker::{CliInvocation, CliSpawner};

        struct PanicSpawner;
        #[async_trait::async_trait]
        impl CliSpawner for PanicSpawner {
            async fn run(
                &self,
                _bin: &str,
                _args: &[String],
                _cwd: &str,
                _env: &[(String, String)],
                _on_spawn: &(dyn Fn(u32) + Send + Sync),
                _on_stdout: &(dyn Fn(String) + Send + Sync),
                _on_stderr: &(dyn Fn(String) + Send + Sync),
            ) -> crate::cli_invoker::Result<CliInvocation> {
                panic!("should not invoke CLI when reusing stored constitution");
            }
        }

        let tmp = std::env::temp_dir().join(format!("orc-spec-skip-{}", Uuid::new_v4()));
        let _ = std::fs::remove_dir_all(&tmp);
        let workspace = WorktreeManager::with_backends(
            tmp.join("repos"),
            tmp.join("worktrees"),
            Box::new(AlwaysOkGit),
            Box::new(StubHosting),
        );
        let registry = Arc::new(orc_harness::pid_registry::PidRegistry::new());
        let cli = CliInvoker::with_spawner(Box::new(PanicSpawner), registry);
        let runner = SpecPipelineRunner::new(&workspace, &cli, "coder");

        let repo = test_repo();
        let feature = test_feature(&repo);
        let mut job = Job::new(repo.client_id, JobType::Spec, "spec this feature", "spec/checkout");
        job.feature_id = Some(feature.id);
        job.spec_phase = Some(SpecPhase::Constitution);

        let ctx = PhaseContext {
            feature_title: feature.title.clone(),
            client_name: "Acme".into(),
            repo_name: repo.repo_name.clone(),
            existing_constitution: Some("# Already generated".into()),
            ..Default::default()
        };

        let outcome = runner
            .run_phase(&job, &repo, &feature, &ctx, SpecOutput::default(), false)
            .await
            .unwrap();

        assert!(outcome.spec_output.constitution.is_some());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn clarify_phase_with_unanswered_question_waits_on_human() {
        use crate::cli_invoker::{CliInvocation, CliSpawner};

        struct ClarifySpawner;
        #[async_trait::async_trait]
        impl CliSpawner for ClarifySpawner {
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
                on_stdout("```json\n[{\"id\":1,\"question\":\"auth scheme?\"}]\n```".to_string());
                Ok(CliInvocation {
                    exit_code: Some(0),
                    pid: Some(1),
                })
            }
        }

        let tmp = std::env::temp_dir().join(format!("orc-spec-clarify-{}", Uuid::new_v4()));
        let _ = std::fs::remove_dir_all(&tmp);
        let workspace = WorktreeManager::with_backends(
            tmp.join("repos"),
            tmp.join("worktrees"),
            Box::new(AlwaysOkGit),
            Box::new(StubHosting),
        );
        let registry = Arc::new(orc_harness::pid_registry::PidRegistry::new());
        let cli = CliInvoker::with_spawner(Box::new(ClarifySpawner), registry);
        let runner = SpecPipelineRunner::new(&workspace, &cli, "coder");

        let repo = test_repo();
        let feature = test_feature(&repo);
        let mut job = Job::new(repo.client_id, JobType::Spec, "spec this feature", "spec/checkout");
        job.feature_id = Some(feature.id);
        job.spec_phase = Some(SpecPhase::Clarify);

        let ctx = PhaseContext::default();
        let mut existing = SpecOutput::default();
        existing.phase = Some(SpecPhase::Specify);

        let outcome = runner
            .run_phase(&job, &repo, &feature, &ctx, existing, false)
            .await
            .unwrap();

        assert_eq!(outcome.action, SpecAction::WaitHuman);
        assert_eq!(outcome.workflow_stage, "clarify_waiting");

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn plan_phase_runs_judge_loop_and_records_manual_review_note_on_exhaustion() {
        use crate::cli_invoker::{CliInvocation, CliSpawner};
        use std::sync::Mutex;

        struct AlwaysFailingJudgeSpawner {
            calls: Mutex<i64>,
        }
        #[async_trait::async_trait]
        impl CliSpawner for AlwaysFailingJudgeSpawner {
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
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                if *calls == 1 {
                    // initial plan-phase CLI call
                    on_stdout("```json\n{\"architecture\":\"layered\"}\n```".to_string());
                } else if *calls % 2 == 0 {
                    // judge pass: always fails
                    on_stdout("```json\n{\"passed\":false,\"overallScore\":10,\"criteria\":[{\"criterion\":\"security\",\"passed\":false,\"reasoning\":\"nope\"}],\"summary\":\"bad\",\"improvements\":[]}\n```".to_string());
                } else {
                    // improve pass
                    on_stdout("```json\n{\"improvedPlan\":{\"architecture\":\"layered-v2\"},\"changesSummary\":[\"tightened security\"]}\n```".to_string());
                }
                Ok(CliInvocation {
                    exit_code: Some(0),
                    pid: Some(1),
                })
            }
        }

        let tmp = std::env::temp_dir().join(format!("orc-spec-plan-{}", Uuid::new_v4()));
        let _ = std::fs::remove_dir_all(&tmp);
        let workspace = WorktreeManager::with_backends(
            tmp.join("repos"),
            tmp.join("worktrees"),
            Box::new(AlwaysOkGit),
            Box::new(StubHosting),
        );
        let registry = Arc::new(orc_harness::pid_registry::PidRegistry::new());
        let cli = CliInvoker::with_spawner(Box::new(AlwaysFailingJudgeSpawner { calls: Mutex::new(0) }), registry);
        let runner = SpecPipelineRunner::new(&workspace, &cli, "coder");

        let repo = test_repo();
        let feature = test_feature(&repo);
        let mut job = Job::new(repo.client_id, JobType::Spec, "spec this feature", "spec/checkout");
        job.feature_id = Some(feature.id);
        job.spec_phase = Some(SpecPhase::Plan);

        let ctx = PhaseContext::default();
        let mut existing = SpecOutput::default();
        existing.phase = Some(SpecPhase::Clarify);
        existing.clarifications = Some(Vec::new());

        let outcome = runner
            .run_phase(&job, &repo, &feature, &ctx, existing, false)
            .await
            .unwrap();

        assert!(outcome.manual_review_note.is_some());
        assert!(outcome.spec_output.plan.is_some());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn judge_prompt_names_all_nine_criteria() {
        let prompt = build_judge_prompt(&serde_json::json!({}));
        assert!(prompt.contains("security"));
        assert!(prompt.contains("performance"));
        assert!(prompt.contains("no hardcoded values"));
    }

    #[allow(dead_code)]
    fn unused_spec_task_hint(_: SpecTask) {}
}
