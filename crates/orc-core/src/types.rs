use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Ids
// ---------------------------------------------------------------------------

pub type JobId = Uuid;
pub type FeatureId = Uuid;
pub type ClientId = Uuid;
pub type RepositoryId = Uuid;

// ---------------------------------------------------------------------------
// JobType / JobStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Code,
    Ralph,
    PrdGeneration,
    Spec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Returns `true` once the job will never change status again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        matches!(
            (self, target),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Queued, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Cancelled)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    PromiseDetected,
    MaxIterations,
    AllStoriesComplete,
    IterationError,
    SpecComplete,
    WaitHuman,
    AnalyzeFailed,
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub client_id: ClientId,
    pub feature_id: Option<FeatureId>,
    pub repository_id: Option<RepositoryId>,
    pub created_by: Option<Uuid>,

    pub job_type: JobType,
    pub prd_mode: bool,

    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub prompt: String,
    pub branch_name: String,
    pub title: Option<String>,
    pub max_iterations: Option<i64>,
    pub completion_promise: Option<String>,
    pub feedback_commands: Vec<String>,
    pub prd: Option<Prd>,
    pub spec_phase: Option<SpecPhase>,
    pub spec_output: Option<SpecOutput>,

    pub exit_code: Option<i32>,
    pub pr_url: Option<String>,
    pub pr_number: Option<i64>,
    pub files_changed: Option<i64>,
    pub code_branch_id: Option<Uuid>,
    pub code_pull_request_id: Option<Uuid>,
    pub error: Option<String>,
    pub worktree_path: Option<String>,
    pub pid: Option<u32>,
    pub completion_reason: Option<CompletionReason>,
    pub current_iteration: i64,
    pub total_iterations: Option<i64>,
    pub prd_progress: Option<PrdProgress>,
}

impl Job {
    /// Build a fresh queued job with the bookkeeping fields zeroed out.
    pub fn new(client_id: ClientId, job_type: JobType, prompt: impl Into<String>, branch_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            client_id,
            feature_id: None,
            repository_id: None,
            created_by: None,
            job_type,
            prd_mode: false,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            prompt: prompt.into(),
            branch_name: branch_name.into(),
            title: None,
            max_iterations: None,
            completion_promise: None,
            feedback_commands: Vec::new(),
            prd: None,
            spec_phase: None,
            spec_output: None,
            exit_code: None,
            pr_url: None,
            pr_number: None,
            files_changed: None,
            code_branch_id: None,
            code_pull_request_id: None,
            error: None,
            worktree_path: None,
            pid: None,
            completion_reason: None,
            current_iteration: 0,
            total_iterations: None,
            prd_progress: None,
        }
    }

    /// `true` if this job runs in "spec-task" mode (LoopRunner over a completed tasks phase).
    pub fn is_spec_task_mode(&self) -> bool {
        self.spec_output
            .as_ref()
            .map(|s| s.spec_mode)
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// JobMessage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMessageKind {
    Stdout,
    Stderr,
    System,
    UserInput,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMessage {
    pub id: Uuid,
    pub job_id: JobId,
    pub kind: JobMessageKind,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl JobMessage {
    pub fn new(job_id: JobId, kind: JobMessageKind, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            kind,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// JobIteration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobIteration {
    pub id: Uuid,
    pub job_id: JobId,
    pub iteration_number: i64,
    pub prompt: String,
    pub output_summary: Option<String>,
    pub promise_detected: bool,
    pub feedback_results: Option<FeedbackReport>,
    pub exit_code: Option<i32>,
    pub story_id: Option<i64>,
    pub commit_sha: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl JobIteration {
    pub fn new(job_id: JobId, iteration_number: i64, prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            iteration_number,
            prompt: prompt.into(),
            output_summary: None,
            promise_detected: false,
            feedback_results: None,
            exit_code: None,
            story_id: None,
            commit_sha: None,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Feedback
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackCommandResult {
    pub category: FeedbackCategory,
    pub command: String,
    pub passed: bool,
    pub output_excerpt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackCategory {
    Test,
    TypeCheck,
    Lint,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackReport {
    pub passed: bool,
    pub results: Vec<FeedbackCommandResult>,
    pub summary: String,
    pub failed_tests: Vec<String>,
}

// ---------------------------------------------------------------------------
// Feature / SpecOutput
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub id: FeatureId,
    pub client_id: ClientId,
    pub title: String,
    pub functionality_notes: Option<String>,
    pub client_context: Option<String>,
    pub feature_type_id: Option<Uuid>,
    pub prd: Option<Prd>,
    pub spec_output: Option<SpecOutput>,
    pub spec_phase: Option<SpecPhase>,
    pub feature_workflow_stage_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecPhase {
    Constitution,
    Specify,
    Clarify,
    Plan,
    Analyze,
    Tasks,
}

impl SpecPhase {
    pub const ORDER: [SpecPhase; 6] = [
        SpecPhase::Constitution,
        SpecPhase::Specify,
        SpecPhase::Clarify,
        SpecPhase::Plan,
        SpecPhase::Analyze,
        SpecPhase::Tasks,
    ];

    /// The phase that follows this one, or `None` after `tasks`.
    pub fn next(&self) -> Option<SpecPhase> {
        let idx = Self::ORDER.iter().position(|p| p == self)?;
        Self::ORDER.get(idx + 1).copied()
    }

    pub fn requires_human_input(&self) -> bool {
        matches!(self, SpecPhase::Clarify)
    }

    pub fn label(&self) -> &'static str {
        match self {
            SpecPhase::Constitution => "constitution",
            SpecPhase::Specify => "specify",
            SpecPhase::Clarify => "clarify",
            SpecPhase::Plan => "plan",
            SpecPhase::Analyze => "analyze",
            SpecPhase::Tasks => "tasks",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Clarification {
    pub id: i64,
    pub category: Option<String>,
    pub question: String,
    pub context: Option<String>,
    pub suggested_default: Option<String>,
    pub response: Option<String>,
    pub responded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecTask {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub files: Vec<String>,
    pub tests: Option<String>,
    pub dependencies: Vec<i64>,
    pub estimate_points: Option<i64>,
    pub acceptance_criteria: Option<String>,
}

/// The per-feature cumulative spec artifact. Each phase merges into one of
/// these optional fields; `phase` names the most recently merged phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpecOutput {
    pub phase: Option<SpecPhase>,
    pub constitution: Option<serde_json::Value>,
    pub spec: Option<serde_json::Value>,
    pub clarifications: Option<Vec<Clarification>>,
    pub plan: Option<serde_json::Value>,
    pub analysis: Option<serde_json::Value>,
    pub tasks: Option<Vec<SpecTask>>,
    /// Set once the tasks phase is handed to the Loop Runner in spec-task mode.
    #[serde(default)]
    pub spec_mode: bool,
}

impl SpecOutput {
    /// `true` when every clarification produced so far has a response.
    pub fn clarifications_all_answered(&self) -> bool {
        self.clarifications
            .as_ref()
            .map(|cs| cs.iter().all(|c| c.response.is_some()))
            .unwrap_or(true)
    }

    pub fn analysis_passed(&self) -> bool {
        self.analysis
            .as_ref()
            .and_then(|v| v.get("passed"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Prd / PrdProgress
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrdStory {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub acceptance_criteria: Option<String>,
    #[serde(default)]
    pub passes: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prd {
    pub title: String,
    pub description: Option<String>,
    pub stories: Vec<PrdStory>,
}

impl Prd {
    /// First story, in PRD order, with `passes=false` and not already completed.
    pub fn next_unpassed_story<'a>(&'a self, completed: &std::collections::HashSet<i64>) -> Option<&'a PrdStory> {
        self.stories
            .iter()
            .find(|s| !s.passes && !completed.contains(&s.id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrdCommitEntry {
    pub story_id: i64,
    pub sha: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrdProgress {
    pub current_story_id: Option<i64>,
    pub completed_story_ids: Vec<i64>,
    pub commits: Vec<PrdCommitEntry>,
}

// ---------------------------------------------------------------------------
// Repository / CodeBranch / CodePullRequest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: RepositoryId,
    pub client_id: ClientId,
    pub provider: String,
    pub owner_name: String,
    pub repo_name: String,
    pub default_branch: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeBranch {
    pub id: Uuid,
    pub repository_id: RepositoryId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodePullRequest {
    pub id: Uuid,
    pub repository_id: RepositoryId,
    pub number: i64,
    pub url: String,
    pub title: String,
    pub files_changed: i64,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: ClientId,
    pub name: String,
    pub constitution: Option<String>,
    pub constitution_generated_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_transitions() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Cancelled));
    }

    #[test]
    fn job_status_is_terminal() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
    }

    #[test]
    fn spec_phase_progression() {
        assert_eq!(SpecPhase::Constitution.next(), Some(SpecPhase::Specify));
        assert_eq!(SpecPhase::Tasks.next(), None);
        assert!(SpecPhase::Clarify.requires_human_input());
        assert!(!SpecPhase::Plan.requires_human_input());
    }

    #[test]
    fn spec_phase_ordering_is_monotonic() {
        assert!(SpecPhase::Constitution < SpecPhase::Specify);
        assert!(SpecPhase::Analyze < SpecPhase::Tasks);
    }

    #[test]
    fn prd_next_unpassed_story_skips_completed_and_passing() {
        let prd = Prd {
            title: "t".into(),
            description: None,
            stories: vec![
                PrdStory { id: 1, title: "a".into(), description: None, acceptance_criteria: None, passes: true },
                PrdStory { id: 2, title: "b".into(), description: None, acceptance_criteria: None, passes: false },
                PrdStory { id: 3, title: "c".into(), description: None, acceptance_criteria: None, passes: false },
            ],
        };
        let mut completed = std::collections::HashSet::new();
        assert_eq!(prd.next_unpassed_story(&completed).unwrap().id, 2);
        completed.insert(2);
        assert_eq!(prd.next_unpassed_story(&completed).unwrap().id, 3);
    }

    #[test]
    fn spec_output_clarifications_all_answered_defaults_true_when_absent() {
        let out = SpecOutput::default();
        assert!(out.clarifications_all_answered());
    }

    #[test]
    fn spec_output_clarifications_all_answered_false_when_pending() {
        let mut out = SpecOutput::default();
        out.clarifications = Some(vec![Clarification {
            id: 1,
            question: "q".into(),
            ..Default::default()
        }]);
        assert!(!out.clarifications_all_answered());
    }

    #[test]
    fn job_new_defaults() {
        let job = Job::new(Uuid::new_v4(), JobType::Code, "do it", "feat/x");
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.current_iteration, 0);
        assert!(job.started_at.is_none());
        assert!(!job.is_spec_task_mode());
    }
}
