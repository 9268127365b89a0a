//! Spec pipeline — the six-phase specification state machine driven by the
//! Spec Pipeline Runner: constitution, specify, clarify, plan, analyze, tasks.
//!
//! Each phase produces a `PhaseResult` that is merged into the owning
//! feature's `SpecOutput`. `SpecPipeline` tracks one `SpecOutput` per feature
//! and reports which phase is next once the current one completes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use orc_core::types::{Clarification, FeatureId, SpecOutput, SpecPhase, SpecTask};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// PhaseResult — output of each spec phase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    Complete,
    Failed,
    /// Terminal for `clarify`: waiting on a human to answer open questions.
    WaitingOnHuman,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseMetrics {
    pub tokens_used: usize,
    pub duration_ms: u64,
    pub llm_calls: usize,
}

/// The result of executing a single spec phase, pending merge into the
/// owning feature's `SpecOutput`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    pub id: Uuid,
    pub phase: SpecPhase,
    pub status: PhaseStatus,
    /// Raw JSON the phase produced, merged into the matching `SpecOutput`
    /// field by `SpecPipeline::record_phase`.
    pub content: serde_json::Value,
    pub metrics: PhaseMetrics,
    pub created_at: DateTime<Utc>,
}

impl PhaseResult {
    pub fn complete(phase: SpecPhase, content: serde_json::Value, metrics: PhaseMetrics) -> Self {
        Self {
            id: Uuid::new_v4(),
            phase,
            status: PhaseStatus::Complete,
            content,
            metrics,
            created_at: Utc::now(),
        }
    }

    pub fn failed(phase: SpecPhase) -> Self {
        Self {
            id: Uuid::new_v4(),
            phase,
            status: PhaseStatus::Failed,
            content: serde_json::Value::Null,
            metrics: PhaseMetrics::default(),
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("spec output not found for feature: {0}")]
    NotFound(FeatureId),
    #[error("invalid phase transition: {from:?} -> {to:?}")]
    InvalidTransition { from: SpecPhase, to: SpecPhase },
    #[error("clarify phase still has unanswered clarifications")]
    ClarificationsPending,
}

pub type Result<T> = std::result::Result<T, SpecError>;

// ---------------------------------------------------------------------------
// SpecPipeline — tracks per-feature spec progression
// ---------------------------------------------------------------------------

/// Tracks one `SpecOutput` per feature and merges each completed phase's
/// result into it, in the teacher's phase-accumulator style.
pub struct SpecPipeline {
    outputs: HashMap<FeatureId, SpecOutput>,
}

impl SpecPipeline {
    pub fn new() -> Self {
        Self {
            outputs: HashMap::new(),
        }
    }

    pub fn start(&mut self, feature_id: FeatureId) -> &SpecOutput {
        self.outputs.entry(feature_id).or_default();
        self.outputs.get(&feature_id).unwrap()
    }

    pub fn get(&self, feature_id: FeatureId) -> Option<&SpecOutput> {
        self.outputs.get(&feature_id)
    }

    pub fn load(&mut self, feature_id: FeatureId, output: SpecOutput) {
        self.outputs.insert(feature_id, output);
    }

    /// Merge a completed phase's content into the feature's `SpecOutput` and
    /// advance its `phase` marker.
    pub fn record_phase(&mut self, feature_id: FeatureId, result: PhaseResult) -> Result<()> {
        let output = self
            .outputs
            .get_mut(&feature_id)
            .ok_or(SpecError::NotFound(feature_id))?;

        if result.status != PhaseStatus::Complete {
            return Ok(());
        }

        match result.phase {
            SpecPhase::Constitution => output.constitution = Some(result.content),
            SpecPhase::Specify => output.spec = Some(result.content),
            SpecPhase::Clarify => {
                let clarifications: Vec<Clarification> =
                    serde_json::from_value(result.content).unwrap_or_default();
                output.clarifications = Some(clarifications);
            }
            SpecPhase::Plan => output.plan = Some(result.content),
            SpecPhase::Analyze => output.analysis = Some(result.content),
            SpecPhase::Tasks => {
                let tasks: Vec<SpecTask> =
                    serde_json::from_value(result.content).unwrap_or_default();
                output.tasks = Some(tasks);
            }
        }
        output.phase = Some(result.phase);
        Ok(())
    }

    /// The phase that should run next for a feature, or `None` if `tasks`
    /// has already completed. Returns `None` for `clarify` until every
    /// clarification produced has a recorded response.
    pub fn next_phase(&self, feature_id: FeatureId) -> Option<SpecPhase> {
        let output = self.outputs.get(&feature_id)?;
        match output.phase {
            None => Some(SpecPhase::Constitution),
            Some(SpecPhase::Clarify) if !output.clarifications_all_answered() => None,
            Some(phase) => phase.next(),
        }
    }

    /// Every tracked feature paired with its next runnable phase.
    pub fn pending_work(&self) -> Vec<(FeatureId, SpecPhase)> {
        self.outputs
            .keys()
            .filter_map(|id| self.next_phase(*id).map(|phase| (*id, phase)))
            .collect()
    }

    pub fn remove(&mut self, feature_id: FeatureId) -> Option<SpecOutput> {
        self.outputs.remove(&feature_id)
    }

    pub fn count(&self) -> usize {
        self.outputs.len()
    }
}

impl Default for SpecPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_feature_starts_at_constitution() {
        let mut pipeline = SpecPipeline::new();
        let feature_id = Uuid::new_v4();
        pipeline.start(feature_id);
        assert_eq!(pipeline.next_phase(feature_id), Some(SpecPhase::Constitution));
    }

    #[test]
    fn completing_a_phase_advances_to_the_next() {
        let mut pipeline = SpecPipeline::new();
        let feature_id = Uuid::new_v4();
        pipeline.start(feature_id);

        pipeline
            .record_phase(
                feature_id,
                PhaseResult::complete(
                    SpecPhase::Constitution,
                    json!({"principles": ["test-first"]}),
                    PhaseMetrics::default(),
                ),
            )
            .unwrap();

        assert_eq!(pipeline.next_phase(feature_id), Some(SpecPhase::Specify));
        assert!(pipeline.get(feature_id).unwrap().constitution.is_some());
    }

    #[test]
    fn clarify_blocks_until_all_answered() {
        let mut pipeline = SpecPipeline::new();
        let feature_id = Uuid::new_v4();
        pipeline.start(feature_id);

        let clarifications = vec![Clarification {
            id: 1,
            question: "auth scheme?".into(),
            ..Default::default()
        }];
        pipeline
            .record_phase(
                feature_id,
                PhaseResult::complete(
                    SpecPhase::Clarify,
                    serde_json::to_value(&clarifications).unwrap(),
                    PhaseMetrics::default(),
                ),
            )
            .unwrap();

        assert_eq!(pipeline.next_phase(feature_id), None);

        let mut output = pipeline.get(feature_id).unwrap().clone();
        output.clarifications.as_mut().unwrap()[0].response = Some("OAuth".into());
        pipeline.load(feature_id, output);

        assert_eq!(pipeline.next_phase(feature_id), Some(SpecPhase::Plan));
    }

    #[test]
    fn tasks_is_terminal() {
        let mut pipeline = SpecPipeline::new();
        let feature_id = Uuid::new_v4();
        pipeline.start(feature_id);
        pipeline
            .record_phase(
                feature_id,
                PhaseResult::complete(SpecPhase::Tasks, json!([]), PhaseMetrics::default()),
            )
            .unwrap();
        assert_eq!(pipeline.next_phase(feature_id), None);
    }

    #[test]
    fn record_phase_on_unknown_feature_errors() {
        let mut pipeline = SpecPipeline::new();
        let result = pipeline.record_phase(
            Uuid::new_v4(),
            PhaseResult::complete(SpecPhase::Constitution, json!({}), PhaseMetrics::default()),
        );
        assert!(matches!(result, Err(SpecError::NotFound(_))));
    }

    #[test]
    fn failed_phase_result_does_not_advance() {
        let mut pipeline = SpecPipeline::new();
        let feature_id = Uuid::new_v4();
        pipeline.start(feature_id);
        pipeline
            .record_phase(feature_id, PhaseResult::failed(SpecPhase::Constitution))
            .unwrap();
        assert_eq!(pipeline.next_phase(feature_id), Some(SpecPhase::Constitution));
    }

    #[test]
    fn pending_work_lists_all_tracked_features() {
        let mut pipeline = SpecPipeline::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        pipeline.start(a);
        pipeline.start(b);
        let work = pipeline.pending_work();
        assert_eq!(work.len(), 2);
    }
}
