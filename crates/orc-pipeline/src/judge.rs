//! Judge/improve loop — the plan phase's quality gate. An LLM-as-judge pass
//! scores a proposed plan against nine fixed criteria; failing plans go
//! through up to three automatic improve/re-judge cycles before the last
//! plan is accepted with a "manual review required" system note.

use serde::{Deserialize, Serialize};

pub const MAX_REVISION_CYCLES: u32 = 3;

/// The nine quality dimensions every plan is judged against, in the fixed
/// order the judge prompt presents them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeCriterion {
    Patterns,
    ErrorHandling,
    NoHardcodedValues,
    FunctionSize,
    CommentIntent,
    TypeStrictness,
    ApiErrorBoundaries,
    Security,
    Performance,
}

impl JudgeCriterion {
    pub const ALL: [JudgeCriterion; 9] = [
        JudgeCriterion::Patterns,
        JudgeCriterion::ErrorHandling,
        JudgeCriterion::NoHardcodedValues,
        JudgeCriterion::FunctionSize,
        JudgeCriterion::CommentIntent,
        JudgeCriterion::TypeStrictness,
        JudgeCriterion::ApiErrorBoundaries,
        JudgeCriterion::Security,
        JudgeCriterion::Performance,
    ];
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionVerdict {
    pub criterion: JudgeCriterion,
    pub passed: bool,
    pub reasoning: String,
    #[serde(default)]
    pub suggestions: Option<String>,
}

/// Parsed response from a single judge pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub passed: bool,
    pub overall_score: u8,
    pub criteria: Vec<CriterionVerdict>,
    pub summary: String,
    #[serde(default)]
    pub improvements: Vec<String>,
}

impl JudgeVerdict {
    pub fn failing_criteria(&self) -> Vec<&CriterionVerdict> {
        self.criteria.iter().filter(|c| !c.passed).collect()
    }
}

/// Parsed response from an improve pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovedPlan {
    pub improved_plan: serde_json::Value,
    #[serde(default)]
    pub changes_summary: Vec<String>,
}

/// Outcome of driving the judge/improve loop to completion.
#[derive(Debug, Clone)]
pub struct JudgeLoopResult {
    pub final_plan: serde_json::Value,
    pub cycles_run: u32,
    pub approved: bool,
    pub last_verdict: Option<JudgeVerdict>,
}

impl JudgeLoopResult {
    /// The system-message note to record when the loop exhausted its
    /// revision budget without the plan passing.
    pub fn manual_review_note(&self) -> Option<String> {
        if self.approved {
            None
        } else {
            Some(format!(
                "plan did not pass judge review after {} revision cycle(s); manual review required",
                self.cycles_run
            ))
        }
    }
}

/// Drives the judge/improve loop given callbacks that invoke the coder CLI
/// for each pass. `judge` runs an LLM-as-judge pass over the current plan;
/// `improve` runs an improve pass given the failing criteria.
///
/// Generic over the callback error type so callers can plug in their own
/// CLI-invocation error (e.g. `CliInvokerError`) without this module
/// depending on it.
pub fn run_judge_loop<E>(
    mut plan: serde_json::Value,
    mut judge: impl FnMut(&serde_json::Value) -> Result<JudgeVerdict, E>,
    mut improve: impl FnMut(&serde_json::Value, &JudgeVerdict) -> Result<ImprovedPlan, E>,
) -> Result<JudgeLoopResult, E> {
    let mut last_verdict = None;

    for cycle in 0..MAX_REVISION_CYCLES {
        let verdict = judge(&plan)?;
        let passed = verdict.passed;
        last_verdict = Some(verdict.clone());

        if passed {
            return Ok(JudgeLoopResult {
                final_plan: plan,
                cycles_run: cycle + 1,
                approved: true,
                last_verdict,
            });
        }

        let improved = improve(&plan, &verdict)?;
        plan = improved.improved_plan;
    }

    Ok(JudgeLoopResult {
        final_plan: plan,
        cycles_run: MAX_REVISION_CYCLES,
        approved: false,
        last_verdict,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn verdict(passed: bool) -> JudgeVerdict {
        JudgeVerdict {
            passed,
            overall_score: if passed { 95 } else { 40 },
            criteria: vec![CriterionVerdict {
                criterion: JudgeCriterion::ErrorHandling,
                passed,
                reasoning: "because".into(),
                suggestions: if passed { None } else { Some("add ?".into()) },
            }],
            summary: "summary".into(),
            improvements: Vec::new(),
        }
    }

    #[test]
    fn passes_on_first_judge_pass() {
        let result: Result<_, ()> = run_judge_loop(
            json!({"steps": []}),
            |_plan| Ok(verdict(true)),
            |_plan, _v| panic!("improve should not be called"),
        );
        let result = result.unwrap();
        assert!(result.approved);
        assert_eq!(result.cycles_run, 1);
    }

    #[test]
    fn improves_then_passes_on_second_cycle() {
        let mut judge_calls = 0;
        let result: Result<_, ()> = run_judge_loop(
            json!({"steps": []}),
            |_plan| {
                judge_calls += 1;
                Ok(verdict(judge_calls > 1))
            },
            |_plan, _v| Ok(ImprovedPlan { improved_plan: json!({"steps": ["fixed"]}), changes_summary: vec!["added error handling".into()] }),
        );
        let result = result.unwrap();
        assert!(result.approved);
        assert_eq!(result.cycles_run, 2);
        assert_eq!(result.final_plan, json!({"steps": ["fixed"]}));
    }

    #[test]
    fn exhausts_cycles_and_flags_manual_review() {
        let result: Result<_, ()> = run_judge_loop(
            json!({"steps": []}),
            |_plan| Ok(verdict(false)),
            |_plan, _v| Ok(ImprovedPlan { improved_plan: json!({"steps": []}), changes_summary: vec![] }),
        );
        let result = result.unwrap();
        assert!(!result.approved);
        assert_eq!(result.cycles_run, MAX_REVISION_CYCLES);
        assert!(result.manual_review_note().is_some());
    }

    #[test]
    fn failing_criteria_filters_correctly() {
        let v = verdict(false);
        assert_eq!(v.failing_criteria().len(), 1);
        assert_eq!(verdict(true).failing_criteria().len(), 0);
    }
}
