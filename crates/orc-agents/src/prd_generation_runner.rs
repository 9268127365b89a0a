//! PRD-Generation Runner: the `job_type=prd_generation` entry in the
//! scheduler's routing table (§4.1). Turns a feature's free-form
//! functionality notes into the structured `Prd` document the PRD Runner
//! (§4.7) later drives story by story.
//!
//! Unlike every other runner this one never touches git: there is no code
//! to branch, commit, or open a PR against, only a document to author. It
//! runs a single CLI invocation over product context and parses the result,
//! following the same JSON-extraction precedence as the spec pipeline.

use orc_core::types::{Job, Prd};
use thiserror::Error;
use tracing::warn;

use crate::cli_invoker::{build_cli_args, CliInvoker};
use crate::prompts::{build_prd_generation_prompt, extract_json};

#[derive(Debug, Error)]
pub enum PrdGenerationError {
    #[error("cli invocation error: {0}")]
    Cli(#[from] crate::cli_invoker::CliInvokerError),
}

pub type Result<T> = std::result::Result<T, PrdGenerationError>;

/// Context fed into the PRD-generation prompt: just enough product framing
/// for the CLI to draft stories, no repository or tech-stack detail.
#[derive(Debug, Clone, Default)]
pub struct PrdGenerationContext {
    pub feature_title: String,
    pub feature_description: Option<String>,
    pub client_name: String,
    pub client_context: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PrdGenerationOutcome {
    pub prd: Option<Prd>,
    pub raw_output: String,
    pub parse_failure: Option<String>,
}

pub struct PrdGenerationRunner<'a> {
    cli: &'a CliInvoker,
    coder_cli_bin: &'a str,
}

impl<'a> PrdGenerationRunner<'a> {
    pub fn new(cli: &'a CliInvoker, coder_cli_bin: &'a str) -> Self {
        Self { cli, coder_cli_bin }
    }

    /// Runs in `cwd`, a scratch directory supplied by the caller — PRD
    /// generation reads no repository state, so any writable directory
    /// works; the daemon passes its configured worktrees root.
    pub async fn run(&self, job: &Job, ctx: &PrdGenerationContext, cwd: &str) -> Result<PrdGenerationOutcome> {
        let prompt = build_prd_generation_prompt(
            &ctx.feature_title,
            ctx.feature_description.as_deref(),
            &ctx.client_name,
            ctx.client_context.as_deref(),
        );

        let mut full_output = String::new();
        let invocation = self
            .cli
            .invoke(
                job.id,
                self.coder_cli_bin,
                &build_cli_args(&prompt, None),
                cwd,
                &[],
                &|line| full_output.push_str(&line),
                &|_line| {},
            )
            .await?;

        if invocation.exit_code != Some(0) {
            warn!(job_id = %job.id, exit_code = ?invocation.exit_code, "prd generation CLI invocation failed");
            return Ok(PrdGenerationOutcome {
                prd: None,
                parse_failure: Some(format!("coder CLI exited with {:?}", invocation.exit_code)),
                raw_output: full_output,
            });
        }

        match extract_json(&full_output) {
            Some(value) => match serde_json::from_value::<Prd>(value) {
                Ok(prd) => Ok(PrdGenerationOutcome {
                    prd: Some(prd),
                    parse_failure: None,
                    raw_output: full_output,
                }),
                Err(e) => Ok(PrdGenerationOutcome {
                    prd: None,
                    parse_failure: Some(format!("PRD shape mismatch: {e}")),
                    raw_output: full_output,
                }),
            },
            None => Ok(PrdGenerationOutcome {
                prd: None,
                parse_failure: Some("no JSON found in CLI output".into()),
                raw_output: full_output,
            }),
        }
    }
}
