//! Agent execution layer: drives the coder CLI against isolated git
//! worktrees for each of a job's three execution modes (one-shot, iterate,
//! PRD) plus the spec pipeline's one-phase-per-job runner.
//!
//! - `cli_invoker` — subprocess spawn/stream/cancel contract
//! - `feedback` — test/typecheck/lint autodetection and execution
//! - `prompts` — phase and iteration prompt templates, CLI output parsing
//! - `one_shot` / `loop_runner` / `prd_runner` / `prd_generation_runner` /
//!   `spec_pipeline_runner` — one runner per job type

pub mod cli_invoker;
pub mod feedback;
pub mod loop_runner;
pub mod one_shot;
pub mod prd_generation_runner;
pub mod prd_runner;
pub mod prompts;
pub mod spec_pipeline_runner;
