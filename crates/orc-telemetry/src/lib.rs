//! Structured logging and trace/span id correlation for the daemon and its
//! runners.
//!
//! - `logging` — human-readable / JSON `tracing-subscriber` initialization
//! - `tracing_setup` — OpenTelemetry-shaped trace/span id generation for
//!   correlating a job's log lines across its worktree, CLI invocation, and
//!   database writes

pub mod logging;
pub mod tracing_setup;
