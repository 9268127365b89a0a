//! Core library for the coding-agent orchestrator.
//!
//! Provides the foundational domain types, the embedded database gateway,
//! configuration loading, and the git workspace manager that every runner
//! in `orc-agents` builds on.

pub mod config;
pub mod db;
pub mod types;
pub mod worktree_manager;
