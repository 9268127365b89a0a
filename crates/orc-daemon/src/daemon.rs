//! Daemon startup: open the database, construct the workspace manager and
//! scheduler from config, and run the dispatch loop until shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use orc_core::config::Config;
use orc_core::db::Db;
use orc_core::worktree_manager::WorktreeManager;
use orc_harness::pid_registry::PidRegistry;
use orc_harness::shutdown::ShutdownSignal;
use tracing::info;

use crate::scheduler::Scheduler;

/// The running job-scheduling daemon. Owns the database handle and the
/// scheduler; shuts down cooperatively when its `ShutdownSignal` fires.
pub struct Daemon {
    scheduler: Arc<Scheduler>,
    shutdown: ShutdownSignal,
}

impl Daemon {
    /// Open (or create) the database at `db_path` and construct the
    /// scheduler from `config`.
    pub async fn new(config: &Config, db_path: impl AsRef<std::path::Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create database directory {}", parent.display()))?;
        }
        let db = Db::new(db_path)
            .await
            .with_context(|| format!("failed to open database at {}", db_path.display()))?;

        let workspace = WorktreeManager::new(
            config.daemon.repos_dir.clone(),
            config.daemon.worktrees_dir.clone(),
        );
        let pid_registry = PidRegistry::new();
        let feedback = orc_agents::feedback::FeedbackRunner::new();
        let shutdown = ShutdownSignal::new();

        let scheduler = Scheduler::new(
            Arc::new(db),
            Arc::new(workspace),
            Arc::new(pid_registry),
            Arc::new(feedback),
            config.daemon.coder_cli_bin.clone(),
            config.daemon.max_concurrent_jobs,
            config.daemon.cosmetic_feature_type_id,
            shutdown.clone(),
        );

        Ok(Self {
            scheduler: Arc::new(scheduler),
            shutdown,
        })
    }

    /// Returns a handle that can be used to trigger shutdown from another
    /// task (e.g. a ctrl-c listener).
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Returns the scheduler, for callers that need to `enqueue`/`cancel`
    /// jobs from outside the dispatch loop (the HTTP layer, in production).
    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.scheduler.clone()
    }

    /// Run the dispatch loop until the shutdown signal fires (blocking).
    pub async fn run(&self) {
        info!("daemon starting dispatch loop");
        self.scheduler.run().await;
        info!("daemon stopped");
    }
}
