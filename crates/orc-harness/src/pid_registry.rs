use dashmap::DashMap;
use tracing::{info, warn};
use uuid::Uuid;

/// Tracks the OS pid of the coder CLI subprocess currently running for each
/// job, so a cancellation request can be routed to the right process without
/// the caller needing to hold a reference to the `Child` handle itself.
#[derive(Default)]
pub struct PidRegistry {
    pids: DashMap<Uuid, u32>,
}

impl PidRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the pid of the process spawned for `job_id`.
    pub fn register(&self, job_id: Uuid, pid: u32) {
        self.pids.insert(job_id, pid);
    }

    /// Drop the registration for `job_id`, typically once its process exits.
    pub fn unregister(&self, job_id: Uuid) {
        self.pids.remove(&job_id);
    }

    pub fn pid_for(&self, job_id: Uuid) -> Option<u32> {
        self.pids.get(&job_id).map(|e| *e)
    }

    /// Send `SIGTERM` (via the platform-appropriate `kill`) to the process
    /// registered for `job_id`. Returns `false` if no process is registered.
    pub fn cancel(&self, job_id: Uuid) -> bool {
        let Some(pid) = self.pid_for(job_id) else {
            return false;
        };

        #[cfg(unix)]
        {
            let result = std::process::Command::new("kill")
                .arg("-TERM")
                .arg(pid.to_string())
                .status();

            match result {
                Ok(status) if status.success() => {
                    info!(job_id = %job_id, pid, "sent cancellation signal");
                    true
                }
                Ok(status) => {
                    warn!(job_id = %job_id, pid, ?status, "kill exited non-zero");
                    false
                }
                Err(e) => {
                    warn!(job_id = %job_id, pid, error = %e, "failed to signal process");
                    false
                }
            }
        }

        #[cfg(not(unix))]
        {
            warn!(job_id = %job_id, pid, "process cancellation is unix-only");
            false
        }
    }

    pub fn len(&self) -> usize {
        self.pids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup() {
        let registry = PidRegistry::new();
        let job_id = Uuid::new_v4();
        registry.register(job_id, 1234);
        assert_eq!(registry.pid_for(job_id), Some(1234));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unregister_clears_entry() {
        let registry = PidRegistry::new();
        let job_id = Uuid::new_v4();
        registry.register(job_id, 1234);
        registry.unregister(job_id);
        assert_eq!(registry.pid_for(job_id), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn cancel_without_registration_returns_false() {
        let registry = PidRegistry::new();
        assert!(!registry.cancel(Uuid::new_v4()));
    }
}
