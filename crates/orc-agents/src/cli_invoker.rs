//! Coder CLI subprocess invocation: spawns the CLI with
//! `stdio=[ignore,pipe,pipe]`, forwards stdout/stderr line-by-line to
//! callbacks, and registers the child pid with a `PidRegistry` so a
//! scheduler-level cancel can signal it.

use std::process::Stdio;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, Instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CliInvokerError {
    #[error("failed to spawn coder CLI: {0}")]
    Spawn(String),
    #[error("coder CLI did not expose a stdout/stderr pipe")]
    MissingPipe,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CliInvokerError>;

/// Outcome of one `runCLI` invocation.
#[derive(Debug, Clone)]
pub struct CliInvocation {
    pub exit_code: Option<i32>,
    pub pid: Option<u32>,
}

/// Abstraction over subprocess spawning so tests can substitute canned
/// stdout/stderr without touching a real coder CLI binary.
#[async_trait::async_trait]
pub trait CliSpawner: Send + Sync {
    /// `on_spawn` fires synchronously with the child's pid right after
    /// spawning, before the process is awaited to completion, so a caller
    /// can register it for cancellation while the CLI is still running.
    async fn run(
        &self,
        bin: &str,
        args: &[String],
        cwd: &str,
        env: &[(String, String)],
        on_spawn: &(dyn Fn(u32) + Send + Sync),
        on_stdout: &(dyn Fn(String) + Send + Sync),
        on_stderr: &(dyn Fn(String) + Send + Sync),
    ) -> Result<CliInvocation>;
}

/// Wraps `tokio::process::Command`, matching the `stdio=[ignore,pipe,pipe]`
/// contract literally: stdin ignored, stdout/stderr piped and drained
/// concurrently line-by-line.
pub struct RealCliSpawner;

#[async_trait::async_trait]
impl CliSpawner for RealCliSpawner {
    async fn run(
        &self,
        bin: &str,
        args: &[String],
        cwd: &str,
        env: &[(String, String)],
        on_spawn: &(dyn Fn(u32) + Send + Sync),
        on_stdout: &(dyn Fn(String) + Send + Sync),
        on_stderr: &(dyn Fn(String) + Send + Sync),
    ) -> Result<CliInvocation> {
        let mut cmd = Command::new(bin);
        cmd.args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| CliInvokerError::Spawn(e.to_string()))?;
        let pid = child.id();
        if let Some(pid) = pid {
            on_spawn(pid);
        }

        let stdout = child.stdout.take().ok_or(CliInvokerError::MissingPipe)?;
        let stderr = child.stderr.take().ok_or(CliInvokerError::MissingPipe)?;
        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut stderr_lines = BufReader::new(stderr).lines();

        loop {
            tokio::select! {
                line = stdout_lines.next_line() => {
                    match line? {
                        Some(l) => on_stdout(l),
                        None => break,
                    }
                }
                line = stderr_lines.next_line() => {
                    match line? {
                        Some(l) => on_stderr(l),
                        None => {}
                    }
                }
            }
        }
        // Drain any remaining stderr after stdout closes.
        while let Some(l) = stderr_lines.next_line().await? {
            on_stderr(l);
        }

        let status = child.wait().await?;
        Ok(CliInvocation {
            exit_code: status.code(),
            pid,
        })
    }
}

/// Registers pids with an injected `orc_harness::pid_registry::PidRegistry`
/// for the duration of one invocation, and drives a `CliSpawner`.
pub struct CliInvoker {
    spawner: Box<dyn CliSpawner>,
    pid_registry: std::sync::Arc<orc_harness::pid_registry::PidRegistry>,
}

impl CliInvoker {
    pub fn new(pid_registry: std::sync::Arc<orc_harness::pid_registry::PidRegistry>) -> Self {
        Self {
            spawner: Box::new(RealCliSpawner),
            pid_registry,
        }
    }

    pub fn with_spawner(
        spawner: Box<dyn CliSpawner>,
        pid_registry: std::sync::Arc<orc_harness::pid_registry::PidRegistry>,
    ) -> Self {
        Self {
            spawner,
            pid_registry,
        }
    }

    /// Invoke the coder CLI for `job_id`, registering its pid the instant
    /// the process spawns (not after it exits) so a concurrent cancel can
    /// find and signal it while it is still running, and unregistering once
    /// the call resolves either way. The whole call runs inside an
    /// operation span carrying a trace id, so every log line this invocation
    /// emits (and whatever the caller logs against the same job afterward)
    /// can be correlated.
    pub async fn invoke(
        &self,
        job_id: Uuid,
        bin: &str,
        args: &[String],
        cwd: &str,
        env: &[(String, String)],
        on_stdout: &(dyn Fn(String) + Send + Sync),
        on_stderr: &(dyn Fn(String) + Send + Sync),
    ) -> Result<CliInvocation> {
        let (span, trace_id) = orc_telemetry::tracing_setup::create_operation_span("cli_invoke");
        async move {
            info!(%job_id, cli = bin, trace_id = %trace_id, "invoking coder CLI");
            let on_spawn = |pid: u32| self.pid_registry.register(job_id, pid);
            let result = self
                .spawner
                .run(bin, args, cwd, env, &on_spawn, on_stdout, on_stderr)
                .await;
            self.pid_registry.unregister(job_id);
            result
        }
        .instrument(span)
        .await
    }
}

/// Build the literal coder CLI argument vector per the fixed subprocess
/// contract: `--print --dangerously-skip-permissions --output-format text
/// [--model <tag>] <prompt>`.
pub fn build_cli_args(prompt: &str, model: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "--print".to_string(),
        "--dangerously-skip-permissions".to_string(),
        "--output-format".to_string(),
        "text".to_string(),
    ];
    if let Some(model) = model {
        args.push("--model".to_string());
        args.push(model.to_string());
    }
    args.push(prompt.to_string());
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct MockSpawner {
        stdout_lines: Vec<String>,
        stderr_lines: Vec<String>,
        exit_code: Option<i32>,
        pid: Option<u32>,
    }

    #[async_trait::async_trait]
    impl CliSpawner for MockSpawner {
        async fn run(
            &self,
            _bin: &str,
            _args: &[String],
            _cwd: &str,
            _env: &[(String, String)],
            on_spawn: &(dyn Fn(u32) + Send + Sync),
            on_stdout: &(dyn Fn(String) + Send + Sync),
            on_stderr: &(dyn Fn(String) + Send + Sync),
        ) -> Result<CliInvocation> {
            if let Some(pid) = self.pid {
                on_spawn(pid);
            }
            for line in &self.stdout_lines {
                on_stdout(line.clone());
            }
            for line in &self.stderr_lines {
                on_stderr(line.clone());
            }
            Ok(CliInvocation {
                exit_code: self.exit_code,
                pid: self.pid,
            })
        }
    }

    #[tokio::test]
    async fn invoke_forwards_stdout_and_registers_pid() {
        let registry = std::sync::Arc::new(orc_harness::pid_registry::PidRegistry::new());
        let invoker = CliInvoker::with_spawner(
            Box::new(MockSpawner {
                stdout_lines: vec!["hello".to_string(), "world".to_string()],
                stderr_lines: vec![],
                exit_code: Some(0),
                pid: Some(4242),
            }),
            registry.clone(),
        );

        let job_id = Uuid::new_v4();
        let captured = Mutex::new(Vec::new());
        let result = invoker
            .invoke(
                job_id,
                "coder",
                &[],
                "/tmp",
                &[],
                &|line| captured.lock().unwrap().push(line),
                &|_line| {},
            )
            .await
            .unwrap();

        assert_eq!(result.exit_code, Some(0));
        assert_eq!(*captured.lock().unwrap(), vec!["hello", "world"]);
        // Unregistered after the call completes.
        assert_eq!(registry.pid_for(job_id), None);
    }

    #[tokio::test]
    async fn invoke_registers_pid_before_the_process_exits() {
        struct SlowSpawner {
            registry: std::sync::Arc<orc_harness::pid_registry::PidRegistry>,
            job_id: Uuid,
        }

        #[async_trait::async_trait]
        impl CliSpawner for SlowSpawner {
            async fn run(
                &self,
                _bin: &str,
                _args: &[String],
                _cwd: &str,
                _env: &[(String, String)],
                on_spawn: &(dyn Fn(u32) + Send + Sync),
                _on_stdout: &(dyn Fn(String) + Send + Sync),
                _on_stderr: &(dyn Fn(String) + Send + Sync),
            ) -> Result<CliInvocation> {
                on_spawn(4242);
                // The pid must already be visible to the registry here,
                // before this "still running" process resolves.
                assert_eq!(self.registry.pid_for(self.job_id), Some(4242));
                Ok(CliInvocation { exit_code: Some(0), pid: Some(4242) })
            }
        }

        let registry = std::sync::Arc::new(orc_harness::pid_registry::PidRegistry::new());
        let job_id = Uuid::new_v4();
        let invoker = CliInvoker::with_spawner(
            Box::new(SlowSpawner { registry: registry.clone(), job_id }),
            registry.clone(),
        );

        invoker
            .invoke(job_id, "coder", &[], "/tmp", &[], &|_| {}, &|_| {})
            .await
            .unwrap();

        assert_eq!(registry.pid_for(job_id), None);
    }

    #[tokio::test]
    async fn invoke_unregisters_pid_even_when_spawner_errors() {
        struct FailingSpawner;

        #[async_trait::async_trait]
        impl CliSpawner for FailingSpawner {
            async fn run(
                &self,
                _bin: &str,
                _args: &[String],
                _cwd: &str,
                _env: &[(String, String)],
                _on_spawn: &(dyn Fn(u32) + Send + Sync),
                _on_stdout: &(dyn Fn(String) + Send + Sync),
                _on_stderr: &(dyn Fn(String) + Send + Sync),
            ) -> Result<CliInvocation> {
                Err(CliInvokerError::Spawn("no such binary".into()))
            }
        }

        let registry = std::sync::Arc::new(orc_harness::pid_registry::PidRegistry::new());
        let invoker = CliInvoker::with_spawner(Box::new(FailingSpawner), registry.clone());
        let job_id = Uuid::new_v4();

        let result = invoker
            .invoke(job_id, "coder", &[], "/tmp", &[], &|_| {}, &|_| {})
            .await;

        assert!(result.is_err());
        assert_eq!(registry.pid_for(job_id), None);
    }

    #[test]
    fn build_cli_args_includes_model_when_given() {
        let args = build_cli_args("do the thing", Some("sonnet"));
        assert!(args.contains(&"--model".to_string()));
        assert!(args.contains(&"sonnet".to_string()));
        assert_eq!(args.last().unwrap(), "do the thing");
    }

    #[test]
    fn build_cli_args_omits_model_when_absent() {
        let args = build_cli_args("do the thing", None);
        assert!(!args.contains(&"--model".to_string()));
    }
}
