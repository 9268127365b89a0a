//! Feedback runner: autodetects test/type-check/lint commands by probing for
//! marker files in a worktree, runs the first match per category plus any
//! caller-supplied custom commands, and never fails the job — command
//! failures simply show up as `passed=false` on the report.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use orc_core::types::{FeedbackCategory, FeedbackCommandResult, FeedbackReport};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::warn;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const OUTPUT_CAP_BYTES: usize = 10 * 1024 * 1024;
const EXCERPT_CHARS: usize = 4_000;

/// One marker file and the command it implies for a given category, tried
/// in the order listed here (first existing marker wins per category).
struct MarkerCommand {
    marker: &'static str,
    category: FeedbackCategory,
    command: &'static str,
}

const MARKER_COMMANDS: &[MarkerCommand] = &[
    // tests
    MarkerCommand { marker: "Cargo.toml", category: FeedbackCategory::Test, command: "cargo test" },
    MarkerCommand { marker: "go.mod", category: FeedbackCategory::Test, command: "go test ./..." },
    MarkerCommand { marker: "pytest.ini", category: FeedbackCategory::Test, command: "pytest" },
    MarkerCommand { marker: "pyproject.toml", category: FeedbackCategory::Test, command: "pytest" },
    MarkerCommand { marker: "playwright.config.ts", category: FeedbackCategory::Test, command: "npx playwright test" },
    MarkerCommand { marker: "playwright.config.js", category: FeedbackCategory::Test, command: "npx playwright test" },
    MarkerCommand { marker: "bun.lockb", category: FeedbackCategory::Test, command: "bun test" },
    MarkerCommand { marker: "pnpm-lock.yaml", category: FeedbackCategory::Test, command: "pnpm test" },
    MarkerCommand { marker: "yarn.lock", category: FeedbackCategory::Test, command: "yarn test" },
    MarkerCommand { marker: "package.json", category: FeedbackCategory::Test, command: "npm test" },
    // type-check
    MarkerCommand { marker: "Cargo.toml", category: FeedbackCategory::TypeCheck, command: "cargo check" },
    MarkerCommand { marker: "go.mod", category: FeedbackCategory::TypeCheck, command: "go vet ./..." },
    MarkerCommand { marker: "tsconfig.json", category: FeedbackCategory::TypeCheck, command: "npx tsc --noEmit" },
    // lint
    MarkerCommand { marker: "Cargo.toml", category: FeedbackCategory::Lint, command: "cargo clippy -- -D warnings" },
    MarkerCommand { marker: "biome.json", category: FeedbackCategory::Lint, command: "npx biome check ." },
    MarkerCommand { marker: ".eslintrc.json", category: FeedbackCategory::Lint, command: "npx eslint ." },
    MarkerCommand { marker: ".eslintrc.js", category: FeedbackCategory::Lint, command: "npx eslint ." },
    MarkerCommand { marker: "pyproject.toml", category: FeedbackCategory::Lint, command: "ruff check ." },
];

/// Pick the first marker-implied command for each category that hasn't
/// already been claimed, in `MARKER_COMMANDS` order.
fn autodetect_commands(worktree: &Path) -> Vec<(FeedbackCategory, String)> {
    let mut found = Vec::new();
    let mut claimed = std::collections::HashSet::new();

    for mc in MARKER_COMMANDS {
        if claimed.contains(&(mc.category as u8)) {
            continue;
        }
        if worktree.join(mc.marker).exists() {
            found.push((mc.category, mc.command.to_string()));
            claimed.insert(mc.category as u8);
        }
    }
    found
}

/// Runs feedback commands against a worktree and reports pass/fail per
/// category. Command execution itself never returns an `Err` — a spawn or
/// non-zero exit is reflected in the result, not propagated.
pub struct FeedbackRunner {
    timeout: Duration,
}

impl Default for FeedbackRunner {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl FeedbackRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run the caller-supplied custom commands (always `Custom` category,
    /// run first) followed by the autodetected test/type-check/lint
    /// commands for `worktree`.
    pub async fn run(&self, worktree: &Path, custom_commands: &[String]) -> FeedbackReport {
        let mut results = Vec::new();

        for command in custom_commands {
            results.push(self.run_one(worktree, FeedbackCategory::Custom, command).await);
        }

        for (category, command) in autodetect_commands(worktree) {
            results.push(self.run_one(worktree, category, &command).await);
        }

        let passed = results.iter().all(|r| r.passed);
        let failed_tests: Vec<String> = results
            .iter()
            .filter(|r| r.category == FeedbackCategory::Test && !r.passed)
            .map(|r| r.command.clone())
            .collect();

        let summary = if results.is_empty() {
            "no feedback commands detected".to_string()
        } else {
            format!(
                "{}/{} feedback commands passed",
                results.iter().filter(|r| r.passed).count(),
                results.len()
            )
        };

        FeedbackReport {
            passed,
            results,
            summary,
            failed_tests,
        }
    }

    async fn run_one(
        &self,
        worktree: &Path,
        category: FeedbackCategory,
        command: &str,
    ) -> FeedbackCommandResult {
        let result = tokio::time::timeout(self.timeout, self.exec(worktree, command)).await;

        match result {
            Ok(Ok((passed, excerpt))) => FeedbackCommandResult {
                category,
                command: command.to_string(),
                passed,
                output_excerpt: excerpt,
            },
            Ok(Err(e)) => {
                warn!(command, error = %e, "feedback command failed to spawn");
                FeedbackCommandResult {
                    category,
                    command: command.to_string(),
                    passed: false,
                    output_excerpt: format!("failed to spawn: {e}"),
                }
            }
            Err(_) => {
                warn!(command, "feedback command timed out");
                FeedbackCommandResult {
                    category,
                    command: command.to_string(),
                    passed: false,
                    output_excerpt: "timed out".to_string(),
                }
            }
        }
    }

    async fn exec(&self, worktree: &Path, command: &str) -> std::io::Result<(bool, String)> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(worktree)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let mut combined = Vec::new();
        if let Some(mut stdout) = child.stdout.take() {
            let mut buf = vec![0u8; OUTPUT_CAP_BYTES];
            if let Ok(n) = stdout.read(&mut buf).await {
                combined.extend_from_slice(&buf[..n]);
            }
        }
        if let Some(mut stderr) = child.stderr.take() {
            let mut buf = vec![0u8; OUTPUT_CAP_BYTES.saturating_sub(combined.len())];
            if !buf.is_empty() {
                if let Ok(n) = stderr.read(&mut buf).await {
                    combined.extend_from_slice(&buf[..n]);
                }
            }
        }

        let status = child.wait().await?;
        let text = String::from_utf8_lossy(&combined).to_string();
        let excerpt: String = text.chars().rev().take(EXCERPT_CHARS).collect::<Vec<_>>().into_iter().rev().collect();
        Ok((status.success(), excerpt))
    }
}
