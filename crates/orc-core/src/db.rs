use std::path::Path;

use chrono::{DateTime, Utc};
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::types::{
    Client, CodeBranch, CodePullRequest, CompletionReason, Feature, Job, JobIteration, JobMessage,
    JobMessageKind, JobStatus, JobType, Repository, SpecPhase,
};

/// Async SQLite-backed gateway for jobs, features, clients, and the
/// repository/branch/PR records the workspace manager produces.
pub struct Db {
    conn: Connection,
}

// ---------------------------------------------------------------------------
// helpers -- enum <-> SQLite string, optional timestamps, JSON blobs
// ---------------------------------------------------------------------------

fn enum_to_sql<T: serde::Serialize>(val: &T) -> String {
    let s = serde_json::to_string(val).expect("serialize enum");
    s.trim_matches('"').to_string()
}

fn enum_from_sql<T: serde::de::DeserializeOwned>(raw: &str) -> T {
    let quoted = format!("\"{}\"", raw);
    serde_json::from_str(&quoted).expect("deserialize enum")
}

fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn ts_from_sql(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .expect("valid rfc3339 timestamp")
        .with_timezone(&Utc)
}

fn opt_ts_to_sql(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(ts_to_sql)
}

fn opt_ts_from_sql(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.map(|s| ts_from_sql(&s))
}

fn json_to_sql<T: serde::Serialize>(val: &T) -> String {
    serde_json::to_string(val).expect("serialize json")
}

fn json_from_sql<T: serde::de::DeserializeOwned>(raw: &str) -> T {
    serde_json::from_str(raw).expect("deserialize json")
}

fn opt_json_to_sql<T: serde::Serialize>(val: &Option<T>) -> Option<String> {
    val.as_ref().map(json_to_sql)
}

fn opt_json_from_sql<T: serde::de::DeserializeOwned>(raw: Option<String>) -> Option<T> {
    raw.map(|s| json_from_sql(&s))
}

impl Db {
    /// Open (or create) the database at the given file path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, tokio_rusqlite::Error> {
        let conn = Connection::open(path.as_ref()).await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn new_in_memory() -> Result<Self, tokio_rusqlite::Error> {
        let conn = Connection::open_in_memory().await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<(), tokio_rusqlite::Error> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA cache_size=-64000;
                    PRAGMA mmap_size=268435456;
                    PRAGMA temp_store=MEMORY;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS clients (
                        id                          TEXT PRIMARY KEY,
                        name                        TEXT NOT NULL,
                        constitution                TEXT,
                        constitution_generated_at   TEXT
                    );

                    CREATE TABLE IF NOT EXISTS code_repositories (
                        id              TEXT PRIMARY KEY,
                        client_id       TEXT NOT NULL,
                        provider        TEXT NOT NULL,
                        owner_name      TEXT NOT NULL,
                        repo_name       TEXT NOT NULL,
                        default_branch  TEXT NOT NULL,
                        url             TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_repos_client ON code_repositories(client_id);

                    CREATE TABLE IF NOT EXISTS code_branches (
                        id              TEXT PRIMARY KEY,
                        repository_id   TEXT NOT NULL,
                        name            TEXT NOT NULL,
                        created_at      TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_branches_repo ON code_branches(repository_id);

                    CREATE TABLE IF NOT EXISTS code_pull_requests (
                        id              TEXT PRIMARY KEY,
                        repository_id   TEXT NOT NULL,
                        number          INTEGER NOT NULL,
                        url             TEXT NOT NULL,
                        title           TEXT NOT NULL,
                        files_changed   INTEGER NOT NULL,
                        created_at      TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_prs_repo ON code_pull_requests(repository_id);

                    CREATE TABLE IF NOT EXISTS features (
                        id                          TEXT PRIMARY KEY,
                        client_id                   TEXT NOT NULL,
                        title                       TEXT NOT NULL,
                        functionality_notes         TEXT,
                        client_context              TEXT,
                        feature_type_id             TEXT,
                        prd                         TEXT,
                        spec_output                 TEXT,
                        spec_phase                  TEXT,
                        feature_workflow_stage_id   TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_features_client ON features(client_id);

                    CREATE TABLE IF NOT EXISTS jobs (
                        id                  TEXT PRIMARY KEY,
                        client_id           TEXT NOT NULL,
                        feature_id          TEXT,
                        repository_id       TEXT,
                        created_by          TEXT,
                        job_type            TEXT NOT NULL,
                        prd_mode            INTEGER NOT NULL,
                        status              TEXT NOT NULL,
                        created_at          TEXT NOT NULL,
                        started_at          TEXT,
                        completed_at        TEXT,
                        prompt              TEXT NOT NULL,
                        branch_name         TEXT NOT NULL,
                        title               TEXT,
                        max_iterations      INTEGER,
                        completion_promise  TEXT,
                        feedback_commands   TEXT NOT NULL,
                        prd                 TEXT,
                        spec_phase          TEXT,
                        spec_output         TEXT,
                        exit_code           INTEGER,
                        pr_url              TEXT,
                        pr_number           INTEGER,
                        files_changed       INTEGER,
                        code_branch_id      TEXT,
                        code_pull_request_id TEXT,
                        error               TEXT,
                        worktree_path       TEXT,
                        pid                 INTEGER,
                        completion_reason   TEXT,
                        current_iteration   INTEGER NOT NULL,
                        total_iterations    INTEGER,
                        prd_progress        TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
                    CREATE INDEX IF NOT EXISTS idx_jobs_client ON jobs(client_id);
                    CREATE INDEX IF NOT EXISTS idx_jobs_feature ON jobs(feature_id);

                    CREATE TABLE IF NOT EXISTS job_messages (
                        id          TEXT PRIMARY KEY,
                        job_id      TEXT NOT NULL,
                        kind        TEXT NOT NULL,
                        content     TEXT NOT NULL,
                        created_at  TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_messages_job ON job_messages(job_id);

                    CREATE TABLE IF NOT EXISTS job_iterations (
                        id                  TEXT PRIMARY KEY,
                        job_id              TEXT NOT NULL,
                        iteration_number    INTEGER NOT NULL,
                        prompt              TEXT NOT NULL,
                        output_summary      TEXT,
                        promise_detected    INTEGER NOT NULL,
                        feedback_results    TEXT,
                        exit_code           INTEGER,
                        story_id            INTEGER,
                        commit_sha          TEXT,
                        created_at          TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_iterations_job ON job_iterations(job_id);
                    ",
                )?;
                Ok(())
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Job CRUD
    // -----------------------------------------------------------------------

    pub async fn upsert_job(&self, job: &Job) -> Result<(), tokio_rusqlite::Error> {
        let id = job.id.to_string();
        let client_id = job.client_id.to_string();
        let feature_id = job.feature_id.map(|u| u.to_string());
        let repository_id = job.repository_id.map(|u| u.to_string());
        let created_by = job.created_by.map(|u| u.to_string());
        let job_type = enum_to_sql(&job.job_type);
        let prd_mode = job.prd_mode as i64;
        let status = enum_to_sql(&job.status);
        let created_at = ts_to_sql(job.created_at);
        let started_at = opt_ts_to_sql(job.started_at);
        let completed_at = opt_ts_to_sql(job.completed_at);
        let prompt = job.prompt.clone();
        let branch_name = job.branch_name.clone();
        let title = job.title.clone();
        let max_iterations = job.max_iterations;
        let completion_promise = job.completion_promise.clone();
        let feedback_commands = json_to_sql(&job.feedback_commands);
        let prd = opt_json_to_sql(&job.prd);
        let spec_phase = job.spec_phase.as_ref().map(enum_to_sql);
        let spec_output = opt_json_to_sql(&job.spec_output);
        let exit_code = job.exit_code;
        let pr_url = job.pr_url.clone();
        let pr_number = job.pr_number;
        let files_changed = job.files_changed;
        let code_branch_id = job.code_branch_id.map(|u| u.to_string());
        let code_pull_request_id = job.code_pull_request_id.map(|u| u.to_string());
        let error = job.error.clone();
        let worktree_path = job.worktree_path.clone();
        let pid = job.pid.map(|p| p as i64);
        let completion_reason = job.completion_reason.as_ref().map(enum_to_sql);
        let current_iteration = job.current_iteration;
        let total_iterations = job.total_iterations;
        let prd_progress = opt_json_to_sql(&job.prd_progress);

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO jobs (
                        id, client_id, feature_id, repository_id, created_by, job_type, prd_mode,
                        status, created_at, started_at, completed_at, prompt, branch_name, title,
                        max_iterations, completion_promise, feedback_commands, prd, spec_phase,
                        spec_output, exit_code, pr_url, pr_number, files_changed, code_branch_id,
                        code_pull_request_id, error, worktree_path, pid, completion_reason,
                        current_iteration, total_iterations, prd_progress
                     ) VALUES (
                        ?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,
                        ?21,?22,?23,?24,?25,?26,?27,?28,?29,?30,?31,?32,?33
                     )
                     ON CONFLICT(id) DO UPDATE SET
                        feature_id=excluded.feature_id, repository_id=excluded.repository_id,
                        status=excluded.status, started_at=excluded.started_at,
                        completed_at=excluded.completed_at, title=excluded.title,
                        spec_phase=excluded.spec_phase, spec_output=excluded.spec_output,
                        prd=excluded.prd, exit_code=excluded.exit_code, pr_url=excluded.pr_url,
                        pr_number=excluded.pr_number, files_changed=excluded.files_changed,
                        code_branch_id=excluded.code_branch_id,
                        code_pull_request_id=excluded.code_pull_request_id, error=excluded.error,
                        worktree_path=excluded.worktree_path, pid=excluded.pid,
                        completion_reason=excluded.completion_reason,
                        current_iteration=excluded.current_iteration,
                        total_iterations=excluded.total_iterations,
                        prd_progress=excluded.prd_progress",
                    rusqlite::params![
                        id, client_id, feature_id, repository_id, created_by, job_type, prd_mode,
                        status, created_at, started_at, completed_at, prompt, branch_name, title,
                        max_iterations, completion_promise, feedback_commands, prd, spec_phase,
                        spec_output, exit_code, pr_url, pr_number, files_changed, code_branch_id,
                        code_pull_request_id, error, worktree_path, pid, completion_reason,
                        current_iteration, total_iterations, prd_progress,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Option<Job>, tokio_rusqlite::Error> {
        let id_str = id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(JOB_SELECT_COLUMNS)?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_job(row)?)),
                    None => Ok(None),
                }
            })
            .await
    }

    pub async fn list_jobs_by_status(
        &self,
        status: JobStatus,
    ) -> Result<Vec<Job>, tokio_rusqlite::Error> {
        let status_str = enum_to_sql(&status);
        let sql = format!(
            "{} WHERE status = ?1 ORDER BY created_at ASC",
            JOB_SELECT_BASE
        );
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(rusqlite::params![status_str])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_job(row)?);
                }
                Ok(out)
            })
            .await
    }

    /// Jobs left `running` by a previous process instance — restart-recovery sweep.
    pub async fn list_running_jobs(&self) -> Result<Vec<Job>, tokio_rusqlite::Error> {
        self.list_jobs_by_status(JobStatus::Running).await
    }

    // -----------------------------------------------------------------------
    // JobMessage
    // -----------------------------------------------------------------------

    pub async fn insert_message(&self, msg: &JobMessage) -> Result<(), tokio_rusqlite::Error> {
        let id = msg.id.to_string();
        let job_id = msg.job_id.to_string();
        let kind = enum_to_sql(&msg.kind);
        let content = msg.content.clone();
        let created_at = ts_to_sql(msg.created_at);

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO job_messages (id, job_id, kind, content, created_at)
                     VALUES (?1,?2,?3,?4,?5)",
                    rusqlite::params![id, job_id, kind, content, created_at],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn list_messages(&self, job_id: Uuid) -> Result<Vec<JobMessage>, tokio_rusqlite::Error> {
        let job_id_str = job_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, job_id, kind, content, created_at
                     FROM job_messages WHERE job_id = ?1 ORDER BY created_at ASC",
                )?;
                let mut rows = stmt.query(rusqlite::params![job_id_str])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let id_str: String = row.get(0)?;
                    let job_id_str: String = row.get(1)?;
                    let kind_str: String = row.get(2)?;
                    let created_at_str: String = row.get(4)?;
                    out.push(JobMessage {
                        id: Uuid::parse_str(&id_str).expect("valid uuid"),
                        job_id: Uuid::parse_str(&job_id_str).expect("valid uuid"),
                        kind: enum_from_sql(&kind_str),
                        content: row.get(3)?,
                        created_at: ts_from_sql(&created_at_str),
                    });
                }
                Ok(out)
            })
            .await
    }

    // -----------------------------------------------------------------------
    // JobIteration
    // -----------------------------------------------------------------------

    pub async fn insert_iteration(&self, it: &JobIteration) -> Result<(), tokio_rusqlite::Error> {
        let id = it.id.to_string();
        let job_id = it.job_id.to_string();
        let iteration_number = it.iteration_number;
        let prompt = it.prompt.clone();
        let output_summary = it.output_summary.clone();
        let promise_detected = it.promise_detected as i64;
        let feedback_results = opt_json_to_sql(&it.feedback_results);
        let exit_code = it.exit_code;
        let story_id = it.story_id;
        let commit_sha = it.commit_sha.clone();
        let created_at = ts_to_sql(it.created_at);

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO job_iterations (
                        id, job_id, iteration_number, prompt, output_summary, promise_detected,
                        feedback_results, exit_code, story_id, commit_sha, created_at
                     ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
                    rusqlite::params![
                        id, job_id, iteration_number, prompt, output_summary, promise_detected,
                        feedback_results, exit_code, story_id, commit_sha, created_at,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn list_iterations(&self, job_id: Uuid) -> Result<Vec<JobIteration>, tokio_rusqlite::Error> {
        let job_id_str = job_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, job_id, iteration_number, prompt, output_summary,
                            promise_detected, feedback_results, exit_code, story_id,
                            commit_sha, created_at
                     FROM job_iterations WHERE job_id = ?1 ORDER BY iteration_number ASC",
                )?;
                let mut rows = stmt.query(rusqlite::params![job_id_str])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_iteration(row)?);
                }
                Ok(out)
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Feature
    // -----------------------------------------------------------------------

    pub async fn upsert_feature(&self, feature: &Feature) -> Result<(), tokio_rusqlite::Error> {
        let id = feature.id.to_string();
        let client_id = feature.client_id.to_string();
        let title = feature.title.clone();
        let functionality_notes = feature.functionality_notes.clone();
        let client_context = feature.client_context.clone();
        let feature_type_id = feature.feature_type_id.map(|u| u.to_string());
        let prd = opt_json_to_sql(&feature.prd);
        let spec_output = opt_json_to_sql(&feature.spec_output);
        let spec_phase = feature.spec_phase.as_ref().map(enum_to_sql);
        let feature_workflow_stage_id = feature.feature_workflow_stage_id.clone();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO features (
                        id, client_id, title, functionality_notes, client_context,
                        feature_type_id, prd, spec_output, spec_phase, feature_workflow_stage_id
                     ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)
                     ON CONFLICT(id) DO UPDATE SET
                        title=excluded.title, functionality_notes=excluded.functionality_notes,
                        client_context=excluded.client_context, prd=excluded.prd,
                        spec_output=excluded.spec_output, spec_phase=excluded.spec_phase,
                        feature_workflow_stage_id=excluded.feature_workflow_stage_id",
                    rusqlite::params![
                        id, client_id, title, functionality_notes, client_context,
                        feature_type_id, prd, spec_output, spec_phase, feature_workflow_stage_id,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get_feature(&self, id: Uuid) -> Result<Option<Feature>, tokio_rusqlite::Error> {
        let id_str = id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, client_id, title, functionality_notes, client_context,
                            feature_type_id, prd, spec_output, spec_phase, feature_workflow_stage_id
                     FROM features WHERE id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_feature(row)?)),
                    None => Ok(None),
                }
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Client
    // -----------------------------------------------------------------------

    pub async fn upsert_client(&self, client: &Client) -> Result<(), tokio_rusqlite::Error> {
        let id = client.id.to_string();
        let name = client.name.clone();
        let constitution = client.constitution.clone();
        let constitution_generated_at = opt_ts_to_sql(client.constitution_generated_at);

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO clients (id, name, constitution, constitution_generated_at)
                     VALUES (?1,?2,?3,?4)
                     ON CONFLICT(id) DO UPDATE SET
                        name=excluded.name, constitution=excluded.constitution,
                        constitution_generated_at=excluded.constitution_generated_at",
                    rusqlite::params![id, name, constitution, constitution_generated_at],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get_client(&self, id: Uuid) -> Result<Option<Client>, tokio_rusqlite::Error> {
        let id_str = id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, constitution, constitution_generated_at
                     FROM clients WHERE id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => {
                        let id_str: String = row.get(0)?;
                        let generated_at: Option<String> = row.get(3)?;
                        Ok(Some(Client {
                            id: Uuid::parse_str(&id_str).expect("valid uuid"),
                            name: row.get(1)?,
                            constitution: row.get(2)?,
                            constitution_generated_at: opt_ts_from_sql(generated_at),
                        }))
                    }
                    None => Ok(None),
                }
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Repository / branch / PR
    // -----------------------------------------------------------------------

    pub async fn upsert_repository(&self, repo: &Repository) -> Result<(), tokio_rusqlite::Error> {
        let id = repo.id.to_string();
        let client_id = repo.client_id.to_string();
        let provider = repo.provider.clone();
        let owner_name = repo.owner_name.clone();
        let repo_name = repo.repo_name.clone();
        let default_branch = repo.default_branch.clone();
        let url = repo.url.clone();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO code_repositories (
                        id, client_id, provider, owner_name, repo_name, default_branch, url
                     ) VALUES (?1,?2,?3,?4,?5,?6,?7)
                     ON CONFLICT(id) DO UPDATE SET
                        default_branch=excluded.default_branch, url=excluded.url",
                    rusqlite::params![id, client_id, provider, owner_name, repo_name, default_branch, url],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get_repository(&self, id: Uuid) -> Result<Option<Repository>, tokio_rusqlite::Error> {
        let id_str = id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, client_id, provider, owner_name, repo_name, default_branch, url
                     FROM code_repositories WHERE id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![id_str])?;
                match rows.next()? {
                    Some(row) => {
                        let id_str: String = row.get(0)?;
                        let client_id_str: String = row.get(1)?;
                        Ok(Some(Repository {
                            id: Uuid::parse_str(&id_str).expect("valid uuid"),
                            client_id: Uuid::parse_str(&client_id_str).expect("valid uuid"),
                            provider: row.get(2)?,
                            owner_name: row.get(3)?,
                            repo_name: row.get(4)?,
                            default_branch: row.get(5)?,
                            url: row.get(6)?,
                        }))
                    }
                    None => Ok(None),
                }
            })
            .await
    }

    pub async fn insert_branch(&self, branch: &CodeBranch) -> Result<(), tokio_rusqlite::Error> {
        let id = branch.id.to_string();
        let repository_id = branch.repository_id.to_string();
        let name = branch.name.clone();
        let created_at = ts_to_sql(branch.created_at);

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO code_branches (id, repository_id, name, created_at)
                     VALUES (?1,?2,?3,?4)",
                    rusqlite::params![id, repository_id, name, created_at],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn insert_pull_request(&self, pr: &CodePullRequest) -> Result<(), tokio_rusqlite::Error> {
        let id = pr.id.to_string();
        let repository_id = pr.repository_id.to_string();
        let number = pr.number;
        let url = pr.url.clone();
        let title = pr.title.clone();
        let files_changed = pr.files_changed;
        let created_at = ts_to_sql(pr.created_at);

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO code_pull_requests (
                        id, repository_id, number, url, title, files_changed, created_at
                     ) VALUES (?1,?2,?3,?4,?5,?6,?7)",
                    rusqlite::params![id, repository_id, number, url, title, files_changed, created_at],
                )?;
                Ok(())
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

const JOB_SELECT_BASE: &str = "SELECT
    id, client_id, feature_id, repository_id, created_by, job_type, prd_mode, status,
    created_at, started_at, completed_at, prompt, branch_name, title, max_iterations,
    completion_promise, feedback_commands, prd, spec_phase, spec_output, exit_code, pr_url,
    pr_number, files_changed, code_branch_id, code_pull_request_id, error, worktree_path, pid,
    completion_reason, current_iteration, total_iterations, prd_progress
    FROM jobs";

const JOB_SELECT_COLUMNS: &str = "SELECT
    id, client_id, feature_id, repository_id, created_by, job_type, prd_mode, status,
    created_at, started_at, completed_at, prompt, branch_name, title, max_iterations,
    completion_promise, feedback_commands, prd, spec_phase, spec_output, exit_code, pr_url,
    pr_number, files_changed, code_branch_id, code_pull_request_id, error, worktree_path, pid,
    completion_reason, current_iteration, total_iterations, prd_progress
    FROM jobs WHERE id = ?1";

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let id_str: String = row.get(0)?;
    let client_id_str: String = row.get(1)?;
    let feature_id_str: Option<String> = row.get(2)?;
    let repository_id_str: Option<String> = row.get(3)?;
    let created_by_str: Option<String> = row.get(4)?;
    let job_type_str: String = row.get(5)?;
    let prd_mode_int: i64 = row.get(6)?;
    let status_str: String = row.get(7)?;
    let created_at_str: String = row.get(8)?;
    let started_at_str: Option<String> = row.get(9)?;
    let completed_at_str: Option<String> = row.get(10)?;
    let feedback_commands_str: String = row.get(16)?;
    let prd_str: Option<String> = row.get(17)?;
    let spec_phase_str: Option<String> = row.get(18)?;
    let spec_output_str: Option<String> = row.get(19)?;
    let code_branch_id_str: Option<String> = row.get(24)?;
    let code_pull_request_id_str: Option<String> = row.get(25)?;
    let pid_int: Option<i64> = row.get(28)?;
    let completion_reason_str: Option<String> = row.get(29)?;
    let prd_progress_str: Option<String> = row.get(32)?;

    Ok(Job {
        id: Uuid::parse_str(&id_str).expect("valid uuid"),
        client_id: Uuid::parse_str(&client_id_str).expect("valid uuid"),
        feature_id: feature_id_str.map(|s| Uuid::parse_str(&s).expect("valid uuid")),
        repository_id: repository_id_str.map(|s| Uuid::parse_str(&s).expect("valid uuid")),
        created_by: created_by_str.map(|s| Uuid::parse_str(&s).expect("valid uuid")),
        job_type: enum_from_sql::<JobType>(&job_type_str),
        prd_mode: prd_mode_int != 0,
        status: enum_from_sql::<JobStatus>(&status_str),
        created_at: ts_from_sql(&created_at_str),
        started_at: opt_ts_from_sql(started_at_str),
        completed_at: opt_ts_from_sql(completed_at_str),
        prompt: row.get(11)?,
        branch_name: row.get(12)?,
        title: row.get(13)?,
        max_iterations: row.get(14)?,
        completion_promise: row.get(15)?,
        feedback_commands: json_from_sql(&feedback_commands_str),
        prd: opt_json_from_sql(prd_str),
        spec_phase: spec_phase_str.map(|s| enum_from_sql::<SpecPhase>(&s)),
        spec_output: opt_json_from_sql(spec_output_str),
        exit_code: row.get(20)?,
        pr_url: row.get(21)?,
        pr_number: row.get(22)?,
        files_changed: row.get(23)?,
        code_branch_id: code_branch_id_str.map(|s| Uuid::parse_str(&s).expect("valid uuid")),
        code_pull_request_id: code_pull_request_id_str
            .map(|s| Uuid::parse_str(&s).expect("valid uuid")),
        error: row.get(26)?,
        worktree_path: row.get(27)?,
        pid: pid_int.map(|p| p as u32),
        completion_reason: completion_reason_str
            .map(|s| enum_from_sql::<CompletionReason>(&s)),
        current_iteration: row.get(30)?,
        total_iterations: row.get(31)?,
        prd_progress: opt_json_from_sql(prd_progress_str),
    })
}

fn row_to_iteration(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobIteration> {
    let id_str: String = row.get(0)?;
    let job_id_str: String = row.get(1)?;
    let promise_detected_int: i64 = row.get(5)?;
    let feedback_results_str: Option<String> = row.get(6)?;
    let created_at_str: String = row.get(10)?;

    Ok(JobIteration {
        id: Uuid::parse_str(&id_str).expect("valid uuid"),
        job_id: Uuid::parse_str(&job_id_str).expect("valid uuid"),
        iteration_number: row.get(2)?,
        prompt: row.get(3)?,
        output_summary: row.get(4)?,
        promise_detected: promise_detected_int != 0,
        feedback_results: opt_json_from_sql(feedback_results_str),
        exit_code: row.get(7)?,
        story_id: row.get(8)?,
        commit_sha: row.get(9)?,
        created_at: ts_from_sql(&created_at_str),
    })
}

fn row_to_feature(row: &rusqlite::Row<'_>) -> rusqlite::Result<Feature> {
    let id_str: String = row.get(0)?;
    let client_id_str: String = row.get(1)?;
    let feature_type_id_str: Option<String> = row.get(5)?;
    let prd_str: Option<String> = row.get(6)?;
    let spec_output_str: Option<String> = row.get(7)?;
    let spec_phase_str: Option<String> = row.get(8)?;

    Ok(Feature {
        id: Uuid::parse_str(&id_str).expect("valid uuid"),
        client_id: Uuid::parse_str(&client_id_str).expect("valid uuid"),
        title: row.get(2)?,
        functionality_notes: row.get(3)?,
        client_context: row.get(4)?,
        feature_type_id: feature_type_id_str.map(|s| Uuid::parse_str(&s).expect("valid uuid")),
        prd: opt_json_from_sql(prd_str),
        spec_output: opt_json_from_sql(spec_output_str),
        spec_phase: spec_phase_str.map(|s| enum_from_sql::<SpecPhase>(&s)),
        feature_workflow_stage_id: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Job, JobMessage, JobMessageKind, JobType};

    #[tokio::test]
    async fn upsert_and_get_job_round_trips() {
        let db = Db::new_in_memory().await.unwrap();
        let mut job = Job::new(Uuid::new_v4(), JobType::Code, "do the thing", "feat/x");
        job.feedback_commands = vec!["npm test".into()];
        db.upsert_job(&job).await.unwrap();

        let loaded = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.prompt, "do the thing");
        assert_eq!(loaded.feedback_commands, vec!["npm test".to_string()]);
        assert_eq!(loaded.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn upsert_job_updates_in_place() {
        let db = Db::new_in_memory().await.unwrap();
        let mut job = Job::new(Uuid::new_v4(), JobType::Ralph, "loop it", "feat/y");
        db.upsert_job(&job).await.unwrap();

        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        db.upsert_job(&job).await.unwrap();

        let loaded = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Running);
        assert!(loaded.started_at.is_some());
    }

    #[tokio::test]
    async fn list_jobs_by_status_filters_correctly() {
        let db = Db::new_in_memory().await.unwrap();
        let client = Uuid::new_v4();
        let mut a = Job::new(client, JobType::Code, "a", "feat/a");
        let b = Job::new(client, JobType::Code, "b", "feat/b");
        a.status = JobStatus::Running;
        db.upsert_job(&a).await.unwrap();
        db.upsert_job(&b).await.unwrap();

        let running = db.list_jobs_by_status(JobStatus::Running).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, a.id);
    }

    #[tokio::test]
    async fn messages_insert_and_list_in_order() {
        let db = Db::new_in_memory().await.unwrap();
        let job = Job::new(Uuid::new_v4(), JobType::Code, "p", "feat/z");
        db.upsert_job(&job).await.unwrap();

        db.insert_message(&JobMessage::new(job.id, JobMessageKind::Stdout, "one"))
            .await
            .unwrap();
        db.insert_message(&JobMessage::new(job.id, JobMessageKind::Stderr, "two"))
            .await
            .unwrap();

        let msgs = db.list_messages(job.id).await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].content, "one");
        assert_eq!(msgs[1].kind, JobMessageKind::Stderr);
    }

    #[tokio::test]
    async fn iterations_insert_and_list() {
        let db = Db::new_in_memory().await.unwrap();
        let job = Job::new(Uuid::new_v4(), JobType::Ralph, "p", "feat/w");
        db.upsert_job(&job).await.unwrap();

        let mut it = JobIteration::new(job.id, 1, "continue");
        it.promise_detected = true;
        db.insert_iteration(&it).await.unwrap();

        let loaded = db.list_iterations(job.id).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].promise_detected);
    }

    #[tokio::test]
    async fn client_round_trips() {
        let db = Db::new_in_memory().await.unwrap();
        let client = Client {
            id: Uuid::new_v4(),
            name: "acme".into(),
            constitution: Some("be kind".into()),
            constitution_generated_at: Some(Utc::now()),
        };
        db.upsert_client(&client).await.unwrap();
        let loaded = db.get_client(client.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "acme");
        assert!(loaded.constitution.is_some());
    }

    #[tokio::test]
    async fn repository_round_trips() {
        let db = Db::new_in_memory().await.unwrap();
        let repo = Repository {
            id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            provider: "github".into(),
            owner_name: "acme".into(),
            repo_name: "widgets".into(),
            default_branch: "main".into(),
            url: "https://example.com/acme/widgets.git".into(),
        };
        db.upsert_repository(&repo).await.unwrap();
        let loaded = db.get_repository(repo.id).await.unwrap().unwrap();
        assert_eq!(loaded.repo_name, "widgets");
        assert_eq!(loaded.default_branch, "main");
    }

    #[tokio::test]
    async fn get_repository_missing_returns_none() {
        let db = Db::new_in_memory().await.unwrap();
        assert!(db.get_repository(Uuid::new_v4()).await.unwrap().is_none());
    }
}
