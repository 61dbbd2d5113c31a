//! Fire-and-forget command execution with poll-based status.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::sync::Semaphore;
use tracing::debug;
use tracing::info;

use crate::config::JobConfig;
use crate::error::ExecError;
use crate::exec::CommandExecutor;
use crate::exec::EXEC_FAILURE_EXIT_CODE;
use crate::exec::EXEC_TIMEOUT_EXIT_CODE;
use crate::exec::ExecOutput;
use crate::exec::ExecParams;
use crate::ids::ExecId;
use crate::workdir::default_working_directory;
use crate::workdir::expand_home;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    Timeout,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

#[derive(Debug)]
struct JobRecord {
    command: String,
    cwd: PathBuf,
    timeout: Duration,
    started_at: DateTime<Utc>,
    started: Instant,
    status: JobStatus,
    stdout: String,
    stderr: String,
    return_code: Option<i32>,
    error: Option<String>,
}

impl JobRecord {
    fn new(command: String, cwd: PathBuf, timeout: Duration) -> Self {
        Self {
            command,
            cwd,
            timeout,
            started_at: Utc::now(),
            started: Instant::now(),
            status: JobStatus::Running,
            stdout: String::new(),
            stderr: String::new(),
            return_code: None,
            error: None,
        }
    }

    /// Moves the record to its terminal state. A terminal record is left as is.
    fn finish(&mut self, result: Result<ExecOutput, ExecError>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        match result {
            Ok(output) => {
                self.status = if output.exit_code == 0 {
                    JobStatus::Completed
                } else {
                    JobStatus::Failed
                };
                self.stdout = output.stdout;
                self.stderr = output.stderr;
                self.return_code = Some(output.exit_code);
            }
            Err(err @ ExecError::Timeout { .. }) => {
                self.status = JobStatus::Timeout;
                self.return_code = Some(EXEC_TIMEOUT_EXIT_CODE);
                self.error = Some(err.to_string());
            }
            Err(err) => {
                self.status = JobStatus::Failed;
                self.return_code = Some(EXEC_FAILURE_EXIT_CODE);
                self.error = Some(err.to_string());
            }
        }
        true
    }

    fn snapshot(&self, exec_id: &ExecId, now: Instant) -> JobSnapshot {
        let elapsed = now.saturating_duration_since(self.started).as_secs_f64();
        JobSnapshot {
            exec_id: exec_id.clone(),
            command: self.command.clone(),
            cwd: self.cwd.clone(),
            status: self.status,
            started_at: self.started_at,
            elapsed_seconds: (elapsed * 10.0).round() / 10.0,
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            return_code: self.return_code,
            error: self.error.clone(),
        }
    }
}

/// Point-in-time copy of a job, safe to hand out while the worker runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub exec_id: ExecId,
    pub command: String,
    pub cwd: PathBuf,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub elapsed_seconds: f64,
    pub stdout: String,
    pub stderr: String,
    pub return_code: Option<i32>,
    pub error: Option<String>,
}

/// Registry of background jobs. Entries live as long as the tracker.
#[derive(Debug, Clone)]
pub struct JobTracker {
    executor: CommandExecutor,
    config: JobConfig,
    jobs: Arc<Mutex<HashMap<ExecId, JobRecord>>>,
    slots: Option<Arc<Semaphore>>,
}

impl JobTracker {
    pub fn new(executor: CommandExecutor, config: JobConfig) -> Self {
        let slots = config
            .max_concurrency
            .map(|limit| Arc::new(Semaphore::new(limit)));
        Self {
            executor,
            config,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            slots,
        }
    }

    /// Registers `command` as `running` and hands it to its own worker task.
    ///
    /// `cwd` defaults to the home directory and may start with `~`; `timeout`
    /// defaults to the configured job timeout.
    pub async fn start(
        &self,
        command: impl Into<String>,
        cwd: Option<&str>,
        timeout: Option<Duration>,
    ) -> ExecId {
        let command = command.into();
        let cwd = cwd
            .filter(|raw| !raw.trim().is_empty())
            .map(expand_home)
            .unwrap_or_else(default_working_directory);
        let timeout = timeout.unwrap_or_else(|| self.config.default_timeout());

        let exec_id = {
            let mut jobs = self.jobs.lock().await;
            let exec_id = loop {
                let candidate = ExecId::generate();
                if !jobs.contains_key(&candidate) {
                    break candidate;
                }
            };
            jobs.insert(
                exec_id.clone(),
                JobRecord::new(command.clone(), cwd.clone(), timeout),
            );
            exec_id
        };
        info!(exec_id = %exec_id, command = %command, cwd = %cwd.display(), "background job started");

        let params = ExecParams::new(command, timeout).with_cwd(cwd);
        tokio::spawn(run_job(
            exec_id.clone(),
            params,
            self.executor.clone(),
            Arc::clone(&self.jobs),
            self.slots.clone(),
        ));
        exec_id
    }

    /// Snapshot of a job, or `None` for an unknown id.
    pub async fn status(&self, exec_id: &ExecId) -> Option<JobSnapshot> {
        let jobs = self.jobs.lock().await;
        jobs.get(exec_id)
            .map(|record| record.snapshot(exec_id, Instant::now()))
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }
}

async fn run_job(
    exec_id: ExecId,
    params: ExecParams,
    executor: CommandExecutor,
    jobs: Arc<Mutex<HashMap<ExecId, JobRecord>>>,
    slots: Option<Arc<Semaphore>>,
) {
    // Held for the whole run; jobs waiting here still report `running`.
    let _permit = match slots {
        Some(slots) => slots.acquire_owned().await.ok(),
        None => None,
    };

    let result = executor.execute(&params).await;
    let mut jobs = jobs.lock().await;
    let Some(record) = jobs.get_mut(&exec_id) else {
        return;
    };
    if record.finish(result) {
        debug!(
            exec_id = %exec_id,
            status = ?record.status,
            return_code = ?record.return_code,
            timeout_secs = record.timeout.as_secs(),
            "background job finished"
        );
    }
}
