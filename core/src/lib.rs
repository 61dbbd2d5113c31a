//! Lifecycle manager for shell processes: one-shot execution with a timeout,
//! background jobs polled by id, and interactive pty sessions.
//!
//! Everything is in memory and lives as long as the process.

#[cfg(not(unix))]
compile_error!("shellport-core only supports unix targets");

pub mod config;
pub mod error;
pub mod exec;
pub mod ids;
pub mod jobs;
mod process_group;
pub mod session;
pub mod workdir;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

pub use config::RuntimeConfig;
pub use error::ExecError;
pub use error::RuntimeError;
pub use exec::CommandExecutor;
pub use exec::ExecOutput;
pub use exec::ExecParams;
pub use exec::run_command;
pub use ids::ExecId;
pub use ids::SessionId;
pub use jobs::JobSnapshot;
pub use jobs::JobStatus;
pub use jobs::JobTracker;
pub use session::SessionOutput;
pub use session::SessionRegistry;
pub use session::SignalKind;

/// The three execution modes wired to one configuration.
#[derive(Debug)]
pub struct ShellRuntime {
    config: RuntimeConfig,
    executor: CommandExecutor,
    jobs: JobTracker,
    sessions: Arc<SessionRegistry>,
}

impl ShellRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        let executor = CommandExecutor::new(&config.exec);
        let jobs = JobTracker::new(executor.clone(), config.jobs.clone());
        let sessions = Arc::new(SessionRegistry::new(config.session.clone()));
        Self {
            config,
            executor,
            jobs,
            sessions,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn jobs(&self) -> &JobTracker {
        &self.jobs
    }

    /// Synchronous run; `timeout` falls back to the configured default.
    pub async fn run(&self, command: &str, cwd: Option<&Path>, timeout: Option<Duration>) -> ExecOutput {
        let mut params = ExecParams::new(
            command,
            timeout.unwrap_or_else(|| self.config.exec.default_timeout()),
        );
        params.cwd = cwd.map(Path::to_path_buf);
        self.executor.run(&params).await
    }

    /// Starts the periodic session sweep if one is configured. Must be called
    /// from within a tokio runtime.
    pub fn spawn_sweeper(&self) -> Option<JoinHandle<()>> {
        self.sessions.spawn_sweeper()
    }

    /// Closes every live session.
    pub async fn shutdown(&self) {
        self.sessions.close_all().await;
    }
}
