use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Working directory does not exist: {}", path.display())]
    InvalidWorkingDirectory { path: PathBuf },
    #[error("failed to create pty session: {pty_error}")]
    CreateSession {
        #[source]
        pty_error: anyhow::Error,
    },
    #[error("unknown signal `{name}`")]
    UnknownSignal { name: String },
    #[error("failed to read config {}: {source}", path.display())]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {source}", path.display())]
    ParseConfig {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl RuntimeError {
    pub(crate) fn create_session(error: anyhow::Error) -> Self {
        Self::CreateSession { pty_error: error }
    }

    pub(crate) fn invalid_working_directory(path: impl Into<PathBuf>) -> Self {
        Self::InvalidWorkingDirectory { path: path.into() }
    }
}

/// Failure taxonomy of a single command execution.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Command timed out after {} seconds", timeout.as_secs())]
    Timeout { timeout: Duration },
    #[error("{source}")]
    Launch {
        #[source]
        source: std::io::Error,
    },
    #[error("{source}")]
    Runtime {
        #[source]
        source: std::io::Error,
    },
}
