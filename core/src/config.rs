//! Runtime configuration.
//!
//! Values come from an optional TOML file and are then overridden by
//! environment variables, so a deployment can tune the reclaim TTL without
//! shipping a file.

use std::fmt::Display;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::RuntimeError;

pub const DEFAULT_SESSION_TTL_SECS: u64 = 300;
pub const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 3_600;
const DEFAULT_SESSION_SHELL: &str = "/bin/bash";
const DEFAULT_EXEC_SHELL: &str = "/bin/sh";
const DEFAULT_MAX_BUFFER_BYTES: usize = 1024 * 1024; // 1 MiB
const DEFAULT_CLOSE_GRACE_MS: u64 = 2_000;

pub const ENV_SESSION_TTL: &str = "PTY_SESSION_TTL_SECONDS";
pub const ENV_SESSION_SHELL: &str = "PTY_SESSION_SHELL";
pub const ENV_SWEEP_INTERVAL: &str = "PTY_SESSION_SWEEP_INTERVAL_SECONDS";
pub const ENV_MAX_BUFFER_BYTES: &str = "PTY_SESSION_MAX_BUFFER_BYTES";
pub const ENV_EXEC_TIMEOUT: &str = "EXEC_DEFAULT_TIMEOUT_SECONDS";
pub const ENV_JOB_TIMEOUT: &str = "BACKGROUND_JOB_TIMEOUT_SECONDS";
pub const ENV_JOB_CONCURRENCY: &str = "BACKGROUND_JOB_MAX_CONCURRENCY";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub session: SessionConfig,
    pub exec: ExecConfig,
    pub jobs: JobConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long an exited session stays readable before the sweep reclaims it.
    pub ttl_seconds: u64,
    pub shell: String,
    pub shell_args: Vec<String>,
    /// Periodic sweep interval; `None` keeps reclamation purely call-driven.
    pub sweep_interval_seconds: Option<u64>,
    /// Unread output at which the pty reader pauses until the next drain.
    pub max_buffer_bytes: usize,
    pub close_grace_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: DEFAULT_SESSION_TTL_SECS,
            shell: DEFAULT_SESSION_SHELL.to_string(),
            shell_args: Vec::new(),
            sweep_interval_seconds: None,
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
            close_grace_ms: DEFAULT_CLOSE_GRACE_MS,
        }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_seconds
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    pub shell: String,
    pub default_timeout_seconds: u64,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            shell: DEFAULT_EXEC_SHELL.to_string(),
            default_timeout_seconds: DEFAULT_EXEC_TIMEOUT_SECS,
        }
    }
}

impl ExecConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub default_timeout_seconds: u64,
    /// Upper bound on jobs executing at once. Jobs past the bound stay
    /// `running` while they wait for a slot.
    pub max_concurrency: Option<usize>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: DEFAULT_JOB_TIMEOUT_SECS,
            max_concurrency: None,
        }
    }
}

impl JobConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_seconds)
    }
}

impl RuntimeConfig {
    /// Loads the optional TOML file at `path`, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, RuntimeError> {
        let mut config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    fn from_toml_file(path: &Path) -> Result<Self, RuntimeError> {
        let raw = std::fs::read_to_string(path).map_err(|source| RuntimeError::ReadConfig {
            path: PathBuf::from(path),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| RuntimeError::ParseConfig {
            path: PathBuf::from(path),
            source,
        })
    }

    pub(crate) fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ttl) = parse_override(&lookup, ENV_SESSION_TTL) {
            self.session.ttl_seconds = ttl;
        }
        if let Some(shell) = lookup(ENV_SESSION_SHELL).filter(|s| !s.trim().is_empty()) {
            self.session.shell = shell;
        }
        if let Some(interval) = parse_override(&lookup, ENV_SWEEP_INTERVAL) {
            self.session.sweep_interval_seconds = Some(interval);
        }
        if let Some(max_bytes) = parse_override(&lookup, ENV_MAX_BUFFER_BYTES) {
            self.session.max_buffer_bytes = max_bytes;
        }
        if let Some(timeout) = parse_override(&lookup, ENV_EXEC_TIMEOUT) {
            self.exec.default_timeout_seconds = timeout;
        }
        if let Some(timeout) = parse_override(&lookup, ENV_JOB_TIMEOUT) {
            self.jobs.default_timeout_seconds = timeout;
        }
        if let Some(limit) = parse_override::<usize, _>(&lookup, ENV_JOB_CONCURRENCY) {
            self.jobs.max_concurrency = (limit > 0).then_some(limit);
        }
    }
}

fn parse_override<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(key, value = %raw, error = %err, "ignoring invalid environment override");
            None
        }
    }
}
