//! One-shot command execution with a hard timeout.

#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;

use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;

use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::process::Command;
use tracing::debug;
use tracing::warn;

use crate::config::ExecConfig;
use crate::error::ExecError;
use crate::process_group::set_parent_death;
use crate::process_group::signal_process_group;

pub const EXEC_TIMEOUT_EXIT_CODE: i32 = 124; // conventional timeout exit code
pub const EXEC_FAILURE_EXIT_CODE: i32 = 1;
pub(crate) const EXIT_CODE_SIGNAL_BASE: i32 = 128; // conventional shell: 128 + signal

// I/O buffer sizing
const READ_CHUNK_SIZE: usize = 8192;
const AGGREGATE_BUFFER_INITIAL_CAPACITY: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct ExecParams {
    pub command: String,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
}

impl ExecParams {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            cwd: None,
            timeout,
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    fn timed_out() -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: EXEC_TIMEOUT_EXIT_CODE,
        }
    }

    fn failed(message: String) -> Self {
        Self {
            stdout: String::new(),
            stderr: message,
            exit_code: EXEC_FAILURE_EXIT_CODE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandExecutor {
    shell: String,
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new(&ExecConfig::default())
    }
}

impl CommandExecutor {
    pub fn new(config: &ExecConfig) -> Self {
        Self {
            shell: config.shell.clone(),
        }
    }

    /// Runs `params` to completion and folds every failure into the
    /// `(stdout, stderr, exit_code)` convention: 124 for a timeout, 1 with the
    /// failure text on stderr for anything else.
    pub async fn run(&self, params: &ExecParams) -> ExecOutput {
        match self.execute(params).await {
            Ok(output) => output,
            Err(ExecError::Timeout { .. }) => ExecOutput::timed_out(),
            Err(err) => ExecOutput::failed(err.to_string()),
        }
    }

    /// Runs `params` and reports the failure taxonomy as typed errors.
    ///
    /// The child is always reaped before this returns. On timeout the whole
    /// process group is killed first.
    pub async fn execute(&self, params: &ExecParams) -> Result<ExecOutput, ExecError> {
        let started = Instant::now();
        let mut child = self
            .spawn(params)
            .map_err(|source| ExecError::Launch { source })?;
        let pid = child.id();

        let stdout_reader = child.stdout.take().ok_or_else(|| ExecError::Runtime {
            source: io::Error::other("stdout pipe was unexpectedly not available"),
        })?;
        let stderr_reader = child.stderr.take().ok_or_else(|| ExecError::Runtime {
            source: io::Error::other("stderr pipe was unexpectedly not available"),
        })?;

        let collect = async {
            let (status, stdout, stderr) = tokio::try_join!(
                child.wait(),
                read_stream(stdout_reader),
                read_stream(stderr_reader),
            )?;
            Ok::<_, io::Error>((status, stdout, stderr))
        };

        let outcome = tokio::time::timeout(params.timeout, collect).await;
        match outcome {
            Ok(Ok((status, stdout, stderr))) => {
                let exit_code = exit_code_of(status);
                debug!(
                    command = %params.command,
                    exit_code,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "command finished"
                );
                Ok(ExecOutput {
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                    exit_code,
                })
            }
            Ok(Err(source)) => {
                kill_and_reap(&mut child, pid).await;
                Err(ExecError::Runtime { source })
            }
            Err(_) => {
                debug!(command = %params.command, timeout_secs = params.timeout.as_secs(), "command timed out");
                kill_and_reap(&mut child, pid).await;
                Err(ExecError::Timeout {
                    timeout: params.timeout,
                })
            }
        }
    }

    fn spawn(&self, params: &ExecParams) -> io::Result<Child> {
        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(&params.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);
        if let Some(cwd) = &params.cwd {
            command.current_dir(cwd);
        }
        let parent_pid = std::process::id() as libc::pid_t;
        unsafe {
            command.pre_exec(move || {
                set_parent_death(parent_pid);
                Ok(())
            });
        }
        command.spawn()
    }
}

/// Convenience wrapper around [`CommandExecutor::run`] with the default shell.
pub async fn run_command(command: &str, cwd: Option<&Path>, timeout: Duration) -> ExecOutput {
    let mut params = ExecParams::new(command, timeout);
    params.cwd = cwd.map(Path::to_path_buf);
    CommandExecutor::default().run(&params).await
}

async fn kill_and_reap(child: &mut Child, pid: Option<u32>) {
    if let Some(pid) = pid
        && let Err(err) = signal_process_group(pid, libc::SIGKILL)
    {
        debug!(pid, error = %err, "process group already gone");
    }
    // Covers the leader even if the group signal raced its exit.
    if let Err(err) = child.start_kill() {
        debug!(error = %err, "child already exited");
    }
    if let Err(err) = child.wait().await {
        warn!(error = %err, "failed to reap timed out child");
    }
}

async fn read_stream<R: AsyncRead + Unpin>(mut reader: R) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(AGGREGATE_BUFFER_INITIAL_CAPACITY);
    let mut tmp = [0u8; READ_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut tmp).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n]);
    }
    Ok(buf)
}

fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or_else(|| {
        #[cfg(unix)]
        {
            if let Some(signal) = status.signal() {
                return EXIT_CODE_SIGNAL_BASE + signal;
            }
        }
        -1
    })
}
