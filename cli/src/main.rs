use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use shellport_core::RuntimeConfig;
use shellport_core::ShellRuntime;

mod exec_cmd;
mod job_cmd;
mod shell_cmd;

use exec_cmd::ExecArgs;
use job_cmd::JobArgs;
use shell_cmd::ShellArgs;

/// Run shell commands, background jobs and interactive pty sessions.
#[derive(Debug, Parser)]
#[command(name = "shellport", version)]
struct Cli {
    /// TOML file with runtime settings; environment variables still override it.
    #[arg(long = "config", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a command to completion and mirror its output and exit code.
    Exec(ExecArgs),
    /// Run a command as a background job and poll it until it finishes.
    Job(JobArgs),
    /// Attach stdin/stdout to a pty session driven through read/write polling.
    Shell(ShellArgs),
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    setup_tracing();
    let cli = Cli::parse();
    let config = RuntimeConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    let runtime = ShellRuntime::new(config);

    match cli.command {
        Command::Exec(args) => exec_cmd::run(&runtime, args).await,
        Command::Job(args) => job_cmd::run(&runtime, args).await,
        Command::Shell(args) => shell_cmd::run(&runtime, args).await,
    }
}

fn setup_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}

/// Maps a child exit code onto the byte a process can return.
pub(crate) fn exit_code_byte(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
