use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use shellport_core::JobStatus;
use shellport_core::ShellRuntime;
use tracing::debug;

#[derive(Debug, Parser)]
pub(crate) struct JobArgs {
    #[arg(value_name = "COMMAND")]
    command: String,

    /// Working directory; `~` is expanded. Defaults to the home directory.
    #[arg(long = "cwd", value_name = "DIR")]
    cwd: Option<String>,

    #[arg(long = "timeout", value_name = "SECS")]
    timeout: Option<u64>,

    #[arg(long = "poll-interval-ms", value_name = "MS", default_value_t = 200)]
    poll_interval_ms: u64,
}

/// Starts the job, polls its status and prints the final snapshot as JSON.
/// Exits 0 only when the job completed.
pub(crate) async fn run(runtime: &ShellRuntime, args: JobArgs) -> Result<ExitCode> {
    let jobs = runtime.jobs();
    let exec_id = jobs
        .start(
            args.command,
            args.cwd.as_deref(),
            args.timeout.map(Duration::from_secs),
        )
        .await;

    let interval = Duration::from_millis(args.poll_interval_ms.max(10));
    let snapshot = loop {
        let snapshot = jobs
            .status(&exec_id)
            .await
            .with_context(|| format!("job {exec_id} disappeared"))?;
        if snapshot.status.is_terminal() {
            break snapshot;
        }
        debug!(exec_id = %exec_id, elapsed = snapshot.elapsed_seconds, "job still running");
        tokio::time::sleep(interval).await;
    };

    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(if snapshot.status == JobStatus::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
