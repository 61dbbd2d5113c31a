use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use shellport_core::ShellRuntime;

use crate::exit_code_byte;

#[derive(Debug, Parser)]
pub(crate) struct ExecArgs {
    /// Shell command, run with `sh -c`.
    #[arg(value_name = "COMMAND")]
    command: String,

    #[arg(long = "cwd", value_name = "DIR")]
    cwd: Option<PathBuf>,

    /// Seconds before the command is killed; defaults to the configured timeout.
    #[arg(long = "timeout", value_name = "SECS")]
    timeout: Option<u64>,

    /// Print `{stdout, stderr, exit_code}` as JSON instead of mirroring the streams.
    #[arg(long = "json")]
    json: bool,
}

pub(crate) async fn run(runtime: &ShellRuntime, args: ExecArgs) -> Result<ExitCode> {
    let output = runtime
        .run(
            &args.command,
            args.cwd.as_deref(),
            args.timeout.map(Duration::from_secs),
        )
        .await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        std::io::stdout().write_all(output.stdout.as_bytes())?;
        std::io::stderr().write_all(output.stderr.as_bytes())?;
    }
    Ok(exit_code_byte(output.exit_code))
}
