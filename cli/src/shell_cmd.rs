use std::io::Write;
use std::process::ExitCode;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use shellport_core::ShellRuntime;
use shellport_core::SignalKind;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tracing::info;

use crate::exit_code_byte;

#[derive(Debug, Parser)]
pub(crate) struct ShellArgs {
    /// Starting directory of the shell. Defaults to the home directory.
    #[arg(long = "cwd", value_name = "DIR")]
    cwd: Option<String>,

    #[arg(long = "poll-interval-ms", value_name = "MS", default_value_t = 50)]
    poll_interval_ms: u64,

    /// How long to keep reading after stdin closes before closing the session.
    #[arg(long = "linger-ms", value_name = "MS", default_value_t = 1_000)]
    linger_ms: u64,
}

/// Forwards stdin lines to a session and prints whatever it produces until
/// the shell exits. Ctrl-C is delivered to the session as SIGINT.
pub(crate) async fn run(runtime: &ShellRuntime, args: ShellArgs) -> Result<ExitCode> {
    let sessions = runtime.sessions();
    let _sweeper = runtime.spawn_sweeper();
    let id = sessions
        .create(args.cwd.as_deref())
        .await
        .context("failed to start session")?;
    info!(session_id = %id, "attached to session");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(Duration::from_millis(args.poll_interval_ms.max(1)));
    let mut stdin_closed_at: Option<Instant> = None;
    let linger = Duration::from_millis(args.linger_ms);
    let mut stdout = std::io::stdout();

    let exit_code = loop {
        tokio::select! {
            line = lines.next_line(), if stdin_closed_at.is_none() => {
                match line? {
                    Some(line) => {
                        sessions.write(&id, &format!("{line}\n")).await;
                    }
                    None => stdin_closed_at = Some(Instant::now()),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                sessions.signal(&id, SignalKind::Interrupt).await;
            }
            _ = ticker.tick() => {
                let chunk = sessions.read(&id).await;
                stdout.write_all(chunk.output.as_bytes())?;
                stdout.flush()?;
                if !chunk.is_running {
                    // The reader thread may still be moving the last bytes.
                    tokio::time::sleep(ticker.period()).await;
                    let trailing = sessions.read(&id).await;
                    stdout.write_all(trailing.output.as_bytes())?;
                    stdout.flush()?;
                    break chunk.exit_code;
                }
                if stdin_closed_at.is_some_and(|closed| closed.elapsed() >= linger) {
                    break None;
                }
            }
        }
    };

    sessions.close(&id).await;
    Ok(exit_code.map_or(ExitCode::SUCCESS, exit_code_byte))
}
