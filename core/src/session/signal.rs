use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::error::RuntimeError;

/// Signals a client may deliver to a session's process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Hangup,
    Interrupt,
    Quit,
    Kill,
    Terminate,
    Stop,
    Continue,
    User1,
    User2,
}

impl SignalKind {
    pub const ALL: [SignalKind; 9] = [
        SignalKind::Hangup,
        SignalKind::Interrupt,
        SignalKind::Quit,
        SignalKind::Kill,
        SignalKind::Terminate,
        SignalKind::Stop,
        SignalKind::Continue,
        SignalKind::User1,
        SignalKind::User2,
    ];

    pub fn as_raw(self) -> libc::c_int {
        match self {
            SignalKind::Hangup => libc::SIGHUP,
            SignalKind::Interrupt => libc::SIGINT,
            SignalKind::Quit => libc::SIGQUIT,
            SignalKind::Kill => libc::SIGKILL,
            SignalKind::Terminate => libc::SIGTERM,
            SignalKind::Stop => libc::SIGSTOP,
            SignalKind::Continue => libc::SIGCONT,
            SignalKind::User1 => libc::SIGUSR1,
            SignalKind::User2 => libc::SIGUSR2,
        }
    }

    /// Conventional short name without the `SIG` prefix.
    pub fn short_name(self) -> &'static str {
        match self {
            SignalKind::Hangup => "HUP",
            SignalKind::Interrupt => "INT",
            SignalKind::Quit => "QUIT",
            SignalKind::Kill => "KILL",
            SignalKind::Terminate => "TERM",
            SignalKind::Stop => "STOP",
            SignalKind::Continue => "CONT",
            SignalKind::User1 => "USR1",
            SignalKind::User2 => "USR2",
        }
    }

    fn long_name(self) -> &'static str {
        match self {
            SignalKind::Hangup => "hangup",
            SignalKind::Interrupt => "interrupt",
            SignalKind::Quit => "quit",
            SignalKind::Kill => "kill",
            SignalKind::Terminate => "terminate",
            SignalKind::Stop => "stop",
            SignalKind::Continue => "continue",
            SignalKind::User1 => "user1",
            SignalKind::User2 => "user2",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIG{}", self.short_name())
    }
}

impl FromStr for SignalKind {
    type Err = RuntimeError;

    /// Accepts `SIGINT`, `INT` and `interrupt`, case-insensitively.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let upper = raw.trim().to_ascii_uppercase();
        let short = upper.strip_prefix("SIG").unwrap_or(&upper);
        SignalKind::ALL
            .into_iter()
            .find(|kind| kind.short_name() == short || kind.long_name().eq_ignore_ascii_case(short))
            .ok_or_else(|| RuntimeError::UnknownSignal {
                name: raw.to_string(),
            })
    }
}
