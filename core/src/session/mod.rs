//! Interactive shells on pseudo-terminals.

mod output_buffer;
mod pty_session;
mod registry;
mod signal;

pub use pty_session::PtySession;
pub use pty_session::SessionOutput;
pub use registry::SessionRegistry;
pub use signal::SignalKind;
