use std::fmt;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::Instant;

use portable_pty::Child;
use portable_pty::CommandBuilder;
use portable_pty::ExitStatus;
use portable_pty::MasterPty;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use serde::Serialize;
use tracing::debug;
use tracing::warn;

use super::output_buffer::OutputBuffer;
use super::signal::SignalKind;
use crate::error::RuntimeError;
use crate::exec::EXIT_CODE_SIGNAL_BASE;
use crate::ids::SessionId;
use crate::process_group::signal_from_description;
use crate::process_group::signal_process_group;

const PTY_ROWS: u16 = 24;
const PTY_COLS: u16 = 80;
const READ_CHUNK_SIZE: usize = 4096;
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Result of draining a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionOutput {
    pub output: String,
    pub is_running: bool,
    pub exit_code: Option<i32>,
}

impl SessionOutput {
    /// What a read of an unknown (closed or reaped) session returns.
    pub fn empty() -> Self {
        Self {
            output: String::new(),
            is_running: false,
            exit_code: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExitRecord {
    code: i32,
    at: Instant,
}

/// Buffer shared with the reader; `drained` wakes a reader paused on a full
/// buffer.
#[derive(Debug)]
struct OutputChannel {
    buffer: StdMutex<OutputBuffer>,
    drained: Condvar,
}

impl OutputChannel {
    fn detach(&self) {
        lock(&self.buffer).detach();
        self.drained.notify_all();
    }
}

pub(crate) struct SpawnRequest<'a> {
    pub shell: &'a str,
    pub args: &'a [String],
    pub cwd: &'a Path,
    pub max_buffer_bytes: usize,
}

/// One shell process attached to a pseudo-terminal.
///
/// The session is the sole owner of the child and the pty master. A
/// blocking reader task moves terminal output into `output`; every other
/// operation is non-blocking.
pub struct PtySession {
    id: SessionId,
    pid: Option<u32>,
    child: StdMutex<Box<dyn Child + Send + Sync>>,
    master: StdMutex<Option<Box<dyn MasterPty + Send>>>,
    writer: StdMutex<Option<Box<dyn Write + Send>>>,
    output: Arc<OutputChannel>,
    // Exit code and exit time are recorded together, exactly once.
    exit: StdMutex<Option<ExitRecord>>,
}

impl fmt::Debug for PtySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PtySession")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("exit", &*lock(&self.exit))
            .finish_non_exhaustive()
    }
}

impl PtySession {
    pub(crate) fn spawn(id: SessionId, request: SpawnRequest<'_>) -> Result<Arc<Self>, RuntimeError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: PTY_ROWS,
                cols: PTY_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(RuntimeError::create_session)?;

        let mut command_builder = CommandBuilder::new(request.shell);
        command_builder.args(request.args);
        command_builder.cwd(request.cwd);

        // On failure the pair is dropped here, closing both ends.
        let child = pair
            .slave
            .spawn_command(command_builder)
            .map_err(RuntimeError::create_session)?;
        // The child holds its own copy of the slave; ours must go so the
        // reader sees EOF once the shell exits.
        drop(pair.slave);
        let master = pair.master;

        let (reader, writer) = match master
            .try_clone_reader()
            .and_then(|reader| Ok((reader, master.take_writer()?)))
        {
            Ok(handles) => handles,
            Err(err) => {
                discard_child(child);
                return Err(RuntimeError::create_session(err));
            }
        };

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(err) => {
                discard_child(child);
                return Err(RuntimeError::create_session(err.into()));
            }
        };
        let output = Arc::new(OutputChannel {
            buffer: StdMutex::new(OutputBuffer::new(request.max_buffer_bytes)),
            drained: Condvar::new(),
        });
        runtime.spawn_blocking({
            let output = Arc::clone(&output);
            let id = id.clone();
            move || pump_output(reader, &output, &id)
        });

        let pid = child.process_id();
        debug!(session_id = %id, pid, cwd = %request.cwd.display(), "pty session started");
        Ok(Arc::new(Self {
            id,
            pid,
            child: StdMutex::new(child),
            master: StdMutex::new(Some(master)),
            writer: StdMutex::new(Some(writer)),
            output,
            exit: StdMutex::new(None),
        }))
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn exit_code(&self) -> Option<i32> {
        lock(&self.exit).map(|record| record.code)
    }

    pub fn exited_at(&self) -> Option<Instant> {
        lock(&self.exit).map(|record| record.at)
    }

    /// Checks the child without blocking and records its exit the first time
    /// it is observed.
    pub(crate) fn poll_exit(&self) -> Option<i32> {
        let mut exit = lock(&self.exit);
        if let Some(record) = *exit {
            return Some(record.code);
        }
        let status = match lock(&self.child).try_wait() {
            Ok(Some(status)) => status,
            Ok(None) => return None,
            Err(err) => {
                warn!(session_id = %self.id, error = %err, "failed to poll session process");
                return None;
            }
        };
        let code = exit_code_of(&status);
        *exit = Some(ExitRecord {
            code,
            at: Instant::now(),
        });
        debug!(session_id = %self.id, exit_code = code, "session process exited");
        Some(code)
    }

    pub(crate) fn should_reap(&self, ttl: Duration, now: Instant) -> bool {
        lock(&self.exit)
            .is_some_and(|record| now.saturating_duration_since(record.at) >= ttl)
    }

    /// Drains everything buffered so far and reports liveness.
    pub fn read_output(&self) -> SessionOutput {
        let output = lock(&self.output.buffer).drain_text();
        self.output.drained.notify_all();
        let exit_code = self.poll_exit();
        SessionOutput {
            output,
            is_running: exit_code.is_none(),
            exit_code,
        }
    }

    /// Best-effort write to the terminal input.
    pub fn write_input(&self, data: &str) {
        let mut writer = lock(&self.writer);
        let Some(writer) = writer.as_mut() else {
            return;
        };
        if let Err(err) = writer
            .write_all(data.as_bytes())
            .and_then(|()| writer.flush())
        {
            debug!(session_id = %self.id, error = %err, "dropping write to session");
        }
    }

    pub fn send_signal(&self, kind: SignalKind) {
        self.signal_group(kind.as_raw());
    }

    /// True once the shell has been reaped and the terminal reached EOF.
    /// Nothing holds the slave then, so the group is empty and its id may
    /// already belong to an unrelated process.
    pub(crate) fn process_group_gone(&self) -> bool {
        self.exit_code().is_some() && lock(&self.output.buffer).is_closed()
    }

    /// Returns whether a signal was sent to the group.
    pub(crate) fn signal_group(&self, signal: libc::c_int) -> bool {
        let Some(pid) = self.pid else {
            return false;
        };
        if self.process_group_gone() {
            debug!(session_id = %self.id, signal, "process group already gone; not signalling");
            return false;
        }
        if let Err(err) = signal_process_group(pid, signal) {
            debug!(session_id = %self.id, pid, signal, error = %err, "process group signal not delivered");
        }
        true
    }

    /// Terminates the process group and releases the terminal.
    ///
    /// A child that ignores the termination signals is killed after `grace`
    /// and waited for on a background thread.
    pub(crate) fn close(self: &Arc<Self>, grace: Duration) {
        // Interactive shells ignore SIGTERM but honor a hangup.
        self.signal_group(libc::SIGHUP);
        self.signal_group(libc::SIGTERM);
        let exited = self.poll_exit().is_some();

        lock(&self.writer).take();
        self.output.detach();
        if lock(&self.master).take().is_some() {
            debug!(session_id = %self.id, "released pty master");
        }

        if exited {
            return;
        }
        let session = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name(format!("pty-reaper-{}", self.id))
            .spawn(move || session.reap_blocking(grace));
        if let Err(err) = spawned {
            warn!(session_id = %self.id, error = %err, "failed to start reaper; killing session immediately");
            self.reap_blocking(Duration::ZERO);
        }
    }

    fn reap_blocking(&self, grace: Duration) {
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if self.poll_exit().is_some() {
                return;
            }
            std::thread::sleep(REAP_POLL_INTERVAL);
        }
        if self.poll_exit().is_some() {
            return;
        }

        self.signal_group(libc::SIGKILL);
        let waited = lock(&self.child).wait();
        match waited {
            Ok(status) => {
                let mut exit = lock(&self.exit);
                if exit.is_none() {
                    *exit = Some(ExitRecord {
                        code: exit_code_of(&status),
                        at: Instant::now(),
                    });
                }
                debug!(session_id = %self.id, "session process killed after grace period");
            }
            Err(err) => warn!(session_id = %self.id, error = %err, "failed to reap session process"),
        }
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        let exited = self
            .exit
            .get_mut()
            .is_ok_and(|exit| exit.is_some());
        self.output.detach();
        if exited {
            return;
        }
        self.signal_group(libc::SIGKILL);
        let child = self.child.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = child.kill() {
            debug!(session_id = %self.id, error = %err, "dropped session already exited");
        }
        if let Err(err) = child.wait() {
            debug!(session_id = %self.id, error = %err, "failed to reap dropped session");
        }
    }
}

fn pump_output(mut reader: Box<dyn Read + Send>, output: &OutputChannel, session_id: &SessionId) {
    let mut buf = [0u8; READ_CHUNK_SIZE];
    loop {
        // Stop pulling from the pty while the buffer is full so the shell
        // blocks on its writes instead of output being discarded.
        {
            let mut buffer = lock(&output.buffer);
            while buffer.is_full() && !buffer.is_detached() {
                buffer = output
                    .drained
                    .wait(buffer)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            if buffer.is_detached() {
                debug!(%session_id, "pty reader detached");
                return;
            }
        }
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => lock(&output.buffer).push_chunk(buf[..n].to_vec()),
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(5));
                continue;
            }
            // Linux reports EIO once the slave side is gone.
            Err(err) => {
                debug!(%session_id, error = %err, "pty reader finished");
                break;
            }
        }
    }
    lock(&output.buffer).mark_closed();
}

/// Exit code in shell convention: a signal death reads as 128 + signal.
fn exit_code_of(status: &ExitStatus) -> i32 {
    match status.signal().and_then(signal_from_description) {
        Some(signal) => EXIT_CODE_SIGNAL_BASE + signal,
        None => status.exit_code() as i32,
    }
}

fn discard_child(mut child: Box<dyn Child + Send + Sync>) {
    if let Err(err) = child.kill() {
        debug!(error = %err, "failed to kill partially created session");
    }
    if let Err(err) = child.wait() {
        debug!(error = %err, "failed to reap partially created session");
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
