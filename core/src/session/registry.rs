use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Instant;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;

use super::pty_session::PtySession;
use super::pty_session::SessionOutput;
use super::pty_session::SpawnRequest;
use super::signal::SignalKind;
use crate::config::SessionConfig;
use crate::error::RuntimeError;
use crate::ids::SessionId;
use crate::workdir::resolve_session_directory;

/// Authoritative map of live sessions.
///
/// Exited sessions are reclaimed lazily: every `create`, `read`, `write` and
/// `signal` first sweeps the map, recording exits and closing sessions whose
/// exit is older than the configured TTL. A registry that sees no calls does
/// not reclaim anything unless [`SessionRegistry::spawn_sweeper`] is running.
#[derive(Debug)]
pub struct SessionRegistry {
    config: SessionConfig,
    sessions: Mutex<HashMap<SessionId, Arc<PtySession>>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl SessionRegistry {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Starts a shell on a fresh pty in `working_directory` (home when `None`).
    pub async fn create(&self, working_directory: Option<&str>) -> Result<SessionId, RuntimeError> {
        self.reap_finished().await;
        let cwd = resolve_session_directory(working_directory)?;

        let id = self.unused_id().await;
        let session = PtySession::spawn(
            id.clone(),
            SpawnRequest {
                shell: &self.config.shell,
                args: &self.config.shell_args,
                cwd: &cwd,
                max_buffer_bytes: self.config.max_buffer_bytes,
            },
        )?;

        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&id) {
            drop(sessions);
            session.close(self.config.close_grace());
            return Err(RuntimeError::create_session(anyhow::anyhow!(
                "session id {id} was claimed concurrently"
            )));
        }
        sessions.insert(id.clone(), session);
        info!(session_id = %id, cwd = %cwd.display(), "session created");
        Ok(id)
    }

    /// Drains buffered output. Unknown ids read as empty and not running.
    pub async fn read(&self, id: &SessionId) -> SessionOutput {
        self.reap_finished().await;
        match self.get(id).await {
            Some(session) => session.read_output(),
            None => SessionOutput::empty(),
        }
    }

    /// Returns `false` for unknown ids; write failures are swallowed.
    pub async fn write(&self, id: &SessionId, data: &str) -> bool {
        self.reap_finished().await;
        let Some(session) = self.get(id).await else {
            return false;
        };
        session.write_input(data);
        true
    }

    /// Signals the whole process group of the session.
    pub async fn signal(&self, id: &SessionId, kind: SignalKind) -> bool {
        self.reap_finished().await;
        let Some(session) = self.get(id).await else {
            return false;
        };
        debug!(session_id = %id, signal = %kind, "signalling session");
        session.send_signal(kind);
        true
    }

    /// Terminates and removes a session. Closing an unknown id is a no-op.
    pub async fn close(&self, id: &SessionId) {
        let removed = self.sessions.lock().await.remove(id);
        if let Some(session) = removed {
            session.close(self.config.close_grace());
            info!(session_id = %id, "session closed");
        }
    }

    pub async fn has(&self, id: &SessionId) -> bool {
        self.sessions.lock().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Records exits and closes sessions whose exit is older than the TTL.
    /// Returns how many sessions were reclaimed.
    pub async fn reap_finished(&self) -> usize {
        let ttl = self.config.ttl();
        let now = Instant::now();
        let expired = {
            let mut sessions = self.sessions.lock().await;
            let mut expired = Vec::new();
            sessions.retain(|_, session| {
                session.poll_exit();
                if session.should_reap(ttl, now) {
                    expired.push(Arc::clone(session));
                    false
                } else {
                    true
                }
            });
            expired
        };

        for session in &expired {
            debug!(session_id = %session.id(), "reaping exited session");
            session.close(self.config.close_grace());
        }
        expired.len()
    }

    /// Closes every session, e.g. on shutdown.
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.sessions.lock().await.drain().collect();
        for (id, session) in drained {
            session.close(self.config.close_grace());
            debug!(session_id = %id, "session closed on shutdown");
        }
    }

    /// Runs [`SessionRegistry::reap_finished`] on the configured interval so
    /// exited sessions are reclaimed even without traffic. Returns `None`
    /// when no interval is configured. The task stops once the registry is
    /// dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let interval = self.config.sweep_interval()?;
        let registry: Weak<Self> = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let reclaimed = registry.reap_finished().await;
                if reclaimed > 0 {
                    debug!(reclaimed, "periodic sweep reclaimed sessions");
                }
            }
        }))
    }

    async fn get(&self, id: &SessionId) -> Option<Arc<PtySession>> {
        self.sessions.lock().await.get(id).cloned()
    }

    async fn unused_id(&self) -> SessionId {
        let sessions = self.sessions.lock().await;
        loop {
            let candidate = SessionId::generate();
            if !sessions.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}
