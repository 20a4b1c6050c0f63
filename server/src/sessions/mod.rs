//! Session registry.
//!
//! [`SessionRegistry`] is the single owner of the key → session map. Nothing
//! else inserts or removes sessions; handlers get an `Arc<Session>` and talk
//! to it through its own narrow API.
//!
//! ## Concurrency
//!
//! The map sits behind an `RwLock`: attaching to an existing session only
//! takes the read lock. Creation is serialized per key by a small gate mutex,
//! so two clients racing on the same new key spawn exactly one process while
//! other keys proceed independently. Processes are spawned and terminated
//! outside the map lock.

pub mod buffer;
pub mod session;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::protocol::{CloseReason, DisplayMode};
use crate::shell::process::{SpawnError, SpawnSpec};
use crate::util::{expand_tilde, now_ms};
use crate::ws::outbound::AttachmentHandle;
use session::{Session, SessionInfo, Subscription};

/// Grace between SIGHUP and SIGKILL when a session is torn down.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Subscribe attempts before giving up on a session that keeps closing
/// underneath us.
const ATTACH_ATTEMPTS: usize = 3;

/// Longest accepted session key.
pub const MAX_KEY_LEN: usize = 128;

/// Errors surfaced to the caller of [`SessionRegistry::get_or_create`].
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid session key")]
    InvalidKey,
    #[error("session limit reached ({0})")]
    SessionLimit(usize),
    #[error(transparent)]
    SpawnFailed(#[from] SpawnError),
    #[error("session closed while attaching: {0}")]
    Closed(CloseReason),
}

impl SessionError {
    pub fn close_reason(&self) -> CloseReason {
        match self {
            Self::InvalidKey => CloseReason::ProtocolError,
            Self::SessionLimit(_) => CloseReason::SessionLimit,
            Self::SpawnFailed(_) => CloseReason::SpawnFailed,
            Self::Closed(reason) => *reason,
        }
    }
}

/// Events produced by [`SessionRegistry::sweep`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepEvent {
    /// Reaped after the idle timeout with nobody attached.
    Expired(String),
    /// Process had already exited; entry removed.
    Exited(String),
}

/// Creation parameters for a session that does not exist yet.
/// Ignored when the key is already live.
#[derive(Debug, Clone, Default)]
pub struct SessionRequest {
    pub cwd: Option<String>,
    pub mode: DisplayMode,
    pub rows: Option<u16>,
    pub cols: Option<u16>,
}

/// Settings copied out of [`Config`] at startup.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub program: String,
    pub args: Vec<String>,
    pub default_working_dir: String,
    pub default_rows: u16,
    pub default_cols: u16,
    pub max_sessions: usize,
    pub buffer_bytes: usize,
    pub idle_timeout: Duration,
    /// Where display-mode control files go. `None` disables live mode switching.
    pub runtime_dir: Option<PathBuf>,
}

impl RegistrySettings {
    pub fn from_config(config: &Config) -> Self {
        let runtime_dir = config.runtime_dir();
        let runtime_dir = match std::fs::create_dir_all(&runtime_dir) {
            Ok(()) => Some(runtime_dir),
            Err(e) => {
                warn!("Cannot create runtime dir {}: {e}; live mode switching disabled", runtime_dir.display());
                None
            }
        };
        Self {
            program: config.shell.command.clone(),
            args: config.shell.args.clone(),
            default_working_dir: config.shell.default_working_dir.clone(),
            default_rows: config.server.default_terminal_rows,
            default_cols: config.server.default_terminal_cols,
            max_sessions: config.session.max_sessions,
            buffer_bytes: config.session.buffer_bytes,
            idle_timeout: Duration::from_secs(config.session.idle_timeout_secs),
            runtime_dir,
        }
    }
}

/// Owns every live session. Cloneable; clones share state.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    gates: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
    /// Creations admitted past the limit check but not yet inserted.
    pending: Arc<AtomicUsize>,
    settings: Arc<RegistrySettings>,
}

/// `true` if `key` is 1–128 chars of `[A-Za-z0-9._-]`.
pub fn validate_session_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

impl SessionRegistry {
    pub fn new(settings: RegistrySettings) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            gates: Arc::new(StdMutex::new(HashMap::new())),
            pending: Arc::new(AtomicUsize::new(0)),
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Live session for `key`, if any.
    pub async fn get(&self, key: &str) -> Option<Arc<Session>> {
        let session = self.sessions.read().await.get(key).cloned()?;
        if session.close_reason().await.is_some() {
            return None;
        }
        Some(session)
    }

    /// Return the live session for `key`, spawning it if needed.
    ///
    /// Concurrent calls for the same key spawn at most one process. Spawn
    /// failures are returned, never retried.
    pub async fn get_or_create(
        &self,
        key: &str,
        request: &SessionRequest,
    ) -> Result<Arc<Session>, SessionError> {
        if !validate_session_key(key) {
            return Err(SessionError::InvalidKey);
        }
        if let Some(session) = self.get(key).await {
            return Ok(session);
        }

        let gate = self.gate(key);
        let result = {
            let _creating = gate.lock().await;
            self.create_locked(key, request).await
        };
        self.release_gate(key, gate);
        result
    }

    /// Body of [`Self::get_or_create`], run while holding the key's gate.
    async fn create_locked(
        &self,
        key: &str,
        request: &SessionRequest,
    ) -> Result<Arc<Session>, SessionError> {
        {
            let mut sessions = self.sessions.write().await;
            if let Some(existing) = sessions.get(key).cloned() {
                if existing.close_reason().await.is_none() {
                    return Ok(existing);
                }
                sessions.remove(key);
            }
            let in_use = sessions.len() + self.pending.load(Ordering::SeqCst);
            if in_use >= self.settings.max_sessions {
                warn!(session = key, "Session limit reached ({})", self.settings.max_sessions);
                return Err(SessionError::SessionLimit(self.settings.max_sessions));
            }
            self.pending.fetch_add(1, Ordering::SeqCst);
        }

        let spec = self.spawn_spec(key, request);
        let spawned = Session::start(key, &spec, self.settings.buffer_bytes);

        let mut sessions = self.sessions.write().await;
        self.pending.fetch_sub(1, Ordering::SeqCst);
        let session = match spawned {
            Ok(session) => session,
            Err(e) => {
                warn!(session = key, "Spawn failed: {e}");
                return Err(e.into());
            }
        };
        sessions.insert(key.to_string(), Arc::clone(&session));
        info!(
            session = key,
            pid = session.pid(),
            cwd = %spec.working_dir,
            mode = %spec.mode,
            "Session created, total: {}",
            sessions.len()
        );
        Ok(session)
    }

    fn spawn_spec(&self, key: &str, request: &SessionRequest) -> SpawnSpec {
        let cwd = request
            .cwd
            .as_deref()
            .filter(|c| !c.is_empty())
            .unwrap_or(&self.settings.default_working_dir);
        SpawnSpec {
            program: self.settings.program.clone(),
            args: self.settings.args.clone(),
            working_dir: expand_tilde(cwd).into_owned(),
            rows: request.rows.filter(|r| *r > 0).unwrap_or(self.settings.default_rows),
            cols: request.cols.filter(|c| *c > 0).unwrap_or(self.settings.default_cols),
            mode: request.mode,
            mode_file: self
                .settings
                .runtime_dir
                .as_ref()
                .map(|dir| dir.join(format!("{key}.{}.mode", Uuid::new_v4().simple()))),
        }
    }

    fn gate(&self, key: &str) -> Arc<Mutex<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(gates.entry(key.to_string()).or_default())
    }

    fn release_gate(&self, key: &str, gate: Arc<Mutex<()>>) {
        let mut gates = self.gates.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        // map + ours: nobody else is waiting on it
        if Arc::strong_count(&gate) <= 2 {
            gates.remove(key);
        }
    }

    /// Resolve or create the session and subscribe `handle` to it.
    ///
    /// If the session closes between lookup and subscribe (exit, sweep,
    /// kill), the lookup is repeated so the caller lands on a fresh process.
    pub async fn attach(
        &self,
        key: &str,
        request: &SessionRequest,
        handle: &AttachmentHandle,
    ) -> Result<(Arc<Session>, Subscription), SessionError> {
        let mut last = CloseReason::ProcessExited;
        for _ in 0..ATTACH_ATTEMPTS {
            let session = self.get_or_create(key, request).await?;
            match session.subscribe(handle.clone()).await {
                Ok(sub) => return Ok((session, sub)),
                Err(reason) => last = reason,
            }
        }
        Err(SessionError::Closed(last))
    }

    /// Terminate and remove `key`. Attached clients are closed with `killed`.
    /// Returns `false` if there was no such session.
    pub async fn kill(&self, key: &str) -> bool {
        let Some(session) = self.sessions.write().await.remove(key) else {
            return false;
        };
        let code = session.shutdown(CloseReason::Killed, KILL_GRACE).await;
        info!(session = key, ?code, "Session killed");
        true
    }

    /// Terminate every session (graceful shutdown).
    pub async fn kill_all(&self) {
        let drained: Vec<Arc<Session>> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        if drained.is_empty() {
            return;
        }
        let count = drained.len();
        futures::future::join_all(
            drained
                .iter()
                .map(|s| s.shutdown(CloseReason::ServerShutdown, KILL_GRACE)),
        )
        .await;
        info!("Shut down {count} session(s)");
    }

    /// Reap idle and exited sessions.
    pub async fn sweep(&self) -> Vec<SweepEvent> {
        let snapshot: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let now = now_ms();
        let mut expired = Vec::new();
        let mut exited = Vec::new();
        for session in snapshot {
            if session.close_reason().await.is_some() {
                exited.push(session);
            } else if session.expire_if_idle(now, self.settings.idle_timeout).await {
                expired.push(session);
            }
        }
        if expired.is_empty() && exited.is_empty() {
            return Vec::new();
        }

        {
            let mut sessions = self.sessions.write().await;
            for session in expired.iter().chain(exited.iter()) {
                if sessions
                    .get(session.key())
                    .is_some_and(|current| Arc::ptr_eq(current, session))
                {
                    sessions.remove(session.key());
                }
            }
        }

        let mut events = Vec::with_capacity(expired.len() + exited.len());
        for session in exited {
            info!(session = session.key(), "Removed exited session");
            events.push(SweepEvent::Exited(session.key().to_string()));
        }
        for session in expired {
            session.shutdown(CloseReason::SessionExpired, KILL_GRACE).await;
            info!(session = session.key(), "Session reaped after idle timeout");
            events.push(SweepEvent::Expired(session.key().to_string()));
        }
        events
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let snapshot: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(snapshot.len());
        for session in snapshot {
            out.push(session.info().await);
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.key.cmp(&b.key)));
        out
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
