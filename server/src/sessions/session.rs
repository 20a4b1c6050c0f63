//! A single live session: one PTY process, its replay ring, and the set of
//! attachments currently subscribed to its output.
//!
//! Exactly one reader task per session drains the process output. For each
//! chunk it takes the I/O lock, appends to the ring and pushes to every
//! subscriber's queue without waiting. [`Session::subscribe`] snapshots the
//! ring and registers under the same lock, so a new attachment sees every
//! byte exactly once: buffered bytes through the replay, later bytes through
//! its queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use super::buffer::{Chunk, ReplayRing};
use crate::protocol::{CloseReason, DisplayMode};
use crate::shell::process::{
    wait_exit, InputClosed, OutputStream, ShellProcess, SpawnError, SpawnSpec,
};
use crate::util::now_ms;
use crate::ws::outbound::{AttachmentHandle, AttachmentId, Outbound, Push};

/// State shared between the reader task and attach/detach.
struct SessionIo {
    ring: ReplayRing,
    subscribers: HashMap<AttachmentId, AttachmentHandle>,
    rows: u16,
    cols: u16,
    mode: DisplayMode,
    /// Set once; a closed session accepts no new subscribers.
    closed: Option<CloseReason>,
}

/// What a new subscriber gets back from [`Session::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    /// Buffered output, oldest first.
    pub replay: Vec<Chunk>,
    pub rows: u16,
    pub cols: u16,
    pub mode: DisplayMode,
}

/// Summary row for `GET /api/sessions`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub key: String,
    pub pid: u32,
    pub cwd: String,
    pub rows: u16,
    pub cols: u16,
    pub mode: DisplayMode,
    pub attachments: usize,
    /// Epoch milliseconds.
    pub created_at: u64,
    pub idle_secs: u64,
    pub buffered_bytes: usize,
    pub exited: bool,
}

pub struct Session {
    key: String,
    cwd: String,
    created_at: u64,
    last_activity: AtomicU64,
    process: ShellProcess,
    io: Mutex<SessionIo>,
}

impl Session {
    /// Spawn the process and start the reader task.
    pub fn start(key: &str, spec: &SpawnSpec, buffer_bytes: usize) -> Result<Arc<Self>, SpawnError> {
        let mut process = ShellProcess::spawn(spec)?;
        let output = process.read();
        let exit = process.exit_watch();
        let now = now_ms();
        let session = Arc::new(Self {
            key: key.to_string(),
            cwd: spec.working_dir.clone(),
            created_at: now,
            last_activity: AtomicU64::new(now),
            process,
            io: Mutex::new(SessionIo {
                ring: ReplayRing::new(buffer_bytes),
                subscribers: HashMap::new(),
                rows: spec.rows,
                cols: spec.cols,
                mode: spec.mode,
                closed: None,
            }),
        });
        if let Some(output) = output {
            tokio::spawn(pump_output(Arc::downgrade(&session), output, exit));
        }
        Ok(session)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    pub fn touch(&self) {
        self.last_activity.store(now_ms(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Register `handle` and return the replay snapshot.
    /// Fails with the close reason if the session is already closed.
    pub async fn subscribe(&self, handle: AttachmentHandle) -> Result<Subscription, CloseReason> {
        let mut io = self.io.lock().await;
        if let Some(reason) = io.closed {
            return Err(reason);
        }
        let replay = io.ring.snapshot();
        debug!(session = %self.key, attachment = %handle.id, replay_chunks = replay.len(), "Subscriber added");
        io.subscribers.insert(handle.id, handle);
        self.touch();
        Ok(Subscription {
            replay,
            rows: io.rows,
            cols: io.cols,
            mode: io.mode,
        })
    }

    /// Remove a subscriber. The session itself is untouched.
    pub async fn unsubscribe(&self, id: AttachmentId) -> bool {
        let removed = self.io.lock().await.subscribers.remove(&id).is_some();
        if removed {
            self.touch();
        }
        removed
    }

    pub async fn attachment_count(&self) -> usize {
        self.io.lock().await.subscribers.len()
    }

    /// Forward client input to the process, in arrival order.
    pub async fn write_input(&self, bytes: Vec<u8>) -> Result<(), InputClosed> {
        self.touch();
        self.process.write(bytes).await
    }

    /// Apply a geometry change. Returns `false` if it matched the current one.
    pub async fn resize(&self, rows: u16, cols: u16) -> Result<bool, nix::Error> {
        let mut io = self.io.lock().await;
        if io.rows == rows && io.cols == cols {
            return Ok(false);
        }
        self.process.resize(rows, cols)?;
        io.rows = rows;
        io.cols = cols;
        debug!(session = %self.key, rows, cols, "Resized");
        Ok(true)
    }

    pub async fn geometry(&self) -> (u16, u16) {
        let io = self.io.lock().await;
        (io.rows, io.cols)
    }

    pub async fn mode(&self) -> DisplayMode {
        self.io.lock().await.mode
    }

    /// Change the display mode and queue `mode-sync` to every subscriber
    /// except `origin`. Queued under the I/O lock, so peers see it before
    /// any output produced after the change.
    pub async fn set_mode(&self, mode: DisplayMode, origin: AttachmentId) {
        let mut io = self.io.lock().await;
        io.mode = mode;
        if let Err(e) = self.process.signal_mode(mode) {
            warn!(session = %self.key, "Cannot signal mode change: {e}");
        }
        let peers: Vec<AttachmentId> = io.subscribers.keys().copied().filter(|id| *id != origin).collect();
        self.fan_out(&mut io, &peers, &Outbound::ModeSync(mode));
        info!(session = %self.key, %mode, peers = peers.len(), "Display mode changed");
    }

    /// Append output to the ring and push it to every subscriber.
    async fn publish(&self, bytes: &[u8]) {
        let mut io = self.io.lock().await;
        if io.closed.is_some() {
            return;
        }
        self.touch();
        let chunk = io.ring.push(bytes);
        let all: Vec<AttachmentId> = io.subscribers.keys().copied().collect();
        self.fan_out(&mut io, &all, &Outbound::Output(chunk.data));
    }

    /// Push `item` to `targets`, dropping any whose queue is full or gone.
    fn fan_out(&self, io: &mut SessionIo, targets: &[AttachmentId], item: &Outbound) {
        for id in targets {
            let Some(handle) = io.subscribers.get(id) else {
                continue;
            };
            match handle.try_push(item.clone()) {
                Push::Queued => {}
                Push::Full => {
                    warn!(session = %self.key, attachment = %id, "Outbound queue full, dropping attachment");
                    handle.kick(CloseReason::SlowConsumer);
                    io.subscribers.remove(id);
                }
                Push::Closed => {
                    io.subscribers.remove(id);
                }
            }
        }
    }

    /// Mark closed and kick every subscriber with `reason`.
    /// Returns `false` if the session was already closed.
    pub async fn close(&self, reason: CloseReason) -> bool {
        let mut io = self.io.lock().await;
        if io.closed.is_some() {
            return false;
        }
        io.closed = Some(reason);
        for (_, handle) in io.subscribers.drain() {
            handle.kick(reason);
        }
        true
    }

    /// Close if nobody is attached and nothing happened for `idle`.
    /// Atomic with respect to [`Session::subscribe`].
    pub async fn expire_if_idle(&self, now: u64, idle: Duration) -> bool {
        let mut io = self.io.lock().await;
        if io.closed.is_some() || !io.subscribers.is_empty() {
            return false;
        }
        let idle_ms = u64::try_from(idle.as_millis()).unwrap_or(u64::MAX);
        if now.saturating_sub(self.last_activity()) < idle_ms {
            return false;
        }
        io.closed = Some(CloseReason::SessionExpired);
        true
    }

    pub async fn close_reason(&self) -> Option<CloseReason> {
        self.io.lock().await.closed
    }

    /// Close with `reason`, then stop and reap the process.
    pub async fn shutdown(&self, reason: CloseReason, grace: Duration) -> Option<i32> {
        self.close(reason).await;
        self.process.terminate(grace).await
    }

    pub async fn info(&self) -> SessionInfo {
        let io = self.io.lock().await;
        SessionInfo {
            key: self.key.clone(),
            pid: self.pid(),
            cwd: self.cwd.clone(),
            rows: io.rows,
            cols: io.cols,
            mode: io.mode,
            attachments: io.subscribers.len(),
            created_at: self.created_at,
            idle_secs: now_ms().saturating_sub(self.last_activity()) / 1000,
            buffered_bytes: io.ring.len_bytes(),
            exited: io.closed.is_some() || self.process.exit_code().is_some(),
        }
    }
}

/// Output still in flight when the exit is seen gets this long to arrive.
const EXIT_DRAIN: Duration = Duration::from_millis(200);

/// Grace for background jobs the shell left behind.
const LEFTOVER_GRACE: Duration = Duration::from_secs(2);

/// The session's single reader. Ends when the process exits, even if a
/// background job still holds the PTY open.
async fn pump_output(
    session: Weak<Session>,
    mut output: OutputStream,
    mut exit: watch::Receiver<Option<i32>>,
) {
    let code = loop {
        tokio::select! {
            biased;
            chunk = output.next() => match chunk {
                Some(bytes) => {
                    let Some(session) = session.upgrade() else {
                        return;
                    };
                    session.publish(&bytes).await;
                }
                None => {
                    break tokio::time::timeout(Duration::from_secs(2), wait_exit(&mut exit))
                        .await
                        .ok()
                        .flatten();
                }
            },
            code = wait_exit(&mut exit) => {
                let deadline = tokio::time::Instant::now() + EXIT_DRAIN;
                while let Ok(Some(bytes)) = tokio::time::timeout_at(deadline, output.next()).await {
                    let Some(session) = session.upgrade() else {
                        return;
                    };
                    session.publish(&bytes).await;
                }
                break code;
            }
        }
    };
    let Some(session) = session.upgrade() else {
        return;
    };
    if session.close(CloseReason::ProcessExited).await {
        info!(session = %session.key, pid = session.pid(), ?code, "Session process exited");
    }
    drop(output);
    session.process.terminate(LEFTOVER_GRACE).await;
}
