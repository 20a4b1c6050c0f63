//! PTY-backed interactive process owned by one session.
//!
//! [`ShellProcess`] spawns the configured program on a fresh PTY and runs two
//! background tasks: an input writer (mpsc → PTY master) and an exit watcher
//! (`child.wait()` → `watch`). Output is not read here; [`ShellProcess::read`]
//! hands out a one-shot stream over the master so the owning session can run
//! exactly one reader.
//!
//! ## Display mode
//!
//! The program learns its display mode from the environment at spawn
//! (`TERMBRIDGE_DISPLAY_MODE`, plus `NO_COLOR=1` in simple mode). A live mode
//! change is written to the file named by `TERMBRIDGE_MODE_FILE` and announced
//! with SIGWINCH to the process group, which programs ignore by default.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::pty;
use crate::protocol::DisplayMode;

/// Read size for PTY output chunks.
const READ_CHUNK: usize = 4096;

/// Everything needed to start one session process.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: String,
    pub rows: u16,
    pub cols: u16,
    pub mode: DisplayMode,
    /// Control file for live mode changes. `None` disables live switching.
    pub mode_file: Option<PathBuf>,
}

/// Why a process could not be started.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("working directory {0} does not exist")]
    WorkingDir(String),
    #[error("failed to allocate PTY: {0}")]
    Pty(#[from] nix::Error),
    #[error("failed to duplicate PTY master: {0}")]
    Dup(std::io::Error),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// The input side is gone (process exited or was terminated).
#[derive(Debug, thiserror::Error)]
#[error("process input closed")]
pub struct InputClosed;

/// Lazy stream of output chunks; ends when the process side of the PTY closes.
pub type OutputStream = BoxStream<'static, Vec<u8>>;

/// One interactive process bound to a PTY.
pub struct ShellProcess {
    pid: u32,
    master: OwnedFd,
    input_tx: mpsc::Sender<Vec<u8>>,
    output: Option<tokio::fs::File>,
    exit_rx: watch::Receiver<Option<i32>>,
    mode_file: Option<PathBuf>,
    tasks: Vec<JoinHandle<()>>,
}

/// Environment describing `mode` to the hosted program.
pub fn mode_env(mode: DisplayMode, mode_file: Option<&Path>) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("TERM".to_string(), "xterm-256color".to_string());
    env.insert("TERMBRIDGE_DISPLAY_MODE".to_string(), mode.as_str().to_string());
    match mode {
        DisplayMode::Simple => {
            env.insert("NO_COLOR".to_string(), "1".to_string());
        }
        DisplayMode::Fancy => {
            env.insert("COLORTERM".to_string(), "truecolor".to_string());
        }
    }
    if let Some(path) = mode_file {
        env.insert(
            "TERMBRIDGE_MODE_FILE".to_string(),
            path.to_string_lossy().into_owned(),
        );
    }
    env
}

fn dup_fd(fd: RawFd) -> Result<tokio::fs::File, SpawnError> {
    // SAFETY: dup returns a new descriptor that we exclusively own.
    let new_fd = unsafe { libc::dup(fd) };
    if new_fd < 0 {
        return Err(SpawnError::Dup(std::io::Error::last_os_error()));
    }
    // SAFETY: `new_fd` is a valid, owned descriptor.
    Ok(tokio::fs::File::from_std(unsafe {
        std::fs::File::from_raw_fd(new_fd)
    }))
}

impl ShellProcess {
    /// Allocate a PTY and start `spec.program` on it.
    pub fn spawn(spec: &SpawnSpec) -> Result<Self, SpawnError> {
        if !Path::new(&spec.working_dir).is_dir() {
            return Err(SpawnError::WorkingDir(spec.working_dir.clone()));
        }

        if let Some(ref path) = spec.mode_file {
            if let Err(e) = std::fs::write(path, spec.mode.as_str()) {
                warn!("Cannot write mode file {}: {e}", path.display());
            }
        }

        let pair = pty::allocate_pty(spec.rows, spec.cols)?;
        let env = mode_env(spec.mode, spec.mode_file.as_deref());
        let mut child = pty::spawn_on_pty(&pair, &spec.program, &spec.args, &spec.working_dir, &env)
            .map_err(|source| SpawnError::Spawn {
                program: spec.program.clone(),
                source,
            })?;
        let pty::PtyPair { master, slave } = pair;
        // Only the child keeps the slave open, so the master sees EOF when it exits.
        drop(slave);

        let pid = child.id().unwrap_or(0);
        let writer = dup_fd(master.as_raw_fd())?;
        let reader = dup_fd(master.as_raw_fd())?;

        // input writer task: mpsc → PTY master (write side)
        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(64);
        let input_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(data) = input_rx.recv().await {
                if writer.write_all(&data).await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
        });

        // exit watcher task
        let (exit_tx, exit_rx) = watch::channel(None);
        let exit_task = tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    warn!("pid {pid}: wait error: {e}");
                    -1
                }
            };
            debug!("pid {pid} exited with code {code}");
            let _ = exit_tx.send(Some(code));
        });

        info!(pid, program = %spec.program, cwd = %spec.working_dir, mode = %spec.mode, "Spawned PTY process");

        Ok(Self {
            pid,
            master,
            input_tx,
            output: Some(reader),
            exit_rx,
            mode_file: spec.mode_file.clone(),
            tasks: vec![input_task, exit_task],
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Forward raw bytes to the process input. No framing is added.
    pub async fn write(&self, bytes: Vec<u8>) -> Result<(), InputClosed> {
        self.input_tx.send(bytes).await.map_err(|_| InputClosed)
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), nix::Error> {
        pty::resize_pty(&self.master, rows, cols)
    }

    /// Take the output stream. Returns `None` on every call after the first.
    pub fn read(&mut self) -> Option<OutputStream> {
        let file = self.output.take()?;
        Some(
            stream::unfold(file, |mut file| async move {
                let mut buf = vec![0u8; READ_CHUNK];
                match file.read(&mut buf).await {
                    // EIO once the slave side is closed
                    Ok(0) | Err(_) => None,
                    Ok(n) => {
                        buf.truncate(n);
                        Some((buf, file))
                    }
                }
            })
            .boxed(),
        )
    }

    /// Tell the running program about a display-mode change.
    pub fn signal_mode(&self, mode: DisplayMode) -> std::io::Result<()> {
        let Some(ref path) = self.mode_file else {
            return Ok(());
        };
        std::fs::write(path, mode.as_str())?;
        self.signal_group(libc::SIGWINCH);
        Ok(())
    }

    /// Exit code, once the process has been reaped.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_rx.borrow()
    }

    /// Receiver for the exit code, for waiting without borrowing `self`.
    pub fn exit_watch(&self) -> watch::Receiver<Option<i32>> {
        self.exit_rx.clone()
    }

    /// Wait until the process has exited and been reaped.
    pub async fn wait(&self) -> Option<i32> {
        wait_exit(&mut self.exit_rx.clone()).await
    }

    /// Stop the process and anything it left behind in its session.
    ///
    /// SIGHUP the process group, give it `grace` to exit, then SIGKILL and
    /// reap. Background jobs still in the shell's session get the same
    /// treatment, even when the shell itself already exited. Returns the exit
    /// code if the process was reaped.
    pub async fn terminate(&self, grace: Duration) -> Option<i32> {
        let code = match self.exit_code() {
            Some(code) => Some(code),
            None => self.stop_leader(grace).await,
        };
        self.hangup_leftovers(grace).await;
        code
    }

    async fn stop_leader(&self, grace: Duration) -> Option<i32> {
        self.signal_group(libc::SIGHUP);
        self.signal_group(libc::SIGCONT);
        if let Ok(code) = tokio::time::timeout(grace, self.wait()).await {
            return code;
        }
        warn!(pid = self.pid, "Process ignored SIGHUP, sending SIGKILL");
        self.signal_group(libc::SIGKILL);
        tokio::time::timeout(Duration::from_secs(2), self.wait())
            .await
            .ok()
            .flatten()
    }

    async fn hangup_leftovers(&self, grace: Duration) {
        let members = session_members(self.pid);
        if members.is_empty() {
            return;
        }
        debug!(pid = self.pid, leftovers = members.len(), "Hanging up background jobs");
        for pid in &members {
            signal_pid(*pid, libc::SIGHUP);
            signal_pid(*pid, libc::SIGCONT);
        }
        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if session_members(self.pid).is_empty() {
                return;
            }
        }
        let stubborn = session_members(self.pid);
        warn!(pid = self.pid, leftovers = stubborn.len(), "Background jobs ignored SIGHUP, sending SIGKILL");
        for pid in stubborn {
            signal_pid(pid, libc::SIGKILL);
        }
    }

    fn signal_group(&self, signal: i32) {
        #[allow(clippy::cast_possible_wrap)]
        let pgid = self.pid as i32;
        if pgid > 0 {
            // SAFETY: kill(2) with a negative pid targets the process group.
            unsafe {
                libc::kill(-pgid, signal);
            }
        }
    }
}

/// Wait on an exit watch until a code is published.
pub async fn wait_exit(rx: &mut watch::Receiver<Option<i32>>) -> Option<i32> {
    loop {
        let current = *rx.borrow_and_update();
        if current.is_some() {
            return current;
        }
        if rx.changed().await.is_err() {
            return *rx.borrow();
        }
    }
}

fn signal_pid(pid: i32, signal: i32) {
    // SAFETY: kill(2) has no memory-safety preconditions.
    unsafe {
        libc::kill(pid, signal);
    }
}

/// Pids whose session id is `leader`, from `/proc`. Empty where `/proc` is
/// not available.
fn session_members(leader: u32) -> Vec<i32> {
    let Ok(leader) = i32::try_from(leader) else {
        return Vec::new();
    };
    if leader <= 0 {
        return Vec::new();
    }
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
        .filter(|pid| proc_session_id(*pid) == Some(leader))
        .collect()
}

fn proc_session_id(pid: i32) -> Option<i32> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // comm may contain spaces; fields after it are: state ppid pgrp session
    let mut fields = stat.get(stat.rfind(')')? + 1..)?.split_whitespace();
    if fields.next()? == "Z" {
        return None;
    }
    fields.nth(2)?.parse().ok()
}

impl Drop for ShellProcess {
    fn drop(&mut self) {
        // background jobs would keep the slave open and the reader blocked
        if self.exit_code().is_none() {
            self.signal_group(libc::SIGKILL);
        }
        for pid in session_members(self.pid) {
            signal_pid(pid, libc::SIGKILL);
        }
        for task in &self.tasks {
            task.abort();
        }
        if let Some(ref path) = self.mode_file {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(program: &str, args: &[&str]) -> SpawnSpec {
        SpawnSpec {
            program: program.to_string(),
            args: args.iter().map(ToString::to_string).collect(),
            working_dir: "/tmp".to_string(),
            rows: 24,
            cols: 80,
            mode: DisplayMode::Fancy,
            mode_file: None,
        }
    }

    async fn read_until(out: &mut OutputStream, needle: &str) -> String {
        let mut seen = String::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(chunk) = out.next().await {
                seen.push_str(&String::from_utf8_lossy(&chunk));
                if seen.contains(needle) {
                    break;
                }
            }
        })
        .await
        .expect("timed out waiting for output");
        seen
    }

    #[test]
    fn simple_mode_env_disables_colour() {
        let env = mode_env(DisplayMode::Simple, Some(Path::new("/tmp/x.mode")));
        assert_eq!(env["NO_COLOR"], "1");
        assert_eq!(env["TERMBRIDGE_DISPLAY_MODE"], "simple");
        assert_eq!(env["TERMBRIDGE_MODE_FILE"], "/tmp/x.mode");
        assert!(!env.contains_key("COLORTERM"));

        let env = mode_env(DisplayMode::Fancy, None);
        assert_eq!(env["COLORTERM"], "truecolor");
        assert!(!env.contains_key("NO_COLOR"));
    }

    #[tokio::test]
    async fn write_reaches_process_and_output_streams_back() {
        let mut proc = ShellProcess::spawn(&spec("/bin/sh", &[])).unwrap();
        let mut out = proc.read().unwrap();
        assert!(proc.read().is_none(), "output stream is one-shot");

        proc.write(b"echo marker-$((6*7))\n".to_vec()).await.unwrap();
        let seen = read_until(&mut out, "marker-42").await;
        assert!(seen.contains("marker-42"));
        proc.terminate(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn resize_is_seen_by_program() {
        let mut proc = ShellProcess::spawn(&spec("/bin/sh", &[])).unwrap();
        let mut out = proc.read().unwrap();
        proc.resize(40, 120).unwrap();
        proc.write(b"stty size\n".to_vec()).await.unwrap();
        let seen = read_until(&mut out, "40 120").await;
        assert!(seen.contains("40 120"));
        proc.terminate(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn terminate_reaps_and_ends_output() {
        let mut proc = ShellProcess::spawn(&spec("/bin/sh", &[])).unwrap();
        let mut out = proc.read().unwrap();
        proc.terminate(Duration::from_secs(2)).await;
        assert!(proc.exit_code().is_some());
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while out.next().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok(), "output stream ends after exit");
    }

    #[tokio::test]
    async fn terminate_hangs_up_background_jobs() {
        let mut proc = ShellProcess::spawn(&spec("/bin/sh", &[])).unwrap();
        let mut out = proc.read().unwrap();
        proc.write(b"sleep 30 & echo job-$((4+4))\n".to_vec()).await.unwrap();
        read_until(&mut out, "job-8").await;
        proc.write(b"exit\n".to_vec()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), proc.wait())
            .await
            .expect("shell did not exit");

        proc.terminate(Duration::from_secs(2)).await;
        assert!(session_members(proc.pid()).is_empty());
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while out.next().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok(), "output stream ends once the job is gone");
    }

    #[tokio::test]
    async fn missing_working_dir_fails_spawn() {
        let mut s = spec("/bin/sh", &[]);
        s.working_dir = "/definitely/not/here".into();
        assert!(matches!(
            ShellProcess::spawn(&s),
            Err(SpawnError::WorkingDir(_))
        ));
    }

    #[tokio::test]
    async fn missing_program_fails_spawn() {
        let s = spec("/definitely/not/a/shell", &[]);
        assert!(matches!(
            ShellProcess::spawn(&s),
            Err(SpawnError::Spawn { .. })
        ));
    }
}
