//! PTY allocation, shell spawning, and terminal resize.
//!
//! Uses the `nix` crate for POSIX PTY APIs. The PTY master fd is kept alive for
//! the session lifetime so I/O and resize operations can be performed on it.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;

use nix::pty::{openpty, OpenptyResult, Winsize};
use tokio::process::{Child, Command};

/// An allocated PTY pair (master + slave).
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

fn winsize(rows: u16, cols: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

/// Allocate a PTY pair with the given terminal size.
pub fn allocate_pty(rows: u16, cols: u16) -> Result<PtyPair, nix::Error> {
    let OpenptyResult { master, slave } = openpty(&winsize(rows, cols), None)?;
    Ok(PtyPair { master, slave })
}

/// Spawn `program args…` on the slave side of the PTY.
///
/// The child becomes a session leader (and so a process group leader) with the
/// PTY slave as its controlling terminal. stdin/stdout/stderr are all
/// connected to the slave fd. `env` is merged into the inherited environment.
pub fn spawn_on_pty(
    pty: &PtyPair,
    program: &str,
    args: &[String],
    working_dir: &str,
    env: &HashMap<String, String>,
) -> std::io::Result<Child> {
    let slave_fd = pty.slave.as_raw_fd();
    let master_fd = pty.master.as_raw_fd();
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.current_dir(working_dir).kill_on_drop(true);

    // The child's stdio is handled by pre_exec (dup2 to PTY slave), so tell
    // tokio not to set up pipes.
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    cmd.envs(env);

    // SAFETY: All syscalls used here are async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(move || {
            // Create a new session so the child is the session leader
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            // Set the PTY slave as the controlling terminal
            if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            // Redirect stdin/stdout/stderr to the PTY slave
            libc::dup2(slave_fd, 0);
            libc::dup2(slave_fd, 1);
            libc::dup2(slave_fd, 2);
            if slave_fd > 2 {
                libc::close(slave_fd);
            }
            // The child never needs the master side.
            libc::close(master_fd);
            Ok(())
        });
    }

    cmd.spawn()
}

/// Resize a PTY's terminal window. The kernel delivers SIGWINCH to the
/// foreground process group.
pub fn resize_pty(master: &OwnedFd, rows: u16, cols: u16) -> Result<(), nix::Error> {
    let ws = winsize(rows, cols);
    // SAFETY: TIOCSWINSZ is a well-defined ioctl that reads a Winsize struct.
    let ret = unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCSWINSZ, std::ptr::addr_of!(ws)) };
    if ret == -1 {
        Err(nix::Error::last())
    } else {
        Ok(())
    }
}

/// Current terminal size as seen by the PTY.
#[cfg(test)]
fn pty_size(master: &OwnedFd) -> Result<(u16, u16), nix::Error> {
    let mut ws = winsize(0, 0);
    // SAFETY: TIOCGWINSZ writes a Winsize struct into `ws`.
    let ret = unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCGWINSZ, std::ptr::addr_of_mut!(ws)) };
    if ret == -1 {
        Err(nix::Error::last())
    } else {
        Ok((ws.ws_row, ws.ws_col))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_is_visible_on_master() {
        let pty = allocate_pty(24, 80).unwrap();
        assert_eq!(pty_size(&pty.master).unwrap(), (24, 80));
        resize_pty(&pty.master, 40, 120).unwrap();
        assert_eq!(pty_size(&pty.master).unwrap(), (40, 120));
    }
}
