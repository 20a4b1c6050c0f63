//! Local process hosting.
//!
//! - [`pty`] - PTY allocation, spawning on the slave side, window size ioctls.
//! - [`process`] - [`process::ShellProcess`], the per-session process adapter
//!   (input, output stream, resize, display mode, terminate).

pub mod process;
pub mod pty;
