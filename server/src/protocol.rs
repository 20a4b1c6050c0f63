//! Client ↔ bridge wire messages.
//!
//! Every control message is a JSON text frame tagged by `"type"`:
//!
//! | Type          | Direction       | Fields              |
//! |---------------|-----------------|---------------------|
//! | `input`       | client → server | `data`              |
//! | `resize`      | client → server | `rows`, `cols`      |
//! | `mode-toggle` | client → server | `mode`              |
//! | `ping`/`pong` | either          | -                   |
//! | `output`      | server → client | `data`              |
//! | `mode-sync`   | server → client | `mode`              |
//! | `close`       | server → client | `reason`, `message` |
//!
//! A binary frame from the client is raw `input`. Output is sent as text;
//! [`Utf8Decoder`] keeps multibyte characters intact across chunk boundaries.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tunnel::DialClass;

/// How much decoration the hosted program is asked to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    /// Colours, spinners, full TUI rendering.
    #[default]
    Fancy,
    /// Plain output for small screens and slow links.
    Simple,
}

impl DisplayMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fancy => "fancy",
            Self::Simple => "simple",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fancy" => Some(Self::Fancy),
            "simple" => Some(Self::Simple),
            _ => None,
        }
    }
}

impl fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Messages accepted from clients.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Input { data: String },
    Resize { rows: u16, cols: u16 },
    Ping,
    Pong,
    ModeToggle { mode: DisplayMode },
}

/// Messages sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Output { data: String },
    Ping,
    Pong,
    ModeSync { mode: DisplayMode },
    Close { reason: CloseReason, message: String },
}

/// Malformed client traffic. Closes only the offending connection.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid message: {0}")]
    InvalidMessage(#[from] serde_json::Error),
    #[error("invalid geometry {rows}x{cols}")]
    InvalidGeometry { rows: u16, cols: u16 },
}

impl ClientMessage {
    /// Parse and validate one text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let msg: Self = serde_json::from_str(text)?;
        if let Self::Resize { rows, cols } = msg {
            if rows == 0 || cols == 0 {
                return Err(ProtocolError::InvalidGeometry { rows, cols });
            }
        }
        Ok(msg)
    }
}

/// What a front end should do after a forced close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAction {
    /// Reconnect with backoff, same session key.
    Reconnect,
    /// Discard the stored credential and log in again.
    Reauthenticate,
    /// Show "process ended"; do not loop.
    Stop,
}

/// Why the server is closing an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Auth,
    HeartbeatTimeout,
    Killed,
    ProcessExited,
    SessionExpired,
    SlowConsumer,
    ProtocolError,
    SpawnFailed,
    SessionLimit,
    ProxyUnreachable,
    ProxyRejected,
    DestinationUnreachable,
    DialTimeout,
    ServerShutdown,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::Killed => "killed",
            Self::ProcessExited => "process_exited",
            Self::SessionExpired => "session_expired",
            Self::SlowConsumer => "slow_consumer",
            Self::ProtocolError => "protocol_error",
            Self::SpawnFailed => "spawn_failed",
            Self::SessionLimit => "session_limit",
            Self::ProxyUnreachable => "proxy_unreachable",
            Self::ProxyRejected => "proxy_rejected",
            Self::DestinationUnreachable => "destination_unreachable",
            Self::DialTimeout => "dial_timeout",
            Self::ServerShutdown => "server_shutdown",
        }
    }

    /// WebSocket close code (private 4000–4999 range).
    pub fn ws_code(self) -> u16 {
        match self {
            Self::Auth => 4001,
            Self::HeartbeatTimeout => 4002,
            Self::Killed => 4003,
            Self::ProcessExited => 4004,
            Self::SessionExpired => 4005,
            Self::SlowConsumer => 4006,
            Self::ProtocolError => 4007,
            Self::SpawnFailed => 4008,
            Self::SessionLimit => 4009,
            Self::ProxyUnreachable => 4010,
            Self::ProxyRejected => 4011,
            Self::DestinationUnreachable => 4012,
            Self::DialTimeout => 4013,
            Self::ServerShutdown => 4014,
        }
    }

    pub fn from_ws_code(code: u16) -> Option<Self> {
        ALL_REASONS.iter().copied().find(|r| r.ws_code() == code)
    }

    pub fn action(self) -> ClientAction {
        match self {
            Self::Auth => ClientAction::Reauthenticate,
            Self::Killed | Self::ProcessExited | Self::SpawnFailed | Self::SessionLimit => {
                ClientAction::Stop
            }
            _ => ClientAction::Reconnect,
        }
    }

    /// Short human-readable explanation sent alongside the code.
    pub fn describe(self) -> &'static str {
        match self {
            Self::Auth => "authentication failed",
            Self::HeartbeatTimeout => "no traffic within heartbeat window",
            Self::Killed => "session killed by operator",
            Self::ProcessExited => "process ended",
            Self::SessionExpired => "session reaped after idle timeout",
            Self::SlowConsumer => "connection could not keep up with output",
            Self::ProtocolError => "malformed message",
            Self::SpawnFailed => "could not start session process",
            Self::SessionLimit => "too many sessions",
            Self::ProxyUnreachable => "tunnel proxy unreachable",
            Self::ProxyRejected => "tunnel proxy rejected the connection",
            Self::DestinationUnreachable => "shell host unreachable",
            Self::DialTimeout => "timed out reaching shell host",
            Self::ServerShutdown => "server shutting down",
        }
    }
}

const ALL_REASONS: [CloseReason; 14] = [
    CloseReason::Auth,
    CloseReason::HeartbeatTimeout,
    CloseReason::Killed,
    CloseReason::ProcessExited,
    CloseReason::SessionExpired,
    CloseReason::SlowConsumer,
    CloseReason::ProtocolError,
    CloseReason::SpawnFailed,
    CloseReason::SessionLimit,
    CloseReason::ProxyUnreachable,
    CloseReason::ProxyRejected,
    CloseReason::DestinationUnreachable,
    CloseReason::DialTimeout,
    CloseReason::ServerShutdown,
];

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<DialClass> for CloseReason {
    fn from(class: DialClass) -> Self {
        match class {
            DialClass::ProxyUnreachable => Self::ProxyUnreachable,
            DialClass::HandshakeRejected => Self::ProxyRejected,
            DialClass::DestinationUnreachable => Self::DestinationUnreachable,
            DialClass::Timeout => Self::DialTimeout,
        }
    }
}

/// Incremental UTF-8 decoder for terminal output.
///
/// Trailing bytes of an incomplete character are held until the next chunk.
/// Invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    carry: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut input = std::mem::take(&mut self.carry);
        input.extend_from_slice(chunk);

        let mut out = String::with_capacity(input.len());
        let mut rest = input.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    break;
                }
                Err(e) => {
                    let (valid, tail) = rest.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    if let Some(bad) = e.error_len() {
                        out.push(char::REPLACEMENT_CHARACTER);
                        rest = &tail[bad..];
                    } else {
                        self.carry = tail.to_vec();
                        break;
                    }
                }
            }
        }
        out
    }
}
