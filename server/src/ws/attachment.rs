//! Lifecycle of one client attachment:
//! `Connecting → Attached → (Detaching | Closed)`, and `Detaching → Closed`.
//!
//! `Detaching` is the client leaving on its own; `Closed` straight from
//! `Attached` is a server-forced close with a reason. Neither touches the
//! session beyond removing the subscriber.

use std::fmt;

use tracing::{debug, info};

use super::outbound::AttachmentId;
use crate::protocol::CloseReason;
use crate::util::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachState {
    Connecting,
    Attached,
    Detaching,
    Closed,
}

impl AttachState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Attached => "attached",
            Self::Detaching => "detaching",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for AttachState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transition was requested from a state that does not allow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("attachment cannot go from {from} to {to}")]
pub struct InvalidTransition {
    pub from: AttachState,
    pub to: AttachState,
}

#[derive(Debug)]
pub struct Attachment {
    pub id: AttachmentId,
    pub session_key: String,
    state: AttachState,
    /// Epoch ms of the successful join (0 before).
    pub attached_at: u64,
    close_reason: Option<CloseReason>,
}

impl Attachment {
    pub fn new(id: AttachmentId, session_key: impl Into<String>) -> Self {
        Self {
            id,
            session_key: session_key.into(),
            state: AttachState::Connecting,
            attached_at: 0,
            close_reason: None,
        }
    }

    pub fn state(&self) -> AttachState {
        self.state
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    fn go(&mut self, to: AttachState) -> Result<(), InvalidTransition> {
        let allowed = matches!(
            (self.state, to),
            (AttachState::Connecting, AttachState::Attached | AttachState::Closed)
                | (AttachState::Attached, AttachState::Detaching | AttachState::Closed)
                | (AttachState::Detaching, AttachState::Closed)
        );
        if !allowed {
            return Err(InvalidTransition {
                from: self.state,
                to,
            });
        }
        debug!(attachment = %self.id, session = %self.session_key, from = %self.state, %to, "Attachment state");
        self.state = to;
        Ok(())
    }

    /// Subscribed and replayed.
    pub fn joined(&mut self) -> Result<(), InvalidTransition> {
        self.go(AttachState::Attached)?;
        self.attached_at = now_ms();
        info!(attachment = %self.id, session = %self.session_key, "Attached");
        Ok(())
    }

    /// Client closed or the socket dropped.
    pub fn client_left(&mut self) -> Result<(), InvalidTransition> {
        self.go(AttachState::Detaching)
    }

    /// Server-forced close (also a failed join).
    pub fn forced(&mut self, reason: CloseReason) -> Result<(), InvalidTransition> {
        self.go(AttachState::Closed)?;
        self.close_reason = Some(reason);
        info!(attachment = %self.id, session = %self.session_key, %reason, "Attachment closed");
        Ok(())
    }

    /// Subscriber removed after the client left.
    pub fn released(&mut self) -> Result<(), InvalidTransition> {
        self.go(AttachState::Closed)?;
        info!(attachment = %self.id, session = %self.session_key, "Detached");
        Ok(())
    }

    /// Leave an attached session: forced with the kick reason, otherwise
    /// through `Detaching`.
    pub fn finish(&mut self, kicked: Option<CloseReason>) -> Result<(), InvalidTransition> {
        match kicked {
            Some(reason) => self.forced(reason),
            None => {
                self.client_left()?;
                self.released()
            }
        }
    }
}
