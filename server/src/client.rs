//! Client side of the reconnect contract.
//!
//! Front ends (and the integration tests) share these definitions so they
//! agree with the server on when a link is dead, how long to back off, and
//! which close reasons are worth retrying. Everything here is pure.

use std::time::Duration;

use crate::protocol::{ClientAction, CloseReason};

/// Silence, as a multiple of the server heartbeat interval, after which a
/// client should give up on the link.
pub const DEAD_LINK_FACTOR: f64 = 1.75;

/// Exponential backoff with a cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        self.initial.saturating_mul(1 << shift).min(self.max)
    }
}

/// `Connected → Reconnecting(n) → Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    /// Attempt number of the reconnect in progress.
    Reconnecting(u32),
}

impl LinkState {
    /// Connection dropped or an attempt failed.
    #[must_use]
    pub fn on_disconnect(self) -> Self {
        match self {
            Self::Connected => Self::Reconnecting(1),
            Self::Reconnecting(n) => Self::Reconnecting(n.saturating_add(1)),
        }
    }

    #[must_use]
    pub fn on_connected(self) -> Self {
        Self::Connected
    }

    /// Delay to wait before the current attempt, if reconnecting.
    pub fn backoff(self, policy: &ReconnectPolicy) -> Option<Duration> {
        match self {
            Self::Connected => None,
            Self::Reconnecting(n) => Some(policy.delay(n)),
        }
    }
}

/// Whether a forced close should trigger an automatic reconnect.
/// Auth failures need a new credential and terminal reasons need a person.
pub fn should_reconnect(reason: CloseReason) -> bool {
    reason.action() == ClientAction::Reconnect
}

/// Same as [`should_reconnect`] for a raw WebSocket close code. Unknown
/// codes (network drops, 1006) are treated as transport failures.
pub fn should_reconnect_code(code: u16) -> bool {
    CloseReason::from_ws_code(code).map_or(true, should_reconnect)
}

/// `true` once a client has heard nothing for longer than
/// [`DEAD_LINK_FACTOR`] × the server's heartbeat interval.
pub fn link_is_dead(silence: Duration, heartbeat_interval: Duration) -> bool {
    silence > heartbeat_interval.mul_f64(DEAD_LINK_FACTOR)
}
