//! Server-side liveness for one attachment.
//!
//! Pure bookkeeping: the connection task feeds it traffic timestamps and
//! polls it on a timer. Any inbound frame counts as traffic, not only `pong`.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
    /// Nothing to do yet.
    Idle,
    /// Send a `ping` probe now.
    Probe,
    /// Silent for longer than the grace window; close the attachment.
    Expired,
}

#[derive(Debug, Clone)]
pub struct Heartbeat {
    interval: Duration,
    grace: Duration,
    last_seen: Instant,
    last_probe: Instant,
}

impl Heartbeat {
    pub fn new(interval: Duration, grace: Duration, now: Instant) -> Self {
        Self {
            interval,
            grace,
            last_seen: now,
            last_probe: now,
        }
    }

    pub fn on_traffic(&mut self, now: Instant) {
        self.last_seen = now;
    }

    pub fn poll(&mut self, now: Instant) -> Beat {
        if now.saturating_duration_since(self.last_seen) >= self.grace {
            return Beat::Expired;
        }
        if now.saturating_duration_since(self.last_probe) >= self.interval {
            self.last_probe = now;
            return Beat::Probe;
        }
        Beat::Idle
    }

    /// How often the owner should call [`Heartbeat::poll`].
    pub fn tick(&self) -> Duration {
        (self.interval.min(self.grace) / 4).max(Duration::from_millis(50))
    }
}
