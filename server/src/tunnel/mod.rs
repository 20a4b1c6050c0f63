//! Outbound connectivity to the shell host.
//!
//! - [`dialer`] - opens byte streams directly or through a SOCKS5 proxy, with
//!   one bounded timeout and a classified failure taxonomy.
//! - [`relay`] - remote mode: pipes a browser WebSocket to the shell host's
//!   own termbridge over a dialed stream.
//! - [`http`] - proxies editor HTTP requests over a dialed stream.

pub mod dialer;
pub mod http;
pub mod relay;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{json, Value};

pub use dialer::{Dialer, TunnelStream};

/// How to reach one remote resource.
///
/// Immutable for the duration of a dial attempt. The destination host is a
/// name, resolved (by us or by the proxy) on every attempt, so an address
/// change is picked up between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRoute {
    pub host: String,
    pub port: u16,
    /// SOCKS5 endpoint (`host:port`). `None` dials the destination directly.
    pub proxy: Option<String>,
    /// Bound on the whole dial sequence.
    pub dial_timeout: Duration,
    pub retry: RetryPolicy,
}

impl TunnelRoute {
    /// A direct route with no retries.
    pub fn direct(host: impl Into<String>, port: u16, dial_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            proxy: None,
            dial_timeout,
            retry: RetryPolicy::none(),
        }
    }

    /// Same route through `proxy`.
    #[must_use]
    pub fn via(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// `host:port` of the destination.
    pub fn destination(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Attempts made by [`Dialer::dial_with_retry`]. Each attempt gets the full
/// dial timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, at least 1.
    pub max_attempts: u32,
    /// Pause before the second attempt; doubles per attempt.
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Single attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }

    pub fn attempts(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Pause before attempt number `attempt` (1-based; the first attempt never waits).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let shift = (attempt - 2).min(16);
        self.backoff.saturating_mul(1 << shift)
    }
}

/// Which step of the dial sequence was running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialStage {
    /// TCP connect to the SOCKS5 proxy.
    ProxyConnect,
    /// SOCKS5 method negotiation and CONNECT request.
    Handshake,
    /// TCP connect straight to the destination (direct routes).
    DestinationConnect,
}

impl DialStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProxyConnect => "proxy_connect",
            Self::Handshake => "handshake",
            Self::DestinationConnect => "destination_connect",
        }
    }
}

impl fmt::Display for DialStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure class, used for logging, counters and client close reasons.
///
/// Each class points at a different fix: the overlay network / VPN for
/// proxy failures, the shell host's service for destination failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialClass {
    ProxyUnreachable,
    HandshakeRejected,
    DestinationUnreachable,
    Timeout,
}

impl DialClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProxyUnreachable => "proxy_unreachable",
            Self::HandshakeRejected => "proxy_rejected",
            Self::DestinationUnreachable => "destination_unreachable",
            Self::Timeout => "dial_timeout",
        }
    }
}

impl fmt::Display for DialClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from [`Dialer::dial`].
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("proxy {proxy} unreachable: {source}")]
    ProxyUnreachable {
        proxy: String,
        #[source]
        source: std::io::Error,
    },
    #[error("proxy {proxy} rejected handshake: {detail}")]
    HandshakeRejected { proxy: String, detail: String },
    #[error("destination {destination} unreachable: {detail}")]
    DestinationUnreachable { destination: String, detail: String },
    #[error("dial to {destination} timed out after {timeout:?} during {stage}")]
    Timeout {
        destination: String,
        stage: DialStage,
        timeout: Duration,
    },
}

impl DialError {
    /// Failure class. A timeout while still connecting to the proxy counts as
    /// the proxy being unreachable; later timeouts stay timeouts.
    pub fn class(&self) -> DialClass {
        match self {
            Self::ProxyUnreachable { .. } => DialClass::ProxyUnreachable,
            Self::HandshakeRejected { .. } => DialClass::HandshakeRejected,
            Self::DestinationUnreachable { .. } => DialClass::DestinationUnreachable,
            Self::Timeout {
                stage: DialStage::ProxyConnect,
                ..
            } => DialClass::ProxyUnreachable,
            Self::Timeout { .. } => DialClass::Timeout,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Lock-free dial counters, reported by `/api/health`.
#[derive(Debug, Default)]
pub struct DialStats {
    pub succeeded: AtomicU64,
    pub proxy_unreachable: AtomicU64,
    pub handshake_rejected: AtomicU64,
    pub destination_unreachable: AtomicU64,
    pub timed_out: AtomicU64,
}

impl DialStats {
    pub fn record_success(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, class: DialClass) {
        let counter = match class {
            DialClass::ProxyUnreachable => &self.proxy_unreachable,
            DialClass::HandshakeRejected => &self.handshake_rejected,
            DialClass::DestinationUnreachable => &self.destination_unreachable,
            DialClass::Timeout => &self.timed_out,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn to_json(&self) -> Value {
        json!({
            "succeeded": self.succeeded.load(Ordering::Relaxed),
            "proxy_unreachable": self.proxy_unreachable.load(Ordering::Relaxed),
            "proxy_rejected": self.handshake_rejected.load(Ordering::Relaxed),
            "destination_unreachable": self.destination_unreachable.load(Ordering::Relaxed),
            "dial_timeout": self.timed_out.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_after_first_attempt() {
        let policy = RetryPolicy::attempts(4, Duration::from_millis(100));
        assert_eq!(policy.delay_before(1), Duration::ZERO);
        assert_eq!(policy.delay_before(2), Duration::from_millis(100));
        assert_eq!(policy.delay_before(3), Duration::from_millis(200));
        assert_eq!(policy.delay_before(4), Duration::from_millis(400));
    }

    #[test]
    fn zero_attempts_means_one() {
        assert_eq!(RetryPolicy::attempts(0, Duration::ZERO).max_attempts, 1);
    }

    #[test]
    fn timeout_class_depends_on_stage() {
        let at = |stage| DialError::Timeout {
            destination: "devbox:7681".into(),
            stage,
            timeout: Duration::from_secs(1),
        };
        assert_eq!(at(DialStage::ProxyConnect).class(), DialClass::ProxyUnreachable);
        assert_eq!(at(DialStage::Handshake).class(), DialClass::Timeout);
        assert_eq!(at(DialStage::DestinationConnect).class(), DialClass::Timeout);
        assert!(at(DialStage::Handshake).is_timeout());
    }

    #[test]
    fn stats_count_by_class() {
        let stats = DialStats::default();
        stats.record_failure(DialClass::ProxyUnreachable);
        stats.record_failure(DialClass::ProxyUnreachable);
        stats.record_failure(DialClass::Timeout);
        stats.record_success();
        let v = stats.to_json();
        assert_eq!(v["proxy_unreachable"], 2);
        assert_eq!(v["dial_timeout"], 1);
        assert_eq!(v["succeeded"], 1);
        assert_eq!(v["proxy_rejected"], 0);
    }

    #[test]
    fn route_builders() {
        let route = TunnelRoute::direct("devbox", 7681, Duration::from_secs(5)).via("127.0.0.1:1055");
        assert_eq!(route.destination(), "devbox:7681");
        assert_eq!(route.proxy.as_deref(), Some("127.0.0.1:1055"));
        assert_eq!(route.retry, RetryPolicy::none());
    }
}
