//! Direct and SOCKS5 dialing with a single bounded timeout.
//!
//! [`Dialer::dial`] either connects straight to the destination or connects to
//! the proxy, negotiates SOCKS5 (no-auth) and issues a CONNECT naming the true
//! destination. The destination name is sent to the proxy unresolved, so names
//! that only exist on the overlay network work. The whole sequence runs under
//! one `tokio::time::timeout`; the stage reached when it fires is reported.

use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, info, warn};

use super::{DialError, DialStage, DialStats, TunnelRoute};

/// Anything that behaves like a connected socket.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// A dialed byte stream. Callers cannot tell whether it went through a proxy.
pub type TunnelStream = Box<dyn AsyncStream>;

/// Opens [`TunnelStream`]s for [`TunnelRoute`]s and keeps failure counters.
///
/// Cloneable - clones share the same counters.
#[derive(Clone, Default)]
pub struct Dialer {
    stats: Arc<DialStats>,
}

impl Dialer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &DialStats {
        &self.stats
    }

    /// One dial attempt bounded by `route.dial_timeout`.
    pub async fn dial(&self, route: &TunnelRoute) -> Result<TunnelStream, DialError> {
        let started = Instant::now();
        let mut stage = if route.proxy.is_some() {
            DialStage::ProxyConnect
        } else {
            DialStage::DestinationConnect
        };

        let outcome = tokio::time::timeout(route.dial_timeout, dial_once(route, &mut stage)).await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(DialError::Timeout {
                destination: route.destination(),
                stage,
                timeout: route.dial_timeout,
            }),
        };

        match &result {
            Ok(_) => {
                self.stats.record_success();
                debug!(
                    destination = %route.destination(),
                    proxy = route.proxy.as_deref().unwrap_or("-"),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Dial succeeded"
                );
            }
            Err(e) => {
                self.stats.record_failure(e.class());
                warn!(
                    destination = %route.destination(),
                    proxy = route.proxy.as_deref().unwrap_or("-"),
                    class = %e.class(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Dial failed: {e}"
                );
            }
        }
        result
    }

    /// Dial with the route's [`RetryPolicy`](super::RetryPolicy). Every failed
    /// attempt is logged; the last error is returned.
    pub async fn dial_with_retry(&self, route: &TunnelRoute) -> Result<TunnelStream, DialError> {
        let attempts = route.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.dial(route).await {
                Ok(stream) => return Ok(stream),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    let delay = route.retry.delay_before(attempt + 1);
                    info!(
                        destination = %route.destination(),
                        attempt,
                        attempts,
                        class = %e.class(),
                        "Retrying dial in {}ms",
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// The unbounded dial sequence. `stage` is kept current so the caller can
/// report where a timeout hit.
async fn dial_once(route: &TunnelRoute, stage: &mut DialStage) -> Result<TunnelStream, DialError> {
    let Some(proxy) = route.proxy.as_deref() else {
        *stage = DialStage::DestinationConnect;
        let stream = TcpStream::connect((route.host.as_str(), route.port))
            .await
            .map_err(|e| DialError::DestinationUnreachable {
                destination: route.destination(),
                detail: e.to_string(),
            })?;
        let _ = stream.set_nodelay(true);
        return Ok(Box::new(stream));
    };

    *stage = DialStage::ProxyConnect;
    let first_hop = TcpStream::connect(proxy)
        .await
        .map_err(|source| DialError::ProxyUnreachable {
            proxy: proxy.to_string(),
            source,
        })?;
    let _ = first_hop.set_nodelay(true);

    *stage = DialStage::Handshake;
    let stream = Socks5Stream::connect_with_socket(first_hop, (route.host.as_str(), route.port))
        .await
        .map_err(|e| classify_socks_error(proxy, route, e))?;

    Ok(Box::new(stream))
}

/// Split SOCKS5 failures into "the proxy said the destination is down" (reply
/// codes 0x01–0x06) and everything else, which is a broken negotiation.
fn classify_socks_error(proxy: &str, route: &TunnelRoute, e: tokio_socks::Error) -> DialError {
    use tokio_socks::Error as S;
    match e {
        S::GeneralSocksServerFailure
        | S::ConnectionNotAllowedByRuleset
        | S::NetworkUnreachable
        | S::HostUnreachable
        | S::ConnectionRefused
        | S::TtlExpired => DialError::DestinationUnreachable {
            destination: route.destination(),
            detail: e.to_string(),
        },
        other => DialError::HandshakeRejected {
            proxy: proxy.to_string(),
            detail: other.to_string(),
        },
    }
}
