//! Long-running endpoints built on [`RelayClient`]: a provider that keeps a
//! local service registered, and a forwarder that exposes a remote service
//! on a local port.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use futures_util::{Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::{Bridge, BridgeStats};
use crate::client::RelayClient;
use crate::error::{Error, Result};
use crate::name::ServiceName;

// Pause after a failed local accept before retrying.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Exponential reconnect delay: `min(max, base * 2^attempt)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound on any delay.
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base
            .saturating_mul(1u32 << attempt.min(31))
            .min(self.max)
    }
}

/// Keeps a local TCP service registered with a broker.
///
/// Each round registers the name, dials the local target and bridges the
/// two until either side hangs up, then registers again: a registration
/// serves one consumer. The target is dialed right after registering so
/// that server-first protocols (VNC, SSH) can greet; the broker holds those
/// bytes until a consumer claims the name.
#[derive(Debug, Clone)]
pub struct ProviderAgent {
    client: RelayClient,
    name: ServiceName,
    target: String,
    backoff: Backoff,
    bridge: Bridge,
}

impl ProviderAgent {
    /// Agent exposing `target` (`host:port`) as `name`.
    pub fn new(client: RelayClient, name: ServiceName, target: impl Into<String>) -> Self {
        Self {
            client,
            name,
            target: target.into(),
            backoff: Backoff::default(),
            bridge: Bridge::default(),
        }
    }

    /// Override the reconnect backoff.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run rounds until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut attempt = 0u32;
        loop {
            let started = Instant::now();
            let round = tokio::select! {
                _ = shutdown.cancelled() => break,
                res = self.round() => res,
            };

            let delay = match round {
                // Nothing crossed the bridge and it ended quickly: the target or
                // broker hung up at once. A long quiet registration that the
                // broker dropped is not a failure.
                Ok(stats)
                    if stats.a_to_b + stats.b_to_a == 0
                        && started.elapsed() < self.backoff.max =>
                {
                    let delay = self.backoff.delay(attempt);
                    attempt = attempt.saturating_add(1);
                    debug!(service = %self.name, ?delay, error = ?stats.first_error, "empty session");
                    delay
                }
                Ok(stats) => {
                    attempt = 0;
                    info!(
                        service = %self.name,
                        to_target = stats.a_to_b,
                        from_target = stats.b_to_a,
                        "session finished, registering again"
                    );
                    continue;
                }
                Err(e) if e.is_transient() => {
                    let delay = self.backoff.delay(attempt);
                    attempt = attempt.saturating_add(1);
                    warn!(service = %self.name, ?delay, "provider round failed: {e}");
                    delay
                }
                Err(e) => {
                    warn!(service = %self.name, "broker refused provider: {e}");
                    self.backoff.max
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!(service = %self.name, "provider agent stopped");
    }

    async fn round(&self) -> Result<BridgeStats> {
        let relay = self.client.register(&self.name).await?;
        let target = TcpStream::connect(&self.target)
            .await
            .map_err(|e| Error::connect(self.target.as_str(), e))?;
        target.set_nodelay(true)?;
        debug!(service = %self.name, target = %self.target, "target connected, waiting for consumer");
        Ok(self.bridge.run(relay, target).await)
    }
}

/// Exposes a remote service on a local TCP listener.
///
/// Every accepted local connection issues its own `REQUEST`, so each one
/// consumes one provider registration.
#[derive(Debug, Clone)]
pub struct LocalForwarder {
    client: RelayClient,
    name: ServiceName,
    bridge: Bridge,
}

impl LocalForwarder {
    /// Forwarder for `name`.
    pub fn new(client: RelayClient, name: ServiceName) -> Self {
        Self {
            client,
            name,
            bridge: Bridge::default(),
        }
    }

    /// Accept on `listener` until `shutdown` is cancelled.
    ///
    /// A failed accept is logged and retried after a short pause; it never
    /// ends the forwarder or the connections already in flight.
    pub async fn run(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        info!(local = %listener.local_addr()?, service = %self.name, "local forwarder listening");
        let incoming = futures_util::stream::unfold(listener, |listener| async move {
            let accepted = listener.accept().await;
            Some((accepted, listener))
        });
        self.serve(incoming, shutdown).await;
        Ok(())
    }

    async fn serve<S>(&self, incoming: S, shutdown: CancellationToken)
    where
        S: Stream<Item = std::io::Result<(TcpStream, SocketAddr)>>,
    {
        tokio::pin!(incoming);
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = incoming.next() => match accepted {
                    Some(Ok((local, addr))) => {
                        debug!(%addr, "local client connected");
                        let this = self.clone();
                        connections.spawn(async move { this.forward(local).await });
                    }
                    Some(Err(e)) => {
                        warn!(service = %self.name, "local accept failed: {e}");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                    None => break,
                },
                Some(res) = connections.join_next() => {
                    if let Err(e) = res {
                        warn!("forwarding task failed: {e}");
                    }
                }
            }
        }
        connections.shutdown().await;
    }

    async fn forward(&self, local: TcpStream) {
        let remote = match self.client.request(&self.name).await {
            Ok(remote) => remote,
            Err(e) => {
                warn!(service = %self.name, "request failed: {e}");
                return;
            }
        };
        let stats = self.bridge.run(local, remote).await;
        debug!(
            service = %self.name,
            to_service = stats.a_to_b,
            from_service = stats.b_to_a,
            "forwarded connection closed"
        );
    }
}
